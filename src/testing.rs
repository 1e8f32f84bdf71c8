//! In-memory fake gateways for unit tests
//!
//! [`FakeCloud`] implements every gateway trait against process-local
//! state, so the lifecycle controllers can be exercised without AWS
//! credentials. Behavior mirrors the remote contracts the controllers rely
//! on: not-found deletes, dependency violations, creation races, and
//! compute environments that take a few polls to disappear.

use crate::aws::batch::{ComputeEnvOps, ComputeEnvStatus, ComputeEnvironment};
use crate::aws::ec2::{
    SecurityGroupDescription, SecurityGroupOps, TagOps, Tenancy, VpcDescription, VpcOps,
};
use crate::aws::error::AwsError;
use crate::aws::iam::{InstanceProfileSummary, RoleDescription, RoleOps};
use crate::aws::role::ServicePrincipal;
use crate::aws::tags::TAG_NAME;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

fn not_found(code: &str, what: &str) -> AwsError {
    AwsError::classify(Some(code), Some(what))
}

fn dependency_violation(what: &str) -> AwsError {
    AwsError::classify(Some("DependencyViolation"), Some(what))
}

struct FakeVpc {
    cidr: String,
    tenancy: Tenancy,
}

struct FakeSubnet {
    vpc_id: String,
    cidr: String,
    #[allow(dead_code)]
    zone: String,
}

struct FakeGroup {
    name: String,
    vpc_id: String,
    description: String,
    ingress: Vec<(u16, String)>,
}

struct FakeInstance {
    vpc_id: String,
    groups: Vec<String>,
    terminated: bool,
}

struct FakeRole {
    arn: String,
    description: Option<String>,
    trust: serde_json::Value,
    attached: BTreeSet<String>,
}

struct FakeEnvironment {
    name: String,
    service_role: Option<String>,
    security_group_ids: Vec<String>,
    /// `Some(n)`: mid-deletion, gone after `n` status polls. `None`: live.
    polls_until_gone: Option<u32>,
}

#[derive(Default)]
struct CloudState {
    counter: u64,
    zones: Vec<String>,
    vpcs: BTreeMap<String, FakeVpc>,
    subnets: BTreeMap<String, FakeSubnet>,
    groups: BTreeMap<String, FakeGroup>,
    instances: BTreeMap<String, FakeInstance>,
    tags: BTreeMap<String, BTreeMap<String, String>>,
    roles: BTreeMap<String, FakeRole>,
    policies: Vec<(String, String)>,
    profiles: BTreeMap<String, Vec<String>>,
    environments: BTreeMap<String, FakeEnvironment>,
    role_create_calls: u32,
    group_delete_failures: BTreeMap<String, u32>,
    group_delete_attempts: BTreeMap<String, u32>,
}

impl CloudState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.counter += 1;
        format!("{prefix}-{:04}", self.counter)
    }
}

/// An in-memory stand-in for the EC2, IAM, and Batch gateways.
#[derive(Clone)]
pub(crate) struct FakeCloud {
    state: Arc<Mutex<CloudState>>,
}

fn role_arn(name: &str) -> String {
    format!("arn:aws:iam::123456789012:role/{name}")
}

fn profile_arn(name: &str) -> String {
    format!("arn:aws:iam::123456789012:instance-profile/{name}")
}

fn environment_arn(name: &str) -> String {
    format!("arn:aws:batch:us-east-1:123456789012:compute-environment/{name}")
}

impl FakeCloud {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(CloudState::default())),
        }
    }

    pub fn with_zones(self, count: usize) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.zones = (0..count)
                .map(|i| format!("us-east-1{}", (b'a' + i as u8) as char))
                .collect();
        }
        self
    }

    pub fn with_policy(self, name: &str) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            let arn = format!("arn:aws:iam::aws:policy/{name}");
            state.policies.push((name.to_string(), arn));
        }
        self
    }

    // Seeding helpers

    pub fn seed_vpc(&self, name: Option<&str>, cidr: &str, tenancy: Tenancy) -> String {
        let mut state = self.state.lock().unwrap();
        let vpc_id = state.next_id("vpc");
        state.vpcs.insert(
            vpc_id.clone(),
            FakeVpc {
                cidr: cidr.to_string(),
                tenancy,
            },
        );
        if let Some(name) = name {
            state
                .tags
                .entry(vpc_id.clone())
                .or_default()
                .insert(TAG_NAME.to_string(), name.to_string());
        }
        vpc_id
    }

    pub fn seed_security_group(&self, name: &str, vpc_id: &str, description: &str) -> String {
        let mut state = self.state.lock().unwrap();
        let group_id = state.next_id("sg");
        state.groups.insert(
            group_id.clone(),
            FakeGroup {
                name: name.to_string(),
                vpc_id: vpc_id.to_string(),
                description: description.to_string(),
                ingress: Vec::new(),
            },
        );
        group_id
    }

    pub fn seed_instance(&self, vpc_id: &str, groups: &[&str]) -> String {
        let mut state = self.state.lock().unwrap();
        let instance_id = state.next_id("i");
        state.instances.insert(
            instance_id.clone(),
            FakeInstance {
                vpc_id: vpc_id.to_string(),
                groups: groups.iter().map(|g| g.to_string()).collect(),
                terminated: false,
            },
        );
        instance_id
    }

    pub fn seed_role(&self, name: &str, service: ServicePrincipal, policies: &[&str]) {
        let mut state = self.state.lock().unwrap();
        let attached = policies
            .iter()
            .map(|policy| {
                state
                    .policies
                    .iter()
                    .find(|(n, _)| n == policy)
                    .map(|(_, arn)| arn.clone())
                    .expect("seeded policy must be in the catalog")
            })
            .collect();
        state.roles.insert(
            name.to_string(),
            FakeRole {
                arn: role_arn(name),
                description: Some("seeded".to_string()),
                trust: json!({
                    "Statement": [{
                        "Effect": "Allow",
                        "Principal": {"Service": service.principal()},
                        "Action": "sts:AssumeRole"
                    }]
                }),
                attached,
            },
        );
    }

    pub fn seed_instance_profile(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.profiles.insert(name.to_string(), Vec::new());
    }

    pub fn seed_compute_environment(
        &self,
        name: &str,
        service_role: Option<&str>,
        security_group_ids: &[&str],
        polls_until_gone: Option<u32>,
    ) -> String {
        let mut state = self.state.lock().unwrap();
        let arn = environment_arn(name);
        state.environments.insert(
            arn.clone(),
            FakeEnvironment {
                name: name.to_string(),
                service_role: service_role.map(String::from),
                security_group_ids: security_group_ids.iter().map(|s| s.to_string()).collect(),
                polls_until_gone,
            },
        );
        arn
    }

    /// Make the next `count` deletes of a group fail with a dependency
    /// violation.
    pub fn fail_next_group_deletes(&self, group_id: &str, count: u32) {
        let mut state = self.state.lock().unwrap();
        state
            .group_delete_failures
            .insert(group_id.to_string(), count);
    }

    // Assertion helpers

    pub fn vpc_exists(&self, vpc_id: &str) -> bool {
        self.state.lock().unwrap().vpcs.contains_key(vpc_id)
    }

    pub fn vpc_count(&self) -> usize {
        self.state.lock().unwrap().vpcs.len()
    }

    pub fn subnet_cidrs(&self, vpc_id: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .subnets
            .values()
            .filter(|subnet| subnet.vpc_id == vpc_id)
            .map(|subnet| subnet.cidr.clone())
            .collect()
    }

    pub fn tag_value(&self, resource_id: &str, key: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state.tags.get(resource_id)?.get(key).cloned()
    }

    pub fn security_group_exists(&self, group_id: &str) -> bool {
        self.state.lock().unwrap().groups.contains_key(group_id)
    }

    pub fn security_group_count(&self) -> usize {
        self.state.lock().unwrap().groups.len()
    }

    pub fn remove_security_group(&self, group_id: &str) {
        self.state.lock().unwrap().groups.remove(group_id);
    }

    pub fn ingress_rules(&self, group_id: &str) -> Vec<(u16, String)> {
        let state = self.state.lock().unwrap();
        state
            .groups
            .get(group_id)
            .map(|group| group.ingress.clone())
            .unwrap_or_default()
    }

    pub fn group_delete_attempts(&self, group_id: &str) -> u32 {
        let state = self.state.lock().unwrap();
        state
            .group_delete_attempts
            .get(group_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn instance_terminated(&self, instance_id: &str) -> bool {
        let state = self.state.lock().unwrap();
        state
            .instances
            .get(instance_id)
            .map(|instance| instance.terminated)
            .unwrap_or(false)
    }

    pub fn role_exists(&self, name: &str) -> bool {
        self.state.lock().unwrap().roles.contains_key(name)
    }

    pub fn role_create_calls(&self) -> u32 {
        self.state.lock().unwrap().role_create_calls
    }

    pub fn attached_policies(&self, role_name: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let Some(role) = state.roles.get(role_name) else {
            return Vec::new();
        };
        role.attached
            .iter()
            .filter_map(|arn| {
                state
                    .policies
                    .iter()
                    .find(|(_, a)| a == arn)
                    .map(|(name, _)| name.clone())
            })
            .collect()
    }

    pub fn instance_profile_exists_locally(&self, name: &str) -> bool {
        self.state.lock().unwrap().profiles.contains_key(name)
    }
}

impl TagOps for FakeCloud {
    async fn create_tags(
        &self,
        resource_ids: &[String],
        tags: &[(&str, &str)],
    ) -> Result<(), AwsError> {
        let mut state = self.state.lock().unwrap();
        for id in resource_ids {
            let entry = state.tags.entry(id.clone()).or_default();
            for (key, value) in tags {
                entry.insert(key.to_string(), value.to_string());
            }
        }
        Ok(())
    }
}

impl VpcOps for FakeCloud {
    async fn describe_vpc(&self, vpc_id: &str) -> Result<Option<VpcDescription>, AwsError> {
        let state = self.state.lock().unwrap();
        Ok(state.vpcs.get(vpc_id).map(|vpc| VpcDescription {
            vpc_id: vpc_id.to_string(),
            name: state
                .tags
                .get(vpc_id)
                .and_then(|tags| tags.get(TAG_NAME))
                .cloned(),
            ipv4_cidr: vpc.cidr.clone(),
            instance_tenancy: vpc.tenancy,
        }))
    }

    async fn vpc_id_for_name(&self, name: &str) -> Result<Option<String>, AwsError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .vpcs
            .keys()
            .find(|vpc_id| {
                state
                    .tags
                    .get(*vpc_id)
                    .and_then(|tags| tags.get(TAG_NAME))
                    .map(|value| value == name)
                    .unwrap_or(false)
            })
            .cloned())
    }

    async fn list_subnet_ids(&self, vpc_id: &str) -> Result<Vec<String>, AwsError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .subnets
            .iter()
            .filter(|(_, subnet)| subnet.vpc_id == vpc_id)
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn availability_zones(&self) -> Result<Vec<String>, AwsError> {
        Ok(self.state.lock().unwrap().zones.clone())
    }

    async fn create_vpc(&self, ipv4_cidr: &str, tenancy: Tenancy) -> Result<String, AwsError> {
        let mut state = self.state.lock().unwrap();
        let vpc_id = state.next_id("vpc");
        state.vpcs.insert(
            vpc_id.clone(),
            FakeVpc {
                cidr: ipv4_cidr.to_string(),
                tenancy,
            },
        );
        Ok(vpc_id)
    }

    async fn vpc_available(&self, vpc_id: &str) -> Result<bool, AwsError> {
        Ok(self.state.lock().unwrap().vpcs.contains_key(vpc_id))
    }

    async fn create_subnet(
        &self,
        vpc_id: &str,
        zone: &str,
        ipv4_cidr: &str,
    ) -> Result<String, AwsError> {
        let mut state = self.state.lock().unwrap();
        let subnet_id = state.next_id("subnet");
        state.subnets.insert(
            subnet_id.clone(),
            FakeSubnet {
                vpc_id: vpc_id.to_string(),
                cidr: ipv4_cidr.to_string(),
                zone: zone.to_string(),
            },
        );
        Ok(subnet_id)
    }

    async fn subnets_available(&self, subnet_ids: &[String]) -> Result<bool, AwsError> {
        let state = self.state.lock().unwrap();
        Ok(subnet_ids.iter().all(|id| state.subnets.contains_key(id)))
    }

    async fn delete_subnet(&self, subnet_id: &str) -> Result<(), AwsError> {
        let mut state = self.state.lock().unwrap();
        state
            .subnets
            .remove(subnet_id)
            .map(|_| ())
            .ok_or_else(|| not_found("InvalidSubnetID.NotFound", subnet_id))
    }

    async fn delete_vpc(&self, vpc_id: &str) -> Result<(), AwsError> {
        let mut state = self.state.lock().unwrap();
        if !state.vpcs.contains_key(vpc_id) {
            return Err(not_found("InvalidVpcID.NotFound", vpc_id));
        }
        if state.groups.values().any(|group| group.vpc_id == vpc_id) {
            return Err(dependency_violation(vpc_id));
        }
        state.vpcs.remove(vpc_id);
        Ok(())
    }

    async fn security_group_ids_in_vpc(&self, vpc_id: &str) -> Result<Vec<String>, AwsError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .groups
            .iter()
            .filter(|(_, group)| group.vpc_id == vpc_id)
            .map(|(id, _)| id.clone())
            .collect())
    }
}

impl SecurityGroupOps for FakeCloud {
    async fn describe_security_group(
        &self,
        group_id: &str,
    ) -> Result<Option<SecurityGroupDescription>, AwsError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .groups
            .get(group_id)
            .map(|group| SecurityGroupDescription {
                security_group_id: group_id.to_string(),
                name: group.name.clone(),
                vpc_id: group.vpc_id.clone(),
                description: group.description.clone(),
            }))
    }

    async fn find_security_group(
        &self,
        name: &str,
        vpc_id: &str,
    ) -> Result<Option<SecurityGroupDescription>, AwsError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .groups
            .iter()
            .find(|(_, group)| group.name == name && group.vpc_id == vpc_id)
            .map(|(id, group)| SecurityGroupDescription {
                security_group_id: id.clone(),
                name: group.name.clone(),
                vpc_id: group.vpc_id.clone(),
                description: group.description.clone(),
            }))
    }

    async fn create_security_group(
        &self,
        name: &str,
        description: &str,
        vpc_id: &str,
    ) -> Result<String, AwsError> {
        let mut state = self.state.lock().unwrap();
        let group_id = state.next_id("sg");
        state.groups.insert(
            group_id.clone(),
            FakeGroup {
                name: name.to_string(),
                vpc_id: vpc_id.to_string(),
                description: description.to_string(),
                ingress: Vec::new(),
            },
        );
        Ok(group_id)
    }

    async fn authorize_ingress(&self, group_id: &str, ports: &[u16]) -> Result<(), AwsError> {
        let mut state = self.state.lock().unwrap();
        let group = state
            .groups
            .get_mut(group_id)
            .ok_or_else(|| not_found("InvalidGroup.NotFound", group_id))?;
        for port in ports {
            group.ingress.push((*port, "0.0.0.0/0".to_string()));
            group.ingress.push((*port, "::/0".to_string()));
        }
        Ok(())
    }

    async fn delete_security_group(&self, group_id: &str) -> Result<(), AwsError> {
        let mut state = self.state.lock().unwrap();
        *state
            .group_delete_attempts
            .entry(group_id.to_string())
            .or_insert(0) += 1;

        if let Some(remaining) = state.group_delete_failures.get_mut(group_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(dependency_violation(group_id));
            }
        }

        state
            .groups
            .remove(group_id)
            .map(|_| ())
            .ok_or_else(|| not_found("InvalidGroup.NotFound", group_id))
    }

    async fn instances_using_group(
        &self,
        vpc_id: &str,
        group_id: &str,
    ) -> Result<Vec<String>, AwsError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .instances
            .iter()
            .filter(|(_, instance)| {
                instance.vpc_id == vpc_id
                    && !instance.terminated
                    && instance.groups.iter().any(|g| g == group_id)
            })
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn terminate_instances(&self, instance_ids: &[String]) -> Result<(), AwsError> {
        let mut state = self.state.lock().unwrap();
        for id in instance_ids {
            if let Some(instance) = state.instances.get_mut(id) {
                instance.terminated = true;
            }
        }
        Ok(())
    }
}

impl RoleOps for FakeCloud {
    async fn get_role(&self, name: &str) -> Result<Option<RoleDescription>, AwsError> {
        let state = self.state.lock().unwrap();
        Ok(state.roles.get(name).map(|role| RoleDescription {
            arn: role.arn.clone(),
            description: role.description.clone(),
            trust_policy: role.trust.clone(),
        }))
    }

    async fn attached_policy_names(&self, role_name: &str) -> Result<Vec<String>, AwsError> {
        Ok(self.attached_policies(role_name))
    }

    async fn list_policy_names(&self) -> Result<Vec<String>, AwsError> {
        let state = self.state.lock().unwrap();
        Ok(state.policies.iter().map(|(name, _)| name.clone()).collect())
    }

    async fn policy_arn(&self, policy_name: &str) -> Result<Option<String>, AwsError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .policies
            .iter()
            .find(|(name, _)| name == policy_name)
            .map(|(_, arn)| arn.clone()))
    }

    async fn create_role(
        &self,
        name: &str,
        trust_policy: &str,
        description: &str,
    ) -> Result<String, AwsError> {
        let mut state = self.state.lock().unwrap();
        state.role_create_calls += 1;

        let trust: serde_json::Value =
            serde_json::from_str(trust_policy).map_err(|err| AwsError::Sdk {
                code: Some("MalformedPolicyDocument".to_string()),
                message: err.to_string(),
            })?;
        let arn = role_arn(name);
        state.roles.insert(
            name.to_string(),
            FakeRole {
                arn: arn.clone(),
                description: Some(description.to_string()),
                trust,
                attached: BTreeSet::new(),
            },
        );
        Ok(arn)
    }

    async fn attach_role_policy(&self, role_name: &str, policy_arn: &str) -> Result<(), AwsError> {
        let mut state = self.state.lock().unwrap();
        let role = state
            .roles
            .get_mut(role_name)
            .ok_or_else(|| not_found("NoSuchEntity", role_name))?;
        role.attached.insert(policy_arn.to_string());
        Ok(())
    }

    async fn detach_role_policy(&self, role_name: &str, policy_arn: &str) -> Result<(), AwsError> {
        let mut state = self.state.lock().unwrap();
        let role = state
            .roles
            .get_mut(role_name)
            .ok_or_else(|| not_found("NoSuchEntity", role_name))?;
        if !role.attached.remove(policy_arn) {
            return Err(not_found("NoSuchEntity", policy_arn));
        }
        Ok(())
    }

    async fn create_instance_profile(&self, name: &str) -> Result<(), AwsError> {
        let mut state = self.state.lock().unwrap();
        if state.profiles.contains_key(name) {
            return Err(AwsError::classify(Some("EntityAlreadyExists"), Some(name)));
        }
        state.profiles.insert(name.to_string(), Vec::new());
        Ok(())
    }

    async fn instance_profile_exists(&self, name: &str) -> Result<bool, AwsError> {
        Ok(self.state.lock().unwrap().profiles.contains_key(name))
    }

    async fn add_role_to_instance_profile(
        &self,
        profile_name: &str,
        role_name: &str,
    ) -> Result<(), AwsError> {
        let mut state = self.state.lock().unwrap();
        let profile = state
            .profiles
            .get_mut(profile_name)
            .ok_or_else(|| not_found("NoSuchEntity", profile_name))?;
        profile.push(role_name.to_string());
        Ok(())
    }

    async fn instance_profiles_for_role(
        &self,
        role_name: &str,
    ) -> Result<Vec<InstanceProfileSummary>, AwsError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .profiles
            .iter()
            .filter(|(_, roles)| roles.iter().any(|r| r == role_name))
            .map(|(name, _)| InstanceProfileSummary {
                name: name.clone(),
                arn: profile_arn(name),
            })
            .collect())
    }

    async fn remove_role_from_instance_profile(
        &self,
        profile_name: &str,
        role_name: &str,
    ) -> Result<(), AwsError> {
        let mut state = self.state.lock().unwrap();
        let profile = state
            .profiles
            .get_mut(profile_name)
            .ok_or_else(|| not_found("NoSuchEntity", profile_name))?;
        profile.retain(|r| r != role_name);
        Ok(())
    }

    async fn delete_instance_profile(&self, name: &str) -> Result<(), AwsError> {
        let mut state = self.state.lock().unwrap();
        let Some(roles) = state.profiles.get(name) else {
            return Err(not_found("NoSuchEntity", name));
        };
        if !roles.is_empty() {
            return Err(AwsError::classify(Some("DeleteConflict"), Some(name)));
        }
        state.profiles.remove(name);
        Ok(())
    }

    async fn delete_role(&self, name: &str) -> Result<(), AwsError> {
        let mut state = self.state.lock().unwrap();
        let in_profile = state
            .profiles
            .values()
            .any(|roles| roles.iter().any(|r| r == name));
        let Some(role) = state.roles.get(name) else {
            return Err(not_found("NoSuchEntity", name));
        };
        if !role.attached.is_empty() || in_profile {
            return Err(AwsError::classify(Some("DeleteConflict"), Some(name)));
        }
        state.roles.remove(name);
        Ok(())
    }
}

impl ComputeEnvOps for FakeCloud {
    async fn environments_using_security_group(
        &self,
        group_id: &str,
    ) -> Result<Vec<ComputeEnvironment>, AwsError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .environments
            .iter()
            .filter(|(_, env)| env.security_group_ids.iter().any(|id| id == group_id))
            .map(|(arn, env)| ComputeEnvironment {
                name: env.name.clone(),
                arn: arn.clone(),
                status: if env.polls_until_gone.is_some() {
                    ComputeEnvStatus::Deleting
                } else {
                    ComputeEnvStatus::Valid
                },
            })
            .collect())
    }

    async fn environments_with_service_role(
        &self,
        role_arn: &str,
    ) -> Result<Vec<ComputeEnvironment>, AwsError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .environments
            .iter()
            .filter(|(_, env)| env.service_role.as_deref() == Some(role_arn))
            .map(|(arn, env)| ComputeEnvironment {
                name: env.name.clone(),
                arn: arn.clone(),
                status: if env.polls_until_gone.is_some() {
                    ComputeEnvStatus::Deleting
                } else {
                    ComputeEnvStatus::Valid
                },
            })
            .collect())
    }

    async fn environment_status(&self, arn: &str) -> Result<Option<ComputeEnvStatus>, AwsError> {
        let mut state = self.state.lock().unwrap();
        let gone = {
            let Some(env) = state.environments.get_mut(arn) else {
                return Ok(None);
            };
            match &mut env.polls_until_gone {
                Some(0) => true,
                Some(remaining) => {
                    *remaining -= 1;
                    false
                }
                None => return Ok(Some(ComputeEnvStatus::Valid)),
            }
        };

        if gone {
            state.environments.remove(arn);
            return Ok(None);
        }
        Ok(Some(ComputeEnvStatus::Deleting))
    }
}
