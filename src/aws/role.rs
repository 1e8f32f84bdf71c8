//! IAM role lifecycle controller
//!
//! Roles are identified by name, globally within the account. Construction
//! either adopts an existing role (recovering its trust policy, service
//! principal, and attached policies) or creates one from a service
//! principal and a set of managed policy names, all of which must already
//! exist in the remote policy catalog. Batch service roles refuse to be
//! destroyed while compute environments still depend on them.

use crate::aws::batch::{ComputeEnvOps, ComputeEnvStatus};
use crate::aws::error::ignore_not_found;
use crate::aws::iam::RoleOps;
use crate::error::Error;
use crate::registry::Registry;
use crate::resource::{Named, RemoteResource};
use crate::wait::{wait_until, WaitConfig};
use backon::{BackoffBuilder, ExponentialBuilder, Retryable};
use serde_json::json;
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

const DEFAULT_DESCRIPTION: &str = "This role was generated by batchrig";

/// How long a role lookup keeps retrying before concluding the role does
/// not exist (IAM reads lag writes).
const LOOKUP_BUDGET: Duration = Duration::from_secs(5);

/// Budget for a fresh instance profile to become visible.
const PROFILE_VISIBLE_WAIT: WaitConfig = WaitConfig {
    initial_delay: Duration::from_millis(500),
    max_delay: Duration::from_secs(10),
    timeout: Duration::from_secs(60),
};

/// Budget for a dependent compute environment to finish deleting.
const COMPUTE_ENV_DELETE_WAIT: WaitConfig = WaitConfig {
    initial_delay: Duration::from_secs(1),
    max_delay: Duration::from_secs(16),
    timeout: Duration::from_secs(120),
};

/// Service principals a role can be based on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServicePrincipal {
    Batch,
    Ec2,
    EcsTasks,
    Lambda,
    Spotfleet,
}

impl ServicePrincipal {
    /// The short service key, e.g. `batch`
    pub fn key(&self) -> &'static str {
        match self {
            ServicePrincipal::Batch => "batch",
            ServicePrincipal::Ec2 => "ec2",
            ServicePrincipal::EcsTasks => "ecs-tasks",
            ServicePrincipal::Lambda => "lambda",
            ServicePrincipal::Spotfleet => "spotfleet",
        }
    }

    /// The full trust-policy principal, e.g. `batch.amazonaws.com`
    pub fn principal(&self) -> &'static str {
        match self {
            ServicePrincipal::Batch => "batch.amazonaws.com",
            ServicePrincipal::Ec2 => "ec2.amazonaws.com",
            ServicePrincipal::EcsTasks => "ecs-tasks.amazonaws.com",
            ServicePrincipal::Lambda => "lambda.amazonaws.com",
            ServicePrincipal::Spotfleet => "spotfleet.amazonaws.com",
        }
    }

    /// Registry section for roles of this kind
    pub fn registry_section(&self) -> String {
        format!("{}-roles", self.key())
    }

    fn from_principal(principal: &str) -> Option<Self> {
        match principal {
            "batch.amazonaws.com" => Some(ServicePrincipal::Batch),
            "ec2.amazonaws.com" => Some(ServicePrincipal::Ec2),
            "ecs-tasks.amazonaws.com" => Some(ServicePrincipal::EcsTasks),
            "lambda.amazonaws.com" => Some(ServicePrincipal::Lambda),
            "spotfleet.amazonaws.com" => Some(ServicePrincipal::Spotfleet),
            _ => None,
        }
    }
}

impl fmt::Display for ServicePrincipal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Parameters for [`Role::ensure`].
///
/// With only a name, the role must already exist and is adopted. Any other
/// field makes this a creation request, which conflicts if the name is
/// taken.
#[derive(Debug, Clone)]
pub struct RoleParams {
    name: String,
    description: Option<String>,
    service: Option<ServicePrincipal>,
    policies: Vec<String>,
    instance_profile: bool,
}

impl RoleParams {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            service: None,
            policies: Vec::new(),
            instance_profile: false,
        }
    }

    /// Description for a new role. A default is used when omitted.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Service principal for a new role's trust policy. Defaults to
    /// `ecs-tasks`.
    pub fn service(mut self, service: ServicePrincipal) -> Self {
        self.service = Some(service);
        self
    }

    /// Add a managed policy to attach to a new role.
    pub fn policy(mut self, policy: impl Into<String>) -> Self {
        self.policies.push(policy.into());
        self
    }

    /// Also create an instance profile and add the role to it.
    pub fn instance_profile(mut self) -> Self {
        self.instance_profile = true;
        self
    }

    fn has_creation_input(&self) -> bool {
        self.description.is_some()
            || self.service.is_some()
            || !self.policies.is_empty()
            || self.instance_profile
    }
}

/// A managed IAM role
#[derive(Debug)]
pub struct Role {
    name: String,
    arn: String,
    description: Option<String>,
    service: ServicePrincipal,
    trust_policy: serde_json::Value,
    policies: BTreeSet<String>,
    pre_existing: bool,
    clobbered: bool,
}

/// Canonical attribute set gathered for an existing role.
struct RoleAttrs {
    arn: String,
    description: Option<String>,
    service: ServicePrincipal,
    trust_policy: serde_json::Value,
    policies: BTreeSet<String>,
}

/// The service principal named by a trust policy's first statement.
fn service_from_trust(name: &str, trust_policy: &serde_json::Value) -> Result<ServicePrincipal, Error> {
    let principal = trust_policy
        .get("Statement")
        .and_then(|statements| statements.get(0))
        .and_then(|statement| statement.get("Principal"))
        .and_then(|principal| principal.get("Service"))
        .and_then(|service| match service {
            serde_json::Value::String(s) => Some(s.as_str()),
            serde_json::Value::Array(services) => services.first().and_then(|s| s.as_str()),
            _ => None,
        })
        .and_then(ServicePrincipal::from_principal);

    principal.ok_or_else(|| {
        Error::Validation(format!(
            "the trust policy of role {name} does not name a supported service principal"
        ))
    })
}

/// Look a role up by name, retrying briefly so a just-created role is not
/// misread as absent.
async fn lookup(iam: &impl RoleOps, name: &str) -> Result<Option<RoleAttrs>, Error> {
    let start = tokio::time::Instant::now();
    let mut delays = ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(500))
        .with_max_delay(Duration::from_secs(4))
        .build();

    let description = loop {
        match iam.get_role(name).await? {
            Some(description) => break description,
            None if start.elapsed() < LOOKUP_BUDGET => {
                let delay = delays.next().unwrap_or(Duration::from_secs(4));
                debug!(role = %name, delay_ms = delay.as_millis(), "Role not visible, retrying");
                tokio::time::sleep(delay).await;
            }
            None => return Ok(None),
        }
    };

    let service = service_from_trust(name, &description.trust_policy)?;
    let policies: BTreeSet<String> = iam.attached_policy_names(name).await?.into_iter().collect();

    Ok(Some(RoleAttrs {
        arn: description.arn,
        description: description.description,
        service,
        trust_policy: description.trust_policy,
        policies,
    }))
}

impl Role {
    /// Find a role by name, adopting it when present and creating it when
    /// creation parameters are given.
    ///
    /// Fails with [`Error::ResourceExists`] when the role exists and
    /// creation parameters were supplied, and with
    /// [`Error::ResourceDoesNotExist`] when it does not exist and none
    /// were.
    pub async fn ensure(
        iam: &impl RoleOps,
        registry: &Registry,
        params: RoleParams,
    ) -> Result<Self, Error> {
        if let Some(attrs) = lookup(iam, &params.name).await? {
            if params.has_creation_input() {
                return Err(Error::ResourceExists {
                    message: format!(
                        "you specified parameters for a role that already exists; choose a \
                         different name, or leave all other input blank to adopt role {}",
                        params.name
                    ),
                    resource_id: params.name,
                });
            }

            registry
                .add(&attrs.service.registry_section(), &params.name, &attrs.arn)
                .await?;

            info!(role = %params.name, arn = %attrs.arn, "Adopted pre-existing IAM role");

            return Ok(Self {
                name: params.name,
                arn: attrs.arn,
                description: attrs.description,
                service: attrs.service,
                trust_policy: attrs.trust_policy,
                policies: attrs.policies,
                pre_existing: true,
                clobbered: false,
            });
        }

        if !params.has_creation_input() {
            return Err(Error::ResourceDoesNotExist {
                message: format!(
                    "IAM role {} does not exist and no parameters were provided to create it",
                    params.name
                ),
                resource_id: params.name,
            });
        }

        Self::create(iam, registry, params).await
    }

    async fn create(
        iam: &impl RoleOps,
        registry: &Registry,
        params: RoleParams,
    ) -> Result<Self, Error> {
        let description = params
            .description
            .unwrap_or_else(|| DEFAULT_DESCRIPTION.to_string());
        let service = params.service.unwrap_or(ServicePrincipal::EcsTasks);

        let trust_policy = json!({
            "Version": "2012-10-17",
            "Statement": [{
                "Effect": "Allow",
                "Principal": {
                    "Service": service.principal()
                },
                "Action": "sts:AssumeRole"
            }]
        });

        // Validate the requested policies against the remote catalog before
        // touching anything.
        let policies: BTreeSet<String> = params.policies.into_iter().collect();
        let catalog: BTreeSet<String> = iam.list_policy_names().await?.into_iter().collect();
        let missing: Vec<&String> = policies.iter().filter(|p| !catalog.contains(*p)).collect();
        if !missing.is_empty() {
            return Err(Error::Validation(format!(
                "could not find the policies {missing:?} on AWS"
            )));
        }

        let arn = iam
            .create_role(&params.name, &trust_policy.to_string(), &description)
            .await?;
        info!(role = %params.name, arn = %arn, "Created IAM role");

        for policy in &policies {
            let policy_arn = iam.policy_arn(policy).await?.ok_or_else(|| {
                Error::Validation(format!("could not find the policy {policy} on AWS"))
            })?;

            // The fresh role may not be visible to attach calls yet.
            (|| async { iam.attach_role_policy(&params.name, &policy_arn).await })
                .retry(attach_retry())
                .when(|err| err.is_not_found())
                .notify(|err, delay| {
                    warn!(role = %params.name, delay = ?delay, error = %err, "Policy attach failed, retrying");
                })
                .await?;
            info!(role = %params.name, policy = %policy, "Attached policy");
        }

        if params.instance_profile {
            match iam.create_instance_profile(&params.name).await {
                Ok(()) => {
                    wait_until(
                        PROFILE_VISIBLE_WAIT,
                        || iam.instance_profile_exists(&params.name),
                        &format!("instance profile {}", params.name),
                    )
                    .await?;
                }
                // Lost a creation race; the profile is already there.
                Err(err) if err.is_already_exists() => {}
                Err(err) => return Err(err.into()),
            }
            iam.add_role_to_instance_profile(&params.name, &params.name)
                .await?;
            info!(profile = %params.name, "Created instance profile");
        }

        registry
            .add(&service.registry_section(), &params.name, &arn)
            .await?;

        Ok(Self {
            name: params.name,
            arn,
            description: Some(description),
            service,
            trust_policy,
            policies,
            pre_existing: false,
            clobbered: false,
        })
    }

    /// ARN of the instance profile attached to this role, if any.
    pub async fn instance_profile_arn(
        &self,
        iam: &impl RoleOps,
    ) -> Result<Option<String>, Error> {
        if self.clobbered {
            return Err(Error::ResourceClobbered {
                resource_id: self.arn.clone(),
            });
        }

        let profiles = iam.instance_profiles_for_role(&self.name).await?;
        Ok(profiles.into_iter().next().map(|profile| profile.arn))
    }

    /// Delete this role, deregistering it on success.
    ///
    /// A batch service role first checks for compute environments that use
    /// it: any not already being deleted fail the destroy with
    /// [`Error::CannotDeleteResource`]; ones mid-deletion are polled until
    /// gone. Instance profiles are detached (and deleted when unused) and
    /// all attached policies detached before the role itself is deleted.
    /// No-op once clobbered.
    pub async fn destroy(
        &mut self,
        iam: &impl RoleOps,
        batch: &impl ComputeEnvOps,
        registry: &Registry,
    ) -> Result<(), Error> {
        if self.clobbered {
            return Ok(());
        }

        if self.service == ServicePrincipal::Batch {
            self.await_dependent_environments(batch).await?;
        }

        for profile in iam.instance_profiles_for_role(&self.name).await? {
            ignore_not_found(
                iam.remove_role_from_instance_profile(&profile.name, &self.name)
                    .await,
            )?;
            match iam.delete_instance_profile(&profile.name).await {
                Ok(()) => {}
                // Another role still uses the profile; leave it in place.
                Err(err) if err.is_dependency_violation() => {
                    debug!(profile = %profile.name, "Instance profile still in use, keeping it");
                }
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err.into()),
            }
        }

        for policy in &self.policies {
            match iam.policy_arn(policy).await? {
                Some(policy_arn) => {
                    ignore_not_found(iam.detach_role_policy(&self.name, &policy_arn).await)?;
                }
                // The policy vanished remotely; nothing left to detach.
                None => debug!(policy = %policy, "Attached policy no longer exists, skipping"),
            }
        }

        iam.delete_role(&self.name).await?;

        registry
            .remove(&self.service.registry_section(), &self.name)
            .await?;
        self.clobbered = true;

        info!(role = %self.name, "Clobbered IAM role");
        Ok(())
    }

    /// Refuse to delete under live compute environments; wait out deleting
    /// ones.
    async fn await_dependent_environments(
        &self,
        batch: &impl ComputeEnvOps,
    ) -> Result<(), Error> {
        let environments = batch.environments_with_service_role(&self.arn).await?;

        let conflicting: Vec<String> = environments
            .iter()
            .filter(|environment| !environment.status.is_terminating())
            .map(|environment| environment.arn.clone())
            .collect();
        if !conflicting.is_empty() {
            return Err(Error::CannotDeleteResource {
                message: format!(
                    "could not delete batch service role {} because compute environments \
                     {conflicting:?} are associated with it and are not being deleted",
                    self.name
                ),
                resource_ids: conflicting,
            });
        }

        for environment in &environments {
            wait_until(
                COMPUTE_ENV_DELETE_WAIT,
                || async {
                    match batch.environment_status(&environment.arn).await? {
                        None | Some(ComputeEnvStatus::Deleted) => Ok(true),
                        Some(_) => Ok(false),
                    }
                },
                &format!("compute environment {}", environment.name),
            )
            .await
            .map_err(|err| match err {
                crate::wait::WaitError::Timeout { .. } => Error::CannotDeleteResource {
                    message: format!(
                        "could not delete batch service role {} because it is taking too long \
                         for compute environment {} to be deleted",
                        self.name, environment.arn
                    ),
                    resource_ids: vec![environment.arn.clone()],
                },
                other => other.into(),
            })?;
        }

        Ok(())
    }

    pub fn arn(&self) -> &str {
        &self.arn
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn service(&self) -> ServicePrincipal {
        self.service
    }

    pub fn trust_policy(&self) -> &serde_json::Value {
        &self.trust_policy
    }

    /// Names of the managed policies attached to this role
    pub fn policies(&self) -> &BTreeSet<String> {
        &self.policies
    }

    pub fn pre_existing(&self) -> bool {
        self.pre_existing
    }

    pub fn clobbered(&self) -> bool {
        self.clobbered
    }
}

impl Named for Role {
    fn name(&self) -> &str {
        &self.name
    }
}

impl RemoteResource for Role {
    fn remote_id(&self) -> &str {
        &self.arn
    }
}

/// Backoff for attach calls against a role that may not be visible yet.
fn attach_retry() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(500))
        .with_max_delay(Duration::from_secs(4))
        .with_max_times(4)
}
