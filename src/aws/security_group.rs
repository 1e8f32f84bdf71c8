//! Security group lifecycle controller
//!
//! A managed security group lives in a VPC it does not own. Creation opens
//! the default inbound rules batch workers need (SSH and HTTP from
//! anywhere). Destruction terminates dependent instances, waits out compute
//! environments that still reference the group, and tolerates one transient
//! dependency violation while ENIs release.

use crate::aws::batch::{ComputeEnvOps, ComputeEnvStatus};
use crate::aws::ec2::SecurityGroupOps;
use crate::aws::tags::{TAG_OWNER, TAG_OWNER_VALUE};
use crate::aws::vpc::Vpc;
use crate::error::Error;
use crate::registry::{Registry, SECTION_SECURITY_GROUPS};
use crate::resource::{Named, RemoteResource};
use crate::wait::{wait_until, WaitConfig};
use backon::{ExponentialBuilder, Retryable};
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_DESCRIPTION: &str = "This security group was automatically generated by batchrig.";

/// Inbound TCP ports opened on every new group
const DEFAULT_INGRESS_PORTS: [u16; 2] = [22, 80];

/// One delayed retry when the delete hits a transient dependency violation
/// (ENIs still releasing after instance termination).
const DEPENDENCY_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Budget for a referencing compute environment to finish deleting.
const COMPUTE_ENV_DELETE_WAIT: WaitConfig = WaitConfig {
    initial_delay: Duration::from_secs(1),
    max_delay: Duration::from_secs(16),
    timeout: Duration::from_secs(120),
};

/// Parameters for [`SecurityGroup::create`].
#[derive(Debug, Clone)]
pub struct SecurityGroupParams {
    name: String,
    description: Option<String>,
}

impl SecurityGroupParams {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
        }
    }

    /// Description for the new group. A default is used when omitted.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// A managed security group
#[derive(Debug)]
pub struct SecurityGroup {
    name: String,
    security_group_id: String,
    vpc_id: String,
    description: String,
    pre_existing: bool,
    clobbered: bool,
}

/// Backoff for follow-up calls against a group that may not be visible yet.
fn creation_retry() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(500))
        .with_max_delay(Duration::from_secs(60))
        .with_max_times(8)
}

impl SecurityGroup {
    /// Adopt an existing security group by its remote id.
    ///
    /// Fails with [`Error::ResourceDoesNotExist`] when no such group exists.
    pub async fn adopt(
        ec2: &impl SecurityGroupOps,
        registry: &Registry,
        security_group_id: &str,
    ) -> Result<Self, Error> {
        let Some(found) = ec2.describe_security_group(security_group_id).await? else {
            return Err(Error::ResourceDoesNotExist {
                message: format!("security group {security_group_id} does not exist"),
                resource_id: security_group_id.to_string(),
            });
        };

        registry
            .add(SECTION_SECURITY_GROUPS, &found.security_group_id, &found.name)
            .await?;

        info!(
            group_id = %found.security_group_id,
            name = %found.name,
            "Adopted pre-existing security group"
        );

        Ok(Self {
            name: found.name,
            security_group_id: found.security_group_id,
            vpc_id: found.vpc_id,
            description: found.description,
            pre_existing: true,
            clobbered: false,
        })
    }

    /// Create a security group in a VPC.
    ///
    /// The group name and VPC are creation parameters: if a group with this
    /// name already exists in the VPC, construction fails with
    /// [`Error::ResourceExists`] carrying its id (adopt it by id instead).
    pub async fn create(
        ec2: &impl SecurityGroupOps,
        registry: &Registry,
        vpc: &Vpc,
        params: SecurityGroupParams,
    ) -> Result<Self, Error> {
        vpc.ensure_not_clobbered()?;

        if let Some(found) = ec2.find_security_group(&params.name, vpc.vpc_id()).await? {
            return Err(Error::ResourceExists {
                message: format!(
                    "the security group name {} is already in use for VPC {} as {}; \
                     adopt it by id instead",
                    params.name, found.vpc_id, found.security_group_id
                ),
                resource_id: found.security_group_id,
            });
        }

        let description = params
            .description
            .unwrap_or_else(|| DEFAULT_DESCRIPTION.to_string());

        let group_id = ec2
            .create_security_group(&params.name, &description, vpc.vpc_id())
            .await?;
        info!(group_id = %group_id, name = %params.name, "Created security group");

        // The group may not be visible to follow-up calls immediately.
        (|| async { ec2.authorize_ingress(&group_id, &DEFAULT_INGRESS_PORTS).await })
            .retry(creation_retry())
            .when(|err| err.is_retryable() || err.is_not_found())
            .notify(|err, delay| {
                warn!(group_id = %group_id, delay = ?delay, error = %err, "Ingress authorization failed, retrying");
            })
            .await?;

        (|| async {
            ec2.create_tags(
                std::slice::from_ref(&group_id),
                &[(TAG_OWNER, TAG_OWNER_VALUE)],
            )
            .await
        })
        .retry(creation_retry())
        .when(|err| err.is_retryable() || err.is_not_found())
        .notify(|err, delay| {
            warn!(group_id = %group_id, delay = ?delay, error = %err, "Tagging failed, retrying");
        })
        .await?;

        registry
            .add(SECTION_SECURITY_GROUPS, &group_id, &params.name)
            .await?;

        Ok(Self {
            name: params.name,
            security_group_id: group_id,
            vpc_id: vpc.vpc_id().to_string(),
            description,
            pre_existing: false,
            clobbered: false,
        })
    }

    /// Delete this security group, deregistering it on success.
    ///
    /// Instances still using the group are terminated first, then any
    /// compute environments referencing it are polled until they finish
    /// deleting. No-op once clobbered.
    pub async fn destroy(
        &mut self,
        ec2: &impl SecurityGroupOps,
        batch: &impl ComputeEnvOps,
        registry: &Registry,
    ) -> Result<(), Error> {
        if self.clobbered {
            return Ok(());
        }

        let dependents = ec2
            .instances_using_group(&self.vpc_id, &self.security_group_id)
            .await?;
        if !dependents.is_empty() {
            ec2.terminate_instances(&dependents).await?;
            info!(instance_ids = ?dependents, "Terminated dependent instances");
        }

        let environments = batch
            .environments_using_security_group(&self.security_group_id)
            .await?;
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
            .await?;
        }

        match ec2.delete_security_group(&self.security_group_id).await {
            Ok(()) => {}
            Err(err) if err.is_dependency_violation() => {
                warn!(
                    group_id = %self.security_group_id,
                    delay = ?DEPENDENCY_RETRY_DELAY,
                    "Security group still has dependents, retrying once"
                );
                tokio::time::sleep(DEPENDENCY_RETRY_DELAY).await;
                ec2.delete_security_group(&self.security_group_id).await?;
            }
            Err(err) => return Err(err.into()),
        }

        registry
            .remove(SECTION_SECURITY_GROUPS, &self.security_group_id)
            .await?;
        self.clobbered = true;

        info!(group_id = %self.security_group_id, name = %self.name, "Clobbered security group");
        Ok(())
    }

    pub fn security_group_id(&self) -> &str {
        &self.security_group_id
    }

    /// Id of the VPC this group lives in. The VPC is not owned by this
    /// group and is never destroyed by it.
    pub fn vpc_id(&self) -> &str {
        &self.vpc_id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn pre_existing(&self) -> bool {
        self.pre_existing
    }

    pub fn clobbered(&self) -> bool {
        self.clobbered
    }
}

impl Named for SecurityGroup {
    fn name(&self) -> &str {
        &self.name
    }
}

impl RemoteResource for SecurityGroup {
    fn remote_id(&self) -> &str {
        &self.security_group_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::vpc::VpcParams;
    use crate::testing::FakeCloud;

    async fn setup() -> (FakeCloud, Registry, Vpc) {
        let cloud = FakeCloud::new().with_zones(2);
        let registry = Registry::open_in_memory().await.unwrap();
        let vpc = Vpc::ensure(&cloud, &registry, VpcParams::new("net"))
            .await
            .unwrap();
        (cloud, registry, vpc)
    }

    #[tokio::test]
    async fn creates_group_with_default_ingress_rules() {
        let (cloud, registry, vpc) = setup().await;

        let sg = SecurityGroup::create(&cloud, &registry, &vpc, SecurityGroupParams::new("sg1"))
            .await
            .unwrap();

        assert!(!sg.pre_existing());
        assert_eq!(sg.vpc_id(), vpc.vpc_id());
        assert_eq!(sg.description(), DEFAULT_DESCRIPTION);

        let rules = cloud.ingress_rules(sg.security_group_id());
        for port in [22u16, 80] {
            assert!(rules.contains(&(port, "0.0.0.0/0".to_string())), "missing v4 rule for {port}");
            assert!(rules.contains(&(port, "::/0".to_string())), "missing v6 rule for {port}");
        }
        assert_eq!(
            cloud.tag_value(sg.security_group_id(), TAG_OWNER).as_deref(),
            Some(TAG_OWNER_VALUE)
        );
        assert!(registry
            .list(SECTION_SECURITY_GROUPS)
            .await
            .unwrap()
            .contains(sg.security_group_id()));
    }

    #[tokio::test]
    async fn creating_an_existing_name_in_the_same_vpc_conflicts() {
        let (cloud, registry, vpc) = setup().await;
        let existing = cloud.seed_security_group("dup", vpc.vpc_id(), "already here");
        let before = cloud.security_group_count();

        let err =
            SecurityGroup::create(&cloud, &registry, &vpc, SecurityGroupParams::new("dup"))
                .await
                .unwrap_err();

        match err {
            Error::ResourceExists { resource_id, .. } => assert_eq!(resource_id, existing),
            other => panic!("expected ResourceExists, got {other:?}"),
        }
        assert_eq!(cloud.security_group_count(), before);
    }

    #[tokio::test]
    async fn adopt_then_destroy_leaves_no_registry_entry() {
        let (cloud, registry, vpc) = setup().await;
        let sg_id = cloud.seed_security_group("adoptee", vpc.vpc_id(), "pre-existing");

        let mut sg = SecurityGroup::adopt(&cloud, &registry, &sg_id).await.unwrap();
        assert!(sg.pre_existing());
        assert_eq!(sg.name(), "adoptee");
        assert!(registry
            .list(SECTION_SECURITY_GROUPS)
            .await
            .unwrap()
            .contains(&sg_id));

        sg.destroy(&cloud, &cloud, &registry).await.unwrap();
        assert!(sg.clobbered());
        assert!(!registry
            .list(SECTION_SECURITY_GROUPS)
            .await
            .unwrap()
            .contains(&sg_id));

        // Second destroy is a no-op.
        sg.destroy(&cloud, &cloud, &registry).await.unwrap();
    }

    #[tokio::test]
    async fn adopting_a_missing_id_fails() {
        let (cloud, registry, _vpc) = setup().await;

        let err = SecurityGroup::adopt(&cloud, &registry, "sg-nope")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ResourceDoesNotExist { .. }));
    }

    #[tokio::test]
    async fn destroy_terminates_dependent_instances() {
        let (cloud, registry, vpc) = setup().await;

        let mut sg =
            SecurityGroup::create(&cloud, &registry, &vpc, SecurityGroupParams::new("used"))
                .await
                .unwrap();
        let instance = cloud.seed_instance(vpc.vpc_id(), &[sg.security_group_id()]);

        sg.destroy(&cloud, &cloud, &registry).await.unwrap();

        assert!(cloud.instance_terminated(&instance));
        assert!(!cloud.security_group_exists(sg.security_group_id()));
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_waits_for_referencing_compute_environment() {
        let (cloud, registry, vpc) = setup().await;

        let mut sg =
            SecurityGroup::create(&cloud, &registry, &vpc, SecurityGroupParams::new("ce-sg"))
                .await
                .unwrap();
        // Environment finishes deleting after two status polls.
        cloud.seed_compute_environment("ce-1", None, &[sg.security_group_id()], Some(2));

        sg.destroy(&cloud, &cloud, &registry).await.unwrap();
        assert!(sg.clobbered());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_dependency_violation_gets_one_delayed_retry() {
        let (cloud, registry, vpc) = setup().await;

        let mut sg =
            SecurityGroup::create(&cloud, &registry, &vpc, SecurityGroupParams::new("flaky"))
                .await
                .unwrap();
        cloud.fail_next_group_deletes(sg.security_group_id(), 1);

        sg.destroy(&cloud, &cloud, &registry).await.unwrap();

        assert!(sg.clobbered());
        assert_eq!(cloud.group_delete_attempts(sg.security_group_id()), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_dependency_violation_propagates() {
        let (cloud, registry, vpc) = setup().await;

        let mut sg =
            SecurityGroup::create(&cloud, &registry, &vpc, SecurityGroupParams::new("stuck"))
                .await
                .unwrap();
        cloud.fail_next_group_deletes(sg.security_group_id(), 5);

        let err = sg.destroy(&cloud, &cloud, &registry).await.unwrap_err();
        assert!(matches!(err, Error::Aws(e) if e.is_dependency_violation()));
        assert!(!sg.clobbered());
    }

    #[tokio::test]
    async fn creating_in_a_clobbered_vpc_fails() {
        let (cloud, registry, mut vpc) = setup().await;
        vpc.destroy(&cloud, &registry).await.unwrap();

        let err =
            SecurityGroup::create(&cloud, &registry, &vpc, SecurityGroupParams::new("late"))
                .await
                .unwrap_err();
        assert!(matches!(err, Error::ResourceClobbered { .. }));
    }
}
