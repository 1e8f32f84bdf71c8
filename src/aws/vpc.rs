//! VPC lifecycle controller
//!
//! A managed VPC owns one subnet per availability zone in its region.
//! Construction either adopts an existing VPC (by id or by name tag) or
//! creates a fresh one, waits for it to become available, tags it, and
//! registers it locally. Destruction deletes the subnets first and refuses
//! to cascade into security groups it does not own.

use crate::aws::ec2::{Tenancy, VpcOps};
use crate::aws::error::{ignore_not_found, AwsError};
use crate::aws::tags::{self, TAG_NAME, TAG_OWNER, TAG_OWNER_VALUE, TAG_VPC_NAME};
use crate::cidr::{self, Ipv4Cidr};
use crate::error::Error;
use crate::registry::{Registry, SECTION_VPC};
use crate::resource::{Named, RemoteResource};
use crate::wait::{wait_until, WaitConfig};
use std::time::Duration;
use tracing::{debug, info};

const DEFAULT_IPV4_CIDR: &str = "10.0.0.0/16";

/// Budget for a freshly created VPC to become visible and available.
const VPC_AVAILABLE_WAIT: WaitConfig = WaitConfig {
    initial_delay: Duration::from_millis(500),
    max_delay: Duration::from_secs(10),
    timeout: Duration::from_secs(60),
};

/// Budget for freshly created subnets to all report available.
const SUBNET_AVAILABLE_WAIT: WaitConfig = WaitConfig {
    initial_delay: Duration::from_secs(1),
    max_delay: Duration::from_secs(60),
    timeout: Duration::from_secs(300),
};

/// Parameters for [`Vpc::ensure`].
#[derive(Debug, Clone)]
pub struct VpcParams {
    name: String,
    ipv4_cidr: Option<Ipv4Cidr>,
    instance_tenancy: Option<Tenancy>,
}

impl VpcParams {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ipv4_cidr: None,
            instance_tenancy: None,
        }
    }

    /// IPv4 CIDR block for a new VPC. Defaults to `10.0.0.0/16`.
    pub fn ipv4_cidr(mut self, ipv4_cidr: Ipv4Cidr) -> Self {
        self.ipv4_cidr = Some(ipv4_cidr);
        self
    }

    /// Instance tenancy for a new VPC. Defaults to `default`.
    pub fn instance_tenancy(mut self, tenancy: Tenancy) -> Self {
        self.instance_tenancy = Some(tenancy);
        self
    }

    fn has_creation_input(&self) -> bool {
        self.ipv4_cidr.is_some() || self.instance_tenancy.is_some()
    }
}

/// A managed virtual private cloud
#[derive(Debug)]
pub struct Vpc {
    name: String,
    vpc_id: String,
    ipv4_cidr: Ipv4Cidr,
    instance_tenancy: Tenancy,
    subnet_ids: Vec<String>,
    pre_existing: bool,
    clobbered: bool,
}

/// Canonical attribute set gathered for an existing VPC.
struct VpcAttrs {
    vpc_id: String,
    name: String,
    ipv4_cidr: String,
    instance_tenancy: Tenancy,
    subnet_ids: Vec<String>,
}

async fn lookup_by_id(ec2: &impl VpcOps, vpc_id: &str) -> Result<Option<VpcAttrs>, Error> {
    match ec2.describe_vpc(vpc_id).await? {
        Some(description) => Ok(Some(gather_attrs(ec2, description).await?)),
        None => Ok(None),
    }
}

async fn lookup_by_name(ec2: &impl VpcOps, name: &str) -> Result<Option<VpcAttrs>, Error> {
    let Some(vpc_id) = ec2.vpc_id_for_name(name).await? else {
        return Ok(None);
    };
    match ec2.describe_vpc(&vpc_id).await? {
        Some(description) => Ok(Some(gather_attrs(ec2, description).await?)),
        None => Ok(None),
    }
}

/// Complete a lookup: back-fill ownership tags on unnamed VPCs and gather
/// the subnet ids.
async fn gather_attrs(
    ec2: &impl VpcOps,
    description: crate::aws::ec2::VpcDescription,
) -> Result<VpcAttrs, Error> {
    let name = match description.name {
        Some(name) => name,
        None => {
            // Tag the VPC so future lookups by name succeed.
            let name = tags::ADOPTED_VPC_NAME.to_string();
            ec2.create_tags(
                std::slice::from_ref(&description.vpc_id),
                &[(TAG_OWNER, TAG_OWNER_VALUE), (TAG_NAME, &name)],
            )
            .await?;
            debug!(vpc_id = %description.vpc_id, "Back-filled name tag on adopted VPC");
            name
        }
    };

    let subnet_ids = ec2.list_subnet_ids(&description.vpc_id).await?;

    Ok(VpcAttrs {
        vpc_id: description.vpc_id,
        name,
        ipv4_cidr: description.ipv4_cidr,
        instance_tenancy: description.instance_tenancy,
        subnet_ids,
    })
}

impl Vpc {
    /// Adopt an existing VPC by its remote id.
    ///
    /// Fails with [`Error::ResourceDoesNotExist`] when no such VPC exists.
    pub async fn adopt(
        ec2: &impl VpcOps,
        registry: &Registry,
        vpc_id: &str,
    ) -> Result<Self, Error> {
        let Some(attrs) = lookup_by_id(ec2, vpc_id).await? else {
            return Err(Error::ResourceDoesNotExist {
                message: format!("VPC {vpc_id} does not exist"),
                resource_id: vpc_id.to_string(),
            });
        };

        Self::adopt_attrs(registry, attrs).await
    }

    /// Find a VPC by name, adopting it when present and creating it
    /// otherwise.
    ///
    /// Supplying a CIDR block or tenancy for a name that already exists
    /// fails with [`Error::ResourceExists`] carrying the discovered VPC id.
    pub async fn ensure(
        ec2: &impl VpcOps,
        registry: &Registry,
        params: VpcParams,
    ) -> Result<Self, Error> {
        if params.instance_tenancy == Some(Tenancy::Host) {
            return Err(Error::Validation(
                "instance tenancy must be one of \"default\" or \"dedicated\"".to_string(),
            ));
        }

        if let Some(attrs) = lookup_by_name(ec2, &params.name).await? {
            if params.has_creation_input() {
                return Err(Error::ResourceExists {
                    message: format!(
                        "the requested VPC parameters are already in use by {}; \
                         drop the creation parameters to adopt it",
                        attrs.vpc_id
                    ),
                    resource_id: attrs.vpc_id,
                });
            }
            return Self::adopt_attrs(registry, attrs).await;
        }

        Self::create(ec2, registry, params).await
    }

    async fn adopt_attrs(registry: &Registry, attrs: VpcAttrs) -> Result<Self, Error> {
        let ipv4_cidr: Ipv4Cidr = attrs.ipv4_cidr.parse()?;
        registry.add(SECTION_VPC, &attrs.vpc_id, &attrs.name).await?;

        info!(vpc_id = %attrs.vpc_id, name = %attrs.name, "Adopted pre-existing VPC");

        Ok(Self {
            name: attrs.name,
            vpc_id: attrs.vpc_id,
            ipv4_cidr,
            instance_tenancy: attrs.instance_tenancy,
            subnet_ids: attrs.subnet_ids,
            pre_existing: true,
            clobbered: false,
        })
    }

    async fn create(
        ec2: &impl VpcOps,
        registry: &Registry,
        params: VpcParams,
    ) -> Result<Self, Error> {
        let ipv4_cidr = params
            .ipv4_cidr
            .unwrap_or_else(|| DEFAULT_IPV4_CIDR.parse().expect("static CIDR literal"));
        let instance_tenancy = params.instance_tenancy.unwrap_or(Tenancy::Default);

        let vpc_id = ec2
            .create_vpc(&ipv4_cidr.to_string(), instance_tenancy)
            .await?;
        info!(vpc_id = %vpc_id, cidr = %ipv4_cidr, tenancy = %instance_tenancy, "Created VPC");

        wait_until(
            VPC_AVAILABLE_WAIT,
            || ec2.vpc_available(&vpc_id),
            &format!("VPC {vpc_id}"),
        )
        .await?;

        ec2.create_tags(
            std::slice::from_ref(&vpc_id),
            &tags::name_tags(&params.name),
        )
        .await?;
        registry.add(SECTION_VPC, &vpc_id, &params.name).await?;

        let subnet_ids = carve_subnets(ec2, &vpc_id, &params.name, ipv4_cidr).await?;

        Ok(Self {
            name: params.name,
            vpc_id,
            ipv4_cidr,
            instance_tenancy,
            subnet_ids,
            pre_existing: false,
            clobbered: false,
        })
    }

    /// Delete this VPC and its subnets, deregistering it on success.
    ///
    /// A dependency violation gathers the VPC's security groups and fails
    /// with [`Error::CannotDeleteResource`] listing them; the caller must
    /// delete those first. No-op once clobbered.
    pub async fn destroy(&mut self, ec2: &impl VpcOps, registry: &Registry) -> Result<(), Error> {
        if self.clobbered {
            return Ok(());
        }

        if let Err(err) = self.delete_remote(ec2).await {
            if err.is_dependency_violation() {
                let dependents = ec2.security_group_ids_in_vpc(&self.vpc_id).await?;
                return Err(Error::CannotDeleteResource {
                    message: format!(
                        "could not delete VPC {} because it has dependencies; \
                         delete the security groups {:?} first",
                        self.vpc_id, dependents
                    ),
                    resource_ids: dependents,
                });
            }
            return Err(err.into());
        }

        registry.remove(SECTION_VPC, &self.vpc_id).await?;
        self.clobbered = true;

        info!(vpc_id = %self.vpc_id, name = %self.name, "Clobbered VPC");
        Ok(())
    }

    /// Delete subnets then the VPC. Already-gone resources are fine: a
    /// caller retrying after a dependency failure must not trip over the
    /// subnets the first attempt removed.
    async fn delete_remote(&self, ec2: &impl VpcOps) -> Result<(), AwsError> {
        for subnet_id in &self.subnet_ids {
            ignore_not_found(ec2.delete_subnet(subnet_id).await)?;
        }
        ignore_not_found(ec2.delete_vpc(&self.vpc_id).await)?;
        Ok(())
    }

    pub fn vpc_id(&self) -> &str {
        &self.vpc_id
    }

    pub fn ipv4_cidr(&self) -> Ipv4Cidr {
        self.ipv4_cidr
    }

    pub fn instance_tenancy(&self) -> Tenancy {
        self.instance_tenancy
    }

    pub fn subnet_ids(&self) -> &[String] {
        &self.subnet_ids
    }

    pub fn pre_existing(&self) -> bool {
        self.pre_existing
    }

    pub fn clobbered(&self) -> bool {
        self.clobbered
    }

    /// Guard for operations that depend on this VPC's identity.
    pub(crate) fn ensure_not_clobbered(&self) -> Result<(), Error> {
        if self.clobbered {
            return Err(Error::ResourceClobbered {
                resource_id: self.vpc_id.clone(),
            });
        }
        Ok(())
    }
}

impl Named for Vpc {
    fn name(&self) -> &str {
        &self.name
    }
}

impl RemoteResource for Vpc {
    fn remote_id(&self) -> &str {
        &self.vpc_id
    }
}

/// Carve one subnet per availability zone out of the VPC block.
async fn carve_subnets(
    ec2: &impl VpcOps,
    vpc_id: &str,
    name: &str,
    ipv4_cidr: Ipv4Cidr,
) -> Result<Vec<String>, Error> {
    let zones = ec2.availability_zones().await?;
    if zones.is_empty() {
        return Err(Error::Validation(
            "region reports no availability zones".to_string(),
        ));
    }
    if ipv4_cidr.num_addresses() < zones.len() as u64 {
        return Err(Error::Validation(
            "IPv4 CIDR block does not have enough addresses for each availability zone"
                .to_string(),
        ));
    }

    let blocks = ipv4_cidr.subnets(cidr::extra_prefix_bits(zones.len()), zones.len())?;

    let mut subnet_ids = Vec::with_capacity(zones.len());
    for (zone, block) in zones.iter().zip(&blocks) {
        let subnet_id = ec2.create_subnet(vpc_id, zone, &block.to_string()).await?;
        info!(subnet_id = %subnet_id, zone = %zone, cidr = %block, "Created subnet");
        subnet_ids.push(subnet_id);
    }

    wait_until(
        SUBNET_AVAILABLE_WAIT,
        || ec2.subnets_available(&subnet_ids),
        &format!("subnets of VPC {vpc_id}"),
    )
    .await?;

    ec2.create_tags(
        &subnet_ids,
        &[(TAG_OWNER, TAG_OWNER_VALUE), (TAG_VPC_NAME, name)],
    )
    .await?;

    Ok(subnet_ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCloud;

    async fn setup(zones: usize) -> (FakeCloud, Registry) {
        let cloud = FakeCloud::new().with_zones(zones);
        let registry = Registry::open_in_memory().await.unwrap();
        (cloud, registry)
    }

    #[tokio::test]
    async fn creates_vpc_with_defaults_and_one_subnet_per_zone() {
        let (cloud, registry) = setup(3).await;

        let vpc = Vpc::ensure(&cloud, &registry, VpcParams::new("mynet"))
            .await
            .unwrap();

        assert!(!vpc.pre_existing());
        assert_eq!(vpc.name(), "mynet");
        assert_eq!(vpc.ipv4_cidr().to_string(), "10.0.0.0/16");
        assert_eq!(vpc.instance_tenancy(), Tenancy::Default);
        assert_eq!(vpc.subnet_ids().len(), 3);

        assert_eq!(
            cloud.subnet_cidrs(vpc.vpc_id()),
            vec!["10.0.0.0/18", "10.0.64.0/18", "10.0.128.0/18"]
        );
        assert_eq!(cloud.tag_value(vpc.vpc_id(), TAG_OWNER).as_deref(), Some("batchrig"));
        assert_eq!(cloud.tag_value(vpc.vpc_id(), TAG_NAME).as_deref(), Some("mynet"));

        let registered = registry.list(SECTION_VPC).await.unwrap();
        assert!(registered.contains(vpc.vpc_id()));
    }

    #[tokio::test]
    async fn eight_zone_region_gets_eight_nested_disjoint_subnets() {
        let (cloud, registry) = setup(8).await;

        let vpc = Vpc::ensure(&cloud, &registry, VpcParams::new("wide"))
            .await
            .unwrap();

        let cidrs: Vec<Ipv4Cidr> = cloud
            .subnet_cidrs(vpc.vpc_id())
            .iter()
            .map(|c| c.parse().unwrap())
            .collect();
        assert_eq!(cidrs.len(), 8);
        for (i, a) in cidrs.iter().enumerate() {
            assert!(vpc.ipv4_cidr().contains(a));
            for b in &cidrs[i + 1..] {
                assert!(!a.overlaps(b));
            }
        }
    }

    #[tokio::test]
    async fn adopt_by_id_then_destroy_leaves_no_registry_entry() {
        let (cloud, registry) = setup(2).await;
        let vpc_id = cloud.seed_vpc(Some("old-net"), "10.1.0.0/16", Tenancy::Default);

        let mut vpc = Vpc::adopt(&cloud, &registry, &vpc_id).await.unwrap();
        assert!(vpc.pre_existing());
        assert!(registry.list(SECTION_VPC).await.unwrap().contains(&vpc_id));

        vpc.destroy(&cloud, &registry).await.unwrap();
        assert!(vpc.clobbered());
        assert!(!registry.list(SECTION_VPC).await.unwrap().contains(&vpc_id));
        assert!(!cloud.vpc_exists(&vpc_id));

        // Destroying again is a no-op.
        vpc.destroy(&cloud, &registry).await.unwrap();
    }

    #[tokio::test]
    async fn adopting_a_missing_id_fails() {
        let (cloud, registry) = setup(2).await;

        let err = Vpc::adopt(&cloud, &registry, "vpc-nope").await.unwrap_err();
        match err {
            Error::ResourceDoesNotExist { resource_id, .. } => {
                assert_eq!(resource_id, "vpc-nope");
            }
            other => panic!("expected ResourceDoesNotExist, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn creation_parameters_for_an_existing_name_conflict() {
        let (cloud, registry) = setup(2).await;
        let vpc_id = cloud.seed_vpc(Some("taken"), "10.2.0.0/16", Tenancy::Default);
        let before = cloud.vpc_count();

        let err = Vpc::ensure(
            &cloud,
            &registry,
            VpcParams::new("taken").ipv4_cidr("10.3.0.0/16".parse().unwrap()),
        )
        .await
        .unwrap_err();

        match err {
            Error::ResourceExists { resource_id, .. } => assert_eq!(resource_id, vpc_id),
            other => panic!("expected ResourceExists, got {other:?}"),
        }
        // No remote mutation happened.
        assert_eq!(cloud.vpc_count(), before);
    }

    #[tokio::test]
    async fn ensure_by_name_twice_yields_identical_attributes() {
        let (cloud, registry) = setup(3).await;

        let first = Vpc::ensure(&cloud, &registry, VpcParams::new("stable"))
            .await
            .unwrap();
        let second = Vpc::ensure(&cloud, &registry, VpcParams::new("stable"))
            .await
            .unwrap();

        assert!(second.pre_existing());
        assert_eq!(first.vpc_id(), second.vpc_id());
        assert_eq!(first.ipv4_cidr(), second.ipv4_cidr());
        assert_eq!(first.instance_tenancy(), second.instance_tenancy());
        assert_eq!(first.subnet_ids(), second.subnet_ids());
    }

    #[tokio::test]
    async fn adopting_an_unnamed_vpc_backfills_ownership_tags() {
        let (cloud, registry) = setup(2).await;
        let vpc_id = cloud.seed_vpc(None, "10.4.0.0/16", Tenancy::Default);

        let vpc = Vpc::adopt(&cloud, &registry, &vpc_id).await.unwrap();

        assert_eq!(vpc.name(), tags::ADOPTED_VPC_NAME);
        assert_eq!(cloud.tag_value(&vpc_id, TAG_OWNER).as_deref(), Some("batchrig"));
        assert_eq!(
            cloud.tag_value(&vpc_id, TAG_NAME).as_deref(),
            Some(tags::ADOPTED_VPC_NAME)
        );
    }

    #[tokio::test]
    async fn destroy_with_live_security_group_lists_it() {
        let (cloud, registry) = setup(2).await;

        let mut vpc = Vpc::ensure(&cloud, &registry, VpcParams::new("busy"))
            .await
            .unwrap();
        let sg_id = cloud.seed_security_group("dep-sg", vpc.vpc_id(), "dependent");

        let err = vpc.destroy(&cloud, &registry).await.unwrap_err();
        match err {
            Error::CannotDeleteResource { resource_ids, .. } => {
                assert!(resource_ids.contains(&sg_id));
            }
            other => panic!("expected CannotDeleteResource, got {other:?}"),
        }
        assert!(!vpc.clobbered());
        // Still registered; nothing was deregistered on failure.
        assert!(registry.list(SECTION_VPC).await.unwrap().contains(vpc.vpc_id()));

        cloud.remove_security_group(&sg_id);
        vpc.destroy(&cloud, &registry).await.unwrap();
        assert!(vpc.clobbered());
    }

    #[tokio::test]
    async fn host_tenancy_is_rejected_before_any_mutation() {
        let (cloud, registry) = setup(2).await;
        let before = cloud.vpc_count();

        let err = Vpc::ensure(
            &cloud,
            &registry,
            VpcParams::new("bad").instance_tenancy(Tenancy::Host),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(cloud.vpc_count(), before);
    }

    #[tokio::test]
    async fn small_block_cannot_cover_many_zones() {
        let (cloud, registry) = setup(8).await;

        let err = Vpc::ensure(
            &cloud,
            &registry,
            VpcParams::new("tiny").ipv4_cidr("10.0.0.0/30".parse().unwrap()),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Validation(_)));
    }
}
