//! Lifecycle integration tests - actually call AWS APIs
//!
//! These tests are marked `#[ignore]` and only run with:
//! ```
//! AWS_PROFILE=your_profile cargo test --test aws_lifecycle_integration -- --ignored
//! ```
//!
//! They create real (free-tier) resources and tear them down again.

mod test_utils;

use batchrig::aws::{AwsContext, BatchClient, Ec2Client, IamClient};
use batchrig::registry::{SECTION_SECURITY_GROUPS, SECTION_VPC};
use batchrig::resource::{Named, RemoteResource};
use batchrig::{Registry, Role, RoleParams, SecurityGroup, SecurityGroupParams, ServicePrincipal, Vpc, VpcParams};
use test_utils::*;

/// Full provision/teardown pass over all three resource kinds.
///
/// Verifies:
/// 1. VPC creation with one subnet per availability zone
/// 2. Security group creation inside that VPC with default ingress
/// 3. Batch role creation with a managed policy and instance profile
/// 4. Registry entries appear on create and disappear on destroy
/// 5. Teardown in dependency order succeeds
#[tokio::test]
#[ignore]
async fn test_full_lifecycle() {
    init_test_logging();
    let region = get_test_region();
    let ctx = AwsContext::new(&region).await;
    let ec2 = Ec2Client::from_context(&ctx);
    let iam = IamClient::from_context(&ctx);
    let batch = BatchClient::from_context(&ctx);

    let registry = Registry::open_at(&scratch_registry_path("batchrig-itest"))
        .await
        .expect("registry should open");

    let vpc_name = unique_name("batchrig-itest-vpc");
    let mut vpc = Vpc::ensure(
        &ec2,
        &registry,
        VpcParams::new(&vpc_name).ipv4_cidr("10.73.0.0/16".parse().unwrap()),
    )
    .await
    .expect("AWS credentials required - set AWS_PROFILE or AWS_ACCESS_KEY_ID");

    assert!(!vpc.pre_existing());
    assert!(!vpc.subnet_ids().is_empty());
    assert!(registry
        .list(SECTION_VPC)
        .await
        .unwrap()
        .contains(vpc.remote_id()));

    // Adopting the same name again must return the same VPC.
    let adopted = Vpc::ensure(&ec2, &registry, VpcParams::new(&vpc_name))
        .await
        .expect("second construction should adopt");
    assert!(adopted.pre_existing());
    assert_eq!(adopted.remote_id(), vpc.remote_id());
    assert_eq!(adopted.subnet_ids(), vpc.subnet_ids());

    let sg_name = unique_name("batchrig-itest-sg");
    let mut sg = SecurityGroup::create(&ec2, &registry, &vpc, SecurityGroupParams::new(&sg_name))
        .await
        .expect("security group should be created");
    assert_eq!(sg.vpc_id(), vpc.remote_id());
    assert_eq!(sg.name(), sg_name);

    let role_name = unique_name("batchrig-itest-role");
    let mut role = Role::ensure(
        &iam,
        &registry,
        RoleParams::new(&role_name)
            .service(ServicePrincipal::Batch)
            .policy("AmazonS3ReadOnlyAccess"),
    )
    .await
    .expect("role should be created");
    assert_eq!(role.service(), ServicePrincipal::Batch);
    assert_eq!(
        role.policies().iter().collect::<Vec<_>>(),
        ["AmazonS3ReadOnlyAccess"]
    );

    // Teardown in dependency order.
    role.destroy(&iam, &batch, &registry)
        .await
        .expect("role teardown should succeed");
    sg.destroy(&ec2, &batch, &registry)
        .await
        .expect("security group teardown should succeed");
    vpc.destroy(&ec2, &registry)
        .await
        .expect("vpc teardown should succeed");

    assert!(registry.list(SECTION_VPC).await.unwrap().is_empty());
    assert!(registry
        .list(SECTION_SECURITY_GROUPS)
        .await
        .unwrap()
        .is_empty());
    assert!(registry.list("batch-roles").await.unwrap().is_empty());
}

/// Destroying a VPC before its security group must fail and list the group.
#[tokio::test]
#[ignore]
async fn test_vpc_teardown_blocked_by_security_group() {
    init_test_logging();
    let region = get_test_region();
    let ctx = AwsContext::new(&region).await;
    let ec2 = Ec2Client::from_context(&ctx);
    let batch = BatchClient::from_context(&ctx);

    let registry = Registry::open_at(&scratch_registry_path("batchrig-itest-dep"))
        .await
        .expect("registry should open");

    let mut vpc = Vpc::ensure(
        &ec2,
        &registry,
        VpcParams::new(unique_name("batchrig-itest-depvpc")),
    )
    .await
    .expect("AWS credentials required - set AWS_PROFILE or AWS_ACCESS_KEY_ID");

    let mut sg = SecurityGroup::create(
        &ec2,
        &registry,
        &vpc,
        SecurityGroupParams::new(unique_name("batchrig-itest-depsg")),
    )
    .await
    .expect("security group should be created");

    let err = vpc
        .destroy(&ec2, &registry)
        .await
        .expect_err("destroy should be blocked by the security group");
    match err {
        batchrig::Error::CannotDeleteResource { resource_ids, .. } => {
            assert!(resource_ids.contains(&sg.security_group_id().to_string()));
        }
        other => panic!("expected CannotDeleteResource, got {other:?}"),
    }

    sg.destroy(&ec2, &batch, &registry)
        .await
        .expect("security group teardown should succeed");
    vpc.destroy(&ec2, &registry)
        .await
        .expect("vpc teardown should succeed after the group is gone");
}
