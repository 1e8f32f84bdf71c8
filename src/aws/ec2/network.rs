//! VPC and subnet gateway operations

use super::{Ec2Client, TagOps};
use crate::aws::error::AwsError;
use crate::aws::tags::TAG_NAME;
use aws_sdk_ec2::types::{Filter, SubnetState, Tenancy as AwsTenancy, VpcState};
use std::fmt;
use std::future::Future;
use tracing::debug;

/// Instance tenancy of a VPC.
///
/// Only `Default` and `Dedicated` are accepted when creating a VPC; `Host`
/// exists so adopted VPCs with host tenancy can still be represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tenancy {
    Default,
    Dedicated,
    Host,
}

impl Tenancy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tenancy::Default => "default",
            Tenancy::Dedicated => "dedicated",
            Tenancy::Host => "host",
        }
    }

    fn from_aws(tenancy: Option<&AwsTenancy>) -> Self {
        match tenancy {
            Some(AwsTenancy::Dedicated) => Tenancy::Dedicated,
            Some(AwsTenancy::Host) => Tenancy::Host,
            _ => Tenancy::Default,
        }
    }
}

impl fmt::Display for Tenancy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical attributes of a remote VPC
#[derive(Debug, Clone)]
pub struct VpcDescription {
    pub vpc_id: String,
    /// Value of the `Name` tag, if the VPC carries one
    pub name: Option<String>,
    pub ipv4_cidr: String,
    pub instance_tenancy: Tenancy,
}

/// Gateway operations for VPCs and their subnets.
pub trait VpcOps: TagOps {
    /// Describe a VPC by id; `None` when the remote reports it not found
    fn describe_vpc(
        &self,
        vpc_id: &str,
    ) -> impl Future<Output = Result<Option<VpcDescription>, AwsError>> + Send;

    /// Find the id of the VPC carrying a `Name` tag with this value
    fn vpc_id_for_name(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Option<String>, AwsError>> + Send;

    /// All subnet ids belonging to a VPC
    fn list_subnet_ids(
        &self,
        vpc_id: &str,
    ) -> impl Future<Output = Result<Vec<String>, AwsError>> + Send;

    /// Names of the availability zones in this region
    fn availability_zones(&self) -> impl Future<Output = Result<Vec<String>, AwsError>> + Send;

    /// Create a VPC, returning its id
    fn create_vpc(
        &self,
        ipv4_cidr: &str,
        tenancy: Tenancy,
    ) -> impl Future<Output = Result<String, AwsError>> + Send;

    /// Whether a VPC is visible and in the `available` state
    fn vpc_available(&self, vpc_id: &str) -> impl Future<Output = Result<bool, AwsError>> + Send;

    /// Create a subnet in a zone, returning its id
    fn create_subnet(
        &self,
        vpc_id: &str,
        zone: &str,
        ipv4_cidr: &str,
    ) -> impl Future<Output = Result<String, AwsError>> + Send;

    /// Whether every listed subnet is visible and `available`
    fn subnets_available(
        &self,
        subnet_ids: &[String],
    ) -> impl Future<Output = Result<bool, AwsError>> + Send;

    fn delete_subnet(&self, subnet_id: &str) -> impl Future<Output = Result<(), AwsError>> + Send;

    fn delete_vpc(&self, vpc_id: &str) -> impl Future<Output = Result<(), AwsError>> + Send;

    /// Ids of all security groups living in a VPC (its deletion blockers)
    fn security_group_ids_in_vpc(
        &self,
        vpc_id: &str,
    ) -> impl Future<Output = Result<Vec<String>, AwsError>> + Send;
}

fn vpc_description(vpc: &aws_sdk_ec2::types::Vpc) -> VpcDescription {
    let name = vpc
        .tags()
        .iter()
        .find(|tag| tag.key() == Some(TAG_NAME))
        .and_then(|tag| tag.value())
        .map(String::from);

    VpcDescription {
        vpc_id: vpc.vpc_id().unwrap_or_default().to_string(),
        name,
        ipv4_cidr: vpc.cidr_block().unwrap_or_default().to_string(),
        instance_tenancy: Tenancy::from_aws(vpc.instance_tenancy()),
    }
}

impl VpcOps for Ec2Client {
    async fn describe_vpc(&self, vpc_id: &str) -> Result<Option<VpcDescription>, AwsError> {
        let response = match self.client.describe_vpcs().vpc_ids(vpc_id).send().await {
            Ok(response) => response,
            Err(err) => {
                let err = AwsError::from_sdk(err);
                return if err.is_not_found() { Ok(None) } else { Err(err) };
            }
        };

        Ok(response.vpcs().first().map(vpc_description))
    }

    async fn vpc_id_for_name(&self, name: &str) -> Result<Option<String>, AwsError> {
        let response = self
            .client
            .describe_tags()
            .filters(
                Filter::builder()
                    .name("resource-type")
                    .values("vpc")
                    .build(),
            )
            .filters(Filter::builder().name("key").values(TAG_NAME).build())
            .filters(Filter::builder().name("value").values(name).build())
            .send()
            .await
            .map_err(AwsError::from_sdk)?;

        Ok(response
            .tags()
            .first()
            .and_then(|tag| tag.resource_id())
            .map(String::from))
    }

    async fn list_subnet_ids(&self, vpc_id: &str) -> Result<Vec<String>, AwsError> {
        let mut subnet_ids = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .describe_subnets()
                .filters(Filter::builder().name("vpc-id").values(vpc_id).build());
            if let Some(token) = &next_token {
                request = request.next_token(token);
            }

            let response = request.send().await.map_err(AwsError::from_sdk)?;
            subnet_ids.extend(
                response
                    .subnets()
                    .iter()
                    .filter_map(|subnet| subnet.subnet_id())
                    .map(String::from),
            );

            match response.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => break,
            }
        }

        Ok(subnet_ids)
    }

    async fn availability_zones(&self) -> Result<Vec<String>, AwsError> {
        let response = self
            .client
            .describe_availability_zones()
            .send()
            .await
            .map_err(AwsError::from_sdk)?;

        Ok(response
            .availability_zones()
            .iter()
            .filter_map(|zone| zone.zone_name())
            .map(String::from)
            .collect())
    }

    async fn create_vpc(&self, ipv4_cidr: &str, tenancy: Tenancy) -> Result<String, AwsError> {
        let response = self
            .client
            .create_vpc()
            .cidr_block(ipv4_cidr)
            .instance_tenancy(AwsTenancy::from(tenancy.as_str()))
            .send()
            .await
            .map_err(AwsError::from_sdk)?;

        response
            .vpc()
            .and_then(|vpc| vpc.vpc_id())
            .map(String::from)
            .ok_or_else(|| AwsError::Sdk {
                code: None,
                message: "CreateVpc returned no VPC id".to_string(),
            })
    }

    async fn vpc_available(&self, vpc_id: &str) -> Result<bool, AwsError> {
        let response = match self.client.describe_vpcs().vpc_ids(vpc_id).send().await {
            Ok(response) => response,
            Err(err) => {
                let err = AwsError::from_sdk(err);
                // A freshly created VPC may not be visible yet.
                return if err.is_not_found() { Ok(false) } else { Err(err) };
            }
        };

        Ok(response
            .vpcs()
            .first()
            .and_then(|vpc| vpc.state())
            .is_some_and(|state| *state == VpcState::Available))
    }

    async fn create_subnet(
        &self,
        vpc_id: &str,
        zone: &str,
        ipv4_cidr: &str,
    ) -> Result<String, AwsError> {
        let response = self
            .client
            .create_subnet()
            .vpc_id(vpc_id)
            .availability_zone(zone)
            .cidr_block(ipv4_cidr)
            .send()
            .await
            .map_err(AwsError::from_sdk)?;

        response
            .subnet()
            .and_then(|subnet| subnet.subnet_id())
            .map(String::from)
            .ok_or_else(|| AwsError::Sdk {
                code: None,
                message: "CreateSubnet returned no subnet id".to_string(),
            })
    }

    async fn subnets_available(&self, subnet_ids: &[String]) -> Result<bool, AwsError> {
        let response = match self
            .client
            .describe_subnets()
            .set_subnet_ids(Some(subnet_ids.to_vec()))
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                let err = AwsError::from_sdk(err);
                return if err.is_not_found() { Ok(false) } else { Err(err) };
            }
        };

        let subnets = response.subnets();
        Ok(subnets.len() == subnet_ids.len()
            && subnets
                .iter()
                .all(|subnet| subnet.state() == Some(&SubnetState::Available)))
    }

    async fn delete_subnet(&self, subnet_id: &str) -> Result<(), AwsError> {
        self.client
            .delete_subnet()
            .subnet_id(subnet_id)
            .send()
            .await
            .map_err(AwsError::from_sdk)?;

        debug!(subnet_id = %subnet_id, "Deleted subnet");
        Ok(())
    }

    async fn delete_vpc(&self, vpc_id: &str) -> Result<(), AwsError> {
        self.client
            .delete_vpc()
            .vpc_id(vpc_id)
            .send()
            .await
            .map_err(AwsError::from_sdk)?;

        debug!(vpc_id = %vpc_id, "Deleted VPC");
        Ok(())
    }

    async fn security_group_ids_in_vpc(&self, vpc_id: &str) -> Result<Vec<String>, AwsError> {
        let mut group_ids = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .describe_security_groups()
                .filters(Filter::builder().name("vpc-id").values(vpc_id).build());
            if let Some(token) = &next_token {
                request = request.next_token(token);
            }

            let response = request.send().await.map_err(AwsError::from_sdk)?;
            group_ids.extend(
                response
                    .security_groups()
                    .iter()
                    .filter_map(|group| group.group_id())
                    .map(String::from),
            );

            match response.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => break,
            }
        }

        Ok(group_ids)
    }
}
