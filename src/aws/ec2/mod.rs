//! EC2-backed gateway for networks and security groups

mod groups;
mod network;

pub use groups::{SecurityGroupDescription, SecurityGroupOps};
pub use network::{Tenancy, VpcDescription, VpcOps};

use crate::aws::context::AwsContext;
use crate::aws::error::AwsError;
use aws_sdk_ec2::Client;
use std::future::Future;

/// EC2 client for managing VPCs, subnets, and security groups
pub struct Ec2Client {
    pub(crate) client: Client,
}

impl Ec2Client {
    /// Create a new EC2 client (loads AWS config from the environment)
    pub async fn new(region: &str) -> Self {
        let ctx = AwsContext::new(region).await;
        Self::from_context(&ctx)
    }

    /// Create an EC2 client from a pre-loaded AWS context
    pub fn from_context(ctx: &AwsContext) -> Self {
        Self {
            client: ctx.ec2_client(),
        }
    }
}

/// Tagging operations shared by the network and security-group gateways.
pub trait TagOps: Send + Sync {
    /// Apply key/value tags to one or more EC2 resources
    fn create_tags(
        &self,
        resource_ids: &[String],
        tags: &[(&str, &str)],
    ) -> impl Future<Output = Result<(), AwsError>> + Send;
}

impl TagOps for Ec2Client {
    async fn create_tags(
        &self,
        resource_ids: &[String],
        tags: &[(&str, &str)],
    ) -> Result<(), AwsError> {
        let mut request = self.client.create_tags();
        for id in resource_ids {
            request = request.resources(id);
        }
        for (key, value) in tags {
            request = request.tags(
                aws_sdk_ec2::types::Tag::builder()
                    .key(*key)
                    .value(*value)
                    .build(),
            );
        }

        request.send().await.map_err(AwsError::from_sdk)?;
        Ok(())
    }
}
