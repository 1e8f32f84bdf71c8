//! Batch gateway for compute environment dependency queries
//!
//! Compute environments are never managed by this crate; they only appear as
//! teardown blockers for security groups and batch service roles.

use crate::aws::context::AwsContext;
use crate::aws::error::AwsError;
use aws_sdk_batch::types::CeStatus;
use aws_sdk_batch::Client;
use std::future::Future;

/// Batch client for querying compute environments
pub struct BatchClient {
    client: Client,
}

impl BatchClient {
    /// Create a new Batch client (loads AWS config from the environment)
    pub async fn new(region: &str) -> Self {
        let ctx = AwsContext::new(region).await;
        Self::from_context(&ctx)
    }

    /// Create a Batch client from a pre-loaded AWS context
    pub fn from_context(ctx: &AwsContext) -> Self {
        Self {
            client: ctx.batch_client(),
        }
    }
}

/// Lifecycle status of a compute environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeEnvStatus {
    Creating,
    Updating,
    Deleting,
    Deleted,
    Valid,
    Invalid,
}

impl ComputeEnvStatus {
    /// Whether the environment is already on its way out
    pub fn is_terminating(&self) -> bool {
        matches!(self, ComputeEnvStatus::Deleting | ComputeEnvStatus::Deleted)
    }

    fn from_aws(status: Option<&CeStatus>) -> Self {
        match status {
            Some(CeStatus::Creating) => ComputeEnvStatus::Creating,
            Some(CeStatus::Updating) => ComputeEnvStatus::Updating,
            Some(CeStatus::Deleting) => ComputeEnvStatus::Deleting,
            Some(CeStatus::Deleted) => ComputeEnvStatus::Deleted,
            Some(CeStatus::Valid) => ComputeEnvStatus::Valid,
            _ => ComputeEnvStatus::Invalid,
        }
    }
}

/// A compute environment that blocks a teardown
#[derive(Debug, Clone)]
pub struct ComputeEnvironment {
    pub name: String,
    pub arn: String,
    pub status: ComputeEnvStatus,
}

/// Gateway operations over compute environments.
pub trait ComputeEnvOps: Send + Sync {
    /// Compute environments whose resources include this security group
    fn environments_using_security_group(
        &self,
        group_id: &str,
    ) -> impl Future<Output = Result<Vec<ComputeEnvironment>, AwsError>> + Send;

    /// Compute environments using this role as their service role
    fn environments_with_service_role(
        &self,
        role_arn: &str,
    ) -> impl Future<Output = Result<Vec<ComputeEnvironment>, AwsError>> + Send;

    /// Current status of an environment; `None` once it is gone
    fn environment_status(
        &self,
        arn: &str,
    ) -> impl Future<Output = Result<Option<ComputeEnvStatus>, AwsError>> + Send;
}

impl BatchClient {
    /// List every compute environment, paginated until exhausted.
    async fn all_environments(
        &self,
    ) -> Result<Vec<aws_sdk_batch::types::ComputeEnvironmentDetail>, AwsError> {
        let mut environments = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let mut request = self.client.describe_compute_environments();
            if let Some(token) = &next_token {
                request = request.next_token(token);
            }

            let response = request.send().await.map_err(AwsError::from_sdk)?;
            environments.extend(response.compute_environments().iter().cloned());

            match response.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => break,
            }
        }

        Ok(environments)
    }
}

fn environment(detail: &aws_sdk_batch::types::ComputeEnvironmentDetail) -> ComputeEnvironment {
    ComputeEnvironment {
        name: detail.compute_environment_name().unwrap_or_default().to_string(),
        arn: detail.compute_environment_arn().unwrap_or_default().to_string(),
        status: ComputeEnvStatus::from_aws(detail.status()),
    }
}

impl ComputeEnvOps for BatchClient {
    async fn environments_using_security_group(
        &self,
        group_id: &str,
    ) -> Result<Vec<ComputeEnvironment>, AwsError> {
        Ok(self
            .all_environments()
            .await?
            .iter()
            .filter(|detail| {
                detail
                    .compute_resources()
                    .map(|resources| {
                        resources
                            .security_group_ids()
                            .iter()
                            .any(|id| id == group_id)
                    })
                    .unwrap_or(false)
            })
            .map(environment)
            .collect())
    }

    async fn environments_with_service_role(
        &self,
        role_arn: &str,
    ) -> Result<Vec<ComputeEnvironment>, AwsError> {
        Ok(self
            .all_environments()
            .await?
            .iter()
            .filter(|detail| detail.service_role() == Some(role_arn))
            .map(environment)
            .collect())
    }

    async fn environment_status(&self, arn: &str) -> Result<Option<ComputeEnvStatus>, AwsError> {
        let response = self
            .client
            .describe_compute_environments()
            .compute_environments(arn)
            .send()
            .await
            .map_err(AwsError::from_sdk)?;

        Ok(response
            .compute_environments()
            .first()
            .map(|detail| ComputeEnvStatus::from_aws(detail.status())))
    }
}
