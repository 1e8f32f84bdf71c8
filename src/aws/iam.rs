//! IAM gateway for roles, policies, and instance profiles

use crate::aws::context::AwsContext;
use crate::aws::error::AwsError;
use aws_sdk_iam::Client;
use percent_encoding::percent_decode_str;
use std::future::Future;
use tracing::debug;

/// IAM client for managing roles and instance profiles
pub struct IamClient {
    client: Client,
}

impl IamClient {
    /// Create a new IAM client (loads AWS config from the environment)
    pub async fn new(region: &str) -> Self {
        let ctx = AwsContext::new(region).await;
        Self::from_context(&ctx)
    }

    /// Create an IAM client from a pre-loaded AWS context
    pub fn from_context(ctx: &AwsContext) -> Self {
        Self {
            client: ctx.iam_client(),
        }
    }
}

/// Canonical attributes of a remote IAM role
#[derive(Debug, Clone)]
pub struct RoleDescription {
    pub arn: String,
    pub description: Option<String>,
    /// The decoded assume-role policy document
    pub trust_policy: serde_json::Value,
}

/// An instance profile attached to a role
#[derive(Debug, Clone)]
pub struct InstanceProfileSummary {
    pub name: String,
    pub arn: String,
}

/// Gateway operations for IAM roles.
pub trait RoleOps: Send + Sync {
    /// Fetch a role by name; `None` when the remote reports it not found
    fn get_role(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Option<RoleDescription>, AwsError>> + Send;

    /// Names of the managed policies attached to a role
    fn attached_policy_names(
        &self,
        role_name: &str,
    ) -> impl Future<Output = Result<Vec<String>, AwsError>> + Send;

    /// Names of every policy in the remote catalog, paginated until
    /// exhausted
    fn list_policy_names(&self) -> impl Future<Output = Result<Vec<String>, AwsError>> + Send;

    /// Resolve a policy name to its ARN through the paginated catalog
    fn policy_arn(
        &self,
        policy_name: &str,
    ) -> impl Future<Output = Result<Option<String>, AwsError>> + Send;

    /// Create a role, returning its ARN
    fn create_role(
        &self,
        name: &str,
        trust_policy: &str,
        description: &str,
    ) -> impl Future<Output = Result<String, AwsError>> + Send;

    fn attach_role_policy(
        &self,
        role_name: &str,
        policy_arn: &str,
    ) -> impl Future<Output = Result<(), AwsError>> + Send;

    fn detach_role_policy(
        &self,
        role_name: &str,
        policy_arn: &str,
    ) -> impl Future<Output = Result<(), AwsError>> + Send;

    fn create_instance_profile(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<(), AwsError>> + Send;

    fn instance_profile_exists(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<bool, AwsError>> + Send;

    fn add_role_to_instance_profile(
        &self,
        profile_name: &str,
        role_name: &str,
    ) -> impl Future<Output = Result<(), AwsError>> + Send;

    /// Instance profiles this role is attached to
    fn instance_profiles_for_role(
        &self,
        role_name: &str,
    ) -> impl Future<Output = Result<Vec<InstanceProfileSummary>, AwsError>> + Send;

    fn remove_role_from_instance_profile(
        &self,
        profile_name: &str,
        role_name: &str,
    ) -> impl Future<Output = Result<(), AwsError>> + Send;

    fn delete_instance_profile(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<(), AwsError>> + Send;

    fn delete_role(&self, name: &str) -> impl Future<Output = Result<(), AwsError>> + Send;
}

/// Decode the URL-encoded policy document IAM returns.
fn decode_policy_document(document: &str) -> Result<serde_json::Value, AwsError> {
    let decoded = percent_decode_str(document)
        .decode_utf8()
        .map_err(|err| AwsError::Sdk {
            code: None,
            message: format!("policy document is not valid UTF-8: {err}"),
        })?;

    serde_json::from_str(&decoded).map_err(|err| AwsError::Sdk {
        code: None,
        message: format!("policy document is not valid JSON: {err}"),
    })
}

impl RoleOps for IamClient {
    async fn get_role(&self, name: &str) -> Result<Option<RoleDescription>, AwsError> {
        let response = match self.client.get_role().role_name(name).send().await {
            Ok(response) => response,
            Err(err) => {
                let err = AwsError::from_sdk(err);
                return if err.is_not_found() { Ok(None) } else { Err(err) };
            }
        };

        let Some(role) = response.role() else {
            return Ok(None);
        };

        let trust_policy = match role.assume_role_policy_document() {
            Some(document) => decode_policy_document(document)?,
            None => serde_json::Value::Null,
        };

        Ok(Some(RoleDescription {
            arn: role.arn().to_string(),
            description: role.description().map(String::from),
            trust_policy,
        }))
    }

    async fn attached_policy_names(&self, role_name: &str) -> Result<Vec<String>, AwsError> {
        let mut names = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_attached_role_policies()
                .role_name(role_name);
            if let Some(marker) = &marker {
                request = request.marker(marker);
            }

            let response = request.send().await.map_err(AwsError::from_sdk)?;
            names.extend(
                response
                    .attached_policies()
                    .iter()
                    .filter_map(|policy| policy.policy_name())
                    .map(String::from),
            );

            if response.is_truncated() {
                marker = response.marker().map(String::from);
            } else {
                break;
            }
        }

        Ok(names)
    }

    async fn list_policy_names(&self) -> Result<Vec<String>, AwsError> {
        let mut names = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let mut request = self.client.list_policies();
            if let Some(marker) = &marker {
                request = request.marker(marker);
            }

            let response = request.send().await.map_err(AwsError::from_sdk)?;
            names.extend(
                response
                    .policies()
                    .iter()
                    .filter_map(|policy| policy.policy_name())
                    .map(String::from),
            );

            if response.is_truncated() {
                marker = response.marker().map(String::from);
            } else {
                break;
            }
        }

        Ok(names)
    }

    async fn policy_arn(&self, policy_name: &str) -> Result<Option<String>, AwsError> {
        let mut marker: Option<String> = None;

        loop {
            let mut request = self.client.list_policies();
            if let Some(marker) = &marker {
                request = request.marker(marker);
            }

            let response = request.send().await.map_err(AwsError::from_sdk)?;
            let found = response
                .policies()
                .iter()
                .find(|policy| policy.policy_name() == Some(policy_name))
                .and_then(|policy| policy.arn())
                .map(String::from);
            if found.is_some() {
                return Ok(found);
            }

            if response.is_truncated() {
                marker = response.marker().map(String::from);
            } else {
                return Ok(None);
            }
        }
    }

    async fn create_role(
        &self,
        name: &str,
        trust_policy: &str,
        description: &str,
    ) -> Result<String, AwsError> {
        let response = self
            .client
            .create_role()
            .role_name(name)
            .assume_role_policy_document(trust_policy)
            .description(description)
            .send()
            .await
            .map_err(AwsError::from_sdk)?;

        response
            .role()
            .map(|role| role.arn().to_string())
            .ok_or_else(|| AwsError::Sdk {
                code: None,
                message: "CreateRole returned no role".to_string(),
            })
    }

    async fn attach_role_policy(&self, role_name: &str, policy_arn: &str) -> Result<(), AwsError> {
        self.client
            .attach_role_policy()
            .role_name(role_name)
            .policy_arn(policy_arn)
            .send()
            .await
            .map_err(AwsError::from_sdk)?;

        debug!(role = %role_name, policy_arn = %policy_arn, "Attached policy");
        Ok(())
    }

    async fn detach_role_policy(&self, role_name: &str, policy_arn: &str) -> Result<(), AwsError> {
        self.client
            .detach_role_policy()
            .role_name(role_name)
            .policy_arn(policy_arn)
            .send()
            .await
            .map_err(AwsError::from_sdk)?;

        debug!(role = %role_name, policy_arn = %policy_arn, "Detached policy");
        Ok(())
    }

    async fn create_instance_profile(&self, name: &str) -> Result<(), AwsError> {
        self.client
            .create_instance_profile()
            .instance_profile_name(name)
            .send()
            .await
            .map_err(AwsError::from_sdk)?;

        Ok(())
    }

    async fn instance_profile_exists(&self, name: &str) -> Result<bool, AwsError> {
        match self
            .client
            .get_instance_profile()
            .instance_profile_name(name)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                let err = AwsError::from_sdk(err);
                if err.is_not_found() {
                    Ok(false)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn add_role_to_instance_profile(
        &self,
        profile_name: &str,
        role_name: &str,
    ) -> Result<(), AwsError> {
        self.client
            .add_role_to_instance_profile()
            .instance_profile_name(profile_name)
            .role_name(role_name)
            .send()
            .await
            .map_err(AwsError::from_sdk)?;

        Ok(())
    }

    async fn instance_profiles_for_role(
        &self,
        role_name: &str,
    ) -> Result<Vec<InstanceProfileSummary>, AwsError> {
        let mut profiles = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_instance_profiles_for_role()
                .role_name(role_name);
            if let Some(marker) = &marker {
                request = request.marker(marker);
            }

            let response = request.send().await.map_err(AwsError::from_sdk)?;
            profiles.extend(response.instance_profiles().iter().map(|profile| {
                InstanceProfileSummary {
                    name: profile.instance_profile_name().to_string(),
                    arn: profile.arn().to_string(),
                }
            }));

            if response.is_truncated() {
                marker = response.marker().map(String::from);
            } else {
                break;
            }
        }

        Ok(profiles)
    }

    async fn remove_role_from_instance_profile(
        &self,
        profile_name: &str,
        role_name: &str,
    ) -> Result<(), AwsError> {
        self.client
            .remove_role_from_instance_profile()
            .instance_profile_name(profile_name)
            .role_name(role_name)
            .send()
            .await
            .map_err(AwsError::from_sdk)?;

        Ok(())
    }

    async fn delete_instance_profile(&self, name: &str) -> Result<(), AwsError> {
        self.client
            .delete_instance_profile()
            .instance_profile_name(name)
            .send()
            .await
            .map_err(AwsError::from_sdk)?;

        debug!(profile = %name, "Deleted instance profile");
        Ok(())
    }

    async fn delete_role(&self, name: &str) -> Result<(), AwsError> {
        self.client
            .delete_role()
            .role_name(name)
            .send()
            .await
            .map_err(AwsError::from_sdk)?;

        debug!(role = %name, "Deleted role");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_url_encoded_policy_documents() {
        let encoded = "%7B%22Statement%22%3A%5B%7B%22Effect%22%3A%22Allow%22%7D%5D%7D";
        let value = decode_policy_document(encoded).unwrap();
        assert_eq!(value["Statement"][0]["Effect"], "Allow");
    }

    #[test]
    fn plain_json_documents_decode_unchanged() {
        let value = decode_policy_document(r#"{"Version": "2012-10-17"}"#).unwrap();
        assert_eq!(value["Version"], "2012-10-17");
    }

    #[test]
    fn garbage_documents_are_rejected() {
        assert!(decode_policy_document("not json").is_err());
    }
}
