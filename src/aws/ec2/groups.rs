//! Security group gateway operations

use super::{Ec2Client, TagOps};
use crate::aws::error::AwsError;
use aws_sdk_ec2::types::{Filter, IpPermission, IpRange, Ipv6Range};
use std::future::Future;
use tracing::debug;

/// Canonical attributes of a remote security group
#[derive(Debug, Clone)]
pub struct SecurityGroupDescription {
    pub security_group_id: String,
    pub name: String,
    pub vpc_id: String,
    pub description: String,
}

/// Gateway operations for security groups and the instances using them.
pub trait SecurityGroupOps: TagOps {
    /// Describe a security group by id; `None` when the remote reports it
    /// not found (or the id is malformed)
    fn describe_security_group(
        &self,
        group_id: &str,
    ) -> impl Future<Output = Result<Option<SecurityGroupDescription>, AwsError>> + Send;

    /// Find a security group by group name within a VPC
    fn find_security_group(
        &self,
        name: &str,
        vpc_id: &str,
    ) -> impl Future<Output = Result<Option<SecurityGroupDescription>, AwsError>> + Send;

    /// Create a security group, returning its id
    fn create_security_group(
        &self,
        name: &str,
        description: &str,
        vpc_id: &str,
    ) -> impl Future<Output = Result<String, AwsError>> + Send;

    /// Open inbound TCP on the given ports from all IPv4 and IPv6 sources
    fn authorize_ingress(
        &self,
        group_id: &str,
        ports: &[u16],
    ) -> impl Future<Output = Result<(), AwsError>> + Send;

    fn delete_security_group(
        &self,
        group_id: &str,
    ) -> impl Future<Output = Result<(), AwsError>> + Send;

    /// Ids of instances in a VPC whose security group list includes this
    /// group
    fn instances_using_group(
        &self,
        vpc_id: &str,
        group_id: &str,
    ) -> impl Future<Output = Result<Vec<String>, AwsError>> + Send;

    fn terminate_instances(
        &self,
        instance_ids: &[String],
    ) -> impl Future<Output = Result<(), AwsError>> + Send;
}

fn group_description(group: &aws_sdk_ec2::types::SecurityGroup) -> SecurityGroupDescription {
    SecurityGroupDescription {
        security_group_id: group.group_id().unwrap_or_default().to_string(),
        name: group.group_name().unwrap_or_default().to_string(),
        vpc_id: group.vpc_id().unwrap_or_default().to_string(),
        description: group.description().unwrap_or_default().to_string(),
    }
}

impl SecurityGroupOps for Ec2Client {
    async fn describe_security_group(
        &self,
        group_id: &str,
    ) -> Result<Option<SecurityGroupDescription>, AwsError> {
        let response = match self
            .client
            .describe_security_groups()
            .group_ids(group_id)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                let err = AwsError::from_sdk(err);
                return if err.is_not_found() { Ok(None) } else { Err(err) };
            }
        };

        Ok(response.security_groups().first().map(group_description))
    }

    async fn find_security_group(
        &self,
        name: &str,
        vpc_id: &str,
    ) -> Result<Option<SecurityGroupDescription>, AwsError> {
        let response = self
            .client
            .describe_security_groups()
            .filters(Filter::builder().name("group-name").values(name).build())
            .filters(Filter::builder().name("vpc-id").values(vpc_id).build())
            .send()
            .await
            .map_err(AwsError::from_sdk)?;

        Ok(response.security_groups().first().map(group_description))
    }

    async fn create_security_group(
        &self,
        name: &str,
        description: &str,
        vpc_id: &str,
    ) -> Result<String, AwsError> {
        let response = self
            .client
            .create_security_group()
            .group_name(name)
            .description(description)
            .vpc_id(vpc_id)
            .send()
            .await
            .map_err(AwsError::from_sdk)?;

        response
            .group_id()
            .map(String::from)
            .ok_or_else(|| AwsError::Sdk {
                code: None,
                message: "CreateSecurityGroup returned no group id".to_string(),
            })
    }

    async fn authorize_ingress(&self, group_id: &str, ports: &[u16]) -> Result<(), AwsError> {
        let mut request = self
            .client
            .authorize_security_group_ingress()
            .group_id(group_id);

        for port in ports {
            request = request.ip_permissions(
                IpPermission::builder()
                    .ip_protocol("tcp")
                    .from_port(i32::from(*port))
                    .to_port(i32::from(*port))
                    .ip_ranges(IpRange::builder().cidr_ip("0.0.0.0/0").build())
                    .ipv6_ranges(Ipv6Range::builder().cidr_ipv6("::/0").build())
                    .build(),
            );
        }

        request.send().await.map_err(AwsError::from_sdk)?;

        debug!(group_id = %group_id, ports = ?ports, "Authorized ingress rules");
        Ok(())
    }

    async fn delete_security_group(&self, group_id: &str) -> Result<(), AwsError> {
        self.client
            .delete_security_group()
            .group_id(group_id)
            .send()
            .await
            .map_err(AwsError::from_sdk)?;

        debug!(group_id = %group_id, "Deleted security group");
        Ok(())
    }

    async fn instances_using_group(
        &self,
        vpc_id: &str,
        group_id: &str,
    ) -> Result<Vec<String>, AwsError> {
        let mut instance_ids = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .describe_instances()
                .filters(Filter::builder().name("vpc-id").values(vpc_id).build());
            if let Some(token) = &next_token {
                request = request.next_token(token);
            }

            let response = request.send().await.map_err(AwsError::from_sdk)?;
            for reservation in response.reservations() {
                for instance in reservation.instances() {
                    let uses_group = instance
                        .security_groups()
                        .iter()
                        .any(|group| group.group_id() == Some(group_id));
                    if uses_group {
                        if let Some(id) = instance.instance_id() {
                            instance_ids.push(id.to_string());
                        }
                    }
                }
            }

            match response.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => break,
            }
        }

        Ok(instance_ids)
    }

    async fn terminate_instances(&self, instance_ids: &[String]) -> Result<(), AwsError> {
        self.client
            .terminate_instances()
            .set_instance_ids(Some(instance_ids.to_vec()))
            .send()
            .await
            .map_err(AwsError::from_sdk)?;

        debug!(instance_ids = ?instance_ids, "Terminated instances");
        Ok(())
    }
}
