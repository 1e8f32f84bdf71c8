//! AWS gateway clients and resource lifecycle controllers

pub mod batch;
pub mod context;
pub mod ec2;
pub mod error;
pub mod iam;
pub mod role;
pub mod security_group;
pub mod tags;
pub mod vpc;

pub use batch::BatchClient;
pub use context::AwsContext;
pub use ec2::Ec2Client;
pub use error::AwsError;
pub use iam::IamClient;
pub use role::{Role, RoleParams, ServicePrincipal};
pub use security_group::{SecurityGroup, SecurityGroupParams};
pub use vpc::{Vpc, VpcParams};
