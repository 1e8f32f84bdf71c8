//! Lifecycle error taxonomy
//!
//! Every non-transient failure a controller can produce maps to one of these
//! variants. Transient remote conditions are absorbed by [`crate::wait`] and
//! only surface here as [`Error::WaitTimeout`] once the budget is exhausted.

use crate::aws::error::AwsError;
use crate::cidr::CidrError;
use crate::wait::WaitError;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by resource lifecycle operations
#[derive(Debug, Error)]
pub enum Error {
    /// Creation parameters were supplied for a resource that already exists
    /// remotely; carries the existing resource's identifier
    #[error("{message}")]
    ResourceExists { message: String, resource_id: String },

    /// An explicit identifier was supplied but the remote reports no such
    /// resource
    #[error("{message}")]
    ResourceDoesNotExist { message: String, resource_id: String },

    /// A lifecycle operation was invoked after successful destruction
    #[error("resource {resource_id} has already been clobbered")]
    ResourceClobbered { resource_id: String },

    /// Destruction is blocked by live or non-transitioning dependents;
    /// carries their identifiers so the caller can resolve them
    #[error("{message}")]
    CannotDeleteResource {
        message: String,
        resource_ids: Vec<String>,
    },

    /// Malformed or mutually-exclusive input, detected before any remote
    /// mutation
    #[error("invalid input: {0}")]
    Validation(String),

    /// A convergence wait exhausted its time budget
    #[error("timed out waiting for {what} after {waited:?}")]
    WaitTimeout { what: String, waited: Duration },

    /// An AWS error outside the enumerated set, passed through verbatim
    #[error(transparent)]
    Aws(#[from] AwsError),

    /// Local registry failure
    #[error("registry error: {0}")]
    Registry(#[from] sqlx::Error),

    #[error("registry I/O error: {0}")]
    RegistryIo(#[from] std::io::Error),

    #[error("could not determine a data directory for the local registry")]
    NoDataDir,
}

impl From<WaitError> for Error {
    fn from(err: WaitError) -> Self {
        match err {
            WaitError::Timeout { what, waited, .. } => Error::WaitTimeout { what, waited },
            WaitError::Check(e) => Error::Aws(e),
        }
    }
}

impl From<CidrError> for Error {
    fn from(err: CidrError) -> Self {
        Error::Validation(err.to_string())
    }
}
