//! AWS error classification and handling
//!
//! Provides typed errors for AWS SDK operations using the error metadata
//! `code()` rather than string matching. The lifecycle controllers branch
//! only on the enumerated categories below; everything else passes through
//! as [`AwsError::Sdk`] verbatim.

use aws_sdk_ec2::error::{ProvideErrorMetadata, SdkError};
use thiserror::Error;

/// AWS error categories for lifecycle and retry logic
#[derive(Debug, Error)]
pub enum AwsError {
    /// Resource was not found
    #[error("resource not found ({code}): {message}")]
    NotFound { code: String, message: String },

    /// Resource already exists (tolerated in idempotent create paths)
    #[error("resource already exists: {message}")]
    AlreadyExists { message: String },

    /// Rate limit exceeded (retryable with backoff)
    #[error("rate limit exceeded: {message}")]
    Throttled { message: String },

    /// Resource has dependent objects (e.g. a security group with attached
    /// ENIs, a VPC with live security groups)
    #[error("resource has dependent objects: {message}")]
    DependencyViolation { message: String },

    /// Generic AWS SDK error with code and message
    #[error("AWS error: {message}")]
    Sdk {
        code: Option<String>,
        message: String,
    },
}

/// Known AWS error codes for "not found" conditions
const NOT_FOUND_CODES: &[&str] = &[
    "InvalidVpcID.NotFound",
    "InvalidSubnetID.NotFound",
    "InvalidGroup.NotFound",
    "InvalidGroupId.Malformed",
    "InvalidPermission.NotFound",
    "NoSuchEntity",
];

/// Known AWS error codes for "already exists" conditions
const ALREADY_EXISTS_CODES: &[&str] = &[
    "EntityAlreadyExists",
    "InvalidGroup.Duplicate",
    "InvalidPermission.Duplicate",
];

/// Known AWS error codes for throttling/rate limiting
const THROTTLING_CODES: &[&str] = &["Throttling", "ThrottlingException", "RequestLimitExceeded"];

/// Known AWS error codes for dependency violations (resource still in use)
const DEPENDENCY_CODES: &[&str] = &["DependencyViolation", "DeleteConflict"];

impl AwsError {
    /// Check if this is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, AwsError::NotFound { .. })
    }

    /// Check if this is an "already exists" error
    pub fn is_already_exists(&self) -> bool {
        matches!(self, AwsError::AlreadyExists { .. })
    }

    /// Check if this is a dependency violation
    pub fn is_dependency_violation(&self) -> bool {
        matches!(self, AwsError::DependencyViolation { .. })
    }

    /// Check if this is a retryable transient error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AwsError::Throttled { .. } | AwsError::DependencyViolation { .. }
        )
    }

    /// Classify an AWS error using its code.
    pub fn classify(code: Option<&str>, message: Option<&str>) -> Self {
        let message = message.unwrap_or("unknown error").to_string();

        match code {
            Some(c) if NOT_FOUND_CODES.contains(&c) => AwsError::NotFound {
                code: c.to_string(),
                message,
            },
            Some(c) if ALREADY_EXISTS_CODES.contains(&c) => AwsError::AlreadyExists { message },
            Some(c) if THROTTLING_CODES.contains(&c) => AwsError::Throttled { message },
            Some(c) if DEPENDENCY_CODES.contains(&c) => AwsError::DependencyViolation { message },
            _ => AwsError::Sdk {
                code: code.map(|s| s.to_string()),
                message,
            },
        }
    }

    /// Classify an AWS SDK operation error via its error metadata.
    pub(crate) fn from_sdk<E, R>(err: SdkError<E, R>) -> Self
    where
        E: ProvideErrorMetadata + std::fmt::Debug,
        R: std::fmt::Debug,
    {
        let meta = ProvideErrorMetadata::meta(&err);
        match (meta.code(), meta.message()) {
            // No metadata at all - dispatch/timeout failures; keep the whole
            // error chain in the message.
            (None, None) => AwsError::Sdk {
                code: None,
                message: format!("{err:?}"),
            },
            (code, message) => Self::classify(code, message),
        }
    }
}

/// Treat a not-found error as success, for idempotent teardown paths where
/// "already gone" satisfies the intent.
pub fn ignore_not_found<T>(result: Result<T, AwsError>) -> Result<Option<T>, AwsError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_codes() {
        for code in NOT_FOUND_CODES {
            let err = AwsError::classify(Some(code), Some("some message"));
            assert!(err.is_not_found(), "Expected NotFound for code: {code}");
        }
    }

    #[test]
    fn already_exists_codes() {
        for code in ALREADY_EXISTS_CODES {
            let err = AwsError::classify(Some(code), Some("msg"));
            assert!(
                err.is_already_exists(),
                "Expected AlreadyExists for code: {code}"
            );
        }
    }

    #[test]
    fn throttling_codes() {
        for code in THROTTLING_CODES {
            let err = AwsError::classify(Some(code), Some("msg"));
            assert!(err.is_retryable(), "Expected retryable for code: {code}");
            assert!(matches!(err, AwsError::Throttled { .. }));
        }
    }

    #[test]
    fn dependency_violation_codes() {
        for code in DEPENDENCY_CODES {
            let err = AwsError::classify(Some(code), Some("ENI attached"));
            assert!(err.is_retryable());
            assert!(err.is_dependency_violation());
        }
    }

    #[test]
    fn unknown_and_missing_codes_pass_through() {
        let err = AwsError::classify(Some("SomeNewError"), Some("details"));
        assert!(matches!(err, AwsError::Sdk { .. }));

        let err2 = AwsError::classify(None, Some("something failed"));
        assert!(matches!(err2, AwsError::Sdk { code: None, .. }));
    }

    #[test]
    fn not_found_is_not_retryable() {
        let err = AwsError::classify(Some("NoSuchEntity"), Some("no role"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn ignore_not_found_passes_other_errors_through() {
        assert_eq!(ignore_not_found(Ok(1)).unwrap(), Some(1));

        let gone = AwsError::classify(Some("InvalidSubnetID.NotFound"), Some("gone"));
        assert_eq!(ignore_not_found::<()>(Err(gone)).unwrap(), None);

        let fatal = AwsError::classify(Some("UnauthorizedOperation"), Some("nope"));
        assert!(ignore_not_found::<()>(Err(fatal)).is_err());
    }
}
