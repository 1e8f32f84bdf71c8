//! Waiting for remote state convergence with exponential backoff.
//!
//! Provides a generic abstraction for waiting on AWS resources (or any async
//! condition) to become ready, with configurable exponential backoff and a
//! hard cap on total elapsed time. Timeout is a distinguishable failure, not
//! a generic error, so callers can map it to their own taxonomy.

use crate::aws::error::AwsError;
use backon::{BackoffBuilder, ExponentialBuilder};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Configuration for resource waiting with exponential backoff.
#[derive(Debug, Clone)]
pub struct WaitConfig {
    /// Initial delay between checks
    pub initial_delay: Duration,
    /// Maximum delay between checks (cap for exponential growth)
    pub max_delay: Duration,
    /// Maximum total time to wait before timeout
    pub timeout: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            timeout: Duration::from_secs(60),
        }
    }
}

impl WaitConfig {
    /// Create a new WaitConfig with the given timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Default::default()
        }
    }
}

/// A convergence wait that did not complete.
#[derive(Debug, Error)]
pub enum WaitError {
    /// The total time budget elapsed before the condition held.
    #[error("timed out waiting for {what} after {waited:?} ({attempts} attempts)")]
    Timeout {
        what: String,
        waited: Duration,
        attempts: u32,
    },

    /// The readiness check itself failed; not retried.
    #[error(transparent)]
    Check(#[from] AwsError),
}

/// Wait until `check` reports ready, backing off exponentially between polls.
///
/// `check` returns `Ok(true)` when the condition holds, `Ok(false)` to poll
/// again after the next delay, or `Err` to abort immediately. The wait never
/// retries on a check error - only "not ready yet" results are polled.
///
/// # Returns
/// * `Ok(())` - the condition held within the budget
/// * `Err(WaitError::Timeout)` - the budget elapsed first
/// * `Err(WaitError::Check)` - the check failed
pub async fn wait_until<F, Fut>(config: WaitConfig, check: F, what: &str) -> Result<(), WaitError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<bool, AwsError>>,
{
    let start = Instant::now();
    let mut attempts = 0u32;

    let mut delays = ExponentialBuilder::default()
        .with_min_delay(config.initial_delay)
        .with_max_delay(config.max_delay)
        .with_factor(2.0)
        .with_jitter()
        .build();

    loop {
        attempts += 1;

        if start.elapsed() >= config.timeout {
            return Err(WaitError::Timeout {
                what: what.to_string(),
                waited: start.elapsed(),
                attempts,
            });
        }

        match check().await {
            Ok(true) => {
                debug!(what = %what, attempts, "Resource ready");
                return Ok(());
            }
            Ok(false) => {
                let delay = delays.next().unwrap_or(config.max_delay);
                debug!(
                    what = %what,
                    attempt = attempts,
                    delay_ms = delay.as_millis(),
                    "Resource not ready, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                warn!(what = %what, error = %e, "Resource check failed");
                return Err(WaitError::Check(e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn wait_succeeds_immediately() {
        let result = wait_until(WaitConfig::default(), || async { Ok(true) }, "test-resource").await;
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_retries_then_succeeds() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = wait_until(
            WaitConfig {
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                timeout: Duration::from_secs(5),
            },
            || {
                let c = counter_clone.clone();
                async move {
                    let count = c.fetch_add(1, Ordering::SeqCst);
                    Ok(count >= 2) // Succeed on 3rd attempt
                }
            },
            "test-resource",
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_timeout_is_distinguishable() {
        let result = wait_until(
            WaitConfig {
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                timeout: Duration::from_millis(100),
            },
            || async { Ok(false) }, // Never ready
            "test-resource",
        )
        .await;

        match result {
            Err(WaitError::Timeout { what, attempts, .. }) => {
                assert_eq!(what, "test-resource");
                assert!(attempts > 1);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn wait_check_error_aborts() {
        let result = wait_until(
            WaitConfig::default(),
            || async {
                Err(AwsError::Sdk {
                    code: None,
                    message: "check failed".to_string(),
                })
            },
            "test-resource",
        )
        .await;

        match result {
            Err(WaitError::Check(e)) => assert!(e.to_string().contains("check failed")),
            other => panic!("expected check error, got {other:?}"),
        }
    }
}
