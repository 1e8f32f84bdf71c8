//! Shared helpers for AWS integration tests

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

/// Install a test subscriber so `RUST_LOG=debug` surfaces the wait loops.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Get the AWS region for tests.
///
/// Checks `AWS_REGION`, then `AWS_DEFAULT_REGION`, then falls back to
/// us-east-1.
pub fn get_test_region() -> String {
    std::env::var("AWS_REGION")
        .or_else(|_| std::env::var("AWS_DEFAULT_REGION"))
        .unwrap_or_else(|_| "us-east-1".to_string())
}

/// Generate a unique resource name so parallel test runs cannot collide.
pub fn unique_name(prefix: &str) -> String {
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    let ts = chrono::Utc::now().timestamp_millis();
    let counter = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{ts}-{counter}")
}

/// Path for a throwaway registry database.
pub fn scratch_registry_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{}-registry.db", unique_name(tag)))
}
