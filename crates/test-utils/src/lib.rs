//! Shared fixtures for the `bundlectl` integration tests.
//!
//! Tests build bundles and installations with [`builders`], publish them to
//! an [`registry::InMemoryRegistry`], and run actions through a scripted
//! [`fake_driver::FakeDriver`] wired into an [`harness::Harness`].

pub mod builders;
pub mod fake_driver;
pub mod fake_executor;
pub mod harness;
pub mod registry;

use std::future::Future;
use std::sync::Once;
use std::time::Duration;

use tracing_subscriber::{EnvFilter, fmt};

static TRACING: Once = Once::new();

/// Upper bound for any single async test step.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Install a test subscriber once per process.
///
/// Output goes through the test writer, so it only shows for failing tests
/// or with `--nocapture`. `BUNDLECTL_LOG` takes `EnvFilter` syntax, e.g.
/// `BUNDLECTL_LOG=bundlectl::engine=debug`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = std::env::var(bundlectl::logging::LOG_ENV_VAR)
            .ok()
            .and_then(|s| EnvFilter::try_new(s).ok())
            .unwrap_or_else(|| EnvFilter::new("warn,bundlectl=info"));

        let _ = fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .try_init();
    });
}

/// Await `f`, panicking if it outlives [`TEST_TIMEOUT`].
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: Future<Output = T>,
{
    match tokio::time::timeout(TEST_TIMEOUT, f).await {
        Ok(value) => value,
        Err(_) => panic!("test step exceeded {TEST_TIMEOUT:?}"),
    }
}
