#![allow(dead_code, unused_imports)]

pub use bundlectl_test_utils::builders;
pub use bundlectl_test_utils::fake_driver::FakeDriver;
pub use bundlectl_test_utils::fake_executor::FakeJobExecutor;
pub use bundlectl_test_utils::harness::{Harness, NAMESPACE};
pub use bundlectl_test_utils::{init_tracing, with_timeout};

use bundlectl::errors::{BundleError, Result};

/// The error of `result`, failing the test on success.
pub fn expect_err<T: std::fmt::Debug>(result: Result<T>) -> BundleError {
    match result {
        Ok(v) => panic!("expected an error, got {v:?}"),
        Err(e) => e,
    }
}
