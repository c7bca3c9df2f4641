//! Regular expressions shared across the crate, compiled once.

use std::sync::LazyLock;

use regex::Regex;

use crate::errors::{BundleError, Result};

type Compiled = LazyLock<std::result::Result<Regex, regex::Error>>;

pub static REPOSITORY_COMPONENT: Compiled =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*$"));

pub static TAG: Compiled = LazyLock::new(|| Regex::new(r"^[\w][\w.-]{0,127}$"));

pub static DIGEST: Compiled =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]+(?:[.+_-][a-z0-9]+)*:[a-fA-F0-9]{32,}$"));

/// `${bundle.dependencies.<DEP>.outputs.<OUT>}`
pub static DEPENDENCY_OUTPUT: Compiled = LazyLock::new(|| {
    Regex::new(r"^\$\{bundle\.dependencies\.([A-Za-z0-9_-]+)\.outputs\.([A-Za-z0-9_-]+)\}$")
});

/// `bundle.parameters.X` / `bundle.credentials.X`, optionally wrapped in `${ }`.
pub static ROOT_VALUE: Compiled = LazyLock::new(|| {
    Regex::new(r"^(?:\$\{\s*)?bundle\.(parameters|credentials)\.([A-Za-z0-9_-]+)(?:\s*\})?$")
});

/// `workflow.<WFID>.jobs.<JOBKEY>.<kind>.<NAME>`
pub static WORKFLOW_WIRING: Compiled = LazyLock::new(|| {
    Regex::new(r"^workflow\.([^.]+)\.jobs\.([^.]+)\.(outputs|parameters|credentials)\.([^.]+)$")
});

/// Names a user may type for installations, sets and dependency keys.
pub static USER_NAME: Compiled = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$"));

/// Borrow a compiled pattern, turning a bad static pattern into an
/// invariant violation instead of a panic.
pub fn get(pattern: &'static Compiled) -> Result<&'static Regex> {
    pattern
        .as_ref()
        .map_err(|e| BundleError::InvariantViolated(format!("invalid built-in pattern: {e}")))
}
