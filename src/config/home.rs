//! The on-disk home directory and the layout underneath it.

use std::path::{Path, PathBuf};

use crate::errors::{BundleError, Result};

pub const HOME_ENV_VAR: &str = "BUNDLECTL_HOME";
pub const DEFAULT_HOME_DIR: &str = ".bundlectl";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Home {
    root: PathBuf,
}

impl Home {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `$BUNDLECTL_HOME`, or `~/.bundlectl`.
    pub fn from_env() -> Result<Self> {
        if let Some(dir) = std::env::var_os(HOME_ENV_VAR).filter(|v| !v.is_empty()) {
            return Ok(Self::new(dir));
        }
        let home = dirs::home_dir().ok_or_else(|| {
            BundleError::not_found(format!(
                "could not determine the user's home directory; set {HOME_ENV_VAR}"
            ))
        })?;
        Ok(Self::new(home.join(DEFAULT_HOME_DIR)))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn secrets_dir(&self) -> PathBuf {
        self.root.join("secrets")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn registry_dir(&self) -> PathBuf {
        self.root.join("registry")
    }

    pub fn migrations_dir(&self) -> PathBuf {
        self.root.join("migrations")
    }

    pub fn schema_path(&self) -> PathBuf {
        self.root.join("schema.json")
    }
}
