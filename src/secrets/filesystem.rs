//! Secret store that keeps one file per secret under `<home>/secrets/`.
//!
//! Meant for single-user machines: files are 0600 inside a 0700 directory,
//! but values are not encrypted at rest.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use crate::context::Context;
use crate::errors::{BundleError, Result};
use crate::fs::{create_private_dir, read_existing, safe_file_name, write_private};
use crate::secrets::SecretStore;

#[derive(Debug, Clone)]
pub struct FilesystemSecretStore {
    dir: PathBuf,
}

impl FilesystemSecretStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key_name: &str, key_value: &str) -> PathBuf {
        self.dir
            .join(safe_file_name(key_name))
            .join(safe_file_name(key_value))
    }
}

#[async_trait]
impl SecretStore for FilesystemSecretStore {
    async fn resolve(&self, _ctx: &Context, key_name: &str, key_value: &str) -> Result<String> {
        let path = self.path_for(key_name, key_value);
        let bytes = tokio::task::spawn_blocking(move || read_existing(&path))
            .await
            .map_err(|e| BundleError::Other(e.into()))?
            .map_err(|e| match e {
                BundleError::NotFound(_) => {
                    BundleError::not_found(format!("secret {key_name}:{key_value}"))
                }
                other => other,
            })?;
        String::from_utf8(bytes).map_err(|e| {
            BundleError::IntegrityError(format!("secret {key_value} is not valid UTF-8: {e}"))
        })
    }

    async fn create(
        &self,
        _ctx: &Context,
        key_name: &str,
        key_value: &str,
        value: &str,
    ) -> Result<()> {
        let path = self.path_for(key_name, key_value);
        debug!(key = key_value, "storing secret");
        let root = self.dir.clone();
        let bytes = value.as_bytes().to_vec();
        tokio::task::spawn_blocking(move || {
            create_private_dir(&root)?;
            write_private(&path, &bytes)
        })
        .await
        .map_err(|e| BundleError::Other(e.into()))?
    }
}
