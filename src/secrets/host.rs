//! Host-side value sources (`value`, `env`, `path`, `command`) and the
//! read-only `host` secret store.

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::context::Context;
use crate::errors::{BundleError, Result};
use crate::secrets::SecretStore;

/// `env` source. `None` when the variable is unset.
pub fn resolve_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// `path` source: the file's contents.
pub async fn resolve_path(path: &str) -> Result<String> {
    let path = expand_home(path);
    tokio::fs::read_to_string(&path).await.map_err(|e| {
        BundleError::MissingSource(format!("could not read {}: {e}", path.display()))
    })
}

/// `command` source: run through `sh -c` and return trimmed stdout.
pub async fn resolve_command(ctx: &Context, command: &str) -> Result<String> {
    debug!(command, "resolving value from command");
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = tokio::select! {
        out = child => out?,
        _ = ctx.cancelled() => {
            return Err(BundleError::Canceled(format!("command {command:?}")));
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(BundleError::MissingSource(format!(
            "command {command:?} exited with {}: {}",
            output.status.code().unwrap_or(-1),
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn expand_home(path: &str) -> std::path::PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|h| h.join(rest))
            .unwrap_or_else(|| Path::new(path).to_path_buf()),
        None => Path::new(path).to_path_buf(),
    }
}

/// Secret store that reads secrets from environment variables.
///
/// It cannot store anything, so it is unsuitable when bundles declare
/// sensitive parameters or outputs.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostSecretStore;

#[async_trait]
impl SecretStore for HostSecretStore {
    async fn resolve(&self, _ctx: &Context, _key_name: &str, key_value: &str) -> Result<String> {
        resolve_env(key_value)
            .ok_or_else(|| BundleError::MissingSource(format!("environment variable {key_value}")))
    }

    async fn create(
        &self,
        _ctx: &Context,
        key_name: &str,
        key_value: &str,
        _value: &str,
    ) -> Result<()> {
        Err(BundleError::invalid_reference(format!(
            "the host secret store is read-only; cannot store {key_name}:{key_value}"
        )))
    }
}
