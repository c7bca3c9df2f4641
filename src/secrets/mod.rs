//! Secret stores and the value resolver.
//!
//! - [`SecretStore`] is the plugin seam: resolve or create a secret by key.
//! - [`resolver::SecretResolver`] turns a [`strategy::SecretStrategy`] into a
//!   concrete string, dispatching on the source key.

pub mod filesystem;
pub mod host;
pub mod memory;
pub mod plugin;
pub mod resolver;
pub mod strategy;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{Home, PluginSelection};
use crate::context::Context;
use crate::errors::Result;

pub use resolver::SecretResolver;
pub use strategy::{SecretStrategy, Source};

/// Backend that stores secret values by `(key_name, key_value)`.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn resolve(&self, ctx: &Context, key_name: &str, key_value: &str) -> Result<String>;

    async fn create(&self, ctx: &Context, key_name: &str, key_value: &str, value: &str)
    -> Result<()>;
}

/// Build the secret store selected by config.
pub fn open_secret_store(home: &Home, selection: &PluginSelection) -> Result<Arc<dyn SecretStore>> {
    let store: Arc<dyn SecretStore> = match selection.plugin.as_str() {
        "filesystem" => Arc::new(filesystem::FilesystemSecretStore::new(home.secrets_dir())),
        "host" => Arc::new(host::HostSecretStore),
        "memory" => Arc::new(memory::MemorySecretStore::default()),
        other => Arc::new(plugin::PluginSecretStore::new(other, selection.config.clone())),
    };
    Ok(store)
}
