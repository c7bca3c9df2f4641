//! Durable record of installations, runs, results, outputs, workflows and
//! named sets.
//!
//! - [`backend::DocumentStore`] is the pluggable CRUD layer.
//! - [`store::Storage`] is the typed API the rest of the crate uses.
//! - [`sanitizer::Sanitizer`] keeps sensitive values out of the documents.
//! - [`migrate`] upgrades legacy on-disk layouts.

pub mod backend;
pub mod documents;
pub mod filesystem;
pub mod memory;
pub mod migrate;
pub mod query;
pub mod sanitizer;
pub mod store;

use std::sync::Arc;

use tracing::debug;

use crate::config::{Config, Home};
use crate::errors::{BundleError, Result};
use crate::secrets::SecretStore;

pub use backend::{Collection, DocumentStore};
pub use documents::{
    CredentialSet, Installation, InstallationSpec, InstallationStatus, Output, ParameterSet, Run,
    RunResult,
};
pub use query::Query;
pub use sanitizer::Sanitizer;
pub use store::Storage;

/// Build the storage selected by config on top of `secrets`.
pub fn open_storage(home: &Home, config: &Config, secrets: Arc<dyn SecretStore>) -> Result<Storage> {
    let docs: Arc<dyn DocumentStore> = match config.storage.plugin.as_str() {
        "filesystem" => Arc::new(filesystem::FilesystemDocumentStore::new(home.root())),
        "memory" => Arc::new(memory::MemoryDocumentStore::new()),
        other => {
            return Err(BundleError::invalid_manifest(format!(
                "unsupported storage plugin {other:?}"
            )));
        }
    };
    debug!(plugin = %config.storage.plugin, home = %home.root().display(), "opened storage");
    Ok(Storage::new(docs, Sanitizer::new(secrets)))
}
