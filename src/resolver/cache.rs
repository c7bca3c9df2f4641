//! Content-addressed bundle cache under `<home>/cache`.
//!
//! ```text
//! cache/<blake3(reference)>/cnab/bundle.json
//! cache/<blake3(reference)>/cnab/relocation-mapping.json
//! cache/<blake3(reference)>/metadata.json
//! cache/<blake3(reference)>.lock
//! ```
//!
//! Writers take an advisory lock on the entry's lock file; readers do not
//! lock and rely on every file being replaced by an atomic rename.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::bundle::definition::Bundle;
use crate::bundle::{BundleReference, Digest, Reference, RelocationMap};
use crate::errors::{BundleError, Result};
use crate::fs::{create_private_dir, read_existing, write_private};
use crate::resolver::registry::{BUNDLE_FILE, RELOCATION_FILE};

const METADATA_FILE: &str = "metadata.json";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheMetadata {
    reference: String,
    digest: Digest,
}

#[derive(Debug, Clone)]
pub struct BundleCache {
    root: PathBuf,
}

impl BundleCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory key for a reference.
    pub fn entry_key(reference: &Reference) -> String {
        blake3::hash(reference.to_string().as_bytes())
            .to_hex()
            .to_string()
    }

    pub fn entry_dir(&self, reference: &Reference) -> PathBuf {
        self.root.join(Self::entry_key(reference))
    }

    /// Look up a cached bundle. A missing or partially written entry is a
    /// miss.
    pub async fn find(&self, reference: &Reference) -> Result<Option<BundleReference>> {
        let dir = self.entry_dir(reference);
        let reference = reference.clone();
        tokio::task::spawn_blocking(move || Self::read_entry(&dir, reference))
            .await
            .map_err(|e| BundleError::Other(e.into()))?
    }

    fn read_entry(dir: &Path, reference: Reference) -> Result<Option<BundleReference>> {
        let metadata: CacheMetadata = match read_existing(&dir.join(METADATA_FILE)) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        let cnab = dir.join("cnab");
        let definition = match read_existing(&cnab.join(BUNDLE_FILE)) {
            Ok(bytes) => Bundle::from_json(&bytes)?,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        let relocation_map: RelocationMap = match read_existing(&cnab.join(RELOCATION_FILE)) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.is_not_found() => RelocationMap::new(),
            Err(e) => return Err(e),
        };

        let actual = definition.digest()?;
        if actual != metadata.digest {
            debug!(%reference, expected = %metadata.digest, %actual, "cached bundle digest mismatch; treating as miss");
            return Ok(None);
        }
        trace!(%reference, dir = %dir.display(), "bundle cache hit");
        Ok(Some(BundleReference {
            reference,
            digest: actual,
            definition,
            relocation_map,
        }))
    }

    /// Store a resolved bundle, replacing any previous entry for its
    /// reference.
    pub async fn store(&self, bundle: &BundleReference) -> Result<PathBuf> {
        let root = self.root.clone();
        let key = Self::entry_key(&bundle.reference);
        let bundle = bundle.clone();
        tokio::task::spawn_blocking(move || Self::write_entry(&root, &key, &bundle))
            .await
            .map_err(|e| BundleError::Other(e.into()))?
    }

    fn write_entry(root: &Path, key: &str, bundle: &BundleReference) -> Result<PathBuf> {
        create_private_dir(root)?;
        let lock_path = root.join(format!("{key}.lock"));
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        lock.lock()?;

        let dir = root.join(key);
        let cnab = dir.join("cnab");
        create_private_dir(&cnab)?;
        write_private(&cnab.join(BUNDLE_FILE), &bundle.definition.to_json()?)?;
        write_private(
            &cnab.join(RELOCATION_FILE),
            &serde_json::to_vec_pretty(&bundle.relocation_map)?,
        )?;
        // Metadata last: its presence marks the entry complete.
        let metadata = CacheMetadata {
            reference: bundle.reference.to_string(),
            digest: bundle.digest.clone(),
        };
        write_private(&dir.join(METADATA_FILE), &serde_json::to_vec_pretty(&metadata)?)?;

        lock.unlock()?;
        debug!(reference = %bundle.reference, dir = %dir.display(), "cached bundle");
        Ok(dir)
    }
}
