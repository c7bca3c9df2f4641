//! The registry seam.
//!
//! The resolver never speaks a registry wire protocol itself; it asks a
//! [`Registry`] for a bundle document and for the tags of a repository.
//! [`DirectoryRegistry`] is the built-in implementation, a plain directory
//! tree that mirrors repository paths:
//!
//! ```text
//! <root>/<registry>/<repository path>/<tag>/bundle.json
//! <root>/<registry>/<repository path>/<tag>/relocation-mapping.json   (optional)
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::bundle::definition::Bundle;
use crate::bundle::{Reference, RelocationMap};
use crate::context::Context;
use crate::errors::{BundleError, Result};
use crate::fs::{read_existing, write_private};

pub const BUNDLE_FILE: &str = "bundle.json";
pub const RELOCATION_FILE: &str = "relocation-mapping.json";

/// What a registry hands back for a reference.
#[derive(Debug, Clone, PartialEq)]
pub struct PulledBundle {
    pub bundle: Bundle,
    pub relocation_map: RelocationMap,
}

#[async_trait]
pub trait Registry: Send + Sync {
    /// Fetch the bundle behind `reference`.
    async fn pull(&self, ctx: &Context, reference: &Reference, insecure: bool)
    -> Result<PulledBundle>;

    /// Tags published for the repository of `reference`.
    async fn list_tags(&self, ctx: &Context, reference: &Reference) -> Result<Vec<String>>;
}

#[derive(Debug, Clone)]
pub struct DirectoryRegistry {
    root: PathBuf,
}

impl DirectoryRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn repository_dir(&self, reference: &Reference) -> PathBuf {
        let mut dir = self.root.join(reference.registry());
        for part in reference.path().split('/') {
            dir.push(part);
        }
        dir
    }

    /// Publish a bundle under `reference`'s tag. Used to seed local
    /// registries.
    pub fn publish(
        &self,
        reference: &Reference,
        bundle: &Bundle,
        relocation_map: &RelocationMap,
    ) -> Result<()> {
        let tag = reference.tag().ok_or_else(|| {
            BundleError::invalid_reference(format!("cannot publish {reference} without a tag"))
        })?;
        let dir = self.repository_dir(reference).join(tag);
        write_private(&dir.join(BUNDLE_FILE), &bundle.to_json()?)?;
        if !relocation_map.is_empty() {
            write_private(
                &dir.join(RELOCATION_FILE),
                &serde_json::to_vec_pretty(relocation_map)?,
            )?;
        }
        Ok(())
    }

    fn read_tag(dir: &Path) -> Result<PulledBundle> {
        let bundle = Bundle::from_json(&read_existing(&dir.join(BUNDLE_FILE))?)?;
        let relocation_map = match read_existing(&dir.join(RELOCATION_FILE)) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.is_not_found() => RelocationMap::new(),
            Err(e) => return Err(e),
        };
        Ok(PulledBundle {
            bundle,
            relocation_map,
        })
    }

    fn tags_in(dir: &Path) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut tags = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.join(BUNDLE_FILE).is_file() {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    tags.push(name.to_string());
                }
            }
        }
        tags.sort();
        Ok(tags)
    }
}

#[async_trait]
impl Registry for DirectoryRegistry {
    async fn pull(
        &self,
        ctx: &Context,
        reference: &Reference,
        _insecure: bool,
    ) -> Result<PulledBundle> {
        ctx.check("pull bundle")?;
        let repo_dir = self.repository_dir(reference);
        let reference = reference.clone();
        debug!(%reference, dir = %repo_dir.display(), "pulling bundle from directory registry");

        tokio::task::spawn_blocking(move || {
            if let Some(tag) = reference.tag() {
                return Self::read_tag(&repo_dir.join(tag)).map_err(|e| match e {
                    BundleError::NotFound(_) => BundleError::not_found(format!("bundle {reference}")),
                    other => other,
                });
            }
            // Digest-only reference: find the tag whose bundle has that digest.
            if let Some(digest) = reference.digest() {
                for tag in Self::tags_in(&repo_dir)? {
                    let pulled = Self::read_tag(&repo_dir.join(&tag))?;
                    if &pulled.bundle.digest()? == digest {
                        return Ok(pulled);
                    }
                }
            }
            Err(BundleError::not_found(format!("bundle {reference}")))
        })
        .await
        .map_err(|e| BundleError::Other(e.into()))?
    }

    async fn list_tags(&self, ctx: &Context, reference: &Reference) -> Result<Vec<String>> {
        ctx.check("list tags")?;
        let dir = self.repository_dir(reference);
        tokio::task::spawn_blocking(move || Self::tags_in(&dir))
            .await
            .map_err(|e| BundleError::Other(e.into()))?
    }
}
