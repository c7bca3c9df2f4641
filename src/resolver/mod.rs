//! Pull-or-cache resolution of bundle references.
//!
//! - [`cache::BundleCache`] is consulted first.
//! - On a miss (or when forced) the [`registry::Registry`] is asked, the
//!   pulled bundle is checked for image integrity and written to the cache.
//! - Version ranges are resolved against the repository's semver tags.

pub mod cache;
pub mod registry;

use std::sync::Arc;

use tracing::{debug, info};

use crate::bundle::definition::Bundle;
use crate::bundle::{BundleReference, Digest, Reference, RelocationMap, VersionSpec};
use crate::context::Context;
use crate::errors::{BundleError, Result};

pub use cache::BundleCache;
pub use registry::{DirectoryRegistry, PulledBundle, Registry};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveOptions {
    /// Allow plain-HTTP or unverified TLS registries.
    pub insecure: bool,
    /// Skip the cache and pull again.
    pub force: bool,
}

#[derive(Clone)]
pub struct BundleResolver {
    cache: BundleCache,
    registry: Arc<dyn Registry>,
}

impl std::fmt::Debug for BundleResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundleResolver")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl BundleResolver {
    pub fn new(cache: BundleCache, registry: Arc<dyn Registry>) -> Self {
        Self { cache, registry }
    }

    pub fn cache(&self) -> &BundleCache {
        &self.cache
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    pub async fn resolve(
        &self,
        ctx: &Context,
        reference: &Reference,
        opts: ResolveOptions,
    ) -> Result<BundleReference> {
        ctx.check("resolve bundle")?;
        if !opts.force {
            if let Some(hit) = self.cache.find(reference).await? {
                debug!(%reference, digest = %hit.digest, "resolved bundle from cache");
                return Ok(hit);
            }
        }

        info!(%reference, force = opts.force, "pulling bundle");
        let pulled = self.registry.pull(ctx, reference, opts.insecure).await?;
        let resolved = verify_pulled(reference, pulled)?;
        self.cache.store(&resolved).await?;
        Ok(resolved)
    }

    /// Pick the highest published tag of `reference`'s repository that
    /// satisfies `spec`.
    pub async fn resolve_version(
        &self,
        ctx: &Context,
        reference: &Reference,
        spec: &VersionSpec,
    ) -> Result<Reference> {
        let tags = self.registry.list_tags(ctx, reference).await?;
        let mut best: Option<(semver::Version, String)> = None;
        for tag in tags {
            let Ok(version) = semver::Version::parse(tag.strip_prefix('v').unwrap_or(&tag)) else {
                continue;
            };
            if !version.pre.is_empty() && !spec.allow_prereleases() {
                continue;
            }
            if !spec.matches(&version)? {
                continue;
            }
            if best.as_ref().is_none_or(|(v, _)| version > *v) {
                best = Some((version, tag));
            }
        }
        let (version, tag) = best.ok_or_else(|| {
            BundleError::not_found(format!(
                "no tag of {} satisfies {}",
                reference.repository(),
                spec.ranges().join(" || ")
            ))
        })?;
        debug!(repository = %reference.repository(), %version, %tag, "selected dependency version");
        Ok(reference.with_tag(tag))
    }
}

/// Check a pulled bundle against its reference and compute its digest.
pub fn verify_pulled(reference: &Reference, pulled: PulledBundle) -> Result<BundleReference> {
    let PulledBundle {
        bundle,
        relocation_map,
    } = pulled;
    verify_images(&bundle, &relocation_map)?;

    let digest = bundle.digest()?;
    if let Some(expected) = reference.digest() {
        if *expected != digest {
            return Err(BundleError::IntegrityError(format!(
                "bundle pulled from {reference} has digest {digest}"
            )));
        }
    }
    Ok(BundleReference {
        reference: reference.clone(),
        digest,
        definition: bundle,
        relocation_map,
    })
}

/// Every invocation image must be pinned by digest, and a relocated image
/// that carries a digest must carry the same one.
pub fn verify_images(bundle: &Bundle, relocation_map: &RelocationMap) -> Result<()> {
    for image in &bundle.invocation_images {
        let declared = image.content_digest.as_deref().ok_or_else(|| {
            BundleError::IntegrityError(format!(
                "invocation image {} of bundle {} has no content digest",
                image.image, bundle.name
            ))
        })?;
        let declared = Digest::parse(declared).map_err(|e| {
            BundleError::IntegrityError(format!("invocation image {}: {e}", image.image))
        })?;

        if let Some(relocated) = relocation_map.get(&image.image) {
            if let Some((_, d)) = relocated.split_once('@') {
                if d != declared.as_str() {
                    return Err(BundleError::IntegrityError(format!(
                        "invocation image {} was relocated to {relocated}, which does not match digest {declared}",
                        image.image
                    )));
                }
            }
        }
    }
    Ok(())
}
