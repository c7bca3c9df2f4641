use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bundlectl::bundle::{Bundle, Reference};
use bundlectl::context::Context;
use bundlectl::errors::{BundleError, Result};
use bundlectl::resolver::{PulledBundle, Registry};

/// Registry held in memory, keyed by `registry/repository:tag`.
#[derive(Clone, Default)]
pub struct InMemoryRegistry {
    bundles: Arc<Mutex<BTreeMap<String, PulledBundle>>>,
    pulls: Arc<AtomicUsize>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `bundle` under `reference`, which must carry a tag.
    pub fn publish(&self, reference: &str, bundle: Bundle) {
        let reference = Reference::parse(reference).expect("valid reference");
        assert!(reference.tag().is_some(), "published references need a tag");
        self.bundles.lock().unwrap().insert(
            reference.to_string(),
            PulledBundle {
                bundle,
                relocation_map: Default::default(),
            },
        );
    }

    /// Number of pulls served, hits and misses alike.
    pub fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn pull(&self, ctx: &Context, reference: &Reference, _insecure: bool) -> Result<PulledBundle> {
        ctx.check("pull bundle")?;
        self.pulls.fetch_add(1, Ordering::SeqCst);
        let bundles = self.bundles.lock().unwrap();

        if let Some(tag) = reference.tag() {
            let key = Reference::parse(&reference.repository())?
                .with_tag(tag)
                .to_string();
            return bundles
                .get(&key)
                .cloned()
                .ok_or_else(|| BundleError::not_found(format!("bundle {reference}")));
        }

        let repository = reference.repository();
        let wanted = reference.digest();
        bundles
            .iter()
            .filter(|(k, _)| Reference::parse(k).is_ok_and(|r| r.repository() == repository))
            .map(|(_, b)| b)
            .find(|b| wanted.is_some_and(|d| b.bundle.digest().is_ok_and(|got| got == *d)))
            .cloned()
            .ok_or_else(|| BundleError::not_found(format!("bundle {reference}")))
    }

    async fn list_tags(&self, _ctx: &Context, reference: &Reference) -> Result<Vec<String>> {
        let repository = reference.repository();
        let bundles = self.bundles.lock().unwrap();
        Ok(bundles
            .keys()
            .filter_map(|k| Reference::parse(k).ok())
            .filter(|r| r.repository() == repository)
            .filter_map(|r| r.tag().map(str::to_string))
            .collect())
    }
}
