use std::sync::Arc;

use bundlectl::app::{App, ApplyOptions};
use bundlectl::bundle::Bundle;
use bundlectl::config::{Config, Home, PluginSelection};
use bundlectl::context::Context;
use bundlectl::exec::DriverRegistry;
use bundlectl::resolver::{BundleCache, BundleResolver};
use bundlectl::secrets::memory::MemorySecretStore;
use bundlectl::storage::memory::MemoryDocumentStore;
use bundlectl::storage::{Sanitizer, Storage};
use tempfile::TempDir;

use crate::fake_driver::{FakeDriver, FAKE_DRIVER};
use crate::registry::InMemoryRegistry;

pub const NAMESPACE: &str = "dev";

/// A fully wired [`App`] over in-memory storage, secrets and registry,
/// with the fake driver as the default runtime.
pub struct Harness {
    pub home: TempDir,
    pub app: App,
    pub storage: Storage,
    pub documents: Arc<MemoryDocumentStore>,
    pub secrets: Arc<MemorySecretStore>,
    pub registry: InMemoryRegistry,
    pub resolver: BundleResolver,
    pub driver: FakeDriver,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_driver(FakeDriver::new())
    }

    pub fn with_driver(driver: FakeDriver) -> Self {
        let home = tempfile::tempdir().expect("temp home");
        let config = Config {
            namespace: NAMESPACE.to_string(),
            storage: PluginSelection::builtin("memory"),
            secrets: PluginSelection::builtin("memory"),
            runtime_driver: FAKE_DRIVER.to_string(),
            ..Default::default()
        };
        let root = Home::new(home.path());

        let secrets = Arc::new(MemorySecretStore::default());
        let documents = Arc::new(MemoryDocumentStore::new());
        let storage = Storage::new(documents.clone(), Sanitizer::new(secrets.clone()));
        let registry = InMemoryRegistry::new();
        let resolver = BundleResolver::new(
            BundleCache::new(root.cache_dir()),
            Arc::new(registry.clone()),
        );
        let mut drivers = DriverRegistry::new();
        drivers.register(Arc::new(driver.clone()));

        let app = App::new(root, config, storage.clone(), resolver.clone(), drivers);
        Self {
            home,
            app,
            storage,
            documents,
            secrets,
            registry,
            resolver,
            driver,
        }
    }

    pub fn ctx(&self) -> Context {
        Context::default()
    }

    pub fn publish(&self, reference: &str, bundle: Bundle) {
        self.registry.publish(reference, bundle);
    }

    pub fn options(&self) -> ApplyOptions {
        ApplyOptions::default()
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
