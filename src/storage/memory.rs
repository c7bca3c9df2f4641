use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::context::Context;
use crate::errors::{BundleError, Result};
use crate::storage::backend::{Collection, DocumentStore};

/// Document store held in memory; used by tests and the `memory` plugin key.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    collections: RwLock<BTreeMap<&'static str, BTreeMap<String, Value>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self, collection: Collection) -> usize {
        self.collections
            .read()
            .await
            .get(collection.name)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn insert(
        &self,
        _ctx: &Context,
        collection: Collection,
        id: &str,
        doc: Value,
    ) -> Result<()> {
        let mut all = self.collections.write().await;
        let docs = all.entry(collection.name).or_default();
        if docs.contains_key(id) {
            return Err(BundleError::Conflict(format!(
                "{} {id} already exists",
                collection.name
            )));
        }
        docs.insert(id.to_string(), doc);
        Ok(())
    }

    async fn upsert(
        &self,
        _ctx: &Context,
        collection: Collection,
        id: &str,
        doc: Value,
    ) -> Result<()> {
        let mut all = self.collections.write().await;
        all.entry(collection.name)
            .or_default()
            .insert(id.to_string(), doc);
        Ok(())
    }

    async fn get(&self, _ctx: &Context, collection: Collection, id: &str) -> Result<Value> {
        self.collections
            .read()
            .await
            .get(collection.name)
            .and_then(|docs| docs.get(id))
            .cloned()
            .ok_or_else(|| BundleError::not_found(format!("{} {id}", collection.name)))
    }

    async fn list(&self, _ctx: &Context, collection: Collection) -> Result<Vec<Value>> {
        Ok(self
            .collections
            .read()
            .await
            .get(collection.name)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn remove(&self, _ctx: &Context, collection: Collection, id: &str) -> Result<()> {
        self.collections
            .write()
            .await
            .get_mut(collection.name)
            .and_then(|docs| docs.remove(id))
            .map(|_| ())
            .ok_or_else(|| BundleError::not_found(format!("{} {id}", collection.name)))
    }
}
