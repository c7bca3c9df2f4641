//! File-per-document backend: `<home>/<collection>/<id>.json`, mode 0600.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tracing::trace;

use crate::context::Context;
use crate::errors::{BundleError, Result};
use crate::fs::{list_files, read_existing, remove_existing, safe_file_name, write_private};
use crate::storage::backend::{Collection, DocumentStore};

#[derive(Debug, Clone)]
pub struct FilesystemDocumentStore {
    root: PathBuf,
}

impl FilesystemDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn doc_path(&self, collection: Collection, id: &str) -> PathBuf {
        self.root
            .join(collection.name)
            .join(format!("{}.json", safe_file_name(id)))
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BundleError::Other(e.into()))?
}

fn not_found_as(collection: Collection, id: &str) -> impl FnOnce(BundleError) -> BundleError {
    let what = format!("{} {id}", collection.name);
    move |e| match e {
        BundleError::NotFound(_) => BundleError::NotFound(what),
        other => other,
    }
}

#[async_trait]
impl DocumentStore for FilesystemDocumentStore {
    async fn insert(
        &self,
        ctx: &Context,
        collection: Collection,
        id: &str,
        doc: Value,
    ) -> Result<()> {
        ctx.check("insert document")?;
        let path = self.doc_path(collection, id);
        let what = format!("{} {id}", collection.name);
        trace!(path = %path.display(), "inserting document");
        let bytes = serde_json::to_vec_pretty(&doc)?;
        blocking(move || {
            if path.exists() {
                return Err(BundleError::Conflict(format!("{what} already exists")));
            }
            write_private(&path, &bytes)
        })
        .await
    }

    async fn upsert(
        &self,
        ctx: &Context,
        collection: Collection,
        id: &str,
        doc: Value,
    ) -> Result<()> {
        ctx.check("upsert document")?;
        let path = self.doc_path(collection, id);
        trace!(path = %path.display(), "writing document");
        let bytes = serde_json::to_vec_pretty(&doc)?;
        blocking(move || write_private(&path, &bytes)).await
    }

    async fn get(&self, ctx: &Context, collection: Collection, id: &str) -> Result<Value> {
        ctx.check("read document")?;
        let path = self.doc_path(collection, id);
        let bytes = blocking(move || read_existing(&path))
            .await
            .map_err(not_found_as(collection, id))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn list(&self, ctx: &Context, collection: Collection) -> Result<Vec<Value>> {
        ctx.check("list documents")?;
        let dir = self.root.join(collection.name);
        blocking(move || {
            let mut docs = Vec::new();
            for path in list_files(&dir, "json")? {
                let bytes = read_existing(&path)?;
                docs.push(serde_json::from_slice(&bytes)?);
            }
            Ok(docs)
        })
        .await
    }

    async fn remove(&self, ctx: &Context, collection: Collection, id: &str) -> Result<()> {
        ctx.check("remove document")?;
        let path = self.doc_path(collection, id);
        blocking(move || remove_existing(&path))
            .await
            .map_err(not_found_as(collection, id))
    }
}
