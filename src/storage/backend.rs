//! The pluggable document backend underneath [`crate::storage::Storage`].
//!
//! A backend stores opaque JSON documents in named collections. Query
//! semantics live above it, so a new backend only needs plain CRUD.

use async_trait::async_trait;
use serde_json::Value;

use crate::context::Context;
use crate::errors::Result;

/// A collection and the field its `name` filter applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Collection {
    pub name: &'static str,
    pub name_field: &'static str,
}

pub const INSTALLATIONS: Collection = Collection {
    name: "installations",
    name_field: "name",
};
pub const RUNS: Collection = Collection {
    name: "runs",
    name_field: "installation",
};
pub const RESULTS: Collection = Collection {
    name: "results",
    name_field: "installation",
};
pub const OUTPUTS: Collection = Collection {
    name: "outputs",
    name_field: "installation",
};
pub const WORKFLOWS: Collection = Collection {
    name: "workflows",
    name_field: "name",
};
pub const PARAMETER_SETS: Collection = Collection {
    name: "parameter-sets",
    name_field: "name",
};
pub const CREDENTIAL_SETS: Collection = Collection {
    name: "credential-sets",
    name_field: "name",
};

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert a new document; `Conflict` if the id is taken.
    async fn insert(&self, ctx: &Context, collection: Collection, id: &str, doc: Value)
    -> Result<()>;

    /// Insert or replace a document.
    async fn upsert(&self, ctx: &Context, collection: Collection, id: &str, doc: Value)
    -> Result<()>;

    /// `NotFound` if absent.
    async fn get(&self, ctx: &Context, collection: Collection, id: &str) -> Result<Value>;

    /// Every document in the collection, in id order.
    async fn list(&self, ctx: &Context, collection: Collection) -> Result<Vec<Value>>;

    /// `NotFound` if absent.
    async fn remove(&self, ctx: &Context, collection: Collection, id: &str) -> Result<()>;
}
