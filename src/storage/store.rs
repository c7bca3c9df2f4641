//! Typed storage API over a [`DocumentStore`] backend.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::context::Context;
use crate::errors::{BundleError, Result};
use crate::secrets::SecretStrategy;
use crate::storage::backend::{
    CREDENTIAL_SETS, Collection, DocumentStore, INSTALLATIONS, OUTPUTS, PARAMETER_SETS, RESULTS,
    RUNS, WORKFLOWS,
};
use crate::storage::documents::{
    CredentialSet, Installation, Output, ParameterSet, Run, RunResult,
};
use crate::storage::query::Query;
use crate::storage::sanitizer::Sanitizer;
use crate::workflow::model::Workflow;

fn to_doc<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

fn from_doc<T: DeserializeOwned>(doc: Value) -> Result<T> {
    Ok(serde_json::from_value(doc)?)
}

/// Document id for entities that are unique by namespace and name.
fn scoped_id(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

fn display(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{namespace}/{name}")
    }
}

/// Installations, runs, results, outputs, workflows and named sets.
///
/// Sensitive run parameters and outputs pass through the [`Sanitizer`] on
/// the way in; callers restore them explicitly when they need the values.
#[derive(Clone)]
pub struct Storage {
    docs: Arc<dyn DocumentStore>,
    sanitizer: Sanitizer,
    /// Serialises read-compare-write sequences on installations.
    write_lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}

impl Storage {
    pub fn new(docs: Arc<dyn DocumentStore>, sanitizer: Sanitizer) -> Self {
        Self {
            docs,
            sanitizer,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn sanitizer(&self) -> &Sanitizer {
        &self.sanitizer
    }

    pub fn documents(&self) -> &Arc<dyn DocumentStore> {
        &self.docs
    }

    async fn find<T: DeserializeOwned>(
        &self,
        ctx: &Context,
        collection: Collection,
        query: &Query,
    ) -> Result<Vec<T>> {
        let docs = self.docs.list(ctx, collection).await?;
        query
            .apply(docs, collection.name_field)
            .into_iter()
            .map(from_doc)
            .collect()
    }

    // ---- installations -------------------------------------------------

    pub async fn insert_installation(&self, ctx: &Context, inst: &mut Installation) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        inst.status.created.get_or_insert(now);
        inst.status.modified = Some(now);
        let id = scoped_id(inst.namespace(), inst.name());
        self.docs
            .insert(ctx, INSTALLATIONS, &id, to_doc(inst)?)
            .await
            .map_err(|e| match e {
                BundleError::Conflict(_) => BundleError::Conflict(format!(
                    "installation {} already exists",
                    display(inst.namespace(), inst.name())
                )),
                other => other,
            })?;
        debug!(namespace = %inst.namespace(), installation = %inst.name(), "inserted installation");
        Ok(())
    }

    /// Replace an installation, failing with `Conflict` if the stored copy
    /// was modified since `inst` was read. Bumps `status.modified`.
    pub async fn update_installation(&self, ctx: &Context, inst: &mut Installation) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let id = scoped_id(inst.namespace(), inst.name());
        let stored: Installation = from_doc(self.docs.get(ctx, INSTALLATIONS, &id).await?)?;
        if stored.status.modified != inst.status.modified {
            return Err(BundleError::Conflict(format!(
                "installation {} was modified concurrently (stale update)",
                display(inst.namespace(), inst.name())
            )));
        }
        let mut now = Utc::now();
        if let Some(prev) = stored.status.modified {
            if now <= prev {
                now = prev + Duration::microseconds(1);
            }
        }
        inst.status.modified = Some(now);
        self.docs.upsert(ctx, INSTALLATIONS, &id, to_doc(inst)?).await
    }

    pub async fn get_installation(
        &self,
        ctx: &Context,
        namespace: &str,
        name: &str,
    ) -> Result<Installation> {
        let doc = self
            .docs
            .get(ctx, INSTALLATIONS, &scoped_id(namespace, name))
            .await
            .map_err(|e| match e {
                BundleError::NotFound(_) => {
                    BundleError::not_found(format!("installation {}", display(namespace, name)))
                }
                other => other,
            })?;
        from_doc(doc)
    }

    pub async fn list_installations(&self, ctx: &Context, query: &Query) -> Result<Vec<Installation>> {
        self.find(ctx, INSTALLATIONS, query).await
    }

    /// Delete an installation and everything recorded under it.
    pub async fn remove_installation(&self, ctx: &Context, namespace: &str, name: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let scope = Query::new().namespace(namespace).name(name);

        for collection in [OUTPUTS, RESULTS, RUNS] {
            let docs = self.docs.list(ctx, collection).await?;
            for doc in scope.apply(docs, collection.name_field) {
                if let Some(id) = doc.get("id").and_then(Value::as_str) {
                    self.docs.remove(ctx, collection, id).await?;
                }
            }
        }

        self.docs
            .remove(ctx, INSTALLATIONS, &scoped_id(namespace, name))
            .await
            .map_err(|e| match e {
                BundleError::NotFound(_) => {
                    BundleError::not_found(format!("installation {}", display(namespace, name)))
                }
                other => other,
            })?;
        info!(%namespace, installation = %name, "deleted installation and its history");
        Ok(())
    }

    // ---- runs ----------------------------------------------------------

    /// Persist a run, sanitising its sensitive parameters first. Returns the
    /// stored form.
    pub async fn insert_run(&self, ctx: &Context, run: Run) -> Result<Run> {
        let mut run = run;
        let params = std::mem::take(&mut run.parameters);
        run.parameters = self
            .sanitizer
            .clean_parameters(ctx, &run.id, &run.bundle, params)
            .await?;
        self.docs.insert(ctx, RUNS, &run.id, to_doc(&run)?).await?;
        debug!(run_id = %run.id, action = %run.action, installation = %run.installation, "inserted run");
        Ok(run)
    }

    fn checked_run(doc: Value) -> Result<Run> {
        let run: Run = from_doc(doc)?;
        run.verify_digest()?;
        Ok(run)
    }

    pub async fn get_run(&self, ctx: &Context, id: &str) -> Result<Run> {
        Self::checked_run(self.docs.get(ctx, RUNS, id).await?)
    }

    pub async fn get_last_run(&self, ctx: &Context, namespace: &str, name: &str) -> Result<Run> {
        let query = Query::new()
            .namespace(namespace)
            .name(name)
            .sort_by("-id")
            .limit(1);
        let docs = self.docs.list(ctx, RUNS).await?;
        let doc = query
            .apply(docs, RUNS.name_field)
            .into_iter()
            .next()
            .ok_or_else(|| {
                BundleError::not_found(format!("no runs for installation {}", display(namespace, name)))
            })?;
        Self::checked_run(doc)
    }

    /// Runs of an installation in creation order, plus their results keyed
    /// by run id.
    pub async fn list_runs(
        &self,
        ctx: &Context,
        namespace: &str,
        name: &str,
    ) -> Result<(Vec<Run>, BTreeMap<String, Vec<RunResult>>)> {
        let scope = Query::new().namespace(namespace).name(name).sort_by("id");
        let docs = self.docs.list(ctx, RUNS).await?;
        let runs = scope
            .apply(docs, RUNS.name_field)
            .into_iter()
            .map(Self::checked_run)
            .collect::<Result<Vec<_>>>()?;

        let results: Vec<RunResult> = self.find(ctx, RESULTS, &scope).await?;
        let mut by_run: BTreeMap<String, Vec<RunResult>> = BTreeMap::new();
        for r in results {
            by_run.entry(r.run_id.clone()).or_default().push(r);
        }
        Ok((runs, by_run))
    }

    /// The run's parameters with sensitive values fetched back.
    pub async fn restore_parameters(&self, ctx: &Context, run: &Run) -> Result<Vec<SecretStrategy>> {
        self.sanitizer.restore_parameters(ctx, &run.parameters).await
    }

    // ---- results -------------------------------------------------------

    pub async fn insert_result(&self, ctx: &Context, result: &RunResult) -> Result<()> {
        self.docs.insert(ctx, RESULTS, &result.id, to_doc(result)?).await?;
        debug!(result_id = %result.id, run_id = %result.run_id, status = %result.status, "inserted result");
        Ok(())
    }

    pub async fn get_result(&self, ctx: &Context, id: &str) -> Result<RunResult> {
        from_doc(self.docs.get(ctx, RESULTS, id).await?)
    }

    pub async fn find_results(&self, ctx: &Context, query: &Query) -> Result<Vec<RunResult>> {
        self.find(ctx, RESULTS, query).await
    }

    // ---- outputs -------------------------------------------------------

    pub async fn insert_output(&self, ctx: &Context, output: Output) -> Result<Output> {
        let output = self.sanitizer.clean_output(ctx, output).await?;
        self.docs.insert(ctx, OUTPUTS, &output.id, to_doc(&output)?).await?;
        Ok(output)
    }

    /// Outputs as stored, sensitive values still sanitised.
    pub async fn find_outputs(&self, ctx: &Context, query: &Query) -> Result<Vec<Output>> {
        self.find(ctx, OUTPUTS, query).await
    }

    pub async fn restore_output(&self, ctx: &Context, output: Output) -> Result<Output> {
        self.sanitizer.restore_output(ctx, output).await
    }

    /// The most recent value of every output of an installation, sanitised.
    pub async fn read_last_outputs(
        &self,
        ctx: &Context,
        namespace: &str,
        name: &str,
    ) -> Result<Vec<Output>> {
        let query = Query::new().namespace(namespace).name(name).sort_by("-id");
        let mut seen = HashSet::new();
        let mut latest: Vec<Output> = self
            .find_outputs(ctx, &query)
            .await?
            .into_iter()
            .filter(|o: &Output| seen.insert(o.name.clone()))
            .collect();
        latest.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(latest)
    }

    /// The most recent value of one output, restored.
    pub async fn read_last_output(
        &self,
        ctx: &Context,
        namespace: &str,
        name: &str,
        output: &str,
    ) -> Result<Output> {
        let query = Query::new()
            .namespace(namespace)
            .name(name)
            .field("name", output)
            .sort_by("-id")
            .limit(1);
        let found = self
            .find_outputs(ctx, &query)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                BundleError::not_found(format!(
                    "output {output} of installation {}",
                    display(namespace, name)
                ))
            })?;
        self.restore_output(ctx, found).await
    }

    // ---- workflows -----------------------------------------------------

    pub async fn upsert_workflow(&self, ctx: &Context, workflow: &mut Workflow) -> Result<()> {
        workflow.prepare()?;
        self.docs
            .upsert(ctx, WORKFLOWS, &workflow.id, to_doc(workflow)?)
            .await
    }

    pub async fn get_workflow(&self, ctx: &Context, id: &str) -> Result<Workflow> {
        let doc = self
            .docs
            .get(ctx, WORKFLOWS, id)
            .await
            .map_err(|e| match e {
                BundleError::NotFound(_) => BundleError::not_found(format!("workflow {id}")),
                other => other,
            })?;
        from_doc(doc)
    }

    pub async fn list_workflows(&self, ctx: &Context, query: &Query) -> Result<Vec<Workflow>> {
        let mut q = query.clone();
        // Workflows are named after their root installation.
        if let Some(name) = q.name.take() {
            q.predicate.insert("installation".into(), Value::String(name));
        }
        self.find(ctx, WORKFLOWS, &q).await
    }

    // ---- parameter / credential sets ------------------------------------

    pub async fn upsert_parameter_set(&self, ctx: &Context, set: &mut ParameterSet) -> Result<()> {
        let now = Utc::now();
        set.created.get_or_insert(now);
        set.modified = Some(now);
        self.docs
            .upsert(ctx, PARAMETER_SETS, &scoped_id(&set.namespace, &set.name), to_doc(set)?)
            .await
    }

    pub async fn get_parameter_set(
        &self,
        ctx: &Context,
        namespace: &str,
        name: &str,
    ) -> Result<ParameterSet> {
        self.get_scoped(ctx, PARAMETER_SETS, "parameter set", namespace, name)
            .await
    }

    pub async fn list_parameter_sets(&self, ctx: &Context, query: &Query) -> Result<Vec<ParameterSet>> {
        self.find(ctx, PARAMETER_SETS, query).await
    }

    pub async fn remove_parameter_set(&self, ctx: &Context, namespace: &str, name: &str) -> Result<()> {
        self.docs
            .remove(ctx, PARAMETER_SETS, &scoped_id(namespace, name))
            .await
    }

    pub async fn upsert_credential_set(&self, ctx: &Context, set: &mut CredentialSet) -> Result<()> {
        let now = Utc::now();
        set.created.get_or_insert(now);
        set.modified = Some(now);
        self.docs
            .upsert(ctx, CREDENTIAL_SETS, &scoped_id(&set.namespace, &set.name), to_doc(set)?)
            .await
    }

    pub async fn get_credential_set(
        &self,
        ctx: &Context,
        namespace: &str,
        name: &str,
    ) -> Result<CredentialSet> {
        self.get_scoped(ctx, CREDENTIAL_SETS, "credential set", namespace, name)
            .await
    }

    pub async fn list_credential_sets(
        &self,
        ctx: &Context,
        query: &Query,
    ) -> Result<Vec<CredentialSet>> {
        self.find(ctx, CREDENTIAL_SETS, query).await
    }

    pub async fn remove_credential_set(&self, ctx: &Context, namespace: &str, name: &str) -> Result<()> {
        self.docs
            .remove(ctx, CREDENTIAL_SETS, &scoped_id(namespace, name))
            .await
    }

    /// Named sets are looked up in the installation's namespace first, then
    /// in the global (empty) namespace.
    async fn get_scoped<T: DeserializeOwned>(
        &self,
        ctx: &Context,
        collection: Collection,
        what: &str,
        namespace: &str,
        name: &str,
    ) -> Result<T> {
        match self.docs.get(ctx, collection, &scoped_id(namespace, name)).await {
            Ok(doc) => return from_doc(doc),
            Err(e) if e.is_not_found() && !namespace.is_empty() => {}
            Err(e) if e.is_not_found() => {
                return Err(BundleError::not_found(format!("{what} {name}")));
            }
            Err(e) => return Err(e),
        }
        match self.docs.get(ctx, collection, &scoped_id("", name)).await {
            Ok(doc) => from_doc(doc),
            Err(e) if e.is_not_found() => Err(BundleError::not_found(format!(
                "{what} {}",
                display(namespace, name)
            ))),
            Err(e) => Err(e),
        }
    }
}
