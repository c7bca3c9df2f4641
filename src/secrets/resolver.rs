//! Turns a [`SecretStrategy`] into a concrete value.
//!
//! Host sources are resolved in process, `secret` goes to the configured
//! [`SecretStore`], and `porter` wiring is resolved against workflow state:
//!
//! ```text
//! workflow.<WFID>.jobs.<JOBKEY>.outputs.<NAME>       last output of that job's result, or of
//!                                                  its installation before the job ran
//! workflow.<WFID>.jobs.<JOBKEY>.parameters.<NAME>    the job's own wiring, resolved again
//! workflow.<WFID>.jobs.<JOBKEY>.credentials.<NAME>   likewise
//! ```
//!
//! `WFID` is normally the `${WFID}` placeholder; the real id comes from the
//! [`Context`] the engine sets before dispatching a job.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, trace};

use crate::context::Context;
use crate::errors::{BundleError, Result};
use crate::patterns;
use crate::secrets::SecretStore;
use crate::secrets::host;
use crate::secrets::strategy::{
    self, SOURCE_COMMAND, SOURCE_ENV, SOURCE_PATH, SOURCE_PORTER, SOURCE_SECRET, SOURCE_VALUE,
    SecretStrategy, Source,
};
use crate::storage::Storage;
use crate::storage::documents::InstallationSpec;
use crate::storage::query::Query;
use crate::workflow::model::Job;

/// Placeholder written into wiring strings at plan time.
pub const WORKFLOW_ID_PLACEHOLDER: &str = "${WFID}";

/// Wiring may point at a job whose own value is wiring again; this bounds
/// how far that chain is followed.
const MAX_WIRING_DEPTH: usize = 16;

/// What a `porter` wiring string points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WiringKind {
    Outputs,
    Parameters,
    Credentials,
}

impl WiringKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WiringKind::Outputs => "outputs",
            WiringKind::Parameters => "parameters",
            WiringKind::Credentials => "credentials",
        }
    }
}

/// A parsed `workflow.<WFID>.jobs.<JOBKEY>.<kind>.<NAME>` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowReference {
    pub workflow_id: String,
    pub job: String,
    pub kind: WiringKind,
    pub name: String,
}

impl WorkflowReference {
    pub fn parse(value: &str) -> Result<Self> {
        let re = patterns::get(&patterns::WORKFLOW_WIRING)?;
        let caps = re.captures(value.trim()).ok_or_else(|| {
            BundleError::invalid_reference(format!("malformed workflow wiring {value:?}"))
        })?;
        let kind = match &caps[3] {
            "outputs" => WiringKind::Outputs,
            "parameters" => WiringKind::Parameters,
            _ => WiringKind::Credentials,
        };
        Ok(Self {
            workflow_id: caps[1].to_string(),
            job: caps[2].to_string(),
            kind,
            name: caps[4].to_string(),
        })
    }

    /// Wiring string with the workflow id left as the placeholder.
    pub fn format(job: &str, kind: WiringKind, name: &str) -> String {
        format!(
            "workflow.{WORKFLOW_ID_PLACEHOLDER}.jobs.{job}.{}.{name}",
            kind.as_str()
        )
    }

    /// The concrete workflow id, substituting the placeholder from `ctx`.
    fn workflow_id<'a>(&'a self, ctx: &'a Context) -> Result<&'a str> {
        if self.workflow_id == WORKFLOW_ID_PLACEHOLDER {
            ctx.workflow_id().ok_or_else(|| {
                BundleError::invalid_reference(format!(
                    "wiring for job {} was resolved outside of a workflow",
                    self.job
                ))
            })
        } else {
            Ok(&self.workflow_id)
        }
    }
}

#[derive(Clone)]
pub struct SecretResolver {
    storage: Storage,
    store: Arc<dyn SecretStore>,
}

impl std::fmt::Debug for SecretResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretResolver").finish_non_exhaustive()
    }
}

impl SecretResolver {
    /// Resolver using the same secret store the storage sanitiser writes to.
    pub fn new(storage: Storage) -> Self {
        let store = Arc::clone(storage.sanitizer().secret_store());
        Self { storage, store }
    }

    /// Resolve one strategy. `Ok(None)` means the source exists but holds no
    /// value (an unset env var, or an unwired parameter); the caller decides
    /// whether that is an error.
    pub async fn resolve(&self, ctx: &Context, strategy: &SecretStrategy) -> Result<Option<String>> {
        self.resolve_at(ctx, strategy, 0).await
    }

    /// Resolve every strategy, filling in `resolved_value`.
    pub async fn resolve_all(
        &self,
        ctx: &Context,
        strategies: &[SecretStrategy],
    ) -> Result<Vec<SecretStrategy>> {
        let mut resolved = Vec::with_capacity(strategies.len());
        for s in strategies {
            let mut s = s.clone();
            s.resolved_value = self.resolve(ctx, &s).await?;
            resolved.push(s);
        }
        Ok(resolved)
    }

    fn resolve_at<'a>(
        &'a self,
        ctx: &'a Context,
        strategy: &'a SecretStrategy,
        depth: usize,
    ) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(async move {
            ctx.check("resolve value")?;
            if depth > MAX_WIRING_DEPTH {
                return Err(BundleError::invalid_reference(format!(
                    "wiring for {} nests deeper than {MAX_WIRING_DEPTH} levels",
                    strategy.name
                )));
            }
            trace!(name = %strategy.name, source = %strategy.source, "resolving");
            let Source { key, value } = &strategy.source;
            match key.as_str() {
                SOURCE_VALUE => Ok(Some(value.clone())),
                SOURCE_ENV => Ok(host::resolve_env(value)),
                SOURCE_PATH => host::resolve_path(value).await.map(Some),
                SOURCE_COMMAND => host::resolve_command(ctx, value).await.map(Some),
                SOURCE_SECRET => self
                    .store
                    .resolve(ctx, SOURCE_SECRET, value)
                    .await
                    .map(Some)
                    .map_err(|e| match e {
                        BundleError::NotFound(m) => BundleError::MissingSource(format!(
                            "secret for {}: {m}",
                            strategy.name
                        )),
                        other => other,
                    }),
                SOURCE_PORTER => self.resolve_workflow(ctx, &strategy.name, value, depth).await,
                other => Err(BundleError::invalid_reference(format!(
                    "unknown source {other:?} for {}",
                    strategy.name
                ))),
            }
        })
    }

    async fn resolve_workflow(
        &self,
        ctx: &Context,
        name: &str,
        wiring: &str,
        depth: usize,
    ) -> Result<Option<String>> {
        let reference = WorkflowReference::parse(wiring)?;
        let workflow_id = reference.workflow_id(ctx)?;
        let workflow = self.storage.get_workflow(ctx, workflow_id).await?;
        let job = workflow.get_job(&reference.job).ok_or_else(|| {
            BundleError::invalid_reference(format!(
                "workflow {workflow_id} has no job {:?} (wired into {name})",
                reference.job
            ))
        })?;
        debug!(
            workflow_id,
            job = %reference.job,
            kind = reference.kind.as_str(),
            target = %reference.name,
            "resolving workflow wiring"
        );

        match reference.kind {
            WiringKind::Outputs => self.job_output(ctx, job, &reference.name).await.map(Some),
            WiringKind::Parameters => {
                if let Some(value) = job.overrides.get(&reference.name) {
                    return Ok(Some(value.clone()));
                }
                let found = self
                    .job_strategy(ctx, &job.installation, WiringKind::Parameters, &reference.name)
                    .await?;
                match found {
                    Some(s) => self.resolve_at(ctx, &s, depth + 1).await,
                    // Unwired: the consuming bundle's own default applies.
                    None => Ok(None),
                }
            }
            WiringKind::Credentials => {
                let found = self
                    .job_strategy(ctx, &job.installation, WiringKind::Credentials, &reference.name)
                    .await?;
                match found {
                    Some(s) => self.resolve_at(ctx, &s, depth + 1).await,
                    None => Err(BundleError::MissingSource(format!(
                        "credential {} is not supplied to job {}",
                        reference.name, reference.job
                    ))),
                }
            }
        }
    }

    async fn job_output(&self, ctx: &Context, job: &Job, output: &str) -> Result<String> {
        if job.status.last_result_id.is_empty() {
            // Not run in this workflow yet, as when uninstalling consumers
            // first: the installation's last recorded value stands in.
            let spec = &job.installation;
            return match self
                .storage
                .read_last_output(ctx, &spec.namespace, &spec.name, output)
                .await
            {
                Ok(found) => Ok(found.value_string()),
                Err(e) if e.is_not_found() => Err(BundleError::OutputNotReady(format!(
                    "job {} has not produced a result yet",
                    job.key
                ))),
                Err(e) => Err(e),
            };
        }
        let query = Query::new()
            .field("resultId", job.status.last_result_id.as_str())
            .field("name", output)
            .sort_by("-id")
            .limit(1);
        let found = self
            .storage
            .find_outputs(ctx, &query)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                BundleError::OutputNotReady(format!(
                    "job {} has no output {output} on result {}",
                    job.key, job.status.last_result_id
                ))
            })?;
        let restored = self.storage.restore_output(ctx, found).await?;
        Ok(restored.value_string())
    }

    /// The job installation's inline strategy for `name`, or the one from its
    /// named sets (later sets win).
    async fn job_strategy(
        &self,
        ctx: &Context,
        spec: &InstallationSpec,
        kind: WiringKind,
        name: &str,
    ) -> Result<Option<SecretStrategy>> {
        let inline = match kind {
            WiringKind::Credentials => &spec.credentials,
            _ => &spec.parameters,
        };
        if let Some(s) = strategy::find(inline, name) {
            return Ok(Some(s.clone()));
        }

        let mut found = None;
        match kind {
            WiringKind::Credentials => {
                for set_name in &spec.credential_sets {
                    let set = self
                        .storage
                        .get_credential_set(ctx, &spec.namespace, set_name)
                        .await?;
                    if let Some(s) = strategy::find(&set.credentials, name) {
                        found = Some(s.clone());
                    }
                }
            }
            _ => {
                for set_name in &spec.parameter_sets {
                    let set = self
                        .storage
                        .get_parameter_set(ctx, &spec.namespace, set_name)
                        .await?;
                    if let Some(s) = strategy::find(&set.parameters, name) {
                        found = Some(s.clone());
                    }
                }
            }
        }
        Ok(found)
    }
}
