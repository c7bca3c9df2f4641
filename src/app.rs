//! The facade the CLI talks to.
//!
//! [`App`] owns the wired components (storage, bundle resolver, action
//! executor) and exposes the user-level operations: applying an
//! installation through a workflow, the imperative install / upgrade /
//! invoke / uninstall actions, inspection, workflow control and the named
//! set CRUD.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::bundle::definition::{OUTPUT_INVOCATION_IMAGE_LOGS, OUTPUT_STATE};
use crate::bundle::{ACTION_INSTALL, ACTION_UNINSTALL, ACTION_UPGRADE, Dependencies, OciReferenceParts, Reference};
use crate::config::{Config, Home};
use crate::context::Context;
use crate::engine::{ReconcilingJobExecutor, WorkflowEngine, scheduler};
use crate::errors::{BundleError, Result};
use crate::exec::{ActionExecutor, DriverRegistry, ExecuteOptions, ExecutionRecord};
use crate::reconcile::{ReconcileOptions, Reconciler};
use crate::resolver::{BundleCache, BundleResolver, DirectoryRegistry, Registry};
use crate::secrets::open_secret_store;
use crate::storage::documents::{
    CredentialSet, Installation, InstallationSpec, Output, ParameterSet, Run, RunResult,
};
use crate::storage::{Query, Storage, migrate, open_storage};
use crate::types::ResultStatus;
use crate::workflow::wiring::{dependency_installation_name, shared_installation_name};
use crate::workflow::{ACTION_NONE, PlanOptions, Planner, Workflow};

/// Shown in place of sensitive values.
pub const MASKED_VALUE: &str = "******";

/// Options shared by `apply` and the imperative actions.
#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    /// Upgrade the root installation even when it is in sync.
    pub force: bool,
    /// Overrides the configured `max-parallel`.
    pub max_parallel: Option<usize>,
    /// Run jobs one at a time.
    pub debug_mode: bool,
    pub exec: ExecuteOptions,
}

/// Changes to an installation requested on the command line.
#[derive(Debug, Clone, Default)]
pub struct InstallationChanges {
    pub reference: Option<String>,
    pub bundle_dir: Option<PathBuf>,
    pub parameter_sets: Vec<String>,
    pub credential_sets: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

impl InstallationChanges {
    pub fn apply_to(&self, spec: &mut InstallationSpec) -> Result<()> {
        if let Some(reference) = &self.reference {
            spec.bundle = OciReferenceParts::from_reference(&Reference::parse(reference)?);
            spec.bundle_dir = None;
        }
        if let Some(dir) = &self.bundle_dir {
            spec.bundle_dir = Some(dir.clone());
        }
        if !self.parameter_sets.is_empty() {
            spec.parameter_sets = self.parameter_sets.clone();
        }
        if !self.credential_sets.is_empty() {
            spec.credential_sets = self.credential_sets.clone();
        }
        spec.labels
            .extend(self.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }
}

/// One job of a dry-run plan and what the reconciler would do with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedJob {
    pub key: String,
    pub installation: String,
    pub planned_action: String,
    pub depends: Vec<String>,
    pub in_sync: bool,
    /// Action the reconciler would run; empty when nothing would run.
    pub action: String,
    pub reason: String,
}

/// A run with the status of its latest result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub id: String,
    pub action: String,
    pub bundle_reference: String,
    pub status: Option<ResultStatus>,
    pub message: String,
    pub created: chrono::DateTime<chrono::Utc>,
}

/// An output as shown to users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputView {
    pub name: String,
    pub value: String,
    pub sensitive: bool,
    /// The installation that produced the value when it is an alias of a
    /// dependency's output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub run_id: String,
}

#[derive(Clone)]
pub struct App {
    home: Home,
    config: Config,
    storage: Storage,
    resolver: BundleResolver,
    executor: ActionExecutor,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("home", &self.home)
            .field("namespace", &self.config.namespace)
            .finish_non_exhaustive()
    }
}

impl App {
    /// Wire the components selected by `config` under `home`.
    pub fn open(home: Home, config: Config) -> Result<Self> {
        let secrets = open_secret_store(&home, &config.secrets)?;
        let storage = open_storage(&home, &config, secrets)?;
        let registry: Arc<dyn Registry> = Arc::new(DirectoryRegistry::new(home.registry_dir()));
        let resolver = BundleResolver::new(BundleCache::new(home.cache_dir()), registry);
        Ok(Self::new(home, config, storage, resolver, DriverRegistry::new()))
    }

    /// Wire explicitly chosen components, as tests do.
    pub fn new(
        home: Home,
        config: Config,
        storage: Storage,
        resolver: BundleResolver,
        drivers: DriverRegistry,
    ) -> Self {
        let executor = ActionExecutor::new(
            storage.clone(),
            resolver.clone(),
            drivers,
            config.runtime_driver.clone(),
        );
        Self {
            home,
            config,
            storage,
            resolver,
            executor,
        }
    }

    pub fn home(&self) -> &Home {
        &self.home
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn executor(&self) -> &ActionExecutor {
        &self.executor
    }

    pub fn namespace_or_default<'a>(&'a self, namespace: Option<&'a str>) -> &'a str {
        namespace.unwrap_or(&self.config.namespace)
    }

    fn reconciler(&self) -> Reconciler {
        Reconciler::new(self.executor.clone())
    }

    fn planner(&self) -> Planner {
        Planner::new(self.storage.clone(), self.resolver.clone())
    }

    fn engine(&self, jobs: ReconcilingJobExecutor) -> WorkflowEngine {
        WorkflowEngine::new(self.storage.clone(), Arc::new(jobs), self.config.max_parallel)
    }

    fn plan_options(&self, opts: &ApplyOptions, action: Option<&str>) -> PlanOptions {
        PlanOptions {
            max_parallel: opts.max_parallel.unwrap_or(0),
            debug_mode: opts.debug_mode,
            action: action.map(str::to_string),
            resolve: opts.exec.resolve,
            overrides: opts.exec.params.clone(),
        }
    }

    fn normalize(&self, spec: &mut InstallationSpec) -> Result<()> {
        if spec.namespace.is_empty() {
            spec.namespace = self.config.namespace.clone();
        }
        spec.validate_user_name()
    }

    async fn plan(
        &self,
        ctx: &Context,
        spec: &InstallationSpec,
        opts: &ApplyOptions,
        action: Option<&str>,
    ) -> Result<Workflow> {
        let bundle = self
            .executor
            .resolve_bundle(ctx, spec, opts.exec.resolve)
            .await
            .map_err(|e| e.for_installation(&spec.namespace, &spec.name))?;
        self.planner()
            .plan(ctx, spec, &bundle, &self.plan_options(opts, action))
            .await
    }

    async fn run(
        &self,
        ctx: &Context,
        spec: &InstallationSpec,
        mut workflow: Workflow,
        jobs: ReconcilingJobExecutor,
    ) -> Result<Workflow> {
        self.engine(jobs)
            .run_workflow(ctx, &mut workflow)
            .await
            .map_err(|e| e.for_installation(&spec.namespace, &spec.name))?;
        Ok(workflow)
    }

    // ---- lifecycle -----------------------------------------------------

    /// Bring the installation and its dependencies to the desired state.
    pub async fn apply(
        &self,
        ctx: &Context,
        mut spec: InstallationSpec,
        opts: &ApplyOptions,
    ) -> Result<Workflow> {
        self.normalize(&mut spec)?;
        let workflow = self.plan(ctx, &spec, opts, None).await?;
        let jobs = ReconcilingJobExecutor::new(self.reconciler(), opts.exec.clone())
            .force_root(opts.force);
        let workflow = self.run(ctx, &spec, workflow, jobs).await?;
        info!(namespace = %spec.namespace, installation = %spec.name, workflow_id = %workflow.id, "applied installation");
        Ok(workflow)
    }

    /// Plan `spec` and report what each job would do, without persisting
    /// or running anything.
    pub async fn apply_dry_run(
        &self,
        ctx: &Context,
        mut spec: InstallationSpec,
        opts: &ApplyOptions,
    ) -> Result<Vec<PlannedJob>> {
        self.normalize(&mut spec)?;
        let workflow = self.plan(ctx, &spec, opts, None).await?;
        let reconciler = self.reconciler();

        let mut planned = Vec::new();
        for stage in &workflow.spec.stages {
            let depends: BTreeMap<String, Vec<String>> = stage
                .jobs
                .values()
                .map(|j| {
                    let inside = j
                        .depends
                        .iter()
                        .filter(|d| stage.jobs.contains_key(*d))
                        .cloned()
                        .collect();
                    (j.key.clone(), inside)
                })
                .collect();
            for key in scheduler::sort(&depends)? {
                let Some(job) = stage.jobs.get(&key) else {
                    continue;
                };
                let mut entry = PlannedJob {
                    key: job.key.clone(),
                    installation: job.installation.display_name(),
                    planned_action: job.action.clone(),
                    depends: job.depends.clone(),
                    in_sync: true,
                    action: String::new(),
                    reason: String::new(),
                };
                if job.action == ACTION_NONE {
                    entry.reason = "reusing shared installation".to_string();
                } else {
                    let mut exec = opts.exec.clone();
                    if job.key != crate::workflow::ROOT_JOB_KEY {
                        exec.params.clear();
                    }
                    let outcome = reconciler
                        .reconcile(
                            ctx,
                            &ReconcileOptions {
                                installation: job.installation.clone(),
                                force: opts.force && job.key == crate::workflow::ROOT_JOB_KEY,
                                dry_run: true,
                                exec,
                            },
                        )
                        .await?;
                    entry.in_sync = outcome.decision.in_sync;
                    entry.action = outcome.decision.planned_action().to_string();
                    entry.reason = outcome.decision.reason;
                }
                planned.push(entry);
            }
        }
        debug!(installation = %spec.name, jobs = planned.len(), "dry run complete");
        Ok(planned)
    }

    /// Install a new installation, or reinstall one with `force`.
    pub async fn install(
        &self,
        ctx: &Context,
        mut spec: InstallationSpec,
        opts: &ApplyOptions,
    ) -> Result<Workflow> {
        self.normalize(&mut spec)?;
        match self.storage.get_installation(ctx, &spec.namespace, &spec.name).await {
            Ok(existing) if existing.is_installed() && !opts.force => {
                return Err(BundleError::Conflict(format!(
                    "installation {} is already installed; use upgrade, or install --force",
                    spec.display_name()
                )));
            }
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        spec.uninstalled = false;
        let workflow = self.plan(ctx, &spec, opts, Some(ACTION_INSTALL)).await?;
        let jobs = ReconcilingJobExecutor::new(self.reconciler(), opts.exec.clone())
            .run_root_action(true);
        self.run(ctx, &spec, workflow, jobs).await
    }

    /// Upgrade an existing installation, applying `changes` first.
    pub async fn upgrade(
        &self,
        ctx: &Context,
        namespace: &str,
        name: &str,
        changes: &InstallationChanges,
        opts: &ApplyOptions,
    ) -> Result<Workflow> {
        let existing = self.storage.get_installation(ctx, namespace, name).await?;
        let mut spec = existing.spec.clone();
        changes.apply_to(&mut spec)?;
        spec.uninstalled = false;
        let workflow = self.plan(ctx, &spec, opts, Some(ACTION_UPGRADE)).await?;
        let jobs = ReconcilingJobExecutor::new(self.reconciler(), opts.exec.clone())
            .run_root_action(true);
        self.run(ctx, &spec, workflow, jobs).await
    }

    /// Run a custom action, or a built-in one, against an existing
    /// installation. Dependencies are not involved.
    pub async fn invoke(
        &self,
        ctx: &Context,
        namespace: &str,
        name: &str,
        action: &str,
        opts: &ApplyOptions,
    ) -> Result<ExecutionRecord> {
        let existing = self.storage.get_installation(ctx, namespace, name).await?;
        info!(namespace, installation = name, action, "invoking action");
        self.executor
            .execute(ctx, &existing.spec, action, &opts.exec)
            .await?
            .into_result()
    }

    /// Uninstall an installation and its dependencies, consumers first.
    /// `opts.exec.delete` / `force_delete` remove the records afterwards.
    pub async fn uninstall(
        &self,
        ctx: &Context,
        namespace: &str,
        name: &str,
        opts: &ApplyOptions,
    ) -> Result<Workflow> {
        let existing = self.storage.get_installation(ctx, namespace, name).await?;
        let mut spec = existing.spec.clone();
        spec.uninstalled = true;
        let workflow = self.plan(ctx, &spec, opts, Some(ACTION_UNINSTALL)).await?;
        let jobs = ReconcilingJobExecutor::new(self.reconciler(), opts.exec.clone())
            .run_root_action(true);
        self.run(ctx, &spec, workflow, jobs).await
    }

    // ---- inspection ----------------------------------------------------

    pub async fn show_installation(&self, ctx: &Context, namespace: &str, name: &str) -> Result<Installation> {
        self.storage.get_installation(ctx, namespace, name).await
    }

    /// Installations in `namespace`, or in every namespace when `None`.
    pub async fn list_installations(&self, ctx: &Context, namespace: Option<&str>) -> Result<Vec<Installation>> {
        let mut query = Query::new().sort_by("namespace").sort_by("name");
        if let Some(ns) = namespace {
            query = query.namespace(ns);
        }
        self.storage.list_installations(ctx, &query).await
    }

    pub async fn list_runs(&self, ctx: &Context, namespace: &str, name: &str) -> Result<Vec<RunSummary>> {
        self.storage.get_installation(ctx, namespace, name).await?;
        let (runs, mut results) = self.storage.list_runs(ctx, namespace, name).await?;
        Ok(runs
            .into_iter()
            .map(|run: Run| {
                let last: Option<RunResult> = results
                    .remove(&run.id)
                    .and_then(|rs| rs.into_iter().max_by(|a, b| a.id.cmp(&b.id)));
                RunSummary {
                    id: run.id,
                    action: run.action,
                    bundle_reference: run.bundle_reference,
                    status: last.as_ref().map(|r| r.status),
                    message: last.map(|r| r.message).unwrap_or_default(),
                    created: run.created,
                }
            })
            .collect())
    }

    /// Latest outputs of an installation, including aliases of dependency
    /// outputs. Sensitive values are masked unless `show_secrets`.
    pub async fn list_outputs(
        &self,
        ctx: &Context,
        namespace: &str,
        name: &str,
        show_secrets: bool,
    ) -> Result<Vec<OutputView>> {
        self.storage.get_installation(ctx, namespace, name).await?;
        let mut views = Vec::new();
        let mut seen = BTreeSet::new();
        for output in self.storage.read_last_outputs(ctx, namespace, name).await? {
            if is_internal_output(&output.name) {
                continue;
            }
            seen.insert(output.name.clone());
            views.push(self.view(ctx, output, None, show_secrets).await?);
        }
        for (alias, installation, local) in self.output_aliases(ctx, namespace, name).await? {
            if seen.contains(&alias) {
                continue;
            }
            match self
                .storage
                .read_last_outputs(ctx, namespace, &installation)
                .await?
                .into_iter()
                .find(|o| o.name == local)
            {
                Some(mut output) => {
                    output.name = alias.clone();
                    views.push(self.view(ctx, output, Some(installation), show_secrets).await?);
                    seen.insert(alias);
                }
                None => debug!(alias = %alias, installation = %installation, output = %local, "aliased output not recorded yet"),
            }
        }
        views.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(views)
    }

    /// One output value, restored. Falls back to a dependency's output when
    /// `output` is an alias declared by the installation's bundle.
    pub async fn read_output(
        &self,
        ctx: &Context,
        namespace: &str,
        name: &str,
        output: &str,
    ) -> Result<Output> {
        match self.storage.read_last_output(ctx, namespace, name, output).await {
            Ok(found) => Ok(found),
            Err(e) if e.is_not_found() => {
                let aliases = self.output_aliases(ctx, namespace, name).await?;
                let Some((_, installation, local)) = aliases.into_iter().find(|(a, _, _)| a == output) else {
                    return Err(e);
                };
                let mut found = self
                    .storage
                    .read_last_output(ctx, namespace, &installation, &local)
                    .await?;
                found.name = output.to_string();
                Ok(found)
            }
            Err(e) => Err(e),
        }
    }

    /// Logs captured from the installation's last run.
    pub async fn show_logs(&self, ctx: &Context, namespace: &str, name: &str) -> Result<String> {
        let output = self
            .storage
            .read_last_output(ctx, namespace, name, OUTPUT_INVOCATION_IMAGE_LOGS)
            .await?;
        Ok(output.value_string())
    }

    async fn view(
        &self,
        ctx: &Context,
        output: Output,
        source: Option<String>,
        show_secrets: bool,
    ) -> Result<OutputView> {
        let value = if output.sensitive && !show_secrets {
            MASKED_VALUE.to_string()
        } else {
            self.storage
                .restore_output(ctx, output.clone())
                .await?
                .value_string()
        };
        Ok(OutputView {
            name: output.name,
            value,
            sensitive: output.sensitive,
            source,
            run_id: output.run_id,
        })
    }

    /// `(alias, dependency installation, dependency output)` triples from
    /// the bundle of the installation's last run.
    async fn output_aliases(
        &self,
        ctx: &Context,
        namespace: &str,
        name: &str,
    ) -> Result<Vec<(String, String, String)>> {
        let run = match self.storage.get_last_run(ctx, namespace, name).await {
            Ok(run) => run,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let Some(deps) = Dependencies::from_bundle(&run.bundle)? else {
            return Ok(Vec::new());
        };
        let mut aliases = Vec::new();
        for dep in deps.requires.iter() {
            let installation = match dep.sharing_group() {
                Some(group) => shared_installation_name(group, &dep.name),
                None => dependency_installation_name(name, &dep.name),
            };
            for (alias, local) in &dep.outputs {
                aliases.push((alias.clone(), installation.clone(), local.clone()));
            }
        }
        Ok(aliases)
    }

    // ---- workflows -----------------------------------------------------

    pub async fn show_workflow(&self, ctx: &Context, id: &str) -> Result<Workflow> {
        self.storage.get_workflow(ctx, id).await
    }

    pub async fn list_workflows(&self, ctx: &Context, namespace: Option<&str>) -> Result<Vec<Workflow>> {
        let mut query = Query::new().sort_by("id");
        if let Some(ns) = namespace {
            query = query.namespace(ns);
        }
        self.storage.list_workflows(ctx, &query).await
    }

    fn workflow_engine(&self, exec: &ExecuteOptions) -> WorkflowEngine {
        self.engine(ReconcilingJobExecutor::new(self.reconciler(), exec.clone()))
    }

    /// Run the failed and canceled jobs of a workflow again.
    pub async fn retry_workflow(&self, ctx: &Context, id: &str, exec: &ExecuteOptions) -> Result<Workflow> {
        self.workflow_engine(exec).retry_workflow(ctx, id).await
    }

    pub async fn cancel_workflow(&self, ctx: &Context, id: &str) -> Result<Workflow> {
        self.engine(ReconcilingJobExecutor::new(self.reconciler(), ExecuteOptions::default()))
            .cancel_workflow(ctx, id)
            .await
    }

    /// Run a single job of a workflow.
    pub async fn step_workflow(
        &self,
        ctx: &Context,
        id: &str,
        job: &str,
        exec: &ExecuteOptions,
    ) -> Result<Workflow> {
        self.workflow_engine(exec).step_through(ctx, id, job).await
    }

    // ---- parameter and credential sets ---------------------------------

    pub async fn apply_parameter_set(&self, ctx: &Context, mut set: ParameterSet) -> Result<ParameterSet> {
        if set.namespace.is_empty() {
            set.namespace = self.config.namespace.clone();
        }
        validate_set_name(&set.name)?;
        warn_unknown_sources(&set.name, set.parameters.iter().map(|s| &s.source));
        self.storage.upsert_parameter_set(ctx, &mut set).await?;
        Ok(set)
    }

    pub async fn show_parameter_set(&self, ctx: &Context, namespace: &str, name: &str) -> Result<ParameterSet> {
        self.storage.get_parameter_set(ctx, namespace, name).await
    }

    pub async fn list_parameter_sets(&self, ctx: &Context, namespace: Option<&str>) -> Result<Vec<ParameterSet>> {
        self.storage.list_parameter_sets(ctx, &set_query(namespace)).await
    }

    pub async fn remove_parameter_set(&self, ctx: &Context, namespace: &str, name: &str) -> Result<()> {
        self.storage.remove_parameter_set(ctx, namespace, name).await
    }

    pub async fn apply_credential_set(&self, ctx: &Context, mut set: CredentialSet) -> Result<CredentialSet> {
        if set.namespace.is_empty() {
            set.namespace = self.config.namespace.clone();
        }
        validate_set_name(&set.name)?;
        warn_unknown_sources(&set.name, set.credentials.iter().map(|s| &s.source));
        self.storage.upsert_credential_set(ctx, &mut set).await?;
        Ok(set)
    }

    pub async fn show_credential_set(&self, ctx: &Context, namespace: &str, name: &str) -> Result<CredentialSet> {
        self.storage.get_credential_set(ctx, namespace, name).await
    }

    pub async fn list_credential_sets(&self, ctx: &Context, namespace: Option<&str>) -> Result<Vec<CredentialSet>> {
        self.storage.list_credential_sets(ctx, &set_query(namespace)).await
    }

    pub async fn remove_credential_set(&self, ctx: &Context, namespace: &str, name: &str) -> Result<()> {
        self.storage.remove_credential_set(ctx, namespace, name).await
    }

    // ---- storage -------------------------------------------------------

    /// Upgrade a legacy home; returns the path of the migration log.
    pub async fn migrate(&self, ctx: &Context) -> Result<PathBuf> {
        migrate::migrate(ctx, &self.home, &self.storage).await
    }
}

fn is_internal_output(name: &str) -> bool {
    name == OUTPUT_STATE || name == OUTPUT_INVOCATION_IMAGE_LOGS
}

fn set_query(namespace: Option<&str>) -> Query {
    let query = Query::new().sort_by("namespace").sort_by("name");
    match namespace {
        Some(ns) => query.namespace(ns),
        None => query,
    }
}

fn validate_set_name(name: &str) -> Result<()> {
    let re = crate::patterns::get(&crate::patterns::USER_NAME)?;
    if re.is_match(name) {
        Ok(())
    } else {
        Err(BundleError::invalid_manifest(format!("invalid set name {name:?}")))
    }
}

fn warn_unknown_sources<'a>(set: &str, sources: impl Iterator<Item = &'a crate::secrets::Source>) {
    for source in sources {
        if !source.is_known_key() {
            warn!(set, source = %source.key, "unknown source key; resolving it will fail");
        }
    }
}
