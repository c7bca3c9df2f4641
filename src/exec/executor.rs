//! Drives one bundle action end to end.
//!
//! Preparation (bundle, parameters, credentials) is pure validation and
//! writes nothing. Execution then persists the run and a `running` result,
//! hands the arguments to the driver, stores the outputs and the final
//! result, and folds that result into the installation's status.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::bundle::definition::{
    ACTION_INSTALL, ACTION_UNINSTALL, Bundle, OUTPUT_INVOCATION_IMAGE_LOGS, OUTPUT_STATE,
};
use crate::bundle::{BundleReference, Reference};
use crate::context::Context;
use crate::errors::{BundleError, Result};
use crate::exec::driver::{ActionArguments, DriverOutput, DriverRegistry};
use crate::exec::parameters;
use crate::fs;
use crate::resolver::{BundleResolver, ResolveOptions};
use crate::secrets::resolver::SecretResolver;
use crate::secrets::strategy::SecretStrategy;
use crate::storage::Storage;
use crate::storage::documents::{
    Installation, InstallationSpec, Output, OutputMetadata, Run, RunResult,
};
use crate::storage::query::Query;
use crate::types::ResultStatus;

/// Key under the bundle's `custom` section holding the blake3 digest of the
/// manifest it was built from.
pub const MANIFEST_DIGEST_KEY: &str = "sh.bundlectl.manifest-digest";
pub const MANIFEST_FILE: &str = "bundle.yaml";
pub const WORKSPACE_BUNDLE_FILE: &str = ".cnab/bundle.json";

/// Rebuilds a workspace bundle whose manifest changed since the last build.
#[async_trait]
pub trait BundleBuilder: Send + Sync {
    /// Rebuild `dir`, rewriting `.cnab/bundle.json`.
    async fn build(&self, ctx: &Context, dir: &Path) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Runtime driver; the executor's default when unset.
    pub driver: Option<String>,
    /// `--param NAME=VALUE` overrides.
    pub params: BTreeMap<String, String>,
    pub resolve: ResolveOptions,
    /// Run even if the last result is still `running`.
    pub force: bool,
    /// Delete the installation after a successful uninstall.
    pub delete: bool,
    /// Delete the installation after an uninstall, whatever its outcome.
    pub force_delete: bool,
    pub allow_docker_host_access: bool,
}

/// A validated action, ready to run.
#[derive(Debug, Clone)]
pub struct PreparedAction {
    pub installation: Installation,
    /// Whether `installation` is already stored.
    pub stored: bool,
    pub action: String,
    pub bundle: BundleReference,
    pub parameters: BTreeMap<String, Value>,
    pub credentials: BTreeMap<String, String>,
    pub bundle_dir: Option<PathBuf>,
}

impl PreparedAction {
    pub fn namespace(&self) -> &str {
        self.installation.namespace()
    }

    pub fn name(&self) -> &str {
        self.installation.name()
    }
}

/// The persisted run and its final result.
///
/// `error` holds the failure that produced a `failed` or `canceled`
/// result; the records are written either way.
#[derive(Debug)]
pub struct ExecutionRecord {
    pub run: Run,
    pub result: RunResult,
    pub outputs: Vec<String>,
    pub deleted: bool,
    pub error: Option<BundleError>,
}

impl ExecutionRecord {
    pub fn status(&self) -> ResultStatus {
        self.result.status
    }

    /// Surface the recorded failure as an error.
    pub fn into_result(self) -> Result<Self> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self),
        }
    }
}

#[derive(Clone)]
pub struct ActionExecutor {
    storage: Storage,
    secrets: SecretResolver,
    resolver: BundleResolver,
    drivers: DriverRegistry,
    default_driver: String,
    builder: Option<Arc<dyn BundleBuilder>>,
}

impl std::fmt::Debug for ActionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionExecutor")
            .field("drivers", &self.drivers)
            .field("default_driver", &self.default_driver)
            .finish_non_exhaustive()
    }
}

impl ActionExecutor {
    pub fn new(
        storage: Storage,
        resolver: BundleResolver,
        drivers: DriverRegistry,
        default_driver: impl Into<String>,
    ) -> Self {
        Self {
            secrets: SecretResolver::new(storage.clone()),
            storage,
            resolver,
            drivers,
            default_driver: default_driver.into(),
            builder: None,
        }
    }

    pub fn with_builder(mut self, builder: Arc<dyn BundleBuilder>) -> Self {
        self.builder = Some(builder);
        self
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn resolver(&self) -> &BundleResolver {
        &self.resolver
    }

    pub fn secrets(&self) -> &SecretResolver {
        &self.secrets
    }

    /// Resolve `action` against `spec` and run it.
    pub async fn execute(
        &self,
        ctx: &Context,
        spec: &InstallationSpec,
        action: &str,
        opts: &ExecuteOptions,
    ) -> Result<ExecutionRecord> {
        let prepared = self.prepare(ctx, spec, action, opts).await?;
        self.execute_prepared(ctx, prepared, opts).await
    }

    /// Steps that must all succeed before anything is written: load the
    /// installation, resolve the bundle, compute parameters and resolve
    /// credentials.
    pub async fn prepare(
        &self,
        ctx: &Context,
        spec: &InstallationSpec,
        action: &str,
        opts: &ExecuteOptions,
    ) -> Result<PreparedAction> {
        let (installation, stored) =
            match self.storage.get_installation(ctx, &spec.namespace, &spec.name).await {
                Ok(mut existing) => {
                    existing.apply_spec(spec.clone());
                    (existing, true)
                }
                Err(e) if e.is_not_found() && action == ACTION_INSTALL => {
                    (Installation::new(spec.clone()), false)
                }
                Err(e) => return Err(e),
            };

        let bundle = self.resolve_bundle(ctx, spec, opts.resolve).await?;
        bundle.definition.action_modifies(action)?;
        let parameters = self
            .resolve_parameters(ctx, spec, &bundle.definition, action, &opts.params)
            .await
            .map_err(|e| e.for_installation(&spec.namespace, &spec.name))?;
        let credentials = self
            .resolve_credentials(ctx, spec, &bundle.definition, action)
            .await
            .map_err(|e| e.for_installation(&spec.namespace, &spec.name))?;

        Ok(PreparedAction {
            installation,
            stored,
            action: action.to_string(),
            bundle,
            parameters,
            credentials,
            bundle_dir: spec.bundle_dir.clone(),
        })
    }

    /// The bundle an installation runs: its workspace build, or the
    /// resolved reference.
    pub async fn resolve_bundle(
        &self,
        ctx: &Context,
        spec: &InstallationSpec,
        opts: ResolveOptions,
    ) -> Result<BundleReference> {
        match &spec.bundle_dir {
            Some(dir) => self.load_workspace(ctx, spec, dir).await,
            None => {
                let reference = spec.bundle.to_reference()?;
                self.resolver.resolve(ctx, &reference, opts).await
            }
        }
    }

    /// Final typed parameters for `action`.
    pub async fn resolve_parameters(
        &self,
        ctx: &Context,
        spec: &InstallationSpec,
        bundle: &Bundle,
        action: &str,
        overrides: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, Value>> {
        let mut layers: Vec<Vec<SecretStrategy>> = Vec::new();
        for name in &spec.parameter_sets {
            let set = self
                .storage
                .get_parameter_set(ctx, &spec.namespace, name)
                .await?;
            layers.push(set.parameters);
        }
        layers.push(spec.parameters.clone());
        let strategies = parameters::layer_strategies(layers.iter().map(Vec::as_slice));

        let mut resolved = BTreeMap::new();
        for s in &strategies {
            if bundle
                .parameters
                .get(&s.name)
                .is_some_and(|p| !p.applies_to(action))
            {
                continue;
            }
            resolved.insert(s.name.clone(), self.secrets.resolve(ctx, s).await?);
        }
        parameters::finalize_parameters(bundle, action, &resolved, overrides)
    }

    pub async fn resolve_credentials(
        &self,
        ctx: &Context,
        spec: &InstallationSpec,
        bundle: &Bundle,
        action: &str,
    ) -> Result<BTreeMap<String, String>> {
        let mut layers: Vec<Vec<SecretStrategy>> = Vec::new();
        for name in &spec.credential_sets {
            let set = self
                .storage
                .get_credential_set(ctx, &spec.namespace, name)
                .await?;
            layers.push(set.credentials);
        }
        layers.push(spec.credentials.clone());
        let strategies = parameters::layer_strategies(layers.iter().map(Vec::as_slice));

        let mut resolved = BTreeMap::new();
        for s in &strategies {
            let Some(def) = bundle.credentials.get(&s.name) else {
                debug!(credential = %s.name, bundle = %bundle.name, "ignoring undeclared credential");
                continue;
            };
            if !def.applies_to(action) {
                continue;
            }
            resolved.insert(s.name.clone(), self.secrets.resolve(ctx, s).await?);
        }
        parameters::finalize_credentials(bundle, action, &resolved)
    }

    /// Persist and run a prepared action.
    pub async fn execute_prepared(
        &self,
        ctx: &Context,
        prepared: PreparedAction,
        opts: &ExecuteOptions,
    ) -> Result<ExecutionRecord> {
        ctx.check("execute action")?;
        let PreparedAction {
            mut installation,
            stored,
            action,
            bundle,
            parameters: params,
            credentials,
            bundle_dir,
        } = prepared;
        let namespace = installation.namespace().to_string();
        let name = installation.name().to_string();

        if stored {
            self.check_busy(ctx, &installation, opts.force).await?;
        }
        let driver_name = opts
            .driver
            .clone()
            .unwrap_or_else(|| self.default_driver.clone());
        let driver = self.drivers.get(&driver_name)?;

        if stored {
            self.storage.update_installation(ctx, &mut installation).await?;
        } else {
            self.storage.insert_installation(ctx, &mut installation).await?;
        }

        let mut run = Run::new(
            &installation,
            &action,
            bundle.definition.clone(),
            &bundle.reference.to_string(),
        )?;
        run.parameters = parameters::to_strategies(&bundle.definition, &params)?;
        let run = self.storage.insert_run(ctx, run).await?;

        let running = run.new_result(ResultStatus::Running, "");
        self.storage.insert_result(ctx, &running).await?;
        installation.apply_result(&run, &running);
        self.storage.update_installation(ctx, &mut installation).await?;

        info!(
            %namespace,
            installation = %name,
            run_id = %run.id,
            %action,
            driver = %driver_name,
            bundle = %bundle.reference,
            "executing action"
        );

        let args = ActionArguments {
            namespace: namespace.clone(),
            installation: name.clone(),
            run_id: run.id.clone(),
            action: action.clone(),
            bundle: bundle.definition.clone(),
            bundle_path: bundle_dir,
            params,
            credentials,
            driver: driver_name,
            relocation_map: bundle.relocation_map.clone(),
            allow_docker_host_access: opts.allow_docker_host_access,
        };

        let invoked = {
            let mut invocation = driver.run(ctx, &args);
            tokio::select! {
                out = &mut invocation => out,
                _ = ctx.cancelled() => {
                    warn!(run_id = %run.id, timeout = ?ctx.shutdown_timeout(), "cancelled, waiting for driver to stop");
                    match tokio::time::timeout(ctx.shutdown_timeout(), &mut invocation).await {
                        Ok(out) => out,
                        Err(_) => Err(BundleError::Canceled(format!(
                            "driver did not stop within {:?}",
                            ctx.shutdown_timeout()
                        ))),
                    }
                }
            }
        };

        // Whatever happened, the outcome is recorded.
        let record_ctx = ctx.detached();
        let (status, error, driver_output) = match invoked {
            Ok(out) => match out.error() {
                None => (ResultStatus::Succeeded, None, Some(out)),
                Some(e) => (ResultStatus::Failed, Some(e), Some(out)),
            },
            Err(e @ BundleError::Canceled(_)) => (ResultStatus::Canceled, Some(e), None),
            Err(e) => (ResultStatus::Failed, Some(e), None),
        };
        let message = error.as_ref().map(|e| e.to_string()).unwrap_or_default();
        let mut result = run.new_result(status, message);

        let outputs = match &driver_output {
            Some(out) => collect_outputs(&run, &result, out),
            None => Vec::new(),
        };
        for output in &outputs {
            result.output_metadata.insert(
                output.name.clone(),
                OutputMetadata {
                    content_digest: Some(output.content_digest.clone()),
                    generated_by_bundle: output.generated_by_bundle,
                },
            );
        }
        self.storage.insert_result(&record_ctx, &result).await?;

        let mut output_names = Vec::with_capacity(outputs.len());
        for output in outputs {
            let output_name = output.name.clone();
            match self.storage.insert_output(&record_ctx, output).await {
                Ok(_) => output_names.push(output_name),
                Err(e) if status != ResultStatus::Succeeded => {
                    warn!(run_id = %run.id, output = %output_name, error = %e, "could not save output of failed run");
                }
                Err(e) => return Err(e),
            }
        }

        installation.apply_result(&run, &result);
        self.storage
            .update_installation(&record_ctx, &mut installation)
            .await?;

        match &error {
            None => info!(
                %namespace,
                installation = %name,
                run_id = %run.id,
                result_id = %result.id,
                %action,
                outputs = output_names.len(),
                "action succeeded"
            ),
            Some(e) => error!(
                %namespace,
                installation = %name,
                run_id = %run.id,
                result_id = %result.id,
                %action,
                status = %status,
                error = %e,
                "action did not succeed"
            ),
        }

        let deleted = self
            .maybe_delete(&record_ctx, &installation, &action, status, opts)
            .await?;

        Ok(ExecutionRecord {
            run,
            result,
            outputs: output_names,
            deleted,
            error: error.map(|e| e.for_installation(&namespace, &name)),
        })
    }

    /// `Conflict` when the installation's latest result is still running.
    async fn check_busy(&self, ctx: &Context, installation: &Installation, force: bool) -> Result<()> {
        let last_run = match self
            .storage
            .get_last_run(ctx, installation.namespace(), installation.name())
            .await
        {
            Ok(run) => run,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        let query = Query::new()
            .field("runId", last_run.id.as_str())
            .sort_by("-id")
            .limit(1);
        let last = self.storage.find_results(ctx, &query).await?.into_iter().next();
        if last.is_some_and(|r| r.status == ResultStatus::Running) {
            if force {
                warn!(
                    namespace = %installation.namespace(),
                    installation = %installation.name(),
                    run_id = %last_run.id,
                    "last run is still marked running; continuing because of --force"
                );
            } else {
                return Err(BundleError::Conflict(format!(
                    "installation {} is busy: run {} ({}) has not finished",
                    installation.spec.display_name(),
                    last_run.id,
                    last_run.action
                )));
            }
        }
        Ok(())
    }

    async fn maybe_delete(
        &self,
        ctx: &Context,
        installation: &Installation,
        action: &str,
        status: ResultStatus,
        opts: &ExecuteOptions,
    ) -> Result<bool> {
        if action != ACTION_UNINSTALL || !(opts.delete || opts.force_delete) {
            return Ok(false);
        }
        if status != ResultStatus::Succeeded && !opts.force_delete {
            warn!(
                namespace = %installation.namespace(),
                installation = %installation.name(),
                "uninstall did not succeed, keeping the installation record (use --force-delete to remove it anyway)"
            );
            return Ok(false);
        }
        self.storage
            .remove_installation(ctx, installation.namespace(), installation.name())
            .await?;
        Ok(true)
    }

    /// Load `.cnab/bundle.json` from a bundle directory, rebuilding first
    /// when `bundle.yaml` changed since the last build.
    async fn load_workspace(
        &self,
        ctx: &Context,
        spec: &InstallationSpec,
        dir: &Path,
    ) -> Result<BundleReference> {
        let bundle_path = dir.join(WORKSPACE_BUNDLE_FILE);
        let mut bundle = Bundle::from_json(&fs::read_existing(&bundle_path)?)?;

        if is_stale(dir, &bundle)? {
            let Some(builder) = &self.builder else {
                return Err(BundleError::invalid_manifest(format!(
                    "bundle is stale, rebuild required ({} changed since {} was built)",
                    dir.join(MANIFEST_FILE).display(),
                    bundle_path.display()
                )));
            };
            info!(dir = %dir.display(), "manifest changed, rebuilding bundle");
            builder.build(ctx, dir).await?;
            bundle = Bundle::from_json(&fs::read_existing(&bundle_path)?)?;
        }

        let reference = if spec.bundle.is_empty() {
            Reference::parse(&format!(
                "localhost/{}:{}",
                bundle.name.to_ascii_lowercase(),
                bundle.version
            ))?
        } else {
            spec.bundle.to_reference()?
        };
        let relocation_map = match fs::read_existing(&dir.join(".cnab/relocation-mapping.json")) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.is_not_found() => BTreeMap::new(),
            Err(e) => return Err(e),
        };
        Ok(BundleReference {
            reference,
            digest: bundle.digest()?,
            definition: bundle,
            relocation_map,
        })
    }
}

/// blake3 hex digest of a manifest's bytes.
pub fn manifest_digest(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Whether the manifest in `dir` differs from the one `bundle` was built
/// from. A workspace without a manifest is never stale.
pub fn is_stale(dir: &Path, bundle: &Bundle) -> Result<bool> {
    let manifest = match fs::read_existing(&dir.join(MANIFEST_FILE)) {
        Ok(bytes) => bytes,
        Err(e) if e.is_not_found() => return Ok(false),
        Err(e) => return Err(e),
    };
    let current = manifest_digest(&manifest);
    let stamped = bundle.custom.get(MANIFEST_DIGEST_KEY).and_then(Value::as_str);
    Ok(stamped != Some(current.as_str()))
}

/// Declared outputs that apply to the run's action, plus the internal log
/// and state outputs.
fn collect_outputs(run: &Run, result: &RunResult, out: &DriverOutput) -> Vec<Output> {
    let bundle = &run.bundle;
    let mut outputs = Vec::new();
    for (name, value) in &out.outputs {
        let declared = bundle.outputs.get(name);
        match declared {
            Some(def) if def.applies_to(&run.action) => {
                let mut output = Output::new(result, name, value.clone());
                output.sensitive = bundle.is_sensitive_output(name);
                output.schema = bundle.output_schema(name).cloned();
                output.generated_by_bundle = def.generated_by_bundle;
                outputs.push(output);
            }
            None if name == OUTPUT_STATE => {
                outputs.push(Output::new(result, name, value.clone()));
            }
            _ => debug!(run_id = %run.id, output = %name, "ignoring output not declared for this action"),
        }
    }
    if !out.logs.is_empty() {
        outputs.push(Output::new(
            result,
            OUTPUT_INVOCATION_IMAGE_LOGS,
            out.logs.clone().into_bytes(),
        ));
    }
    outputs
}
