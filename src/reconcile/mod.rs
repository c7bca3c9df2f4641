//! Decides whether an installation needs a bundle run, and which one.
//!
//! | condition                                         | verdict    |
//! |---------------------------------------------------|------------|
//! | wants uninstalled, not installed                  | no-op      |
//! | wants uninstalled, installed                      | uninstall  |
//! | never completed an install, or uninstalled since  | install    |
//! | no previous run                                   | install    |
//! | last run did not succeed                          | upgrade    |
//! | bundle digest changed                             | upgrade    |
//! | parameter fingerprint changed                     | upgrade    |
//! | credential set names changed                      | upgrade    |
//! | forced                                            | upgrade    |
//! | otherwise                                         | in sync    |

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;
use tracing::{debug, info};

use crate::bundle::definition::{ACTION_INSTALL, ACTION_UNINSTALL, ACTION_UPGRADE};
use crate::context::Context;
use crate::errors::{BundleError, ErrorKind, Result};
use crate::exec::{ActionExecutor, ExecuteOptions, ExecutionRecord, PreparedAction, parameters};
use crate::storage::documents::{Installation, InstallationSpec, Run, RunResult};
use crate::types::ResultStatus;

#[derive(Debug, Clone, Default)]
pub struct ReconcileOptions {
    pub installation: InstallationSpec,
    /// Run an upgrade even when the installation is in sync.
    pub force: bool,
    /// Decide but do not execute.
    pub dry_run: bool,
    pub exec: ExecuteOptions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub in_sync: bool,
    /// `None` when nothing needs to run.
    pub action: Option<String>,
    pub reason: String,
}

impl Decision {
    fn noop(reason: impl Into<String>) -> Self {
        Self {
            in_sync: true,
            action: None,
            reason: reason.into(),
        }
    }

    fn run(action: &str, reason: impl Into<String>) -> Self {
        Self {
            in_sync: false,
            action: Some(action.to_string()),
            reason: reason.into(),
        }
    }

    pub fn planned_action(&self) -> &str {
        self.action.as_deref().unwrap_or("")
    }
}

#[derive(Debug)]
pub struct ReconcileOutcome {
    pub decision: Decision,
    /// Set when the bundle was run.
    pub record: Option<ExecutionRecord>,
    /// The run and result that now describe the installation: the new ones
    /// when the bundle ran, otherwise the installation's last ones.
    pub run_id: String,
    pub result_id: String,
    pub status: ResultStatus,
}

impl ReconcileOutcome {
    /// Surface a failed run as an error.
    pub fn into_result(self) -> Result<Self> {
        match self.record {
            Some(record) => {
                let record = record.into_result()?;
                Ok(Self {
                    record: Some(record),
                    ..self
                })
            }
            None => Ok(self),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Reconciler {
    executor: ActionExecutor,
}

impl Reconciler {
    pub fn new(executor: ActionExecutor) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &ActionExecutor {
        &self.executor
    }

    pub async fn reconcile(&self, ctx: &Context, opts: &ReconcileOptions) -> Result<ReconcileOutcome> {
        let spec = &opts.installation;
        let decided = self.decide(ctx, opts).await;
        let (decision, prepared) = match decided {
            // Wiring to outputs that do not exist yet cannot be compared;
            // a dry run reports the job as needing a run.
            Err(e) if opts.dry_run && wiring_pending(&e) => (
                Decision::run(ACTION_UPGRADE, format!("waiting on upstream values: {e}")),
                None,
            ),
            other => other?,
        };
        info!(
            namespace = %spec.namespace,
            installation = %spec.name,
            in_sync = decision.in_sync,
            action = decision.planned_action(),
            reason = %decision.reason,
            dry_run = opts.dry_run,
            "reconciled installation"
        );

        let Some(action) = decision.action.clone().filter(|_| !opts.dry_run) else {
            let (run_id, result_id, status) = self.current(ctx, spec).await?;
            return Ok(ReconcileOutcome {
                decision,
                record: None,
                run_id,
                result_id,
                status,
            });
        };

        let prepared = match prepared {
            Some(p) if p.action == action => p,
            _ => self.executor.prepare(ctx, spec, &action, &opts.exec).await?,
        };
        let record = self
            .executor
            .execute_prepared(ctx, prepared, &opts.exec)
            .await?;
        Ok(ReconcileOutcome {
            decision,
            run_id: record.run.id.clone(),
            result_id: record.result.id.clone(),
            status: record.result.status,
            record: Some(record),
        })
    }

    /// The verdict for `opts.installation`, plus the prepared action when
    /// preparing it was needed to decide.
    pub async fn decide(
        &self,
        ctx: &Context,
        opts: &ReconcileOptions,
    ) -> Result<(Decision, Option<PreparedAction>)> {
        let spec = &opts.installation;
        let storage = self.executor.storage();
        let existing = match storage.get_installation(ctx, &spec.namespace, &spec.name).await {
            Ok(inst) => Some(inst),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };

        if spec.uninstalled {
            return Ok(match existing {
                Some(inst) if inst.is_installed() => (
                    Decision::run(ACTION_UNINSTALL, "installation should be uninstalled"),
                    None,
                ),
                _ => (Decision::noop("installation is not installed"), None),
            });
        }

        let Some(existing) = existing else {
            return Ok((Decision::run(ACTION_INSTALL, "installation does not exist"), None));
        };
        if !existing.status.installation_completed {
            return Ok((Decision::run(ACTION_INSTALL, "install has never completed"), None));
        }
        if existing.is_uninstalled() {
            return Ok((Decision::run(ACTION_INSTALL, "installation was uninstalled"), None));
        }

        let Some((last, last_result)) = self.last_modifying_run(ctx, &existing).await? else {
            return Ok((Decision::run(ACTION_INSTALL, "no previous run"), None));
        };

        let prepared = self
            .executor
            .prepare(ctx, spec, ACTION_UPGRADE, &opts.exec)
            .await?;
        let changed = self.changes(ctx, &last, &last_result, &prepared).await?;
        let decision = match changed {
            Some(reason) => Decision::run(ACTION_UPGRADE, reason),
            None if opts.force => Decision::run(ACTION_UPGRADE, "forced"),
            None => Decision::noop("installation is up to date"),
        };
        Ok((decision, Some(prepared)))
    }

    /// Why `prepared` differs from the last run, if it does.
    async fn changes(
        &self,
        ctx: &Context,
        last: &Run,
        last_result: &Option<RunResult>,
        prepared: &PreparedAction,
    ) -> Result<Option<String>> {
        if last_result.as_ref().map(|r| r.status) != Some(ResultStatus::Succeeded) {
            return Ok(Some(format!("last {} did not succeed", last.action)));
        }
        if last.bundle_digest != prepared.bundle.digest {
            return Ok(Some(format!(
                "bundle changed from {} to {}",
                last.bundle_digest, prepared.bundle.digest
            )));
        }

        // Only parameters consumed by both the last action and an upgrade
        // are comparable; an install-only parameter is never sent to upgrade.
        let bundle = &prepared.bundle.definition;
        let comparable = |name: &str| {
            bundle
                .parameters
                .get(name)
                .is_none_or(|p| p.applies_to(&last.action) && p.applies_to(ACTION_UPGRADE))
        };
        let desired: BTreeMap<String, Value> = prepared
            .parameters
            .iter()
            .filter(|(name, _)| comparable(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        let desired = parameters::fingerprint(bundle, &desired)?;
        let restored = self.executor.storage().restore_parameters(ctx, last).await?;
        let previous: BTreeMap<String, Value> = restored
            .into_iter()
            .filter(|s| comparable(&s.name))
            .map(|s| (s.name, Value::String(s.source.value)))
            .collect();
        let previous = parameters::fingerprint(bundle, &previous)?;
        if desired != previous {
            let names: BTreeSet<&str> = desired
                .keys()
                .chain(previous.keys())
                .filter(|k| desired.get(*k) != previous.get(*k))
                .map(String::as_str)
                .collect();
            debug!(run_id = %last.id, changed = ?names, "parameters changed");
            return Ok(Some(format!(
                "parameters changed: {}",
                names.into_iter().collect::<Vec<_>>().join(", ")
            )));
        }

        let mut want = prepared.installation.spec.credential_sets.clone();
        let mut had = last.credential_sets.clone();
        want.sort();
        had.sort();
        if want != had {
            return Ok(Some("credential sets changed".to_string()));
        }
        Ok(None)
    }

    /// The most recent run of an action that modifies the installation,
    /// with its latest result.
    async fn last_modifying_run(
        &self,
        ctx: &Context,
        inst: &Installation,
    ) -> Result<Option<(Run, Option<RunResult>)>> {
        let (runs, mut results) = self
            .executor
            .storage()
            .list_runs(ctx, inst.namespace(), inst.name())
            .await?;
        let Some(run) = runs
            .into_iter()
            .rev()
            .find(|r| r.bundle.action_modifies(&r.action).unwrap_or(false))
        else {
            return Ok(None);
        };
        let result = results
            .remove(&run.id)
            .and_then(|rs| rs.into_iter().max_by(|a, b| a.id.cmp(&b.id)));
        Ok(Some((run, result)))
    }

    async fn current(
        &self,
        ctx: &Context,
        spec: &InstallationSpec,
    ) -> Result<(String, String, ResultStatus)> {
        match self
            .executor
            .storage()
            .get_installation(ctx, &spec.namespace, &spec.name)
            .await
        {
            Ok(inst) => Ok((
                inst.status.last_run_id,
                inst.status.last_result_id,
                ResultStatus::Succeeded,
            )),
            Err(e) if e.is_not_found() => {
                Ok((String::new(), String::new(), ResultStatus::Succeeded))
            }
            Err(e) => Err(e),
        }
    }
}

fn wiring_pending(e: &BundleError) -> bool {
    matches!(
        e.kind(),
        ErrorKind::OutputNotReady | ErrorKind::InvalidReference | ErrorKind::NotFound
    )
}
