//! How the engine runs a single job.
//!
//! The engine talks to a [`JobExecutor`] instead of the reconciler
//! directly, so tests can swap in a fake that never touches a driver.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::bundle::definition::is_built_in_action;
use crate::context::Context;
use crate::errors::{BundleError, Result};
use crate::exec::ExecuteOptions;
use crate::reconcile::{ReconcileOptions, Reconciler};
use crate::types::ResultStatus;
use crate::workflow::model::{ACTION_NONE, Job};
use crate::workflow::wiring::ROOT_JOB_KEY;

/// Outcome of one job, recorded into its status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub run_id: String,
    pub result_id: String,
    pub status: ResultStatus,
    pub message: String,
}

impl JobReport {
    pub fn succeeded(run_id: impl Into<String>, result_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            result_id: result_id.into(),
            status: ResultStatus::Succeeded,
            message: String::new(),
        }
    }

    pub fn failed(status: ResultStatus, message: impl Into<String>) -> Self {
        Self {
            run_id: String::new(),
            result_id: String::new(),
            status,
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Run `job`. An `Err` is reserved for failures that should abort the
    /// whole workflow; a job that merely failed reports it in the
    /// [`JobReport`].
    async fn execute_job(&self, ctx: &Context, job: &Job) -> Result<JobReport>;
}

/// Production executor: asks the reconciler whether each job needs to run.
#[derive(Debug, Clone)]
pub struct ReconcilingJobExecutor {
    reconciler: Reconciler,
    exec: ExecuteOptions,
    /// Run the root job's planned action as is instead of reconciling it,
    /// as `upgrade` and `invoke` require.
    run_root_action: bool,
    /// Upgrade the root installation even when it is in sync.
    force_root: bool,
}

impl ReconcilingJobExecutor {
    pub fn new(reconciler: Reconciler, exec: ExecuteOptions) -> Self {
        Self {
            reconciler,
            exec,
            run_root_action: false,
            force_root: false,
        }
    }

    pub fn run_root_action(mut self, yes: bool) -> Self {
        self.run_root_action = yes;
        self
    }

    pub fn force_root(mut self, yes: bool) -> Self {
        self.force_root = yes;
        self
    }

    /// Execute options for `job`. `--param` overrides name root
    /// parameters: the root job gets those recorded on it, topped up with
    /// any given now. Dependencies reach them only through wiring.
    fn options_for(&self, job: &Job) -> ExecuteOptions {
        let mut exec = self.exec.clone();
        if job.key == ROOT_JOB_KEY {
            let mut params = job.overrides.clone();
            params.extend(std::mem::take(&mut exec.params));
            exec.params = params;
        } else {
            exec.params.clear();
        }
        exec
    }

    /// A reused installation: its last result stands in for the job's.
    async fn reuse(&self, ctx: &Context, job: &Job) -> Result<JobReport> {
        let spec = &job.installation;
        let inst = self
            .reconciler
            .executor()
            .storage()
            .get_installation(ctx, &spec.namespace, &spec.name)
            .await?;
        debug!(job = %job.key, installation = %spec.name, result_id = %inst.status.last_result_id, "reusing installation");
        Ok(JobReport::succeeded(
            inst.status.last_run_id,
            inst.status.last_result_id,
        ))
    }
}

#[async_trait]
impl JobExecutor for ReconcilingJobExecutor {
    async fn execute_job(&self, ctx: &Context, job: &Job) -> Result<JobReport> {
        if job.action == ACTION_NONE {
            return self.reuse(ctx, job).await;
        }

        let exec = self.options_for(job);
        let direct = !is_built_in_action(&job.action)
            || (self.run_root_action && job.key == ROOT_JOB_KEY);
        let attempt = if direct {
            info!(job = %job.key, action = %job.action, "running job action");
            self.reconciler
                .executor()
                .execute(ctx, &job.installation, &job.action, &exec)
                .await
                .map(|record| {
                    let message = record.error.as_ref().map(|e| e.to_string()).unwrap_or_default();
                    JobReport {
                        run_id: record.run.id,
                        result_id: record.result.id,
                        status: record.result.status,
                        message,
                    }
                })
        } else {
            let opts = ReconcileOptions {
                installation: job.installation.clone(),
                force: self.force_root && job.key == ROOT_JOB_KEY,
                dry_run: false,
                exec,
            };
            self.reconciler.reconcile(ctx, &opts).await.map(|outcome| {
                let message = match &outcome.record {
                    Some(record) => record.error.as_ref().map(|e| e.to_string()).unwrap_or_default(),
                    None => outcome.decision.reason.clone(),
                };
                JobReport {
                    run_id: outcome.run_id,
                    result_id: outcome.result_id,
                    status: outcome.status,
                    message,
                }
            })
        };

        match attempt {
            Ok(report) => Ok(report),
            Err(e @ BundleError::InvariantViolated(_)) => Err(e),
            Err(BundleError::Canceled(m)) => Ok(JobReport::failed(ResultStatus::Canceled, m)),
            // Failures before a run was recorded still fail the job.
            Err(e) => Ok(JobReport::failed(ResultStatus::Failed, e.to_string())),
        }
    }
}
