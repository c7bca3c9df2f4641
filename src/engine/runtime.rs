//! Runs persisted workflows.
//!
//! This is the IO shell around [`StageScheduler`]: it hands ready jobs to a
//! pool of at most `maxParallel` tasks, records every job's outcome on the
//! workflow document as it arrives, and stops handing out work after the
//! first failure or cancellation.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::context::Context;
use crate::errors::{BundleError, Result};
use crate::storage::Storage;
use crate::types::ResultStatus;
use crate::workflow::model::{Job, Workflow};

use super::executor::{JobExecutor, JobReport};
use super::scheduler::StageScheduler;

#[derive(Clone)]
pub struct WorkflowEngine {
    storage: Storage,
    executor: Arc<dyn JobExecutor>,
    /// Parallelism for workflows that do not set their own; 0 means the
    /// number of CPUs.
    default_parallel: usize,
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("default_parallel", &self.default_parallel)
            .finish_non_exhaustive()
    }
}

impl WorkflowEngine {
    pub fn new(storage: Storage, executor: Arc<dyn JobExecutor>, default_parallel: usize) -> Self {
        Self {
            storage,
            executor,
            default_parallel,
        }
    }

    /// Workers for `workflow`: 1 in debug mode, otherwise the workflow's
    /// own setting, the engine default, or the number of CPUs.
    pub fn max_parallel(&self, workflow: &Workflow) -> usize {
        if workflow.spec.debug_mode {
            return 1;
        }
        if workflow.spec.max_parallel > 0 {
            return workflow.spec.max_parallel;
        }
        if self.default_parallel > 0 {
            return self.default_parallel;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    /// Persist `workflow` (assigning its id on first save) and run every
    /// stage in order.
    pub async fn run_workflow(&self, ctx: &Context, workflow: &mut Workflow) -> Result<()> {
        if workflow.status.cancel_requested {
            return Err(BundleError::Canceled(format!(
                "workflow {} was cancelled",
                workflow.id
            )));
        }
        workflow.status.status = Some(ResultStatus::Running);
        workflow.status.message.clear();
        self.storage.upsert_workflow(ctx, workflow).await?;

        let wctx = ctx.with_workflow(workflow.id.clone());
        info!(
            workflow_id = %workflow.id,
            installation = %workflow.installation,
            stages = workflow.spec.stages.len(),
            max_parallel = self.max_parallel(workflow),
            "running workflow"
        );

        for index in 0..workflow.spec.stages.len() {
            if let Err(e) = self.execute_stage(&wctx, workflow, index).await {
                let status = match &e {
                    BundleError::Canceled(_) => ResultStatus::Canceled,
                    _ => ResultStatus::Failed,
                };
                workflow.status.status = Some(status);
                workflow.status.message = e.to_string();
                self.save(&ctx.detached(), workflow).await?;
                error!(workflow_id = %workflow.id, stage = index, error = %e, "workflow did not complete");
                return Err(e);
            }
        }

        workflow.status.status = Some(ResultStatus::Succeeded);
        self.save(ctx, workflow).await?;
        info!(workflow_id = %workflow.id, "workflow completed");
        Ok(())
    }

    /// Run one stage to completion. Returns the first job failure as an
    /// error once every in-flight job has drained.
    pub async fn execute_stage(
        &self,
        ctx: &Context,
        workflow: &mut Workflow,
        index: usize,
    ) -> Result<()> {
        let satisfied: BTreeSet<String> = workflow.spec.stages[..index]
            .iter()
            .flat_map(|s| s.jobs.values())
            .filter(|j| j.status.is_succeeded())
            .map(|j| j.key.clone())
            .collect();
        let mut scheduler = StageScheduler::new(&workflow.spec.stages[index], &satisfied)?;
        let limit = self.max_parallel(workflow);
        debug!(workflow_id = %workflow.id, stage = index, order = ?scheduler.order(), "stage order");

        let mut workers: JoinSet<(String, Result<JobReport>)> = JoinSet::new();
        let mut aborted: Option<BundleError> = None;
        loop {
            if !ctx.is_cancelled() && aborted.is_none() && !workflow.status.cancel_requested {
                let capacity = limit.saturating_sub(workers.len());
                let ready = scheduler.collect_ready(capacity);
                for key in ready {
                    let Some(job) = workflow.get_job_mut(&key) else {
                        return Err(BundleError::InvariantViolated(format!(
                            "scheduled job {key} is not in the workflow"
                        )));
                    };
                    job.status.status = Some(ResultStatus::Running);
                    job.status.message.clear();
                    let job: Job = job.clone();
                    self.save(ctx, workflow).await?;

                    info!(workflow_id = %workflow.id, job = %key, action = %job.action, "starting job");
                    let executor = Arc::clone(&self.executor);
                    let jctx = ctx.clone();
                    workers.spawn(async move {
                        let report = executor.execute_job(&jctx, &job).await;
                        (job.key, report)
                    });
                }
            }

            let Some(joined) = workers.join_next().await else {
                break;
            };
            let (key, report) = joined.map_err(|e| {
                BundleError::InvariantViolated(format!("job worker panicked: {e}"))
            })?;
            let report = match report {
                Ok(report) => report,
                Err(e) => {
                    error!(workflow_id = %workflow.id, job = %key, error = %e, "job aborted the workflow");
                    let report = JobReport::failed(ResultStatus::Failed, e.to_string());
                    if aborted.is_none() {
                        aborted = Some(e);
                    }
                    report
                }
            };
            self.record(ctx, workflow, &key, &report).await?;
            scheduler.complete(&key, report.status == ResultStatus::Succeeded, report.message.clone());
        }

        if let Some(e) = aborted {
            return Err(e);
        }
        if let Some((key, message)) = scheduler.first_failure() {
            let canceled = workflow
                .get_job(key)
                .is_some_and(|j| j.status.status == Some(ResultStatus::Canceled));
            let msg = format!("job {key} failed: {message}");
            return Err(if canceled {
                BundleError::Canceled(msg)
            } else {
                BundleError::Other(anyhow::anyhow!(msg))
            });
        }
        if !scheduler.all_succeeded() {
            ctx.check("workflow stage")?;
            if workflow.status.cancel_requested {
                return Err(BundleError::Canceled(format!(
                    "workflow {} was cancelled",
                    workflow.id
                )));
            }
            return Err(BundleError::InvariantViolated(format!(
                "stage {index} of workflow {} stopped with unfinished jobs",
                workflow.id
            )));
        }
        Ok(())
    }

    /// Copy a job's outcome onto the workflow and persist it.
    async fn record(
        &self,
        ctx: &Context,
        workflow: &mut Workflow,
        key: &str,
        report: &JobReport,
    ) -> Result<()> {
        let Some(job) = workflow.get_job_mut(key) else {
            return Err(BundleError::InvariantViolated(format!(
                "completed job {key} is not in the workflow"
            )));
        };
        job.status.status = Some(report.status);
        job.status.message = report.message.clone();
        if !report.run_id.is_empty() {
            job.status.last_run_id = report.run_id.clone();
        }
        if !report.result_id.is_empty() {
            job.status.last_result_id = report.result_id.clone();
            if !job.status.result_ids.contains(&report.result_id) {
                job.status.result_ids.push(report.result_id.clone());
            }
        }
        match report.status {
            ResultStatus::Succeeded => {
                info!(workflow_id = %workflow.id, job = %key, result_id = %report.result_id, "job succeeded")
            }
            status => {
                warn!(workflow_id = %workflow.id, job = %key, %status, message = %report.message, "job did not succeed")
            }
        }
        // Cancellation must not stop the outcome from being saved.
        self.save(&ctx.detached(), workflow).await
    }

    /// Persist a workflow that is already running. A cancellation stored by
    /// `cancel_workflow` since the document was loaded is merged in first, so
    /// the write cannot clear it.
    async fn save(&self, ctx: &Context, workflow: &mut Workflow) -> Result<()> {
        if !workflow.id.is_empty() && !workflow.status.cancel_requested {
            match self.storage.get_workflow(ctx, &workflow.id).await {
                Ok(stored) if stored.status.cancel_requested => {
                    info!(workflow_id = %workflow.id, "cancellation requested while running");
                    workflow.status.cancel_requested = true;
                }
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        self.storage.upsert_workflow(ctx, workflow).await
    }

    /// Load and run a stored workflow.
    pub async fn run_workflow_id(&self, ctx: &Context, id: &str) -> Result<Workflow> {
        let mut workflow = self.storage.get_workflow(ctx, id).await?;
        self.run_workflow(ctx, &mut workflow).await?;
        Ok(workflow)
    }

    /// Reset failed and canceled jobs and run the workflow again. Jobs that
    /// succeeded are not re-run.
    pub async fn retry_workflow(&self, ctx: &Context, id: &str) -> Result<Workflow> {
        let mut workflow = self.storage.get_workflow(ctx, id).await?;
        workflow.status.cancel_requested = false;
        workflow.reset_failed();
        info!(workflow_id = %id, "retrying workflow");
        self.run_workflow(ctx, &mut workflow).await?;
        Ok(workflow)
    }

    /// Mark a workflow so that later runs and steps refuse to proceed.
    pub async fn cancel_workflow(&self, ctx: &Context, id: &str) -> Result<Workflow> {
        let mut workflow = self.storage.get_workflow(ctx, id).await?;
        workflow.status.cancel_requested = true;
        if workflow.status.status != Some(ResultStatus::Succeeded) {
            workflow.status.status = Some(ResultStatus::Canceled);
            workflow.status.message = "cancelled by user".to_string();
        }
        self.storage.upsert_workflow(ctx, &mut workflow).await?;
        info!(workflow_id = %id, "workflow cancelled");
        Ok(workflow)
    }

    /// Run a single job whose dependencies have all succeeded.
    pub async fn step_through(&self, ctx: &Context, id: &str, key: &str) -> Result<Workflow> {
        let mut workflow = self.storage.get_workflow(ctx, id).await?;
        if workflow.status.cancel_requested {
            return Err(BundleError::Canceled(format!("workflow {id} was cancelled")));
        }
        let job = workflow
            .get_job(key)
            .cloned()
            .ok_or_else(|| BundleError::not_found(format!("job {key} in workflow {id}")))?;
        let unmet: Vec<&str> = job
            .depends
            .iter()
            .filter(|d| !workflow.get_job(d).is_some_and(|j| j.status.is_succeeded()))
            .map(String::as_str)
            .collect();
        if !unmet.is_empty() {
            return Err(BundleError::Conflict(format!(
                "job {key} cannot run before {}",
                unmet.join(", ")
            )));
        }

        let wctx = ctx.with_workflow(workflow.id.clone());
        if let Some(j) = workflow.get_job_mut(key) {
            j.status.status = Some(ResultStatus::Running);
        }
        self.save(ctx, &mut workflow).await?;
        info!(workflow_id = %id, job = %key, "stepping through job");

        let report = match self.executor.execute_job(&wctx, &job).await {
            Ok(report) => report,
            Err(e) => {
                let report = JobReport::failed(ResultStatus::Failed, e.to_string());
                self.record(ctx, &mut workflow, key, &report).await?;
                return Err(e);
            }
        };
        self.record(ctx, &mut workflow, key, &report).await?;

        if workflow.is_complete() {
            workflow.status.status = Some(ResultStatus::Succeeded);
            self.save(ctx, &mut workflow).await?;
        }
        if report.status != ResultStatus::Succeeded {
            return Err(BundleError::Other(anyhow::anyhow!(
                "job {key} {}: {}",
                report.status,
                report.message
            )));
        }
        Ok(workflow)
    }
}
