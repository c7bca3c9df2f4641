use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bundlectl::context::Context;
use bundlectl::engine::{JobExecutor, JobReport};
use bundlectl::errors::{BundleError, Result};
use bundlectl::types::ResultStatus;
use bundlectl::workflow::Job;

/// A fake job executor that:
/// - records which jobs were "run", in start order
/// - reports success unless the job key was marked to fail, cancel or error
/// - tracks how many jobs ran at the same time.
#[derive(Clone, Default)]
pub struct FakeJobExecutor {
    executed: Arc<Mutex<Vec<String>>>,
    failing: BTreeSet<String>,
    canceling: BTreeSet<String>,
    erroring: BTreeSet<String>,
    delay: Option<Duration>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl FakeJobExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(mut self, key: &str) -> Self {
        self.failing.insert(key.to_string());
        self
    }

    pub fn cancel(mut self, key: &str) -> Self {
        self.canceling.insert(key.to_string());
        self
    }

    /// Return `Err` for `key`, which aborts the workflow.
    pub fn error(mut self, key: &str) -> Self {
        self.erroring.insert(key.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    /// Most jobs observed running at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobExecutor for FakeJobExecutor {
    async fn execute_job(&self, ctx: &Context, job: &Job) -> Result<JobReport> {
        {
            let mut guard = self.executed.lock().unwrap();
            guard.push(job.key.clone());
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let interrupted = match self.delay {
            Some(delay) => tokio::select! {
                _ = tokio::time::sleep(delay) => false,
                _ = ctx.cancelled() => true,
            },
            None => false,
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.erroring.contains(&job.key) {
            return Err(BundleError::InvariantViolated(format!(
                "fake executor error in {}",
                job.key
            )));
        }
        if interrupted || self.canceling.contains(&job.key) {
            return Ok(JobReport::failed(ResultStatus::Canceled, "interrupted"));
        }
        if self.failing.contains(&job.key) {
            return Ok(JobReport::failed(ResultStatus::Failed, "boom"));
        }
        Ok(JobReport::succeeded(
            format!("run-{}", job.key),
            format!("result-{}", job.key),
        ))
    }
}
