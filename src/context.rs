//! Request context threaded through every suspending operation.
//!
//! Carries the cancellation token shared with the signal handler and, while
//! the engine is dispatching a job, the id of the workflow that job belongs
//! to. The workflow id never lives in the persisted workflow document; it is
//! only ever passed through here.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::errors::{BundleError, Result};

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct Context {
    cancel: CancellationToken,
    workflow_id: Option<String>,
    shutdown_timeout: Duration,
}

impl Default for Context {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

impl Context {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            workflow_id: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Derive a context scoped to a workflow run.
    pub fn with_workflow(&self, workflow_id: impl Into<String>) -> Self {
        Self {
            cancel: self.cancel.clone(),
            workflow_id: Some(workflow_id.into()),
            shutdown_timeout: self.shutdown_timeout,
        }
    }

    /// Child context whose cancellation does not propagate upwards.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            workflow_id: self.workflow_id.clone(),
            shutdown_timeout: self.shutdown_timeout,
        }
    }

    /// Context that is never cancelled, for recording the outcome of work
    /// that was.
    pub fn detached(&self) -> Self {
        Self {
            cancel: CancellationToken::new(),
            workflow_id: self.workflow_id.clone(),
            shutdown_timeout: self.shutdown_timeout,
        }
    }

    pub fn workflow_id(&self) -> Option<&str> {
        self.workflow_id.as_deref()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Fail fast with `Canceled` if the context has been cancelled.
    pub fn check(&self, what: &str) -> Result<()> {
        if self.is_cancelled() {
            return Err(BundleError::Canceled(what.to_string()));
        }
        Ok(())
    }
}
