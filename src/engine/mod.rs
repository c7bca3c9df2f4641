//! Workflow execution.
//!
//! - [`scheduler`] is the pure per-stage ordering state.
//! - [`executor`] runs a single job, normally through the reconciler.
//! - [`runtime`] drives whole workflows with a bounded worker pool.

pub mod executor;
pub mod runtime;
pub mod scheduler;

pub use executor::{JobExecutor, JobReport, ReconcilingJobExecutor};
pub use runtime::WorkflowEngine;
pub use scheduler::{JobState, StageScheduler};
