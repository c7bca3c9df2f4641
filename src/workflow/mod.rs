//! Workflows: the persisted plan for applying a root installation and its
//! dependencies.
//!
//! - [`model`] holds the workflow document.
//! - [`wiring`] lowers dependency wiring into job strategies.
//! - [`planner`] builds a workflow from a resolved bundle.

pub mod model;
pub mod planner;
pub mod wiring;

pub use model::{ACTION_NONE, Job, JobStatus, Stage, Workflow, WorkflowSpec, WorkflowStatus};
pub use planner::{PlanOptions, Planner, SHARING_GROUP_LABEL};
pub use wiring::ROOT_JOB_KEY;
