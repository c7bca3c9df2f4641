//! Workflow documents: stages of jobs plus their mutable status.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{BundleError, Result};
use crate::storage::documents::{InstallationSpec, new_id};
use crate::types::ResultStatus;

pub const WORKFLOW_SCHEMA_VERSION: &str = "1.0.0";

/// Job action for a shared installation that is reused as is.
pub const ACTION_NONE: &str = "none";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSpec {
    pub schema_version: String,
    /// 0 means "number of CPUs".
    #[serde(default)]
    pub max_parallel: usize,
    #[serde(default)]
    pub debug_mode: bool,
    pub stages: Vec<Stage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub jobs: BTreeMap<String, Job>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub key: String,
    pub action: String,
    pub installation: InstallationSpec,
    #[serde(default)]
    pub depends: Vec<String>,
    /// `--param` values given for this workflow. Only the root job carries
    /// them; they are never written to the installation itself.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub overrides: BTreeMap<String, String>,
    #[serde(default)]
    pub status: JobStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_run_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_result_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub result_ids: Vec<String>,
    /// `None` until the job has been picked up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ResultStatus>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl JobStatus {
    pub fn is_succeeded(&self) -> bool {
        self.status == Some(ResultStatus::Succeeded)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ResultStatus>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Set by `cancel_workflow`; every later step refuses to proceed.
    #[serde(default)]
    pub cancel_requested: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: String,
    /// Root installation this workflow applies.
    pub namespace: String,
    pub installation: String,
    pub created: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub spec: WorkflowSpec,
    #[serde(default)]
    pub status: WorkflowStatus,
}

impl Workflow {
    pub fn new(namespace: impl Into<String>, installation: impl Into<String>, spec: WorkflowSpec) -> Self {
        Self {
            id: String::new(),
            namespace: namespace.into(),
            installation: installation.into(),
            created: None,
            spec,
            status: WorkflowStatus::default(),
        }
    }

    /// Assign an id and creation time if this workflow has never been
    /// persisted, and check its jobs are well formed.
    pub fn prepare(&mut self) -> Result<()> {
        if self.id.is_empty() {
            self.id = new_id();
        }
        if self.created.is_none() {
            self.created = Some(Utc::now());
        }
        if self.spec.schema_version.is_empty() {
            self.spec.schema_version = WORKFLOW_SCHEMA_VERSION.to_string();
        }
        let mut seen = std::collections::HashSet::new();
        for stage in &self.spec.stages {
            for (key, job) in &stage.jobs {
                if key != &job.key {
                    return Err(BundleError::InvariantViolated(format!(
                        "job stored under {key:?} has key {:?}",
                        job.key
                    )));
                }
                if !seen.insert(key.as_str()) {
                    return Err(BundleError::InvariantViolated(format!(
                        "job key {key:?} appears in more than one stage"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.spec.stages.iter().flat_map(|s| s.jobs.values())
    }

    pub fn get_job(&self, key: &str) -> Option<&Job> {
        self.spec.stages.iter().find_map(|s| s.jobs.get(key))
    }

    pub fn get_job_mut(&mut self, key: &str) -> Option<&mut Job> {
        self.spec
            .stages
            .iter_mut()
            .find_map(|s| s.jobs.get_mut(key))
    }

    /// Clear failed and canceled job statuses so a retry runs them again.
    /// Run and result history is kept.
    pub fn reset_failed(&mut self) {
        for stage in &mut self.spec.stages {
            for job in stage.jobs.values_mut() {
                if job.status.status.is_some_and(|s| s != ResultStatus::Succeeded) {
                    job.status.status = None;
                    job.status.message.clear();
                }
            }
        }
        self.status.status = None;
        self.status.message.clear();
    }

    pub fn is_complete(&self) -> bool {
        self.jobs().all(|j| j.status.is_succeeded())
    }
}
