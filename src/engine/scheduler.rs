//! Pure scheduling state for one workflow stage.
//!
//! No IO happens here: the runtime asks for ready jobs, runs them however
//! it likes and reports completions back. Keeping this separate lets the
//! ordering rules be tested without a runtime.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::errors::{BundleError, Result};
use crate::workflow::model::Stage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

#[derive(Debug)]
pub struct StageScheduler {
    /// Job keys in dependency order, ties broken by key.
    order: Vec<String>,
    depends: BTreeMap<String, Vec<String>>,
    states: BTreeMap<String, JobState>,
    /// Set on the first failure; nothing new is handed out afterwards.
    first_failure: Option<(String, String)>,
}

impl StageScheduler {
    /// Scheduler for `stage`.
    ///
    /// `satisfied` holds keys outside the stage that already succeeded
    /// (jobs of earlier stages). Jobs whose `succeeded` flag is set start
    /// out done, which is how a retry skips them.
    pub fn new(stage: &Stage, satisfied: &BTreeSet<String>) -> Result<Self> {
        let jobs: Vec<(String, Vec<String>, bool)> = stage
            .jobs
            .values()
            .map(|j| (j.key.clone(), j.depends.clone(), j.status.is_succeeded()))
            .collect();
        Self::from_jobs(jobs, satisfied)
    }

    /// Scheduler over `(key, depends, already succeeded)` triples.
    pub fn from_jobs(
        jobs: Vec<(String, Vec<String>, bool)>,
        satisfied: &BTreeSet<String>,
    ) -> Result<Self> {
        let keys: BTreeSet<String> = jobs.iter().map(|(k, _, _)| k.clone()).collect();
        let mut depends = BTreeMap::new();
        let mut states = BTreeMap::new();
        for (key, deps, done) in jobs {
            let mut inside = Vec::new();
            for dep in deps {
                if keys.contains(&dep) {
                    inside.push(dep);
                } else if !satisfied.contains(&dep) {
                    return Err(BundleError::InvariantViolated(format!(
                        "job {key} depends on {dep}, which is neither in its stage nor completed earlier"
                    )));
                }
            }
            states.insert(
                key.clone(),
                if done {
                    JobState::Succeeded
                } else {
                    JobState::Pending
                },
            );
            depends.insert(key, inside);
        }
        let order = sort(&depends)?;
        Ok(Self {
            order,
            depends,
            states,
            first_failure: None,
        })
    }

    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn state(&self, key: &str) -> Option<JobState> {
        self.states.get(key).copied()
    }

    fn deps_succeeded(&self, key: &str) -> bool {
        self.depends
            .get(key)
            .is_some_and(|deps| {
                deps.iter()
                    .all(|d| self.states.get(d) == Some(&JobState::Succeeded))
            })
    }

    /// Up to `capacity` pending jobs whose dependencies all succeeded, in
    /// stage order. They are marked running.
    pub fn collect_ready(&mut self, capacity: usize) -> Vec<String> {
        if self.first_failure.is_some() {
            return Vec::new();
        }
        let ready: Vec<String> = self
            .order
            .iter()
            .filter(|k| self.states.get(*k) == Some(&JobState::Pending))
            .filter(|k| self.deps_succeeded(k))
            .take(capacity)
            .cloned()
            .collect();
        for key in &ready {
            self.states.insert(key.clone(), JobState::Running);
            debug!(job = %key, "dependencies satisfied; marking running");
        }
        ready
    }

    /// Record that a running job finished.
    pub fn complete(&mut self, key: &str, succeeded: bool, message: impl Into<String>) {
        let state = if succeeded {
            JobState::Succeeded
        } else {
            JobState::Failed
        };
        self.states.insert(key.to_string(), state);
        if !succeeded && self.first_failure.is_none() {
            self.first_failure = Some((key.to_string(), message.into()));
        }
    }

    pub fn running(&self) -> usize {
        self.states
            .values()
            .filter(|s| **s == JobState::Running)
            .count()
    }

    /// First failed job and its message.
    pub fn first_failure(&self) -> Option<&(String, String)> {
        self.first_failure.as_ref()
    }

    pub fn all_succeeded(&self) -> bool {
        self.states.values().all(|s| *s == JobState::Succeeded)
    }

    /// Nothing is running and nothing more will be handed out.
    pub fn is_finished(&self) -> bool {
        if self.running() > 0 {
            return false;
        }
        if self.first_failure.is_some() {
            return true;
        }
        !self
            .order
            .iter()
            .any(|k| self.states.get(k) == Some(&JobState::Pending) && self.deps_succeeded(k))
    }
}

/// Kahn's algorithm over `depends`, emitting ready keys in key order.
/// A cycle is `InvariantViolated`.
pub fn sort(depends: &BTreeMap<String, Vec<String>>) -> Result<Vec<String>> {
    let mut remaining: BTreeMap<&str, usize> = depends
        .iter()
        .map(|(k, deps)| (k.as_str(), deps.iter().collect::<BTreeSet<_>>().len()))
        .collect();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (key, deps) in depends {
        for dep in deps.iter().collect::<BTreeSet<_>>() {
            dependents.entry(dep.as_str()).or_default().push(key.as_str());
        }
    }

    let mut ready: BTreeSet<&str> = remaining
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(k, _)| *k)
        .collect();
    let mut order = Vec::with_capacity(depends.len());
    while let Some(key) = ready.pop_first() {
        order.push(key.to_string());
        for dependent in dependents.get(key).into_iter().flatten() {
            if let Some(n) = remaining.get_mut(dependent) {
                *n -= 1;
                if *n == 0 {
                    ready.insert(*dependent);
                }
            }
        }
    }

    if order.len() != depends.len() {
        let stuck: Vec<&str> = remaining
            .iter()
            .filter(|(_, n)| **n > 0)
            .map(|(k, _)| *k)
            .collect();
        return Err(BundleError::InvariantViolated(format!(
            "cycle in workflow stage among jobs: {}",
            stuck.join(", ")
        )));
    }
    Ok(order)
}
