//! Lowering dependency wiring into job strategies.
//!
//! The planner never resolves values. It writes `porter` strategies whose
//! value names the job that owns the real value, and the secret resolver
//! follows them while the workflow runs.

use crate::dag::Wiring;
use crate::secrets::resolver::{WiringKind, WorkflowReference};
use crate::secrets::strategy::{SOURCE_PORTER, SecretStrategy, Source};

/// Key of the job that applies the user's own installation.
pub const ROOT_JOB_KEY: &str = "root";

/// Job key of dependency `dep` declared by the job `parent_key`.
pub fn child_job_key(parent_key: &str, dep: &str) -> String {
    if parent_key == ROOT_JOB_KEY {
        dep.to_string()
    } else {
        format!("{parent_key}/{dep}")
    }
}

/// Installation name of a non-shared dependency: `PARENT/DEPKEY`.
pub fn dependency_installation_name(parent_name: &str, dep: &str) -> String {
    format!("{parent_name}/{dep}")
}

/// Installation name of a shared dependency created for a sharing group.
pub fn shared_installation_name(group: &str, dep: &str) -> String {
    format!("{group}-{dep}")
}

pub fn porter_strategy(name: &str, job: &str, kind: WiringKind, target: &str) -> SecretStrategy {
    SecretStrategy::new(
        name,
        Source::new(SOURCE_PORTER, WorkflowReference::format(job, kind, target)),
    )
}

/// The strategy a dependency job uses for input `name`.
///
/// - literals are passed as values;
/// - `bundle.parameters.X` / `bundle.credentials.X` read the parent job's
///   input `X`;
/// - `${bundle.dependencies.D.outputs.O}` reads output `O` of the sibling
///   job for `D`.
pub fn lower(name: &str, wiring: &Wiring, parent_key: &str) -> SecretStrategy {
    match wiring {
        Wiring::Literal(v) => SecretStrategy::value(name, v.clone()),
        Wiring::RootParameter(p) => porter_strategy(name, parent_key, WiringKind::Parameters, p),
        Wiring::RootCredential(c) => porter_strategy(name, parent_key, WiringKind::Credentials, c),
        Wiring::DependencyOutput { dependency, output } => porter_strategy(
            name,
            &child_job_key(parent_key, dependency),
            WiringKind::Outputs,
            output,
        ),
    }
}
