//! Post-sort validation of output wiring against the resolved bundles.
//!
//! Every problem is collected and reported at once through
//! [`crate::errors::aggregate`].

use std::collections::BTreeMap;

use crate::bundle::definition::Bundle;
use crate::dag::graph::DependencyGraph;
use crate::dag::wiring::Wiring;
use crate::errors::{BundleError, Result, aggregate};

/// Check every output reference in `graph` against the dependency bundles,
/// keyed by dependency key.
///
/// - the referenced output must be declared by the target bundle;
/// - a wired parameter must be declared by the consuming bundle;
/// - an output feeding a parameter must have the parameter's type.
pub fn validate_wiring(graph: &DependencyGraph, bundles: &BTreeMap<String, Bundle>) -> Result<()> {
    let mut errors = Vec::new();

    for node in graph.nodes() {
        let consumer = bundles.get(&node.key);

        for (param, wiring) in &node.parameters {
            if let Some(consumer) = consumer {
                if !consumer.parameters.contains_key(param) {
                    errors.push(BundleError::invalid_manifest(format!(
                        "dependency {} wires parameter {param}, which bundle {} does not declare",
                        node.key, consumer.name
                    )));
                    continue;
                }
            }
            if let Wiring::DependencyOutput { dependency, output } = wiring {
                if let Err(e) = check_output(bundles, &node.key, dependency, output) {
                    errors.push(e);
                    continue;
                }
                if let (Some(consumer), Some(producer)) = (consumer, bundles.get(dependency)) {
                    if let Err(e) = check_types(consumer, param, producer, dependency, output) {
                        errors.push(e);
                    }
                }
            }
        }

        for wiring in node.credentials.values() {
            if let Wiring::DependencyOutput { dependency, output } = wiring {
                if let Err(e) = check_output(bundles, &node.key, dependency, output) {
                    errors.push(e);
                }
            }
        }

        for (alias, local) in &node.dependency.outputs {
            if let Some(consumer) = consumer {
                if !consumer.outputs.contains_key(local) {
                    errors.push(BundleError::invalid_manifest(format!(
                        "dependency {} aliases output {alias} to {local}, which bundle {} does not declare",
                        node.key, consumer.name
                    )));
                }
            }
        }
    }

    match aggregate(errors) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn check_output(
    bundles: &BTreeMap<String, Bundle>,
    consumer_key: &str,
    dependency: &str,
    output: &str,
) -> Result<()> {
    let producer = bundles.get(dependency).ok_or_else(|| {
        BundleError::invalid_manifest(format!(
            "dependency {consumer_key} references unresolved dependency {dependency}"
        ))
    })?;
    if !producer.outputs.contains_key(output) {
        return Err(BundleError::invalid_manifest(format!(
            "dependency {consumer_key} references output {output} of {dependency}, but bundle {} does not declare it",
            producer.name
        )));
    }
    Ok(())
}

fn check_types(
    consumer: &Bundle,
    param: &str,
    producer: &Bundle,
    dependency: &str,
    output: &str,
) -> Result<()> {
    let (Some(want), Some(have)) = (consumer.parameter_schema(param), producer.output_schema(output))
    else {
        return Ok(());
    };
    let want = want.parameter_type()?;
    let have = have.parameter_type()?;
    if want != have {
        return Err(BundleError::invalid_manifest(format!(
            "parameter {param} of {} is {} but output {dependency}.{output} is {}",
            consumer.name,
            want.as_str(),
            have.as_str()
        )));
    }
    Ok(())
}
