//! Parameter and credential precedence.
//!
//! Lowest to highest: bundle defaults, named sets in listed order, inline
//! installation values, command-line overrides. Parameters whose `applyTo`
//! excludes the action are dropped and every value is coerced to its
//! schema type.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

use crate::bundle::definition::{Bundle, is_internal_parameter};
use crate::errors::{BundleError, Result};
use crate::secrets::strategy::SecretStrategy;

/// Overlay `layer` onto `base`; keys in `layer` win.
pub fn overlay<V: Clone>(base: &mut BTreeMap<String, V>, layer: &BTreeMap<String, V>) {
    for (k, v) in layer {
        base.insert(k.clone(), v.clone());
    }
}

/// Overlay every layer in order onto an empty map.
pub fn merge_layers<'a, V: Clone + 'a>(
    layers: impl IntoIterator<Item = &'a BTreeMap<String, V>>,
) -> BTreeMap<String, V> {
    let mut merged = BTreeMap::new();
    for layer in layers {
        overlay(&mut merged, layer);
    }
    merged
}

/// Flatten strategy lists in precedence order, the last entry per name
/// winning.
pub fn layer_strategies<'a>(
    layers: impl IntoIterator<Item = &'a [SecretStrategy]>,
) -> Vec<SecretStrategy> {
    let mut by_name: BTreeMap<String, SecretStrategy> = BTreeMap::new();
    for layer in layers {
        for s in layer {
            by_name.insert(s.name.clone(), s.clone());
        }
    }
    by_name.into_values().collect()
}

/// Parse `NAME=VALUE` command-line overrides.
pub fn parse_overrides(raw: &[String]) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for item in raw {
        let (name, value) = item.split_once('=').ok_or_else(|| {
            BundleError::invalid_manifest(format!(
                "invalid parameter {item:?}: expected NAME=VALUE"
            ))
        })?;
        let name = name.trim();
        if name.is_empty() {
            return Err(BundleError::invalid_manifest(format!(
                "invalid parameter {item:?}: empty name"
            )));
        }
        out.insert(name.to_string(), value.to_string());
    }
    Ok(out)
}

/// Final typed parameters for `action`.
///
/// `resolved` holds the values of the layered strategies (`None` when a
/// source had no value); `overrides` are raw command-line values.
pub fn finalize_parameters(
    bundle: &Bundle,
    action: &str,
    resolved: &BTreeMap<String, Option<String>>,
    overrides: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, Value>> {
    for name in overrides.keys() {
        if !bundle.parameters.contains_key(name) {
            return Err(BundleError::invalid_manifest(format!(
                "bundle {} has no parameter {name}",
                bundle.name
            )));
        }
    }

    let mut values: BTreeMap<String, Value> = BTreeMap::new();
    for name in bundle.parameters.keys() {
        if let Some(default) = bundle.parameter_schema(name).and_then(|s| s.default.clone()) {
            values.insert(name.clone(), default);
        }
    }

    for (name, value) in resolved {
        let Some(value) = value else { continue };
        if !bundle.parameters.contains_key(name) {
            debug!(parameter = %name, bundle = %bundle.name, "ignoring value for undeclared parameter");
            continue;
        }
        values.insert(name.clone(), bundle.convert_parameter_value(name, value)?);
    }

    for (name, value) in overrides {
        values.insert(name.clone(), bundle.convert_parameter_value(name, value)?);
    }

    let mut missing = Vec::new();
    values.retain(|name, _| {
        bundle
            .parameters
            .get(name)
            .is_some_and(|p| p.applies_to(action))
    });
    for (name, def) in &bundle.parameters {
        if def.required && def.applies_to(action) && !values.contains_key(name) {
            missing.push(name.clone());
        }
    }
    if !missing.is_empty() {
        return Err(BundleError::MissingSource(format!(
            "required parameters have no value for action {action}: {}",
            missing.join(", ")
        )));
    }
    Ok(values)
}

/// Final credentials for `action`. Unset required credentials are
/// `MissingSource`.
pub fn finalize_credentials(
    bundle: &Bundle,
    action: &str,
    resolved: &BTreeMap<String, Option<String>>,
) -> Result<BTreeMap<String, String>> {
    let mut values = BTreeMap::new();
    let mut missing = Vec::new();
    for (name, def) in &bundle.credentials {
        if !def.applies_to(action) {
            continue;
        }
        match resolved.get(name).cloned().flatten() {
            Some(v) => {
                values.insert(name.clone(), v);
            }
            None if def.required => missing.push(name.clone()),
            None => {}
        }
    }
    if !missing.is_empty() {
        return Err(BundleError::MissingSource(format!(
            "required credentials have no value for action {action}: {}",
            missing.join(", ")
        )));
    }
    Ok(values)
}

/// Canonical `name -> text` form of typed parameters, internal parameters
/// dropped. Two maps that differ only in representation (`"1"` vs `1` for
/// an integer) produce the same fingerprint.
pub fn fingerprint(
    bundle: &Bundle,
    values: &BTreeMap<String, Value>,
) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for (name, value) in values {
        if is_internal_parameter(name) {
            continue;
        }
        let typed = match value {
            Value::String(s) => bundle.convert_parameter_value(name, s)?,
            other => other.clone(),
        };
        out.insert(name.clone(), bundle.write_parameter_to_string(name, &typed)?);
    }
    Ok(out)
}

/// Parameters as persisted on a run: one literal strategy per value.
pub fn to_strategies(
    bundle: &Bundle,
    values: &BTreeMap<String, Value>,
) -> Result<Vec<SecretStrategy>> {
    values
        .iter()
        .map(|(name, value)| {
            Ok(SecretStrategy::value(
                name.clone(),
                bundle.write_parameter_to_string(name, value)?,
            ))
        })
        .collect()
}
