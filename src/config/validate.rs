use std::collections::HashSet;
use std::time::Duration;

use crate::config::model::{
    Config, DEFAULT_RUNTIME_DRIVER, DEFAULT_SECRETS_PLUGIN, DEFAULT_STORAGE_PLUGIN,
    PluginConfig, PluginSelection, RawConfigFile,
};
use crate::errors::{BundleError, Result};
use crate::logging::parse_level_str;
use crate::types::BuildDriver;

pub const BUILTIN_STORAGE_PLUGINS: &[&str] = &["filesystem", "memory"];

impl TryFrom<RawConfigFile> for Config {
    type Error = BundleError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_namespace(&raw.namespace)?;
        let verbosity = validate_verbosity(raw.verbosity.as_deref())?;
        let build_driver = validate_build_driver(raw.build_driver.as_deref())?;
        validate_unique_names("storage", &raw.storage)?;
        validate_unique_names("secrets", &raw.secrets)?;

        let storage = select_plugin(
            "storage",
            raw.default_storage.as_deref(),
            raw.default_storage_plugin.as_deref(),
            DEFAULT_STORAGE_PLUGIN,
            &raw.storage,
        )?;
        if !BUILTIN_STORAGE_PLUGINS.contains(&storage.plugin.as_str()) {
            return Err(BundleError::invalid_manifest(format!(
                "storage plugin {:?} is not supported (expected one of {})",
                storage.plugin,
                BUILTIN_STORAGE_PLUGINS.join(", ")
            )));
        }

        let secrets = select_plugin(
            "secrets",
            raw.default_secrets.as_deref(),
            raw.default_secrets_plugin.as_deref(),
            DEFAULT_SECRETS_PLUGIN,
            &raw.secrets,
        )?;

        let runtime_driver = raw
            .runtime_driver
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_RUNTIME_DRIVER.to_string());

        Ok(Config {
            namespace: raw.namespace,
            verbosity,
            storage,
            secrets,
            experimental: raw.experimental.into_iter().collect(),
            build_driver,
            shutdown_timeout: raw
                .shutdown_timeout
                .map(Duration::from_secs)
                .unwrap_or(crate::context::DEFAULT_SHUTDOWN_TIMEOUT),
            max_parallel: raw.max_parallel.unwrap_or(0),
            runtime_driver,
        })
    }
}

fn validate_namespace(namespace: &str) -> Result<()> {
    if namespace.contains('/') {
        return Err(BundleError::invalid_manifest(format!(
            "namespace {namespace:?} must not contain '/'"
        )));
    }
    Ok(())
}

fn validate_verbosity(verbosity: Option<&str>) -> Result<Option<tracing::Level>> {
    match verbosity {
        None => Ok(None),
        Some(v) if v.trim().is_empty() => Ok(None),
        Some(v) => parse_level_str(v).map(Some).ok_or_else(|| {
            BundleError::invalid_manifest(format!(
                "verbosity {v:?} is invalid (expected error, warn, info, debug or trace)"
            ))
        }),
    }
}

fn validate_build_driver(driver: Option<&str>) -> Result<BuildDriver> {
    match driver {
        None => Ok(BuildDriver::default()),
        Some(d) => d.parse().map_err(BundleError::InvalidManifest),
    }
}

fn validate_unique_names(section: &str, plugins: &[PluginConfig]) -> Result<()> {
    let mut seen = HashSet::new();
    for p in plugins {
        if p.name.trim().is_empty() {
            return Err(BundleError::invalid_manifest(format!(
                "every [[{section}]] entry needs a name"
            )));
        }
        if !seen.insert(p.name.as_str()) {
            return Err(BundleError::invalid_manifest(format!(
                "{section} plugin name {:?} is declared more than once",
                p.name
            )));
        }
    }
    Ok(())
}

fn select_plugin(
    section: &str,
    named: Option<&str>,
    builtin: Option<&str>,
    fallback: &str,
    plugins: &[PluginConfig],
) -> Result<PluginSelection> {
    if let Some(name) = named.filter(|n| !n.trim().is_empty()) {
        let entry = plugins.iter().find(|p| p.name == name).ok_or_else(|| {
            BundleError::invalid_manifest(format!(
                "default-{section} {name:?} does not match any [[{section}]] entry"
            ))
        })?;
        return Ok(PluginSelection {
            plugin: entry.plugin.clone(),
            config: entry.config.clone(),
        });
    }
    let key = builtin.filter(|k| !k.trim().is_empty()).unwrap_or(fallback);
    Ok(PluginSelection::builtin(key))
}
