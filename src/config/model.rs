use std::collections::BTreeSet;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::types::BuildDriver;

pub const DEFAULT_STORAGE_PLUGIN: &str = "filesystem";
pub const DEFAULT_SECRETS_PLUGIN: &str = "filesystem";
pub const DEFAULT_RUNTIME_DRIVER: &str = "docker";

/// User configuration as read from `config.{toml,yaml,yml,json}`.
///
/// ```toml
/// namespace = "dev"
/// verbosity = "debug"
/// default-secrets = "mysecrets"
///
/// [[secrets]]
/// name = "mysecrets"
/// plugin = "filesystem"
/// ```
///
/// Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RawConfigFile {
    /// Namespace used for unqualified installation names.
    #[serde(default)]
    pub namespace: String,

    /// Log level (`error`, `warn`, `info`, `debug`, `trace`).
    #[serde(default)]
    pub verbosity: Option<String>,

    /// Name of an entry in `storage` to use.
    #[serde(default)]
    pub default_storage: Option<String>,

    /// Name of an entry in `secrets` to use.
    #[serde(default)]
    pub default_secrets: Option<String>,

    /// Built-in storage plugin key used when `default-storage` is unset.
    #[serde(default)]
    pub default_storage_plugin: Option<String>,

    /// Built-in secrets plugin key used when `default-secrets` is unset.
    #[serde(default)]
    pub default_secrets_plugin: Option<String>,

    /// Experimental feature flags.
    #[serde(default)]
    pub experimental: Vec<String>,

    #[serde(default)]
    pub build_driver: Option<String>,

    /// Named storage plugin configurations.
    #[serde(default)]
    pub storage: Vec<PluginConfig>,

    /// Named secrets plugin configurations.
    #[serde(default)]
    pub secrets: Vec<PluginConfig>,

    /// Seconds to wait for drivers to stop after an interrupt.
    #[serde(default)]
    pub shutdown_timeout: Option<u64>,

    /// Workflow parallelism; 0 or unset means number of CPUs.
    #[serde(default)]
    pub max_parallel: Option<usize>,

    /// Runtime driver used when none is given on the command line.
    #[serde(default)]
    pub runtime_driver: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PluginConfig {
    pub name: String,
    pub plugin: String,
    #[serde(default)]
    pub config: Value,
}

/// A resolved backend choice: built-in or external plugin key plus its
/// plugin-specific settings.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginSelection {
    pub plugin: String,
    pub config: Value,
}

impl PluginSelection {
    pub fn builtin(plugin: &str) -> Self {
        Self {
            plugin: plugin.to_string(),
            config: Value::Null,
        }
    }
}

/// Validated configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub namespace: String,
    pub verbosity: Option<tracing::Level>,
    pub storage: PluginSelection,
    pub secrets: PluginSelection,
    pub experimental: BTreeSet<String>,
    pub build_driver: BuildDriver,
    pub shutdown_timeout: Duration,
    pub max_parallel: usize,
    pub runtime_driver: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            verbosity: None,
            storage: PluginSelection::builtin(DEFAULT_STORAGE_PLUGIN),
            secrets: PluginSelection::builtin(DEFAULT_SECRETS_PLUGIN),
            experimental: BTreeSet::new(),
            build_driver: BuildDriver::default(),
            shutdown_timeout: crate::context::DEFAULT_SHUTDOWN_TIMEOUT,
            max_parallel: 0,
            runtime_driver: DEFAULT_RUNTIME_DRIVER.to_string(),
        }
    }
}

impl Config {
    pub fn is_experimental_enabled(&self, flag: &str) -> bool {
        self.experimental.contains(flag)
    }
}
