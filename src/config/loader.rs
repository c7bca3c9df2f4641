use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::home::Home;
use crate::config::model::{Config, RawConfigFile};
use crate::errors::{BundleError, Result};

/// Config file names probed in the home directory; the first one present wins.
pub const CONFIG_FILE_NAMES: &[&str] = &["config.toml", "config.yaml", "config.yml", "config.json"];

/// Find the config file in `home`, if any.
pub fn find_config_file(home: &Home) -> Option<PathBuf> {
    CONFIG_FILE_NAMES
        .iter()
        .map(|name| home.root().join(name))
        .find(|p| p.is_file())
}

/// Load a configuration file and return the raw, unvalidated document.
///
/// The format is chosen from the file extension.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawConfigFile> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    let raw: RawConfigFile = match ext.as_str() {
        "toml" => toml::from_str(&contents)?,
        "yaml" | "yml" => {
            if contents.trim().is_empty() {
                RawConfigFile::default()
            } else {
                serde_yaml::from_str(&contents)?
            }
        }
        "json" => serde_json::from_str(&contents)?,
        other => {
            return Err(BundleError::invalid_manifest(format!(
                "unsupported config file extension {other:?} for {}",
                path.display()
            )));
        }
    };

    Ok(raw)
}

/// Load and validate a single config file.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<Config> {
    let raw = load_from_path(&path)?;
    Config::try_from(raw)
}

/// Load the configuration for `home`, falling back to defaults when no
/// config file exists.
pub fn load_config(home: &Home) -> Result<Config> {
    match find_config_file(home) {
        Some(path) => {
            debug!(path = %path.display(), "loading config");
            load_and_validate(&path)
        }
        None => {
            debug!(home = %home.root().display(), "no config file found, using defaults");
            Ok(Config::default())
        }
    }
}
