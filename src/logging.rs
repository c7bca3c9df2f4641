//! Logging setup for `bundlectl` using `tracing` + `tracing-subscriber`.
//!
//! Priority for determining the log level:
//! 1. `BUNDLECTL_LOG` environment variable (full `EnvFilter` syntax)
//! 2. `--log-level` CLI flag
//! 3. `verbosity` from the config file
//! 4. default to `info`
//!
//! Logs are sent to STDERR so that stdout carries only command output.

use anyhow::Result;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::LogLevel;

pub const LOG_ENV_VAR: &str = "BUNDLECTL_LOG";

/// Initialise the global logging subscriber.
///
/// Safe to call once at startup.
pub fn init_logging(
    cli_level: Option<LogLevel>,
    config_level: Option<tracing::Level>,
) -> Result<()> {
    let fallback = cli_level
        .map(level_from_log_level)
        .or(config_level)
        .unwrap_or(tracing::Level::INFO);

    let filter = match std::env::var(LOG_ENV_VAR) {
        Ok(s) if !s.trim().is_empty() => EnvFilter::try_new(s.trim())?,
        _ => EnvFilter::new(fallback.as_str().to_ascii_lowercase()),
    };

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialise logging: {e}"))?;

    Ok(())
}

fn level_from_log_level(lvl: LogLevel) -> tracing::Level {
    match lvl {
        LogLevel::Error => tracing::Level::ERROR,
        LogLevel::Warn => tracing::Level::WARN,
        LogLevel::Info => tracing::Level::INFO,
        LogLevel::Debug => tracing::Level::DEBUG,
        LogLevel::Trace => tracing::Level::TRACE,
    }
}

pub fn parse_level_str(s: &str) -> Option<tracing::Level> {
    match s.trim().to_lowercase().as_str() {
        "error" => Some(tracing::Level::ERROR),
        "warn" | "warning" => Some(tracing::Level::WARN),
        "info" => Some(tracing::Level::INFO),
        "debug" => Some(tracing::Level::DEBUG),
        "trace" => Some(tracing::Level::TRACE),
        _ => None,
    }
}
