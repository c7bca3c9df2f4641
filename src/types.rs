use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Outcome recorded on a `Result` document and mirrored on job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Running => "running",
            ResultStatus::Succeeded => "succeeded",
            ResultStatus::Failed => "failed",
            ResultStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ResultStatus::Running)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, ResultStatus::Failed | ResultStatus::Canceled)
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResultStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "running" => Ok(ResultStatus::Running),
            "succeeded" | "success" => Ok(ResultStatus::Succeeded),
            "failed" | "failure" => Ok(ResultStatus::Failed),
            "canceled" | "cancelled" => Ok(ResultStatus::Canceled),
            other => Err(format!("invalid result status: {other}")),
        }
    }
}

/// Image builder used when a workspace bundle needs rebuilding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BuildDriver {
    #[default]
    Docker,
    Buildkit,
}

impl FromStr for BuildDriver {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "docker" => Ok(BuildDriver::Docker),
            "buildkit" => Ok(BuildDriver::Buildkit),
            other => Err(format!(
                "invalid build-driver: {other} (expected \"docker\" or \"buildkit\")"
            )),
        }
    }
}

/// How inspection commands print their results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Plain,
    Json,
    Yaml,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "plain" | "table" => Ok(OutputFormat::Plain),
            "json" => Ok(OutputFormat::Json),
            "yaml" | "yml" => Ok(OutputFormat::Yaml),
            other => Err(format!(
                "invalid output format: {other} (expected plain, json or yaml)"
            )),
        }
    }
}
