//! The persisted entities: installations, runs, results, outputs and named
//! parameter/credential sets.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bundle::definition::{Bundle, Schema};
use crate::bundle::reference::{Digest, OciReferenceParts};
use crate::errors::{BundleError, Result};
use crate::patterns;
use crate::secrets::strategy::SecretStrategy;
use crate::types::ResultStatus;

/// Time-ordered unique id. Lexical order matches creation order.
pub fn new_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

/// What the user wants an installation to look like.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallationSpec {
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub bundle: OciReferenceParts,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<SecretStrategy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub credentials: Vec<SecretStrategy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameter_sets: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub credential_sets: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<Value>,
    /// Desired state: the installation should be uninstalled.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub uninstalled: bool,
    /// Bundle directory when the installation is applied from a workspace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_dir: Option<PathBuf>,
}

impl InstallationSpec {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// Names typed by users may not contain `/`; that separator is reserved
    /// for dependency installations (`PARENT/DEPKEY`).
    pub fn validate_user_name(&self) -> Result<()> {
        let re = patterns::get(&patterns::USER_NAME)?;
        if !re.is_match(&self.name) {
            return Err(BundleError::invalid_manifest(format!(
                "invalid installation name {:?}: names must start with a letter or digit and may only contain letters, digits, '.', '_' and '-'",
                self.name
            )));
        }
        if self.namespace.contains('/') {
            return Err(BundleError::invalid_manifest(format!(
                "invalid namespace {:?}: '/' is not allowed",
                self.namespace
            )));
        }
        Ok(())
    }

    pub fn display_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.namespace, self.name)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallationStatus {
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uninstalled: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_run_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_result_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<ResultStatus>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bundle_reference: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bundle_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_digest: Option<Digest>,
    #[serde(default)]
    pub installation_completed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Installation {
    pub id: String,
    #[serde(flatten)]
    pub spec: InstallationSpec,
    #[serde(default)]
    pub status: InstallationStatus,
}

impl Installation {
    pub fn new(spec: InstallationSpec) -> Self {
        Self {
            id: new_id(),
            spec,
            status: InstallationStatus::default(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.spec.namespace
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn is_installed(&self) -> bool {
        self.status.installed.is_some() && self.status.uninstalled.is_none()
    }

    pub fn is_uninstalled(&self) -> bool {
        self.status.uninstalled.is_some()
    }

    /// Take the user-controlled fields from `spec`, keeping id and status.
    pub fn apply_spec(&mut self, spec: InstallationSpec) {
        self.spec = spec;
    }

    /// Fold a run's result into the denormalised status.
    pub fn apply_result(&mut self, run: &Run, result: &RunResult) {
        let modifies = run.bundle.action_modifies(&run.action).unwrap_or(false);

        self.status.last_run_id = run.id.clone();
        self.status.last_action = run.action.clone();
        self.status.last_result_id = result.id.clone();
        self.status.last_status = Some(result.status);

        if !modifies {
            return;
        }

        self.status.bundle_reference = run.bundle_reference.clone();
        self.status.bundle_version = run.bundle.version.clone();
        self.status.bundle_digest = Some(run.bundle_digest.clone());

        if result.status == ResultStatus::Succeeded {
            match run.action.as_str() {
                crate::bundle::ACTION_INSTALL => {
                    self.status.installed = Some(result.created);
                    self.status.uninstalled = None;
                    self.status.installation_completed = true;
                }
                crate::bundle::ACTION_UNINSTALL => {
                    self.status.uninstalled = Some(result.created);
                }
                _ => {}
            }
        }
    }

    /// Rebuild the status from the ordered run/result history.
    pub fn recompute_status(&mut self, runs: &[Run], results: &BTreeMap<String, Vec<RunResult>>) {
        let created = self.status.created;
        let modified = self.status.modified;
        self.status = InstallationStatus {
            created,
            modified,
            ..Default::default()
        };
        let mut ordered: Vec<&Run> = runs.iter().collect();
        ordered.sort_by(|a, b| a.id.cmp(&b.id));
        for run in ordered {
            let Some(run_results) = results.get(&run.id) else {
                continue;
            };
            let mut run_results: Vec<&RunResult> = run_results.iter().collect();
            run_results.sort_by(|a, b| a.id.cmp(&b.id));
            for result in run_results {
                self.apply_result(run, result);
            }
        }
    }
}

/// The intent to run one action against an installation, frozen at
/// creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub installation_id: String,
    pub namespace: String,
    pub installation: String,
    pub bundle_reference: String,
    pub bundle_digest: Digest,
    pub bundle: Bundle,
    pub action: String,
    #[serde(default)]
    pub parameters: Vec<SecretStrategy>,
    #[serde(default)]
    pub credential_sets: Vec<String>,
    #[serde(default)]
    pub parameter_sets: Vec<String>,
    pub created: DateTime<Utc>,
}

impl Run {
    pub fn new(installation: &Installation, action: &str, bundle: Bundle, reference: &str) -> Result<Self> {
        let bundle_digest = bundle.digest()?;
        Ok(Self {
            id: new_id(),
            installation_id: installation.id.clone(),
            namespace: installation.spec.namespace.clone(),
            installation: installation.spec.name.clone(),
            bundle_reference: reference.to_string(),
            bundle_digest,
            bundle,
            action: action.to_string(),
            parameters: Vec::new(),
            credential_sets: installation.spec.credential_sets.clone(),
            parameter_sets: installation.spec.parameter_sets.clone(),
            created: Utc::now(),
        })
    }

    /// The frozen bundle must still hash to the recorded digest.
    pub fn verify_digest(&self) -> Result<()> {
        let actual = self.bundle.digest()?;
        if actual != self.bundle_digest {
            return Err(BundleError::IntegrityError(format!(
                "run {} records bundle digest {} but its frozen bundle hashes to {actual}",
                self.id, self.bundle_digest
            )));
        }
        Ok(())
    }

    pub fn new_result(&self, status: ResultStatus, message: impl Into<String>) -> RunResult {
        RunResult {
            id: new_id(),
            run_id: self.id.clone(),
            namespace: self.namespace.clone(),
            installation: self.installation.clone(),
            status,
            message: message.into(),
            created: Utc::now(),
            output_metadata: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputMetadata {
    pub content_digest: Option<Digest>,
    #[serde(default)]
    pub generated_by_bundle: bool,
}

/// Outcome of a run. A run has a `running` result followed by a terminal one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub id: String,
    pub run_id: String,
    pub namespace: String,
    pub installation: String,
    pub status: ResultStatus,
    #[serde(default)]
    pub message: String,
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub output_metadata: BTreeMap<String, OutputMetadata>,
}

/// A value produced by a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Output {
    pub id: String,
    pub name: String,
    pub namespace: String,
    pub installation: String,
    pub run_id: String,
    pub result_id: String,
    /// Hex-encoded on disk; empty when the value lives in the secret store.
    #[serde(with = "hex_bytes", default)]
    pub value: Vec<u8>,
    /// Secret store handle when the output is sensitive.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
    pub content_digest: Digest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Schema>,
    #[serde(default)]
    pub generated_by_bundle: bool,
    #[serde(default)]
    pub sensitive: bool,
    pub created: DateTime<Utc>,
}

impl Output {
    pub fn new(result: &RunResult, name: &str, value: Vec<u8>) -> Self {
        Self {
            id: new_id(),
            name: name.to_string(),
            namespace: result.namespace.clone(),
            installation: result.installation.clone(),
            run_id: result.run_id.clone(),
            result_id: result.id.clone(),
            content_digest: Digest::sha256(&value),
            value,
            key: String::new(),
            schema: None,
            generated_by_bundle: false,
            sensitive: false,
            created: Utc::now(),
        }
    }

    pub fn value_string(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// A named, namespaced list of parameter sources.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterSet {
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub parameters: Vec<SecretStrategy>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub modified: Option<DateTime<Utc>>,
}

/// A named, namespaced list of credential sources.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialSet {
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub credentials: Vec<SecretStrategy>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub modified: Option<DateTime<Utc>>,
}
