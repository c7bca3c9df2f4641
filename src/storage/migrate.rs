//! One-shot upgrade of the legacy claim layout.
//!
//! Legacy homes recorded history as CNAB claims:
//!
//! ```text
//! claims/<installation>/<claim id>.json
//! results/<claim id>/<result id>.json
//! outputs/<result id>/<result id>-<output name>
//! ```
//!
//! Each claim becomes a run, each claim result a result, each output file an
//! output, and the installation status is recomputed from that history.
//! Progress is appended to `migrations/<timestamp>.log`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::bundle::definition::Bundle;
use crate::config::Home;
use crate::context::Context;
use crate::errors::{BundleError, Result};
use crate::fs::{create_private_dir, write_private};
use crate::secrets::SecretStrategy;
use crate::storage::documents::{Installation, InstallationSpec, Output, Run, RunResult};
use crate::storage::store::Storage;
use crate::types::ResultStatus;

pub const STORAGE_SCHEMA_VERSION: &str = "1.0.0";
pub const STORAGE_SCHEMA_FILE: &str = "storage.json";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageSchema {
    pub schema_version: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyClaim {
    id: String,
    installation: String,
    #[serde(default)]
    namespace: String,
    created: DateTime<Utc>,
    action: String,
    bundle: Bundle,
    #[serde(default)]
    bundle_reference: String,
    #[serde(default)]
    parameters: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyResult {
    id: String,
    created: DateTime<Utc>,
    status: String,
    #[serde(default)]
    message: String,
}

struct MigrationLog {
    path: PathBuf,
    lines: Vec<String>,
}

impl MigrationLog {
    fn line(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        info!(target: "bundlectl::migrate", "{msg}");
        self.lines
            .push(format!("{} {msg}", Utc::now().to_rfc3339()));
    }

    fn flush(&self) -> Result<()> {
        let mut text = self.lines.join("\n");
        text.push('\n');
        write_private(&self.path, text.as_bytes())
    }
}

pub fn read_schema(home: &Home) -> Result<Option<StorageSchema>> {
    let path = home.root().join(STORAGE_SCHEMA_FILE);
    match std::fs::read(&path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_schema(home: &Home) -> Result<()> {
    let schema = StorageSchema {
        schema_version: STORAGE_SCHEMA_VERSION.to_string(),
    };
    write_private(
        &home.root().join(STORAGE_SCHEMA_FILE),
        &serde_json::to_vec_pretty(&schema)?,
    )
}

/// Whether `home` still holds legacy claims that have not been migrated.
pub fn needs_migration(home: &Home) -> Result<bool> {
    let current = read_schema(home)?
        .is_some_and(|s| s.schema_version == STORAGE_SCHEMA_VERSION);
    Ok(!current && home.root().join("claims").is_dir())
}

/// Upgrade `home` in place and return the path of the migration log.
pub async fn migrate(ctx: &Context, home: &Home, storage: &Storage) -> Result<PathBuf> {
    let migrations = home.migrations_dir();
    create_private_dir(&migrations)?;
    let mut log = MigrationLog {
        path: migrations.join(format!("{}.log", Utc::now().format("%Y%m%dT%H%M%S%.3fZ"))),
        lines: Vec::new(),
    };

    if read_schema(home)?.is_some_and(|s| s.schema_version == STORAGE_SCHEMA_VERSION) {
        log.line(format!(
            "storage is already up to date (schema {STORAGE_SCHEMA_VERSION})"
        ));
        log.flush()?;
        return Ok(log.path);
    }

    let claims_dir = home.root().join("claims");
    let mut migrated = 0usize;
    if claims_dir.is_dir() {
        let mut installations: Vec<PathBuf> = std::fs::read_dir(&claims_dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_dir())
            .collect();
        installations.sort();

        for dir in installations {
            ctx.check("migration")?;
            match migrate_installation(ctx, home, storage, &dir, &mut log).await {
                Ok(()) => migrated += 1,
                Err(e) => {
                    log.line(format!("failed to migrate {}: {e}", dir.display()));
                    log.flush()?;
                    return Err(e);
                }
            }
        }
    } else {
        log.line("no legacy claims found");
    }

    write_schema(home)?;
    log.line(format!(
        "migrated {migrated} installation(s); storage schema is now {STORAGE_SCHEMA_VERSION}"
    ));
    log.flush()?;
    Ok(log.path)
}

async fn migrate_installation(
    ctx: &Context,
    home: &Home,
    storage: &Storage,
    dir: &Path,
    log: &mut MigrationLog,
) -> Result<()> {
    let mut claim_files = crate::fs::list_files(dir, "json")?;
    claim_files.sort();
    let mut claims = Vec::new();
    for path in claim_files {
        let claim: LegacyClaim = serde_json::from_slice(&std::fs::read(&path)?).map_err(|e| {
            BundleError::invalid_manifest(format!("legacy claim {}: {e}", path.display()))
        })?;
        claims.push(claim);
    }
    claims.sort_by(|a, b| a.id.cmp(&b.id));

    let Some(first) = claims.first() else {
        log.line(format!("skipping {}: no claims", dir.display()));
        return Ok(());
    };

    let namespace = first.namespace.clone();
    let name = first.installation.clone();
    log.line(format!("migrating installation {name} ({} claims)", claims.len()));

    let mut inst = match storage.get_installation(ctx, &namespace, &name).await {
        Ok(existing) => existing,
        Err(e) if e.is_not_found() => {
            let mut spec = InstallationSpec::new(namespace.clone(), name.clone());
            if let Ok(r) = crate::bundle::Reference::parse(&first.bundle_reference) {
                spec.bundle = crate::bundle::OciReferenceParts::from_reference(&r);
            }
            let mut inst = Installation::new(spec);
            inst.status.created = Some(first.created);
            storage.insert_installation(ctx, &mut inst).await?;
            inst
        }
        Err(e) => return Err(e),
    };

    let mut runs = Vec::new();
    let mut results: BTreeMap<String, Vec<RunResult>> = BTreeMap::new();

    for claim in claims {
        let run = Run {
            id: claim.id.clone(),
            installation_id: inst.id.clone(),
            namespace: namespace.clone(),
            installation: name.clone(),
            bundle_reference: claim.bundle_reference.clone(),
            bundle_digest: claim.bundle.digest()?,
            bundle: claim.bundle,
            action: claim.action,
            parameters: claim
                .parameters
                .iter()
                .map(|(k, v)| {
                    let text = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    SecretStrategy::value(k.clone(), text)
                })
                .collect(),
            credential_sets: Vec::new(),
            parameter_sets: Vec::new(),
            created: claim.created,
        };
        let run = storage.insert_run(ctx, run).await?;

        let results_dir = home.root().join("results").join(&run.id);
        for path in crate::fs::list_files(&results_dir, "json")? {
            let legacy: LegacyResult = serde_json::from_slice(&std::fs::read(&path)?)?;
            let status = legacy.status.parse::<ResultStatus>().unwrap_or_else(|_| {
                warn!(result = %legacy.id, status = %legacy.status, "unknown legacy status, recording as failed");
                ResultStatus::Failed
            });
            let result = RunResult {
                id: legacy.id.clone(),
                run_id: run.id.clone(),
                namespace: namespace.clone(),
                installation: name.clone(),
                status,
                message: legacy.message,
                created: legacy.created,
                output_metadata: BTreeMap::new(),
            };
            storage.insert_result(ctx, &result).await?;
            migrate_outputs(ctx, home, storage, &run, &result).await?;
            results.entry(run.id.clone()).or_default().push(result);
        }
        runs.push(run);
    }

    inst.recompute_status(&runs, &results);
    storage.update_installation(ctx, &mut inst).await?;
    log.line(format!(
        "migrated installation {name}: {} runs, last status {}",
        runs.len(),
        inst.status
            .last_status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "none".into())
    ));
    Ok(())
}

async fn migrate_outputs(
    ctx: &Context,
    home: &Home,
    storage: &Storage,
    run: &Run,
    result: &RunResult,
) -> Result<()> {
    let dir = home.root().join("outputs").join(&result.id);
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let prefix = format!("{}-", result.id);
    for entry in entries {
        let path = entry?.path();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(output_name) = file_name.strip_prefix(&prefix) else {
            continue;
        };
        let mut output = Output::new(result, output_name, std::fs::read(&path)?);
        output.sensitive = run.bundle.is_sensitive_output(output_name);
        output.schema = run.bundle.output_schema(output_name).cloned();
        output.generated_by_bundle = run
            .bundle
            .outputs
            .get(output_name)
            .is_some_and(|o| o.generated_by_bundle);
        storage.insert_output(ctx, output).await?;
    }
    Ok(())
}
