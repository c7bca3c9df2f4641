//! Moves sensitive values out of storage documents and into the secret
//! store, leaving a handle behind.
//!
//! Parameters live under `<run id>-param-<name>` and outputs under
//! `<result id>-output-<name>`, so a parameter and an output sharing a name
//! never collide. Output bytes are stored base64-encoded because secret
//! stores only hold text.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use tracing::debug;

use crate::bundle::definition::Bundle;
use crate::context::Context;
use crate::errors::{BundleError, Result};
use crate::secrets::SecretStore;
use crate::secrets::strategy::{SOURCE_SECRET, SOURCE_VALUE, SecretStrategy, Source};
use crate::storage::documents::Output;

pub fn parameter_handle(run_id: &str, name: &str) -> String {
    format!("{run_id}-param-{name}")
}

pub fn output_handle(result_id: &str, name: &str) -> String {
    format!("{result_id}-output-{name}")
}

#[derive(Clone)]
pub struct Sanitizer {
    secrets: Arc<dyn SecretStore>,
}

impl std::fmt::Debug for Sanitizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sanitizer").finish_non_exhaustive()
    }
}

impl Sanitizer {
    pub fn new(secrets: Arc<dyn SecretStore>) -> Self {
        Self { secrets }
    }

    pub fn secret_store(&self) -> &Arc<dyn SecretStore> {
        &self.secrets
    }

    /// Replace sensitive literal parameter values with secret handles.
    pub async fn clean_parameters(
        &self,
        ctx: &Context,
        run_id: &str,
        bundle: &Bundle,
        params: Vec<SecretStrategy>,
    ) -> Result<Vec<SecretStrategy>> {
        let mut cleaned = Vec::with_capacity(params.len());
        for mut param in params {
            if bundle.is_sensitive_parameter(&param.name) && param.source.key == SOURCE_VALUE {
                let handle = parameter_handle(run_id, &param.name);
                self.secrets
                    .create(ctx, SOURCE_SECRET, &handle, &param.source.value)
                    .await?;
                debug!(parameter = %param.name, handle = %handle, "sanitised sensitive parameter");
                param.source = Source::new(SOURCE_SECRET, handle);
                param.resolved_value = None;
            }
            cleaned.push(param);
        }
        Ok(cleaned)
    }

    /// Turn secret handles back into literal values.
    pub async fn restore_parameters(
        &self,
        ctx: &Context,
        params: &[SecretStrategy],
    ) -> Result<Vec<SecretStrategy>> {
        let mut restored = Vec::with_capacity(params.len());
        for param in params {
            let mut param = param.clone();
            if param.source.key == SOURCE_SECRET {
                let value = self
                    .secrets
                    .resolve(ctx, SOURCE_SECRET, &param.source.value)
                    .await?;
                param.source = Source::new(SOURCE_VALUE, value);
            }
            restored.push(param);
        }
        Ok(restored)
    }

    /// Move a sensitive output's value into the secret store.
    pub async fn clean_output(&self, ctx: &Context, mut output: Output) -> Result<Output> {
        if !output.sensitive || output.value.is_empty() {
            return Ok(output);
        }
        let handle = output_handle(&output.result_id, &output.name);
        let encoded = STANDARD.encode(&output.value);
        self.secrets.create(ctx, SOURCE_SECRET, &handle, &encoded).await?;
        debug!(output = %output.name, handle = %handle, "sanitised sensitive output");
        output.key = handle;
        output.value.clear();
        Ok(output)
    }

    /// Fetch a sensitive output's value back from the secret store.
    pub async fn restore_output(&self, ctx: &Context, mut output: Output) -> Result<Output> {
        if output.key.is_empty() {
            return Ok(output);
        }
        let encoded = self.secrets.resolve(ctx, SOURCE_SECRET, &output.key).await?;
        output.value = STANDARD.decode(encoded.trim()).map_err(|e| {
            BundleError::IntegrityError(format!(
                "secret {} for output {} is not valid base64: {e}",
                output.key, output.name
            ))
        })?;
        output.key.clear();
        Ok(output)
    }
}
