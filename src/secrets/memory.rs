use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::context::Context;
use crate::errors::{BundleError, Result};
use crate::secrets::SecretStore;

/// Process-local secret store, used by tests and the `memory` plugin key.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    values: Mutex<BTreeMap<(String, String), String>>,
}

impl MemorySecretStore {
    pub fn len(&self) -> usize {
        self.values.lock().map(|v| v.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key_name: &str, key_value: &str) -> bool {
        self.values
            .lock()
            .map(|v| v.contains_key(&(key_name.to_string(), key_value.to_string())))
            .unwrap_or(false)
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn resolve(&self, _ctx: &Context, key_name: &str, key_value: &str) -> Result<String> {
        let values = self
            .values
            .lock()
            .map_err(|_| BundleError::InvariantViolated("secret store lock poisoned".into()))?;
        values
            .get(&(key_name.to_string(), key_value.to_string()))
            .cloned()
            .ok_or_else(|| BundleError::not_found(format!("secret {key_name}:{key_value}")))
    }

    async fn create(
        &self,
        _ctx: &Context,
        key_name: &str,
        key_value: &str,
        value: &str,
    ) -> Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| BundleError::InvariantViolated("secret store lock poisoned".into()))?;
        values.insert((key_name.to_string(), key_value.to_string()), value.to_string());
        Ok(())
    }
}
