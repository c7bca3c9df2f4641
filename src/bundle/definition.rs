//! The parsed CNAB bundle document.
//!
//! Only the fields the lifecycle core consumes are typed. Unknown schema
//! keywords are preserved so a bundle survives a parse/serialise round trip
//! unchanged, which matters because the digest is computed over the
//! serialised form.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bundle::reference::Digest;
use crate::errors::{BundleError, Result};

pub const ACTION_INSTALL: &str = "install";
pub const ACTION_UPGRADE: &str = "upgrade";
pub const ACTION_UNINSTALL: &str = "uninstall";

/// Parameters with this prefix are injected by the tool itself and never
/// take part in change detection.
pub const INTERNAL_PARAMETER_PREFIX: &str = "porter-";

pub const OUTPUT_INVOCATION_IMAGE_LOGS: &str = "io.cnab.outputs.invocationImageLogs";
pub const OUTPUT_STATE: &str = "porter-state";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub schema_version: String,
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub invocation_images: Vec<InvocationImage>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub images: BTreeMap<String, Image>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub actions: BTreeMap<String, ActionDefinition>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, ParameterDefinition>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub credentials: BTreeMap<String, CredentialDefinition>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, OutputDefinition>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub definitions: BTreeMap<String, Schema>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_extensions: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationImage {
    #[serde(default = "default_image_type")]
    pub image_type: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_digest: Option<String>,
}

fn default_image_type() -> String {
    "docker".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    #[serde(default = "default_image_type")]
    pub image_type: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionDefinition {
    #[serde(default)]
    pub modifies: bool,
    #[serde(default)]
    pub stateless: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterDefinition {
    pub definition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<Location>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub apply_to: Vec<String>,
}

impl ParameterDefinition {
    pub fn applies_to(&self, action: &str) -> bool {
        applies_to(&self.apply_to, action)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub apply_to: Vec<String>,
}

impl CredentialDefinition {
    pub fn applies_to(&self, action: &str) -> bool {
        applies_to(&self.apply_to, action)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputDefinition {
    pub definition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub apply_to: Vec<String>,
    #[serde(default = "default_true")]
    pub generated_by_bundle: bool,
}

impl OutputDefinition {
    pub fn applies_to(&self, action: &str) -> bool {
        applies_to(&self.apply_to, action)
    }
}

fn default_true() -> bool {
    true
}

fn applies_to(filter: &[String], action: &str) -> bool {
    filter.is_empty() || filter.iter().any(|a| a == action)
}

/// The subset of JSON schema a bundle definition uses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub schema_type: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_encoding: Option<String>,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Primitive parameter types the executor coerces values into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
    File,
}

impl ParameterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParameterType::String => "string",
            ParameterType::Integer => "integer",
            ParameterType::Number => "number",
            ParameterType::Boolean => "boolean",
            ParameterType::Object => "object",
            ParameterType::Array => "array",
            ParameterType::File => "file",
        }
    }
}

impl Schema {
    /// First declared type; a missing type is treated as a string.
    pub fn parameter_type(&self) -> Result<ParameterType> {
        let name = match &self.schema_type {
            None => return Ok(ParameterType::String),
            Some(Value::String(s)) => s.as_str(),
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .find(|t| *t != "null")
                .unwrap_or("string"),
            Some(other) => {
                return Err(BundleError::invalid_manifest(format!(
                    "unsupported schema type {other}"
                )));
            }
        };
        match name {
            "string" => {
                if self.content_encoding.as_deref() == Some("base64") {
                    Ok(ParameterType::File)
                } else {
                    Ok(ParameterType::String)
                }
            }
            "integer" | "int" => Ok(ParameterType::Integer),
            "number" => Ok(ParameterType::Number),
            "boolean" | "bool" => Ok(ParameterType::Boolean),
            "object" => Ok(ParameterType::Object),
            "array" => Ok(ParameterType::Array),
            "file" => Ok(ParameterType::File),
            other => Err(BundleError::invalid_manifest(format!(
                "unsupported schema type {other:?}"
            ))),
        }
    }

    pub fn is_sensitive(&self) -> bool {
        self.write_only.unwrap_or(false)
    }

    /// Coerce a raw string into a JSON value of this schema's type.
    pub fn convert_value(&self, raw: &str) -> Result<Value> {
        let invalid = |expected: &str| {
            BundleError::invalid_manifest(format!("value {raw:?} is not a valid {expected}"))
        };
        match self.parameter_type()? {
            ParameterType::String | ParameterType::File => Ok(Value::String(raw.to_string())),
            ParameterType::Integer => raw
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| invalid("integer")),
            ParameterType::Number => raw
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| invalid("number")),
            ParameterType::Boolean => match raw.trim() {
                "true" | "TRUE" | "True" | "1" => Ok(Value::Bool(true)),
                "false" | "FALSE" | "False" | "0" => Ok(Value::Bool(false)),
                _ => Err(invalid("boolean")),
            },
            ParameterType::Object => match serde_json::from_str::<Value>(raw)? {
                v @ Value::Object(_) => Ok(v),
                _ => Err(invalid("object")),
            },
            ParameterType::Array => match serde_json::from_str::<Value>(raw)? {
                v @ Value::Array(_) => Ok(v),
                _ => Err(invalid("array")),
            },
        }
    }

    /// Canonical string form of a typed value. Strings are written bare,
    /// everything else as compact JSON, so `"1"` and `1` for an integer
    /// parameter produce the same text.
    pub fn write_value(&self, value: &Value) -> Result<String> {
        match value {
            Value::String(s) => match self.parameter_type()? {
                ParameterType::String | ParameterType::File => Ok(s.clone()),
                _ => {
                    let typed = self.convert_value(s)?;
                    self.write_value(&typed)
                }
            },
            Value::Null => Ok(String::new()),
            other => Ok(serde_json::to_string(other)?),
        }
    }
}

impl Bundle {
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let bundle: Bundle = serde_json::from_slice(bytes)?;
        bundle.validate()?;
        Ok(bundle)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Minimal structural checks on a parsed bundle.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(BundleError::invalid_manifest("bundle name is required"));
        }
        if self.invocation_images.is_empty() {
            return Err(BundleError::invalid_manifest(format!(
                "bundle {} declares no invocation images",
                self.name
            )));
        }
        for (name, param) in &self.parameters {
            if !self.definitions.contains_key(&param.definition) {
                return Err(BundleError::invalid_manifest(format!(
                    "parameter {name} references undefined definition {}",
                    param.definition
                )));
            }
        }
        for (name, output) in &self.outputs {
            if !self.definitions.contains_key(&output.definition) {
                return Err(BundleError::invalid_manifest(format!(
                    "output {name} references undefined definition {}",
                    output.definition
                )));
            }
        }
        Ok(())
    }

    /// Content digest over the canonical (key-sorted) JSON encoding.
    pub fn digest(&self) -> Result<Digest> {
        // Going through `Value` sorts object keys, including flattened ones.
        let canonical = serde_json::to_vec(&serde_json::to_value(self)?)?;
        Ok(Digest::sha256(&canonical))
    }

    pub fn parameter_schema(&self, name: &str) -> Option<&Schema> {
        self.parameters
            .get(name)
            .and_then(|p| self.definitions.get(&p.definition))
    }

    pub fn output_schema(&self, name: &str) -> Option<&Schema> {
        self.outputs
            .get(name)
            .and_then(|o| self.definitions.get(&o.definition))
    }

    pub fn is_sensitive_parameter(&self, name: &str) -> bool {
        self.parameter_schema(name).is_some_and(Schema::is_sensitive)
    }

    pub fn is_sensitive_output(&self, name: &str) -> bool {
        self.output_schema(name).is_some_and(Schema::is_sensitive)
    }

    /// Whether running `action` changes the installation's state.
    pub fn action_modifies(&self, action: &str) -> Result<bool> {
        match action {
            ACTION_INSTALL | ACTION_UPGRADE | ACTION_UNINSTALL => Ok(true),
            custom => self
                .actions
                .get(custom)
                .map(|a| a.modifies)
                .ok_or_else(|| {
                    BundleError::invalid_manifest(format!(
                        "bundle {} does not define action {custom:?}",
                        self.name
                    ))
                }),
        }
    }

    /// Convert a raw parameter value using its declared schema.
    pub fn convert_parameter_value(&self, name: &str, raw: &str) -> Result<Value> {
        match self.parameter_schema(name) {
            Some(schema) => schema.convert_value(raw),
            None => Ok(Value::String(raw.to_string())),
        }
    }

    /// Canonical string form of a parameter value, used for fingerprints.
    pub fn write_parameter_to_string(&self, name: &str, value: &Value) -> Result<String> {
        match self.parameter_schema(name) {
            Some(schema) => schema.write_value(value),
            None => match value {
                Value::String(s) => Ok(s.clone()),
                other => Ok(serde_json::to_string(other)?),
            },
        }
    }
}

pub fn is_internal_parameter(name: &str) -> bool {
    name.starts_with(INTERNAL_PARAMETER_PREFIX)
}

pub fn is_built_in_action(action: &str) -> bool {
    matches!(action, ACTION_INSTALL | ACTION_UPGRADE | ACTION_UNINSTALL)
}
