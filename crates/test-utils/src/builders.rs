#![allow(dead_code)]

use std::collections::BTreeMap;

use bundlectl::bundle::definition::{
    ActionDefinition, CredentialDefinition, InvocationImage, OutputDefinition,
    ParameterDefinition,
};
use bundlectl::bundle::dependencies::{
    BundleLocator, DEPENDENCIES_V2_KEY, Requires, Sharing, SharingGroup,
};
use bundlectl::bundle::{Bundle, Dependencies, Dependency, OciReferenceParts, Schema, VersionSpec};
use bundlectl::secrets::SecretStrategy;
use bundlectl::storage::documents::InstallationSpec;
use serde_json::{json, Value};

/// A digest that passes invocation-image verification.
pub fn image_digest(seed: char) -> String {
    format!("sha256:{}", seed.to_string().repeat(64))
}

/// Builder for bundle definitions used in tests.
///
/// Every bundle gets one invocation image with a valid content digest.
pub struct BundleBuilder {
    bundle: Bundle,
    dependencies: Vec<Dependency>,
}

impl BundleBuilder {
    pub fn new(name: &str, version: &str) -> Self {
        let bundle = Bundle {
            schema_version: "1.2.0".to_string(),
            name: name.to_string(),
            version: version.to_string(),
            invocation_images: vec![InvocationImage {
                image_type: "docker".to_string(),
                image: format!("example.com/{name}-installer:{version}"),
                content_digest: Some(image_digest('a')),
            }],
            ..Default::default()
        };
        Self {
            bundle,
            dependencies: Vec::new(),
        }
    }

    fn definition(mut self, name: &str, schema: Schema) -> Self {
        self.bundle.definitions.insert(name.to_string(), schema);
        self
    }

    fn typed(schema_type: &str) -> Schema {
        Schema {
            schema_type: Some(Value::String(schema_type.to_string())),
            ..Default::default()
        }
    }

    /// Optional string parameter with no default.
    pub fn with_string_param(self, name: &str) -> Self {
        self.with_param(name, Self::typed("string"), false)
    }

    pub fn with_required_param(self, name: &str) -> Self {
        self.with_param(name, Self::typed("string"), true)
    }

    pub fn with_default_param(self, name: &str, default: &str) -> Self {
        let mut schema = Self::typed("string");
        schema.default = Some(json!(default));
        self.with_param(name, schema, false)
    }

    pub fn with_integer_param(self, name: &str, default: Option<i64>) -> Self {
        let mut schema = Self::typed("integer");
        schema.default = default.map(Value::from);
        self.with_param(name, schema, false)
    }

    pub fn with_sensitive_param(self, name: &str) -> Self {
        let mut schema = Self::typed("string");
        schema.write_only = Some(true);
        self.with_param(name, schema, false)
    }

    /// Parameter applying only to the listed actions.
    pub fn with_param_for(mut self, name: &str, actions: &[&str]) -> Self {
        self = self.with_param(name, Self::typed("string"), false);
        if let Some(p) = self.bundle.parameters.get_mut(name) {
            p.apply_to = actions.iter().map(|a| a.to_string()).collect();
        }
        self
    }

    pub fn with_param(mut self, name: &str, schema: Schema, required: bool) -> Self {
        let def = format!("{name}-parameter");
        self.bundle.parameters.insert(
            name.to_string(),
            ParameterDefinition {
                definition: def.clone(),
                required,
                ..Default::default()
            },
        );
        self.definition(&def, schema)
    }

    pub fn with_credential(mut self, name: &str, required: bool) -> Self {
        self.bundle.credentials.insert(
            name.to_string(),
            CredentialDefinition {
                required,
                env: Some(name.to_uppercase()),
                ..Default::default()
            },
        );
        self
    }

    pub fn with_output(self, name: &str) -> Self {
        self.with_typed_output(name, "string", false)
    }

    pub fn with_sensitive_output(self, name: &str) -> Self {
        self.with_typed_output(name, "string", true)
    }

    pub fn with_typed_output(mut self, name: &str, schema_type: &str, sensitive: bool) -> Self {
        let def = format!("{name}-output");
        self.bundle.outputs.insert(
            name.to_string(),
            OutputDefinition {
                definition: def.clone(),
                generated_by_bundle: true,
                ..Default::default()
            },
        );
        let mut schema = Self::typed(schema_type);
        if sensitive {
            schema.write_only = Some(true);
        }
        self.definition(&def, schema)
    }

    pub fn with_action(mut self, name: &str, modifies: bool) -> Self {
        self.bundle.actions.insert(
            name.to_string(),
            ActionDefinition {
                modifies,
                ..Default::default()
            },
        );
        self
    }

    /// Declare a v2 dependency. The extension is stored as a JSON map, so
    /// `requires` order ends up sorted by name.
    pub fn with_dependency(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn with_custom(mut self, key: &str, value: Value) -> Self {
        self.bundle.custom.insert(key.to_string(), value);
        self
    }

    pub fn build(mut self) -> Bundle {
        if !self.dependencies.is_empty() {
            let deps = Dependencies {
                sequence: Vec::new(),
                requires: Requires(self.dependencies),
            };
            let value = serde_json::to_value(&deps).expect("dependencies serialise");
            self.bundle
                .custom
                .insert(DEPENDENCIES_V2_KEY.to_string(), value);
        }
        self.bundle
    }
}

/// Builder for one entry of a bundle's `requires` map.
pub struct DependencyBuilder {
    dependency: Dependency,
}

impl DependencyBuilder {
    pub fn new(name: &str, reference: &str) -> Self {
        Self {
            dependency: Dependency {
                name: name.to_string(),
                bundle: BundleLocator::Reference(reference.to_string()),
                ..Default::default()
            },
        }
    }

    pub fn with_version(mut self, range: &str) -> Self {
        self.dependency.version = Some(VersionSpec::Range(range.to_string()));
        self
    }

    pub fn with_parameter(mut self, name: &str, wiring: &str) -> Self {
        self.dependency
            .parameters
            .insert(name.to_string(), wiring.to_string());
        self
    }

    pub fn with_credential(mut self, name: &str, wiring: &str) -> Self {
        self.dependency
            .credentials
            .insert(name.to_string(), wiring.to_string());
        self
    }

    /// Expose the dependency's output `output` under `alias` on the parent.
    pub fn with_output_alias(mut self, alias: &str, output: &str) -> Self {
        self.dependency
            .outputs
            .insert(alias.to_string(), output.to_string());
        self
    }

    pub fn shared(mut self, group: &str) -> Self {
        self.dependency.sharing = Some(Sharing {
            mode: true,
            group: Some(SharingGroup {
                name: group.to_string(),
            }),
        });
        self
    }

    pub fn build(self) -> Dependency {
        self.dependency
    }
}

/// Builder for installation specs.
pub struct InstallationBuilder {
    spec: InstallationSpec,
}

impl InstallationBuilder {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            spec: InstallationSpec::new(namespace, name),
        }
    }

    /// Point at `reference`, which must carry a tag.
    pub fn with_reference(mut self, reference: &str) -> Self {
        let parsed = bundlectl::bundle::Reference::parse(reference).expect("valid reference");
        self.spec.bundle = OciReferenceParts::from_reference(&parsed);
        self
    }

    pub fn with_param(mut self, name: &str, value: &str) -> Self {
        self.spec.parameters.push(SecretStrategy::value(name, value));
        self
    }

    pub fn with_credential(mut self, name: &str, value: &str) -> Self {
        self.spec
            .credentials
            .push(SecretStrategy::value(name, value));
        self
    }

    pub fn with_parameter_set(mut self, name: &str) -> Self {
        self.spec.parameter_sets.push(name.to_string());
        self
    }

    pub fn with_credential_set(mut self, name: &str) -> Self {
        self.spec.credential_sets.push(name.to_string());
        self
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.spec.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn uninstalled(mut self) -> Self {
        self.spec.uninstalled = true;
        self
    }

    pub fn build(self) -> InstallationSpec {
        self.spec
    }
}

/// `{name: value}` parameter map for finalisation tests.
pub fn resolved(pairs: &[(&str, &str)]) -> BTreeMap<String, Option<String>> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), Some(v.to_string())))
        .collect()
}
