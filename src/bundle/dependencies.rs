//! The dependency extension stored in a bundle's `custom` section.
//!
//! Two shapes are accepted:
//! - v1 (`io.cnab.dependencies`): `requires` map plus optional `sequence`;
//! - v2 (`org.getporter.dependencies@v2`): the same `requires` map with
//!   parameter/credential wiring, output aliases and sharing.
//!
//! `requires` keeps the order it was deserialised in, and the dependency
//! graph breaks topological ties by that order. The extension is read out of
//! the bundle's `custom` JSON, whose object keys are sorted, so for a parsed
//! bundle the order is lexical by dependency name unless a v1 `sequence`
//! reorders it.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::bundle::definition::Bundle;
use crate::bundle::reference::Reference;
use crate::errors::{BundleError, Result};
use crate::patterns;

pub const DEPENDENCIES_V1_KEY: &str = "io.cnab.dependencies";
pub const DEPENDENCIES_V2_KEY: &str = "org.getporter.dependencies@v2";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dependencies {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sequence: Vec<String>,
    #[serde(default)]
    pub requires: Requires,
}

/// Dependencies in the order they were read (lexical for parsed bundles).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Requires(pub Vec<Dependency>);

impl Requires {
    pub fn iter(&self) -> impl Iterator<Item = &Dependency> {
        self.0.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Dependency> {
        self.0.iter().find(|d| d.name == name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    /// Key in the `requires` map; filled in while deserialising.
    #[serde(skip)]
    pub name: String,
    pub bundle: BundleLocator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<VersionSpec>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub credentials: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sharing: Option<Sharing>,
}

/// Either a bare reference string (v1) or `{reference, version}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BundleLocator {
    Reference(String),
    Detailed {
        reference: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<VersionSpec>,
    },
}

impl Default for BundleLocator {
    fn default() -> Self {
        BundleLocator::Reference(String::new())
    }
}

/// A semver constraint: a single range string or `{ranges, allowPrereleases}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VersionSpec {
    Range(String),
    Ranges {
        #[serde(default)]
        ranges: Vec<String>,
        #[serde(rename = "allowPrereleases", default)]
        allow_prereleases: bool,
    },
}

impl VersionSpec {
    pub fn ranges(&self) -> Vec<&str> {
        match self {
            VersionSpec::Range(r) => vec![r.as_str()],
            VersionSpec::Ranges { ranges, .. } => ranges.iter().map(String::as_str).collect(),
        }
    }

    pub fn allow_prereleases(&self) -> bool {
        matches!(self, VersionSpec::Ranges { allow_prereleases: true, .. })
    }

    /// Whether `version` satisfies any of the ranges. An empty range list
    /// matches everything.
    pub fn matches(&self, version: &semver::Version) -> Result<bool> {
        let ranges = self.ranges();
        if ranges.is_empty() {
            return Ok(version.pre.is_empty() || self.allow_prereleases());
        }
        let candidate = if self.allow_prereleases() && !version.pre.is_empty() {
            semver::Version::new(version.major, version.minor, version.patch)
        } else {
            version.clone()
        };
        for range in ranges {
            let req = semver::VersionReq::parse(range).map_err(|e| {
                BundleError::invalid_manifest(format!("invalid version range {range:?}: {e}"))
            })?;
            if req.matches(&candidate) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sharing {
    #[serde(default)]
    pub mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<SharingGroup>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharingGroup {
    pub name: String,
}

impl Dependency {
    pub fn reference_str(&self) -> &str {
        match &self.bundle {
            BundleLocator::Reference(r) => r,
            BundleLocator::Detailed { reference, .. } => reference,
        }
    }

    pub fn reference(&self) -> Result<Reference> {
        Reference::parse(self.reference_str()).map_err(|e| {
            BundleError::invalid_manifest(format!("dependency {}: {e}", self.name))
        })
    }

    /// Effective version constraint, preferring the one inside `bundle`.
    pub fn version_spec(&self) -> Option<&VersionSpec> {
        match &self.bundle {
            BundleLocator::Detailed {
                version: Some(v), ..
            } => Some(v),
            _ => self.version.as_ref(),
        }
    }

    /// Sharing group name when sharing is enabled.
    pub fn sharing_group(&self) -> Option<&str> {
        let sharing = self.sharing.as_ref()?;
        if !sharing.mode {
            return None;
        }
        sharing
            .group
            .as_ref()
            .map(|g| g.name.as_str())
            .filter(|n| !n.is_empty())
    }
}

impl Dependencies {
    /// Read the dependency extension from a bundle, v2 taking precedence.
    pub fn from_bundle(bundle: &Bundle) -> Result<Option<Dependencies>> {
        let raw = bundle
            .custom
            .get(DEPENDENCIES_V2_KEY)
            .or_else(|| bundle.custom.get(DEPENDENCIES_V1_KEY));
        let Some(raw) = raw else {
            return Ok(None);
        };
        let mut deps: Dependencies = serde_json::from_value(raw.clone()).map_err(|e| {
            BundleError::invalid_manifest(format!(
                "bundle {} has an invalid dependencies extension: {e}",
                bundle.name
            ))
        })?;
        deps.apply_sequence()?;
        deps.validate_names()?;
        Ok(Some(deps))
    }

    /// Reorder `requires` by the v1 `sequence`, leaving unlisted entries in
    /// their existing order after the sequenced ones.
    fn apply_sequence(&mut self) -> Result<()> {
        if self.sequence.is_empty() {
            return Ok(());
        }
        let mut remaining = std::mem::take(&mut self.requires.0);
        let mut ordered = Vec::with_capacity(remaining.len());
        for name in &self.sequence {
            let pos = remaining.iter().position(|d| &d.name == name).ok_or_else(|| {
                BundleError::invalid_manifest(format!(
                    "dependency sequence names unknown dependency {name:?}"
                ))
            })?;
            ordered.push(remaining.remove(pos));
        }
        ordered.extend(remaining);
        self.requires.0 = ordered;
        Ok(())
    }

    fn validate_names(&self) -> Result<()> {
        let name_re = patterns::get(&patterns::USER_NAME)?;
        let mut seen = HashSet::new();
        for dep in self.requires.iter() {
            if !name_re.is_match(&dep.name) || dep.name.contains('.') {
                return Err(BundleError::invalid_manifest(format!(
                    "invalid dependency name {:?}",
                    dep.name
                )));
            }
            if !seen.insert(dep.name.as_str()) {
                return Err(BundleError::invalid_manifest(format!(
                    "dependency {:?} is declared more than once",
                    dep.name
                )));
            }
            if dep.reference_str().trim().is_empty() {
                return Err(BundleError::invalid_manifest(format!(
                    "dependency {} has no bundle reference",
                    dep.name
                )));
            }
        }
        Ok(())
    }
}

impl Serialize for Requires {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for dep in &self.0 {
            map.serialize_entry(&dep.name, dep)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Requires {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct RequiresVisitor;

        impl<'de> Visitor<'de> for RequiresVisitor {
            type Value = Requires;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of dependency name to dependency")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut access: A,
            ) -> std::result::Result<Requires, A::Error> {
                let mut deps = Vec::new();
                while let Some((name, mut dep)) = access.next_entry::<String, Dependency>()? {
                    dep.name = name;
                    deps.push(dep);
                }
                Ok(Requires(deps))
            }
        }

        deserializer.deserialize_map(RequiresVisitor)
    }
}
