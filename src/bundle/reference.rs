//! OCI references and content digests.
//!
//! Syntax: `[REGISTRY/]NAME[:TAG][@sha256:HEX]`. `NAME` may contain `/`.
//! When no registry is given the reference is canonicalised onto
//! `docker.io`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::errors::{BundleError, Result};
use crate::patterns;

pub const DEFAULT_REGISTRY: &str = "docker.io";

/// A content digest such as `sha256:4f1c...`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if !patterns::get(&patterns::DIGEST)?.is_match(s) {
            return Err(BundleError::invalid_reference(format!("invalid digest {s:?}")));
        }
        Ok(Digest(s.to_ascii_lowercase()))
    }

    /// SHA-256 digest of raw bytes.
    pub fn sha256(bytes: &[u8]) -> Self {
        let sum = Sha256::digest(bytes);
        Digest(format!("sha256:{}", hex::encode(sum)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn algorithm(&self) -> &str {
        self.0.split_once(':').map(|(a, _)| a).unwrap_or_default()
    }

    pub fn hex(&self) -> &str {
        self.0.split_once(':').map(|(_, h)| h).unwrap_or_default()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Digest {
    type Error = BundleError;

    fn try_from(value: String) -> Result<Self> {
        Digest::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> Self {
        d.0
    }
}

/// A canonicalised OCI reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Reference {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<Digest>,
}

impl Reference {
    pub fn parse(input: &str) -> Result<Self> {
        let raw = input.trim();
        if raw.is_empty() {
            return Err(BundleError::invalid_reference("empty reference"));
        }

        let (rest, digest) = match raw.split_once('@') {
            Some((rest, d)) => (rest, Some(Digest::parse(d)?)),
            None => (raw, None),
        };

        // A tag is whatever follows the last ':' after the last '/', so that
        // a registry port (`localhost:5000/x`) is not mistaken for a tag.
        let last_slash = rest.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match rest[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&rest[..split], Some(rest[split + 1..].to_string()))
            }
            None => (rest, None),
        };

        if let Some(t) = &tag {
            if !patterns::get(&patterns::TAG)?.is_match(t) {
                return Err(BundleError::invalid_reference(format!(
                    "invalid tag {t:?} in reference {raw:?}"
                )));
            }
        }

        let (registry, repository) = match name.split_once('/') {
            Some((first, remainder))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), remainder.to_string())
            }
            _ => (DEFAULT_REGISTRY.to_string(), name.to_string()),
        };

        if repository.is_empty() {
            return Err(BundleError::invalid_reference(format!(
                "missing repository in reference {raw:?}"
            )));
        }
        let component_re = patterns::get(&patterns::REPOSITORY_COMPONENT)?;
        for component in repository.split('/') {
            if !component_re.is_match(component) {
                return Err(BundleError::invalid_reference(format!(
                    "invalid repository component {component:?} in reference {raw:?}"
                )));
            }
        }

        Ok(Reference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Repository path without registry, e.g. `getporter/mysql`.
    pub fn path(&self) -> &str {
        &self.repository
    }

    /// Registry-qualified repository, e.g. `docker.io/getporter/mysql`.
    pub fn repository(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&Digest> {
        self.digest.as_ref()
    }

    pub fn with_tag(&self, tag: impl Into<String>) -> Self {
        Reference {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: Some(tag.into()),
            digest: None,
        }
    }

    pub fn with_digest(&self, digest: Digest) -> Self {
        Reference {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: self.tag.clone(),
            digest: Some(digest),
        }
    }

    /// The tag, with a leading `v` stripped, parsed as a semantic version.
    pub fn version(&self) -> Option<semver::Version> {
        let tag = self.tag.as_deref()?;
        semver::Version::parse(tag.strip_prefix('v').unwrap_or(tag)).ok()
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

impl FromStr for Reference {
    type Err = BundleError;

    fn from_str(s: &str) -> Result<Self> {
        Reference::parse(s)
    }
}

impl TryFrom<String> for Reference {
    type Error = BundleError;

    fn try_from(value: String) -> Result<Self> {
        Reference::parse(&value)
    }
}

impl From<Reference> for String {
    fn from(r: Reference) -> Self {
        r.to_string()
    }
}

/// The bundle locator stored on an installation: repository plus one of
/// digest, tag or version (tried in that order).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciReferenceParts {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repository: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub digest: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tag: String,
}

impl OciReferenceParts {
    pub fn is_empty(&self) -> bool {
        self.repository.is_empty()
    }

    pub fn to_reference(&self) -> Result<Reference> {
        if self.repository.is_empty() {
            return Err(BundleError::invalid_reference(
                "bundle repository is not set",
            ));
        }
        let base = Reference::parse(&self.repository)?;
        if !self.digest.is_empty() {
            return Ok(base.with_digest(Digest::parse(&self.digest)?));
        }
        if !self.tag.is_empty() {
            return Ok(base.with_tag(self.tag.clone()));
        }
        if !self.version.is_empty() {
            let v = self.version.trim_start_matches('v');
            return Ok(base.with_tag(format!("v{v}")));
        }
        Err(BundleError::invalid_reference(format!(
            "bundle {} has no digest, tag or version",
            self.repository
        )))
    }

    pub fn from_reference(r: &Reference) -> Self {
        let mut parts = OciReferenceParts {
            repository: r.repository(),
            ..Default::default()
        };
        if let Some(tag) = r.tag() {
            parts.tag = tag.to_string();
            if let Some(v) = r.version() {
                parts.version = v.to_string();
            }
        }
        if let Some(d) = r.digest() {
            parts.digest = d.to_string();
        }
        parts
    }
}
