//! Value-source strategies: where a parameter or credential value comes from.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const SOURCE_VALUE: &str = "value";
pub const SOURCE_ENV: &str = "env";
pub const SOURCE_PATH: &str = "path";
pub const SOURCE_COMMAND: &str = "command";
pub const SOURCE_SECRET: &str = "secret";
/// In-process workflow wiring, see `secrets::resolver`.
pub const SOURCE_PORTER: &str = "porter";

pub const SOURCE_KEYS: &[&str] = &[
    SOURCE_VALUE,
    SOURCE_ENV,
    SOURCE_PATH,
    SOURCE_COMMAND,
    SOURCE_SECRET,
    SOURCE_PORTER,
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Source {
    pub key: String,
    pub value: String,
}

impl Source {
    pub fn new(key: &str, value: impl Into<String>) -> Self {
        Self {
            key: key.to_string(),
            value: value.into(),
        }
    }

    pub fn is_known_key(&self) -> bool {
        SOURCE_KEYS.contains(&self.key.as_str())
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Literal values may be sensitive; only show where the value lives.
        if self.key == SOURCE_VALUE {
            write!(f, "{}:<literal>", self.key)
        } else {
            write!(f, "{}:{}", self.key, self.value)
        }
    }
}

/// A named value plus the source it is fetched from.
///
/// `resolved_value` is filled in by the resolver and never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretStrategy {
    pub name: String,
    pub source: Source,
    #[serde(skip)]
    pub resolved_value: Option<String>,
}

impl SecretStrategy {
    pub fn new(name: impl Into<String>, source: Source) -> Self {
        Self {
            name: name.into(),
            source,
            resolved_value: None,
        }
    }

    pub fn value(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(name, Source::new(SOURCE_VALUE, value))
    }
}

/// Find a strategy by name, the last entry winning on duplicates.
pub fn find<'a>(strategies: &'a [SecretStrategy], name: &str) -> Option<&'a SecretStrategy> {
    strategies.iter().rev().find(|s| s.name == name)
}
