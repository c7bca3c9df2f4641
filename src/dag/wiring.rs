//! Parser for the values a dependency declares for its parameters and
//! credentials.
//!
//! The grammar is deliberately narrow. Only these forms are recognised:
//!
//! - `${bundle.dependencies.<DEP>.outputs.<OUT>}` (induces a graph edge)
//! - `bundle.parameters.<NAME>` / `${bundle.parameters.<NAME>}`
//! - `bundle.credentials.<NAME>` / `${bundle.credentials.<NAME>}`
//!
//! Anything else is a literal.

use std::fmt;

use crate::errors::Result;
use crate::patterns;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Wiring {
    Literal(String),
    /// Pass a root parameter straight through.
    RootParameter(String),
    /// Pass a root credential straight through.
    RootCredential(String),
    /// Another dependency's output.
    DependencyOutput { dependency: String, output: String },
}

impl Wiring {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();

        if let Some(caps) = patterns::get(&patterns::DEPENDENCY_OUTPUT)?.captures(trimmed) {
            return Ok(Wiring::DependencyOutput {
                dependency: caps[1].to_string(),
                output: caps[2].to_string(),
            });
        }

        if let Some(caps) = patterns::get(&patterns::ROOT_VALUE)?.captures(trimmed) {
            let name = caps[2].to_string();
            return Ok(match &caps[1] {
                "parameters" => Wiring::RootParameter(name),
                _ => Wiring::RootCredential(name),
            });
        }

        Ok(Wiring::Literal(raw.to_string()))
    }

    /// The dependency this wiring reads an output from, if any.
    pub fn output_source(&self) -> Option<(&str, &str)> {
        match self {
            Wiring::DependencyOutput { dependency, output } => Some((dependency, output)),
            _ => None,
        }
    }
}

impl fmt::Display for Wiring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Wiring::Literal(v) => f.write_str(v),
            Wiring::RootParameter(n) => write!(f, "bundle.parameters.{n}"),
            Wiring::RootCredential(n) => write!(f, "bundle.credentials.{n}"),
            Wiring::DependencyOutput { dependency, output } => {
                write!(f, "${{bundle.dependencies.{dependency}.outputs.{output}}}")
            }
        }
    }
}
