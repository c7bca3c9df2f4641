//! Dependency graph of a bundle.
//!
//! - [`wiring`] parses the values a dependency declares for its inputs.
//! - [`graph`] builds the output-wiring graph, sorts it and finds cycles.
//! - [`validate`] checks wiring against the resolved dependency bundles.

pub mod graph;
pub mod validate;
pub mod wiring;

pub use graph::{DependencyGraph, DependencyNode};
pub use validate::validate_wiring;
pub use wiring::Wiring;
