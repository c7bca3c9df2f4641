//! Bundle data model: references, the CNAB document and its dependency
//! extension.

pub mod definition;
pub mod dependencies;
pub mod reference;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use definition::{
    ACTION_INSTALL, ACTION_UNINSTALL, ACTION_UPGRADE, Bundle, ParameterType, Schema,
};
pub use dependencies::{Dependencies, Dependency, VersionSpec};
pub use reference::{Digest, OciReferenceParts, Reference};

/// Original image reference -> relocated image reference.
pub type RelocationMap = BTreeMap<String, String>;

/// A resolved bundle: where it came from, what it is, and where its images
/// live now.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleReference {
    pub reference: Reference,
    pub digest: Digest,
    pub definition: Bundle,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub relocation_map: RelocationMap,
}
