use serde::{Deserialize, Serialize};

/// A domain as reported by the identity source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeystoneDomain {
    pub uuid: String,
    pub name: String,
}

/// A project as reported by the identity source.
///
/// `parent_uuid` is the UUID of the parent project, or the domain UUID for
/// top-level projects (identity sources that do not nest projects report an
/// empty string).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeystoneProject {
    pub uuid: String,
    pub name: String,
    #[serde(default)]
    pub parent_uuid: String,
}
