use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::units::Unit;

/// Static metadata of one resource, as declared by its quota plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub name: String,
    #[serde(default)]
    pub unit: Unit,
    /// The backend does not support quotas for this resource; only usage is
    /// tracked and all quota columns stay NULL.
    #[serde(default)]
    pub no_quota: bool,
    /// When the backend reports exactly this quota on a project that has no
    /// stored quota yet, the scrape adopts it as the initial stored quota.
    #[serde(default)]
    pub auto_approve_initial_quota: Option<u64>,
    /// Quota is written by a third party; recorded but never pushed.
    #[serde(default)]
    pub externally_managed: bool,
}

impl ResourceInfo {
    pub fn new(name: impl Into<String>) -> Self {
        ResourceInfo {
            name: name.into(),
            unit: Unit::None,
            no_quota: false,
            auto_approve_initial_quota: None,
            externally_managed: false,
        }
    }
}

/// Usage and backend quota of one resource in one project, as scraped from
/// the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceData {
    /// Quota currently enforced in the backend. May be negative (backends
    /// use -1 for "infinite").
    pub quota: i64,
    pub usage: u64,
    #[serde(default)]
    pub physical_usage: Option<u64>,
    #[serde(default)]
    pub subresources: Vec<serde_json::Value>,
}

/// Result of one quota-plugin scrape: per-resource data plus the opaque
/// metrics blob the plugin wants persisted alongside.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScrapeData {
    pub resources: BTreeMap<String, ResourceData>,
    #[serde(default)]
    pub serialized_metrics: String,
}
