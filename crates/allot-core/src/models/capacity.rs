use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Capacity of one resource in one availability zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AzCapacity {
    pub capacity: u64,
    #[serde(default)]
    pub usage: Option<u64>,
}

/// Cluster-wide capacity of one resource as reported by a capacity plugin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapacityValue {
    pub capacity: u64,
    #[serde(default)]
    pub capacity_per_az: Option<BTreeMap<String, AzCapacity>>,
    #[serde(default)]
    pub subcapacities: Vec<serde_json::Value>,
}

impl CapacityValue {
    pub fn flat(capacity: u64) -> Self {
        CapacityValue {
            capacity,
            capacity_per_az: None,
            subcapacities: Vec::new(),
        }
    }
}

/// Result of one capacity-plugin scrape: service type → resource name →
/// capacity. Keys are BTreeMaps so iteration order is deterministic.
pub type CapacityData = BTreeMap<String, BTreeMap<String, CapacityValue>>;
