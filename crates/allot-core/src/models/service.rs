use serde::{Deserialize, Serialize};

/// Identity of a backend service as declared by its quota plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    /// Short service type string, e.g. "compute".
    pub service_type: String,
    /// Human-readable product name, e.g. "nova". Used as a metric label.
    pub product_name: String,
}
