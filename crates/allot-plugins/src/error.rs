use thiserror::Error;

#[derive(Debug, Error)]
pub enum PluginError {
    /// The backend service is not present in the service catalog. Workers
    /// treat this as "service not deployed" and suspend for a long interval
    /// instead of retrying at the normal cadence.
    #[error("endpoint not found in service catalog: {0}")]
    EndpointNotFound(String),

    /// Any transient backend failure; retried via the normal staleness
    /// machinery.
    #[error("backend error: {0}")]
    Backend(String),

    #[error("unknown {kind} plugin: {name:?}")]
    UnknownPlugin { kind: &'static str, name: String },

    #[error("invalid plugin parameters: {0}")]
    InvalidParams(#[from] serde_json::Error),
}

impl PluginError {
    pub fn is_endpoint_not_found(&self) -> bool {
        matches!(self, PluginError::EndpointNotFound(_))
    }
}
