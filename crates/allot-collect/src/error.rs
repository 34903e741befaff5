use thiserror::Error;

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("store error: {0}")]
    Store(#[from] allot_store::StoreError),

    #[error("plugin error: {0}")]
    Plugin(#[from] allot_plugins::PluginError),

    #[error("configuration error: {0}")]
    Config(#[from] allot_core::error::CoreError),

    #[error("no quota plugin registered for service type {0:?}")]
    MissingPlugin(String),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
