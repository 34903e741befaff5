use serde::Serialize;
use tracing::info;

/// A quota write that was pushed into a backend service.
///
/// One event per (project, service) application; the per-resource values
/// travel in `details` as a JSON object.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaChangeEvent {
    pub cluster_id: String,
    pub domain_name: String,
    pub project_name: String,
    pub project_uuid: String,
    pub service_type: String,
    pub details: serde_json::Value,
}

impl QuotaChangeEvent {
    pub fn new(
        cluster_id: impl Into<String>,
        domain_name: impl Into<String>,
        project_name: impl Into<String>,
        project_uuid: impl Into<String>,
        service_type: impl Into<String>,
    ) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            domain_name: domain_name.into(),
            project_name: project_name.into(),
            project_uuid: project_uuid.into(),
            service_type: service_type.into(),
            details: serde_json::Value::Null,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    /// Emit this audit event via tracing.
    pub fn emit(&self) {
        info!(
            audit.action = "set-backend-quota",
            audit.cluster_id = %self.cluster_id,
            audit.domain = %self.domain_name,
            audit.project = %self.project_name,
            audit.project_uuid = %self.project_uuid,
            audit.service_type = %self.service_type,
            audit.details = %self.details,
            "audit event"
        );
    }
}
