use std::collections::BTreeMap;

use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;

use allot_store::Store;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct ProjectReport {
    pub name: String,
    pub uuid: String,
    pub domain_name: String,
    pub domain_uuid: String,
    /// service type → resource name → values
    pub services: BTreeMap<String, BTreeMap<String, ProjectResourceReport>>,
}

#[derive(Debug, Serialize)]
pub struct ProjectResourceReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<u64>,
    pub usage: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub physical_usage: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_quota: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired_backend_quota: Option<i64>,
}

pub async fn get_project(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Result<Json<ProjectReport>, ApiError> {
    let Some((domain, project)) = state
        .store
        .project_by_uuid(&state.cluster_id, &uuid)
        .await?
    else {
        return Err(ApiError::NotFound(format!("project {uuid}")));
    };

    let mut services: BTreeMap<String, BTreeMap<String, ProjectResourceReport>> = BTreeMap::new();
    for row in state.store.project_report(&state.cluster_id).await? {
        if row.project_uuid != uuid {
            continue;
        }
        services.entry(row.service_type).or_default().insert(
            row.resource_name,
            ProjectResourceReport {
                quota: row.quota,
                usage: row.usage,
                physical_usage: row.physical_usage,
                backend_quota: row.backend_quota,
                desired_backend_quota: row.desired_backend_quota,
            },
        );
    }

    Ok(Json(ProjectReport {
        name: project.name,
        uuid: project.uuid,
        domain_name: domain.name,
        domain_uuid: domain.uuid,
        services,
    }))
}
