use std::collections::BTreeMap;

use axum::extract::State;
use axum::Json;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use allot_store::Store;

use crate::error::ApiError;
use crate::state::AppState;

fn format_timestamp(at: Option<DateTime<Utc>>) -> Option<String> {
    at.map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
}

#[derive(Debug, Serialize)]
pub struct ClusterReport {
    pub cluster_id: String,
    pub services: BTreeMap<String, ServiceCapacity>,
}

#[derive(Debug, Default, Serialize)]
pub struct ServiceCapacity {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scraped_at: Option<String>,
    pub resources: BTreeMap<String, ResourceCapacity>,
}

#[derive(Debug, Serialize)]
pub struct ResourceCapacity {
    pub capacity: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity_per_az: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub comment: String,
}

pub async fn get_cluster(
    State(state): State<AppState>,
) -> Result<Json<ClusterReport>, ApiError> {
    let rows = state.store.capacity_report(&state.cluster_id).await?;
    let mut services: BTreeMap<String, ServiceCapacity> = BTreeMap::new();
    for row in rows {
        let service = services.entry(row.service_type.clone()).or_default();
        service.scraped_at = format_timestamp(row.scraped_at);
        service.resources.insert(
            row.resource_name.clone(),
            ResourceCapacity {
                capacity: row.capacity,
                capacity_per_az: row
                    .capacity_per_az
                    .as_deref()
                    .and_then(|s| serde_json::from_str(s).ok()),
                comment: row.comment,
            },
        );
    }
    Ok(Json(ClusterReport {
        cluster_id: state.cluster_id.clone(),
        services,
    }))
}
