use std::collections::BTreeMap;

use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;

use allot_store::ops::DomainReportRow;
use allot_store::Store;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct DomainReport {
    pub name: String,
    pub uuid: String,
    /// service type → resource name → quota
    pub services: BTreeMap<String, BTreeMap<String, u64>>,
}

fn group(rows: Vec<DomainReportRow>) -> BTreeMap<String, DomainReport> {
    let mut domains: BTreeMap<String, DomainReport> = BTreeMap::new();
    for row in rows {
        let domain = domains
            .entry(row.domain_uuid.clone())
            .or_insert_with(|| DomainReport {
                name: row.domain_name.clone(),
                uuid: row.domain_uuid.clone(),
                services: BTreeMap::new(),
            });
        domain
            .services
            .entry(row.service_type)
            .or_default()
            .insert(row.resource_name, row.quota);
    }
    domains
}

pub async fn list_domains(
    State(state): State<AppState>,
) -> Result<Json<Vec<DomainReport>>, ApiError> {
    let rows = state.store.domain_report(&state.cluster_id).await?;
    Ok(Json(group(rows).into_values().collect()))
}

pub async fn get_domain(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Result<Json<DomainReport>, ApiError> {
    let rows = state.store.domain_report(&state.cluster_id).await?;
    group(rows)
        .remove(&uuid)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("domain {uuid}")))
}
