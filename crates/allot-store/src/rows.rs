//! Persisted row types, one struct per table.
//!
//! Numeric conventions: quotas and backend quotas are `i64` territory
//! (backends report -1 for "infinite"); usage and capacity are unsigned.
//! JSON payloads (`subresources`, `subcapacities`, `capacity_per_az`,
//! `serialized_metrics`) are carried as opaque serialized strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterServiceRow {
    pub id: i64,
    pub cluster_id: String,
    pub service_type: String,
    pub scraped_at: Option<DateTime<Utc>>,
}

/// The special comment value marking an operator-maintained capacity row.
/// Such rows survive capacity passes that no longer report them.
pub const MANUAL_COMMENT: &str = "manual";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterResourceRow {
    pub id: i64,
    pub service_id: i64,
    pub name: String,
    pub capacity: u64,
    pub capacity_per_az: Option<String>,
    pub subcapacities: String,
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterCapacitorRow {
    pub id: i64,
    pub cluster_id: String,
    pub capacitor_id: String,
    pub scraped_at: DateTime<Utc>,
    pub scrape_duration_secs: f64,
    pub serialized_metrics: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainRow {
    pub id: i64,
    pub cluster_id: String,
    pub name: String,
    pub uuid: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainServiceRow {
    pub id: i64,
    pub domain_id: i64,
    pub service_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainResourceRow {
    pub id: i64,
    pub service_id: i64,
    pub name: String,
    pub quota: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRow {
    pub id: i64,
    pub domain_id: i64,
    pub name: String,
    pub uuid: String,
    pub parent_uuid: String,
    pub has_bursting: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectServiceRow {
    pub id: i64,
    pub project_id: i64,
    pub service_type: String,
    pub scraped_at: Option<DateTime<Utc>>,
    pub checked_at: Option<DateTime<Utc>>,
    pub stale: bool,
    pub scrape_duration_secs: f64,
    pub serialized_metrics: String,
    pub scrape_error_message: String,
    pub rates_scraped_at: Option<DateTime<Utc>>,
    pub rates_checked_at: Option<DateTime<Utc>>,
    pub rates_stale: bool,
    pub rates_scrape_duration_secs: f64,
    pub rates_scrape_error_message: String,
    pub rates_scrape_state: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectResourceRow {
    pub id: i64,
    pub service_id: i64,
    pub name: String,
    /// NULL exactly for no-quota resources.
    pub quota: Option<u64>,
    pub usage: u64,
    pub physical_usage: Option<u64>,
    /// Quota currently enforced in the backend; negative means "infinite"
    /// (or "unknown", for the -1 written with first-failure dummy rows).
    pub backend_quota: Option<i64>,
    pub desired_backend_quota: Option<i64>,
    pub subresources: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRateRow {
    pub id: i64,
    pub service_id: i64,
    pub name: String,
    /// Plain decimal representation of a non-negative big integer.
    pub usage_as_bigint: String,
}
