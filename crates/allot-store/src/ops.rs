//! Argument and result types for the coarse-grained [`Store`](crate::Store)
//! operations.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::rows::{DomainRow, ProjectRow, ProjectServiceRow};

/// The project-service a scrape worker selected, with its project and domain
/// context.
#[derive(Debug, Clone)]
pub struct ScrapeTarget {
    pub service: ProjectServiceRow,
    pub project: ProjectRow,
    pub domain: DomainRow,
}

/// Full new state of one project resource, written on a successful scrape
/// (or as a dummy row after a failed first scrape).
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceUpsert {
    pub name: String,
    /// None exactly for no-quota resources.
    pub quota: Option<u64>,
    pub usage: u64,
    pub physical_usage: Option<u64>,
    pub backend_quota: Option<i64>,
    pub desired_backend_quota: Option<i64>,
    /// Serialized JSON array; empty string when the plugin reported none.
    pub subresources: String,
}

/// Everything a successful scrape writes in one transaction. `resources` is
/// the complete declared set: rows with other names are pruned.
#[derive(Debug, Clone)]
pub struct ScrapeSuccess {
    pub resources: Vec<ResourceUpsert>,
    pub duration_secs: f64,
    pub serialized_metrics: String,
    /// Becomes both `scraped_at` and `checked_at`.
    pub completed_at: DateTime<Utc>,
}

/// Everything a failed scrape writes. `scraped_at` is never touched, except
/// through `first_time_dummies` which pins it to the UNIX epoch.
#[derive(Debug, Clone)]
pub struct ScrapeFailure {
    pub checked_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub error_message: String,
    /// Set only when this was the first-ever scrape of the service: dummy
    /// rows for every declared resource, plus `scraped_at` = epoch so the
    /// service sorts after genuinely new work but is eventually retried.
    pub first_time_dummies: Option<Vec<ResourceUpsert>>,
}

/// Everything a successful rate scrape writes in one transaction. `rates` is
/// the complete declared set: rows with other names are pruned.
#[derive(Debug, Clone)]
pub struct RatesSuccess {
    /// (rate name, decimal usage)
    pub rates: Vec<(String, String)>,
    pub scrape_state: String,
    pub duration_secs: f64,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RatesFailure {
    pub checked_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub error_message: String,
}

/// A new ProjectService (with seeded resources) created alongside a new
/// project.
#[derive(Debug, Clone)]
pub struct NewProjectService {
    pub service_type: String,
    /// (resource name, initial quota) for resources whose constraint or
    /// distribution model dictates a non-zero start.
    pub initial_resources: Vec<(String, u64)>,
}

/// Changes one consistency pass applies to a domain, atomically.
#[derive(Debug, Clone, Default)]
pub struct DomainReconciliation {
    pub create_services: Vec<String>,
    /// Service ids to delete (cascades to their resources).
    pub delete_services: Vec<i64>,
    /// (service type, resource name, quota) to insert or update.
    pub upsert_resources: Vec<(String, String, u64)>,
    /// (service type, resource name) rows to prune.
    pub delete_resources: Vec<(String, String)>,
}

impl DomainReconciliation {
    pub fn is_empty(&self) -> bool {
        self.create_services.is_empty()
            && self.delete_services.is_empty()
            && self.upsert_resources.is_empty()
            && self.delete_resources.is_empty()
    }
}

/// Changes one consistency pass applies to a project, atomically. Quota
/// violations of existing rows are never corrected here; the offending
/// service is only marked stale and the scrape loop does the work. Missing
/// rows that a constraint or distribution model mandates are seeded, though
/// (insert-if-absent, never overwriting).
#[derive(Debug, Clone, Default)]
pub struct ProjectReconciliation {
    pub create_services: Vec<String>,
    pub delete_services: Vec<i64>,
    /// (service type, resource name, quota) rows inserted only if absent.
    pub seed_resources: Vec<(String, String, u64)>,
    /// Service ids whose `stale` flag is set.
    pub mark_stale: Vec<i64>,
}

impl ProjectReconciliation {
    pub fn is_empty(&self) -> bool {
        self.create_services.is_empty()
            && self.delete_services.is_empty()
            && self.seed_resources.is_empty()
            && self.mark_stale.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct CapacitorUpsert {
    pub capacitor_id: String,
    pub scraped_at: DateTime<Utc>,
    pub scrape_duration_secs: f64,
    pub serialized_metrics: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CapacityResourceUpdate {
    pub capacity: u64,
    pub capacity_per_az: Option<String>,
    pub subcapacities: String,
}

/// Everything one capacity pass writes in one transaction. `values` has
/// already been filtered to enabled service types and advertised resource
/// names.
#[derive(Debug, Clone)]
pub struct CapacityPass {
    pub capacitors: Vec<CapacitorUpsert>,
    /// Capacitor rows whose id is not in this list are deleted.
    pub configured_capacitor_ids: Vec<String>,
    /// service type → resource name → new capacity values.
    pub values: BTreeMap<String, BTreeMap<String, CapacityResourceUpdate>>,
    pub scraped_at: DateTime<Utc>,
}

/// Oldest and newest `scraped_at` per service type, for the aggregate
/// metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrapeAgeRow {
    pub service_type: String,
    pub oldest_scraped_at: Option<DateTime<Utc>>,
    pub newest_scraped_at: Option<DateTime<Utc>>,
}

/// One cluster resource with its service type, for reports and metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct CapacityReportRow {
    pub service_type: String,
    pub resource_name: String,
    pub capacity: u64,
    pub capacity_per_az: Option<String>,
    pub subcapacities: String,
    pub comment: String,
    pub scraped_at: Option<DateTime<Utc>>,
}

/// One domain resource with its domain and service context.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainReportRow {
    pub domain_name: String,
    pub domain_uuid: String,
    pub service_type: String,
    pub resource_name: String,
    pub quota: u64,
}

/// One project resource with its full context.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectReportRow {
    pub domain_name: String,
    pub domain_uuid: String,
    pub project_name: String,
    pub project_uuid: String,
    pub service_type: String,
    pub resource_name: String,
    pub quota: Option<u64>,
    pub usage: u64,
    pub physical_usage: Option<u64>,
    pub backend_quota: Option<i64>,
    pub desired_backend_quota: Option<i64>,
}
