use async_trait::async_trait;
use chrono::{DateTime, Utc};

use allot_core::config::TimingConfig;
use allot_core::models::{KeystoneDomain, KeystoneProject};

use crate::error::StoreError;
use crate::ops::{
    CapacityPass, CapacityReportRow, DomainReconciliation, DomainReportRow, NewProjectService,
    ProjectReconciliation, ProjectReportRow, RatesFailure, RatesSuccess, ScrapeAgeRow,
    ScrapeFailure, ScrapeSuccess, ScrapeTarget,
};
use crate::rows::{
    ClusterCapacitorRow, ClusterResourceRow, ClusterServiceRow, DomainResourceRow, DomainRow,
    DomainServiceRow, ProjectRateRow, ProjectResourceRow, ProjectRow, ProjectServiceRow,
};

/// The single source of persisted truth, shared by all loops.
///
/// Reads are plain queries. Writes are coarse-grained: each method applies
/// its whole change set atomically (one transaction in [`crate::PgStore`],
/// one lock scope in [`crate::MemStore`]), which is what makes every loop
/// iteration safe to kill at any suspension point.
#[async_trait]
pub trait Store: Send + Sync {
    // --- cluster services and capacity ---

    /// Ensure exactly one ClusterService per enabled service type and none
    /// for disabled types.
    async fn sync_cluster_services(
        &self,
        cluster_id: &str,
        enabled: &[String],
    ) -> Result<(), StoreError>;

    async fn cluster_services(&self, cluster_id: &str)
        -> Result<Vec<ClusterServiceRow>, StoreError>;

    async fn cluster_resources(&self, service_id: i64)
        -> Result<Vec<ClusterResourceRow>, StoreError>;

    /// Insert or overwrite a single cluster resource with an explicit
    /// comment. This is the operator-facing path that seeds `"manual"`
    /// capacity rows.
    async fn put_cluster_resource(
        &self,
        cluster_id: &str,
        service_type: &str,
        resource_name: &str,
        capacity: u64,
        comment: &str,
    ) -> Result<(), StoreError>;

    /// Apply one capacity pass: upsert/prune capacitor rows, ensure
    /// ClusterService rows, touch their `scraped_at`, and reconcile
    /// ClusterResource rows (respecting the `"manual"` comment rule).
    async fn write_capacity_pass(
        &self,
        cluster_id: &str,
        pass: CapacityPass,
    ) -> Result<(), StoreError>;

    async fn cluster_capacitors(
        &self,
        cluster_id: &str,
    ) -> Result<Vec<ClusterCapacitorRow>, StoreError>;

    // --- domains and projects (discovery) ---

    async fn domains(&self, cluster_id: &str) -> Result<Vec<DomainRow>, StoreError>;

    async fn create_domain(
        &self,
        cluster_id: &str,
        domain: &KeystoneDomain,
    ) -> Result<DomainRow, StoreError>;

    async fn rename_domain(&self, domain_id: i64, new_name: &str) -> Result<(), StoreError>;

    /// Cascades to all services, projects and their descendants.
    async fn delete_domain(&self, domain_id: i64) -> Result<(), StoreError>;

    async fn projects(&self, domain_id: i64) -> Result<Vec<ProjectRow>, StoreError>;

    /// Create a project together with its ProjectService rows (and seeded
    /// initial resources), in one transaction.
    async fn create_project(
        &self,
        domain_id: i64,
        project: &KeystoneProject,
        services: &[NewProjectService],
    ) -> Result<ProjectRow, StoreError>;

    async fn update_project(
        &self,
        project_id: i64,
        name: &str,
        parent_uuid: &str,
    ) -> Result<(), StoreError>;

    async fn delete_project(&self, project_id: i64) -> Result<(), StoreError>;

    /// Toggle the bursting flag. Flipped by the (external) API; exposed here
    /// so tests and operators can exercise the bursting path.
    async fn set_project_has_bursting(
        &self,
        project_id: i64,
        has_bursting: bool,
    ) -> Result<(), StoreError>;

    /// Overwrite the stored quota of one project resource. This is the
    /// out-of-band write path of the (external) quota API; the next scrape
    /// of an authoritative cluster pushes the new value into the backend.
    async fn set_project_quota(
        &self,
        service_id: i64,
        resource_name: &str,
        quota: u64,
    ) -> Result<(), StoreError>;

    async fn project_by_uuid(
        &self,
        cluster_id: &str,
        project_uuid: &str,
    ) -> Result<Option<(DomainRow, ProjectRow)>, StoreError>;

    // --- domain/project services (consistency) ---

    async fn domain_services(&self, domain_id: i64) -> Result<Vec<DomainServiceRow>, StoreError>;

    async fn domain_resources(&self, service_id: i64)
        -> Result<Vec<DomainResourceRow>, StoreError>;

    async fn apply_domain_reconciliation(
        &self,
        domain_id: i64,
        reconciliation: DomainReconciliation,
    ) -> Result<(), StoreError>;

    async fn project_services(&self, project_id: i64)
        -> Result<Vec<ProjectServiceRow>, StoreError>;

    async fn apply_project_reconciliation(
        &self,
        project_id: i64,
        reconciliation: ProjectReconciliation,
    ) -> Result<(), StoreError>;

    // --- scrape loops ---

    /// The next project-service to scrape for this service type: stale rows
    /// first, then oldest `checked_at` (never-checked sorts first), ties by
    /// ascending id. Only rows matching the staleness condition are
    /// considered; `None` means the worker should idle.
    async fn next_scrape_target(
        &self,
        cluster_id: &str,
        service_type: &str,
        now: DateTime<Utc>,
        timing: &TimingConfig,
    ) -> Result<Option<ScrapeTarget>, StoreError>;

    /// Same selection, keyed on the `rates_*` columns.
    async fn next_rates_target(
        &self,
        cluster_id: &str,
        service_type: &str,
        now: DateTime<Utc>,
        timing: &TimingConfig,
    ) -> Result<Option<ScrapeTarget>, StoreError>;

    async fn project_resources(
        &self,
        service_id: i64,
    ) -> Result<Vec<ProjectResourceRow>, StoreError>;

    async fn project_rates(&self, service_id: i64) -> Result<Vec<ProjectRateRow>, StoreError>;

    async fn write_scrape_success(
        &self,
        service_id: i64,
        outcome: ScrapeSuccess,
    ) -> Result<(), StoreError>;

    async fn write_scrape_failure(
        &self,
        service_id: i64,
        outcome: ScrapeFailure,
    ) -> Result<(), StoreError>;

    async fn write_rates_success(
        &self,
        service_id: i64,
        outcome: RatesSuccess,
    ) -> Result<(), StoreError>;

    async fn write_rates_failure(
        &self,
        service_id: i64,
        outcome: RatesFailure,
    ) -> Result<(), StoreError>;

    // --- quota application ---

    /// Persist the desired backend quota for the named resources. Runs
    /// before the backend call so that drift stays visible if the call dies.
    async fn set_desired_backend_quota(
        &self,
        service_id: i64,
        values: &[(String, i64)],
    ) -> Result<(), StoreError>;

    /// Persist the applied backend quota after a successful backend call.
    async fn set_backend_quota(
        &self,
        service_id: i64,
        values: &[(String, i64)],
    ) -> Result<(), StoreError>;

    // --- reports (metrics exporter, API) ---

    async fn scrape_age_extremes(&self, cluster_id: &str)
        -> Result<Vec<ScrapeAgeRow>, StoreError>;

    async fn capacity_report(&self, cluster_id: &str)
        -> Result<Vec<CapacityReportRow>, StoreError>;

    async fn domain_report(&self, cluster_id: &str) -> Result<Vec<DomainReportRow>, StoreError>;

    async fn project_report(&self, cluster_id: &str)
        -> Result<Vec<ProjectReportRow>, StoreError>;
}
