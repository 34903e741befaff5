//! In-memory [`Store`] for tests and development.
//!
//! All tables live in one `Mutex`-guarded state; every trait method takes
//! the lock once, so each operation is atomic exactly like a `PgStore`
//! transaction.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use allot_core::clock::unix_epoch;
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
    MANUAL_COMMENT,
};
use crate::store::Store;

#[derive(Default)]
struct MemState {
    next_id: i64,
    cluster_services: BTreeMap<i64, ClusterServiceRow>,
    cluster_resources: BTreeMap<i64, ClusterResourceRow>,
    cluster_capacitors: BTreeMap<i64, ClusterCapacitorRow>,
    domains: BTreeMap<i64, DomainRow>,
    domain_services: BTreeMap<i64, DomainServiceRow>,
    domain_resources: BTreeMap<i64, DomainResourceRow>,
    projects: BTreeMap<i64, ProjectRow>,
    project_services: BTreeMap<i64, ProjectServiceRow>,
    project_resources: BTreeMap<i64, ProjectResourceRow>,
    project_rates: BTreeMap<i64, ProjectRateRow>,
}

impl MemState {
    fn alloc_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn delete_project_service(&mut self, service_id: i64) {
        self.project_services.remove(&service_id);
        self.project_resources.retain(|_, r| r.service_id != service_id);
        self.project_rates.retain(|_, r| r.service_id != service_id);
    }

    fn delete_project(&mut self, project_id: i64) {
        let service_ids: Vec<i64> = self
            .project_services
            .values()
            .filter(|s| s.project_id == project_id)
            .map(|s| s.id)
            .collect();
        for service_id in service_ids {
            self.delete_project_service(service_id);
        }
        self.projects.remove(&project_id);
    }

    fn delete_domain_service(&mut self, service_id: i64) {
        self.domain_services.remove(&service_id);
        self.domain_resources.retain(|_, r| r.service_id != service_id);
    }

    fn delete_cluster_service(&mut self, service_id: i64) {
        self.cluster_services.remove(&service_id);
        self.cluster_resources.retain(|_, r| r.service_id != service_id);
    }

    fn project_cluster(&self, project: &ProjectRow) -> Option<&str> {
        self.domains
            .get(&project.domain_id)
            .map(|d| d.cluster_id.as_str())
    }

    fn new_project_service(&mut self, project_id: i64, service_type: &str) -> i64 {
        let id = self.alloc_id();
        self.project_services.insert(
            id,
            ProjectServiceRow {
                id,
                project_id,
                service_type: service_type.to_string(),
                scraped_at: None,
                checked_at: None,
                stale: false,
                scrape_duration_secs: 0.0,
                serialized_metrics: String::new(),
                scrape_error_message: String::new(),
                rates_scraped_at: None,
                rates_checked_at: None,
                rates_stale: false,
                rates_scrape_duration_secs: 0.0,
                rates_scrape_error_message: String::new(),
                rates_scrape_state: String::new(),
            },
        );
        id
    }

    fn upsert_project_resource(&mut self, service_id: i64, upsert: &crate::ops::ResourceUpsert) {
        if let Some(row) = self
            .project_resources
            .values_mut()
            .find(|r| r.service_id == service_id && r.name == upsert.name)
        {
            row.quota = upsert.quota;
            row.usage = upsert.usage;
            row.physical_usage = upsert.physical_usage;
            row.backend_quota = upsert.backend_quota;
            row.desired_backend_quota = upsert.desired_backend_quota;
            row.subresources = upsert.subresources.clone();
        } else {
            let id = self.alloc_id();
            self.project_resources.insert(
                id,
                ProjectResourceRow {
                    id,
                    service_id,
                    name: upsert.name.clone(),
                    quota: upsert.quota,
                    usage: upsert.usage,
                    physical_usage: upsert.physical_usage,
                    backend_quota: upsert.backend_quota,
                    desired_backend_quota: upsert.desired_backend_quota,
                    subresources: upsert.subresources.clone(),
                },
            );
        }
    }
}

/// Whether a project-service is due for a resource scrape.
fn resource_scrape_due(ps: &ProjectServiceRow, now: DateTime<Utc>, timing: &TimingConfig) -> bool {
    if ps.stale {
        return true;
    }
    let Some(scraped_at) = ps.scraped_at else {
        return true;
    };
    if scraped_at < now - timing.scrape_interval() {
        return true;
    }
    match ps.checked_at {
        Some(checked_at) => {
            checked_at != scraped_at && checked_at < now - timing.recheck_interval()
        }
        None => false,
    }
}

/// Whether a project-service is due for a rate scrape.
fn rates_scrape_due(ps: &ProjectServiceRow, now: DateTime<Utc>, timing: &TimingConfig) -> bool {
    if ps.rates_stale {
        return true;
    }
    let Some(scraped_at) = ps.rates_scraped_at else {
        return true;
    };
    if scraped_at < now - timing.scrape_interval() {
        return true;
    }
    match ps.rates_checked_at {
        Some(checked_at) => {
            checked_at != scraped_at && checked_at < now - timing.recheck_interval()
        }
        None => false,
    }
}

pub struct MemStore {
    state: Mutex<MemState>,
}

impl MemStore {
    pub fn new() -> Self {
        MemStore {
            state: Mutex::new(MemState::default()),
        }
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn sync_cluster_services(
        &self,
        cluster_id: &str,
        enabled: &[String],
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let stale_ids: Vec<i64> = state
            .cluster_services
            .values()
            .filter(|s| s.cluster_id == cluster_id && !enabled.contains(&s.service_type))
            .map(|s| s.id)
            .collect();
        for id in stale_ids {
            state.delete_cluster_service(id);
        }
        for service_type in enabled {
            let exists = state
                .cluster_services
                .values()
                .any(|s| s.cluster_id == cluster_id && &s.service_type == service_type);
            if !exists {
                let id = state.alloc_id();
                state.cluster_services.insert(
                    id,
                    ClusterServiceRow {
                        id,
                        cluster_id: cluster_id.to_string(),
                        service_type: service_type.clone(),
                        scraped_at: None,
                    },
                );
            }
        }
        Ok(())
    }

    async fn cluster_services(
        &self,
        cluster_id: &str,
    ) -> Result<Vec<ClusterServiceRow>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut rows: Vec<_> = state
            .cluster_services
            .values()
            .filter(|s| s.cluster_id == cluster_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.service_type.cmp(&b.service_type));
        Ok(rows)
    }

    async fn cluster_resources(
        &self,
        service_id: i64,
    ) -> Result<Vec<ClusterResourceRow>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut rows: Vec<_> = state
            .cluster_resources
            .values()
            .filter(|r| r.service_id == service_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rows)
    }

    async fn put_cluster_resource(
        &self,
        cluster_id: &str,
        service_type: &str,
        resource_name: &str,
        capacity: u64,
        comment: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let service_id = match state
            .cluster_services
            .values()
            .find(|s| s.cluster_id == cluster_id && s.service_type == service_type)
        {
            Some(service) => service.id,
            None => {
                let id = state.alloc_id();
                state.cluster_services.insert(
                    id,
                    ClusterServiceRow {
                        id,
                        cluster_id: cluster_id.to_string(),
                        service_type: service_type.to_string(),
                        scraped_at: None,
                    },
                );
                id
            }
        };
        if let Some(row) = state
            .cluster_resources
            .values_mut()
            .find(|r| r.service_id == service_id && r.name == resource_name)
        {
            row.capacity = capacity;
            row.comment = comment.to_string();
        } else {
            let id = state.alloc_id();
            state.cluster_resources.insert(
                id,
                ClusterResourceRow {
                    id,
                    service_id,
                    name: resource_name.to_string(),
                    capacity,
                    capacity_per_az: None,
                    subcapacities: String::new(),
                    comment: comment.to_string(),
                },
            );
        }
        Ok(())
    }

    async fn write_capacity_pass(
        &self,
        cluster_id: &str,
        pass: CapacityPass,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();

        // Capacitor bookkeeping: upsert scraped ones, drop unconfigured ones.
        for upsert in &pass.capacitors {
            if let Some(row) = state.cluster_capacitors.values_mut().find(|c| {
                c.cluster_id == cluster_id && c.capacitor_id == upsert.capacitor_id
            }) {
                row.scraped_at = upsert.scraped_at;
                row.scrape_duration_secs = upsert.scrape_duration_secs;
                row.serialized_metrics = upsert.serialized_metrics.clone();
            } else {
                let id = state.alloc_id();
                state.cluster_capacitors.insert(
                    id,
                    ClusterCapacitorRow {
                        id,
                        cluster_id: cluster_id.to_string(),
                        capacitor_id: upsert.capacitor_id.clone(),
                        scraped_at: upsert.scraped_at,
                        scrape_duration_secs: upsert.scrape_duration_secs,
                        serialized_metrics: upsert.serialized_metrics.clone(),
                    },
                );
            }
        }
        state.cluster_capacitors.retain(|_, c| {
            c.cluster_id != cluster_id || pass.configured_capacitor_ids.contains(&c.capacitor_id)
        });

        // Ensure a ClusterService for every reported service type.
        for service_type in pass.values.keys() {
            let exists = state
                .cluster_services
                .values()
                .any(|s| s.cluster_id == cluster_id && &s.service_type == service_type);
            if !exists {
                let id = state.alloc_id();
                state.cluster_services.insert(
                    id,
                    ClusterServiceRow {
                        id,
                        cluster_id: cluster_id.to_string(),
                        service_type: service_type.clone(),
                        scraped_at: None,
                    },
                );
            }
        }
        for service in state.cluster_services.values_mut() {
            if service.cluster_id == cluster_id {
                service.scraped_at = Some(pass.scraped_at);
            }
        }

        // Reconcile resources per service.
        let services: Vec<(i64, String)> = state
            .cluster_services
            .values()
            .filter(|s| s.cluster_id == cluster_id)
            .map(|s| (s.id, s.service_type.clone()))
            .collect();
        let empty = BTreeMap::new();
        for (service_id, service_type) in services {
            let reported = pass.values.get(&service_type).unwrap_or(&empty);

            let existing_ids: Vec<i64> = state
                .cluster_resources
                .values()
                .filter(|r| r.service_id == service_id)
                .map(|r| r.id)
                .collect();
            for id in existing_ids {
                let (name, comment) = match state.cluster_resources.get(&id) {
                    Some(row) => (row.name.clone(), row.comment.clone()),
                    None => continue,
                };
                match reported.get(&name) {
                    Some(update) => {
                        if let Some(row) = state.cluster_resources.get_mut(&id) {
                            row.capacity = update.capacity;
                            row.capacity_per_az = update.capacity_per_az.clone();
                            row.subcapacities = update.subcapacities.clone();
                            row.comment = String::new();
                        }
                    }
                    None if comment == MANUAL_COMMENT => {}
                    None => {
                        state.cluster_resources.remove(&id);
                    }
                }
            }

            for (name, update) in reported {
                let exists = state
                    .cluster_resources
                    .values()
                    .any(|r| r.service_id == service_id && &r.name == name);
                if !exists {
                    let id = state.alloc_id();
                    state.cluster_resources.insert(
                        id,
                        ClusterResourceRow {
                            id,
                            service_id,
                            name: name.clone(),
                            capacity: update.capacity,
                            capacity_per_az: update.capacity_per_az.clone(),
                            subcapacities: update.subcapacities.clone(),
                            comment: String::new(),
                        },
                    );
                }
            }
        }
        Ok(())
    }

    async fn cluster_capacitors(
        &self,
        cluster_id: &str,
    ) -> Result<Vec<ClusterCapacitorRow>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut rows: Vec<_> = state
            .cluster_capacitors
            .values()
            .filter(|c| c.cluster_id == cluster_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.capacitor_id.cmp(&b.capacitor_id));
        Ok(rows)
    }

    async fn domains(&self, cluster_id: &str) -> Result<Vec<DomainRow>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut rows: Vec<_> = state
            .domains
            .values()
            .filter(|d| d.cluster_id == cluster_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn create_domain(
        &self,
        cluster_id: &str,
        domain: &KeystoneDomain,
    ) -> Result<DomainRow, StoreError> {
        let mut state = self.state.lock().unwrap();
        let id = state.alloc_id();
        let row = DomainRow {
            id,
            cluster_id: cluster_id.to_string(),
            name: domain.name.clone(),
            uuid: domain.uuid.clone(),
        };
        state.domains.insert(id, row.clone());
        Ok(row)
    }

    async fn rename_domain(&self, domain_id: i64, new_name: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let domain = state
            .domains
            .get_mut(&domain_id)
            .ok_or_else(|| StoreError::not_found("domain", domain_id))?;
        domain.name = new_name.to_string();
        Ok(())
    }

    async fn delete_domain(&self, domain_id: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let project_ids: Vec<i64> = state
            .projects
            .values()
            .filter(|p| p.domain_id == domain_id)
            .map(|p| p.id)
            .collect();
        for project_id in project_ids {
            state.delete_project(project_id);
        }
        let service_ids: Vec<i64> = state
            .domain_services
            .values()
            .filter(|s| s.domain_id == domain_id)
            .map(|s| s.id)
            .collect();
        for service_id in service_ids {
            state.delete_domain_service(service_id);
        }
        state.domains.remove(&domain_id);
        Ok(())
    }

    async fn projects(&self, domain_id: i64) -> Result<Vec<ProjectRow>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut rows: Vec<_> = state
            .projects
            .values()
            .filter(|p| p.domain_id == domain_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn create_project(
        &self,
        domain_id: i64,
        project: &KeystoneProject,
        services: &[NewProjectService],
    ) -> Result<ProjectRow, StoreError> {
        let mut state = self.state.lock().unwrap();
        let id = state.alloc_id();
        let row = ProjectRow {
            id,
            domain_id,
            name: project.name.clone(),
            uuid: project.uuid.clone(),
            parent_uuid: project.parent_uuid.clone(),
            has_bursting: false,
        };
        state.projects.insert(id, row.clone());
        for service in services {
            let service_id = state.new_project_service(id, &service.service_type);
            for (resource_name, quota) in &service.initial_resources {
                let resource_id = state.alloc_id();
                state.project_resources.insert(
                    resource_id,
                    ProjectResourceRow {
                        id: resource_id,
                        service_id,
                        name: resource_name.clone(),
                        quota: Some(*quota),
                        usage: 0,
                        physical_usage: None,
                        backend_quota: None,
                        desired_backend_quota: None,
                        subresources: String::new(),
                    },
                );
            }
        }
        Ok(row)
    }

    async fn update_project(
        &self,
        project_id: i64,
        name: &str,
        parent_uuid: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let project = state
            .projects
            .get_mut(&project_id)
            .ok_or_else(|| StoreError::not_found("project", project_id))?;
        project.name = name.to_string();
        project.parent_uuid = parent_uuid.to_string();
        Ok(())
    }

    async fn delete_project(&self, project_id: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.delete_project(project_id);
        Ok(())
    }

    async fn set_project_has_bursting(
        &self,
        project_id: i64,
        has_bursting: bool,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let project = state
            .projects
            .get_mut(&project_id)
            .ok_or_else(|| StoreError::not_found("project", project_id))?;
        project.has_bursting = has_bursting;
        Ok(())
    }

    async fn set_project_quota(
        &self,
        service_id: i64,
        resource_name: &str,
        quota: u64,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let row = state
            .project_resources
            .values_mut()
            .find(|r| r.service_id == service_id && r.name == resource_name)
            .ok_or_else(|| {
                StoreError::not_found("project resource", format!("{service_id}/{resource_name}"))
            })?;
        row.quota = Some(quota);
        Ok(())
    }

    async fn project_by_uuid(
        &self,
        cluster_id: &str,
        project_uuid: &str,
    ) -> Result<Option<(DomainRow, ProjectRow)>, StoreError> {
        let state = self.state.lock().unwrap();
        for project in state.projects.values() {
            if project.uuid != project_uuid {
                continue;
            }
            if let Some(domain) = state.domains.get(&project.domain_id) {
                if domain.cluster_id == cluster_id {
                    return Ok(Some((domain.clone(), project.clone())));
                }
            }
        }
        Ok(None)
    }

    async fn domain_services(&self, domain_id: i64) -> Result<Vec<DomainServiceRow>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut rows: Vec<_> = state
            .domain_services
            .values()
            .filter(|s| s.domain_id == domain_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.service_type.cmp(&b.service_type));
        Ok(rows)
    }

    async fn domain_resources(
        &self,
        service_id: i64,
    ) -> Result<Vec<DomainResourceRow>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut rows: Vec<_> = state
            .domain_resources
            .values()
            .filter(|r| r.service_id == service_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rows)
    }

    async fn apply_domain_reconciliation(
        &self,
        domain_id: i64,
        reconciliation: DomainReconciliation,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        for service_id in &reconciliation.delete_services {
            state.delete_domain_service(*service_id);
        }
        for service_type in &reconciliation.create_services {
            let exists = state
                .domain_services
                .values()
                .any(|s| s.domain_id == domain_id && &s.service_type == service_type);
            if !exists {
                let id = state.alloc_id();
                state.domain_services.insert(
                    id,
                    DomainServiceRow {
                        id,
                        domain_id,
                        service_type: service_type.clone(),
                    },
                );
            }
        }
        for (service_type, resource_name, quota) in &reconciliation.upsert_resources {
            let Some(service_id) = state
                .domain_services
                .values()
                .find(|s| s.domain_id == domain_id && &s.service_type == service_type)
                .map(|s| s.id)
            else {
                continue;
            };
            if let Some(row) = state
                .domain_resources
                .values_mut()
                .find(|r| r.service_id == service_id && &r.name == resource_name)
            {
                row.quota = *quota;
            } else {
                let id = state.alloc_id();
                state.domain_resources.insert(
                    id,
                    DomainResourceRow {
                        id,
                        service_id,
                        name: resource_name.clone(),
                        quota: *quota,
                    },
                );
            }
        }
        for (service_type, resource_name) in &reconciliation.delete_resources {
            let Some(service_id) = state
                .domain_services
                .values()
                .find(|s| s.domain_id == domain_id && &s.service_type == service_type)
                .map(|s| s.id)
            else {
                continue;
            };
            state
                .domain_resources
                .retain(|_, r| !(r.service_id == service_id && &r.name == resource_name));
        }
        Ok(())
    }

    async fn project_services(
        &self,
        project_id: i64,
    ) -> Result<Vec<ProjectServiceRow>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut rows: Vec<_> = state
            .project_services
            .values()
            .filter(|s| s.project_id == project_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.service_type.cmp(&b.service_type));
        Ok(rows)
    }

    async fn apply_project_reconciliation(
        &self,
        project_id: i64,
        reconciliation: ProjectReconciliation,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        for service_id in &reconciliation.delete_services {
            state.delete_project_service(*service_id);
        }
        for service_type in &reconciliation.create_services {
            let exists = state
                .project_services
                .values()
                .any(|s| s.project_id == project_id && &s.service_type == service_type);
            if !exists {
                state.new_project_service(project_id, service_type);
            }
        }
        for (service_type, resource_name, quota) in &reconciliation.seed_resources {
            let Some(service_id) = state
                .project_services
                .values()
                .find(|s| s.project_id == project_id && &s.service_type == service_type)
                .map(|s| s.id)
            else {
                continue;
            };
            let exists = state
                .project_resources
                .values()
                .any(|r| r.service_id == service_id && &r.name == resource_name);
            if !exists {
                let id = state.alloc_id();
                state.project_resources.insert(
                    id,
                    ProjectResourceRow {
                        id,
                        service_id,
                        name: resource_name.clone(),
                        quota: Some(*quota),
                        usage: 0,
                        physical_usage: None,
                        backend_quota: None,
                        desired_backend_quota: None,
                        subresources: String::new(),
                    },
                );
            }
        }
        for service_id in &reconciliation.mark_stale {
            if let Some(service) = state.project_services.get_mut(service_id) {
                service.stale = true;
            }
        }
        Ok(())
    }

    async fn next_scrape_target(
        &self,
        cluster_id: &str,
        service_type: &str,
        now: DateTime<Utc>,
        timing: &TimingConfig,
    ) -> Result<Option<ScrapeTarget>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut candidates: Vec<&ProjectServiceRow> = state
            .project_services
            .values()
            .filter(|ps| {
                ps.service_type == service_type
                    && state
                        .projects
                        .get(&ps.project_id)
                        .and_then(|p| state.project_cluster(p))
                        == Some(cluster_id)
                    && resource_scrape_due(ps, now, timing)
            })
            .collect();
        // Priority: stale first, then oldest check (never-checked first),
        // then ascending id. `Option<DateTime>` orders `None` first, which is
        // exactly the COALESCE(checked_at, -infinity) behavior.
        candidates.sort_by_key(|ps| (std::cmp::Reverse(ps.stale), ps.checked_at, ps.id));
        let Some(service) = candidates.first() else {
            return Ok(None);
        };
        let project = state
            .projects
            .get(&service.project_id)
            .ok_or_else(|| StoreError::not_found("project", service.project_id))?;
        let domain = state
            .domains
            .get(&project.domain_id)
            .ok_or_else(|| StoreError::not_found("domain", project.domain_id))?;
        Ok(Some(ScrapeTarget {
            service: (*service).clone(),
            project: project.clone(),
            domain: domain.clone(),
        }))
    }

    async fn next_rates_target(
        &self,
        cluster_id: &str,
        service_type: &str,
        now: DateTime<Utc>,
        timing: &TimingConfig,
    ) -> Result<Option<ScrapeTarget>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut candidates: Vec<&ProjectServiceRow> = state
            .project_services
            .values()
            .filter(|ps| {
                ps.service_type == service_type
                    && state
                        .projects
                        .get(&ps.project_id)
                        .and_then(|p| state.project_cluster(p))
                        == Some(cluster_id)
                    && rates_scrape_due(ps, now, timing)
            })
            .collect();
        candidates.sort_by_key(|ps| (std::cmp::Reverse(ps.rates_stale), ps.rates_checked_at, ps.id));
        let Some(service) = candidates.first() else {
            return Ok(None);
        };
        let project = state
            .projects
            .get(&service.project_id)
            .ok_or_else(|| StoreError::not_found("project", service.project_id))?;
        let domain = state
            .domains
            .get(&project.domain_id)
            .ok_or_else(|| StoreError::not_found("domain", project.domain_id))?;
        Ok(Some(ScrapeTarget {
            service: (*service).clone(),
            project: project.clone(),
            domain: domain.clone(),
        }))
    }

    async fn project_resources(
        &self,
        service_id: i64,
    ) -> Result<Vec<ProjectResourceRow>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut rows: Vec<_> = state
            .project_resources
            .values()
            .filter(|r| r.service_id == service_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rows)
    }

    async fn project_rates(&self, service_id: i64) -> Result<Vec<ProjectRateRow>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut rows: Vec<_> = state
            .project_rates
            .values()
            .filter(|r| r.service_id == service_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rows)
    }

    async fn write_scrape_success(
        &self,
        service_id: i64,
        outcome: ScrapeSuccess,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        for upsert in &outcome.resources {
            state.upsert_project_resource(service_id, upsert);
        }
        let declared: Vec<&str> = outcome.resources.iter().map(|r| r.name.as_str()).collect();
        state
            .project_resources
            .retain(|_, r| r.service_id != service_id || declared.contains(&r.name.as_str()));

        let service = state
            .project_services
            .get_mut(&service_id)
            .ok_or_else(|| StoreError::not_found("project service", service_id))?;
        service.scraped_at = Some(outcome.completed_at);
        service.checked_at = Some(outcome.completed_at);
        service.stale = false;
        service.scrape_error_message = String::new();
        service.scrape_duration_secs = outcome.duration_secs;
        service.serialized_metrics = outcome.serialized_metrics;
        Ok(())
    }

    async fn write_scrape_failure(
        &self,
        service_id: i64,
        outcome: ScrapeFailure,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if let Some(dummies) = &outcome.first_time_dummies {
            for upsert in dummies {
                if let Some(row) = state
                    .project_resources
                    .values_mut()
                    .find(|r| r.service_id == service_id && r.name == upsert.name)
                {
                    // Seeded rows keep their quota; only the backend view is
                    // stamped as unknown.
                    row.backend_quota = upsert.backend_quota;
                } else {
                    state.upsert_project_resource(service_id, upsert);
                }
            }
        }
        let service = state
            .project_services
            .get_mut(&service_id)
            .ok_or_else(|| StoreError::not_found("project service", service_id))?;
        service.checked_at = Some(outcome.checked_at);
        service.stale = false;
        service.scrape_error_message = outcome.error_message;
        service.scrape_duration_secs = outcome.duration_secs;
        if outcome.first_time_dummies.is_some() {
            service.scraped_at = Some(unix_epoch());
        }
        Ok(())
    }

    async fn write_rates_success(
        &self,
        service_id: i64,
        outcome: RatesSuccess,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        for (name, usage) in &outcome.rates {
            if let Some(row) = state
                .project_rates
                .values_mut()
                .find(|r| r.service_id == service_id && &r.name == name)
            {
                row.usage_as_bigint = usage.clone();
            } else {
                let id = state.alloc_id();
                state.project_rates.insert(
                    id,
                    ProjectRateRow {
                        id,
                        service_id,
                        name: name.clone(),
                        usage_as_bigint: usage.clone(),
                    },
                );
            }
        }
        let declared: Vec<&str> = outcome.rates.iter().map(|(name, _)| name.as_str()).collect();
        state
            .project_rates
            .retain(|_, r| r.service_id != service_id || declared.contains(&r.name.as_str()));

        let service = state
            .project_services
            .get_mut(&service_id)
            .ok_or_else(|| StoreError::not_found("project service", service_id))?;
        service.rates_scraped_at = Some(outcome.completed_at);
        service.rates_checked_at = Some(outcome.completed_at);
        service.rates_stale = false;
        service.rates_scrape_error_message = String::new();
        service.rates_scrape_duration_secs = outcome.duration_secs;
        service.rates_scrape_state = outcome.scrape_state;
        Ok(())
    }

    async fn write_rates_failure(
        &self,
        service_id: i64,
        outcome: RatesFailure,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let service = state
            .project_services
            .get_mut(&service_id)
            .ok_or_else(|| StoreError::not_found("project service", service_id))?;
        service.rates_checked_at = Some(outcome.checked_at);
        service.rates_stale = false;
        service.rates_scrape_error_message = outcome.error_message;
        service.rates_scrape_duration_secs = outcome.duration_secs;
        Ok(())
    }

    async fn set_desired_backend_quota(
        &self,
        service_id: i64,
        values: &[(String, i64)],
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        for (name, desired) in values {
            if let Some(row) = state
                .project_resources
                .values_mut()
                .find(|r| r.service_id == service_id && &r.name == name)
            {
                row.desired_backend_quota = Some(*desired);
            }
        }
        Ok(())
    }

    async fn set_backend_quota(
        &self,
        service_id: i64,
        values: &[(String, i64)],
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        for (name, quota) in values {
            if let Some(row) = state
                .project_resources
                .values_mut()
                .find(|r| r.service_id == service_id && &r.name == name)
            {
                row.backend_quota = Some(*quota);
            }
        }
        Ok(())
    }

    async fn scrape_age_extremes(
        &self,
        cluster_id: &str,
    ) -> Result<Vec<ScrapeAgeRow>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut by_type: BTreeMap<String, Vec<Option<DateTime<Utc>>>> = BTreeMap::new();
        for ps in state.project_services.values() {
            let in_cluster = state
                .projects
                .get(&ps.project_id)
                .and_then(|p| state.project_cluster(p))
                == Some(cluster_id);
            if in_cluster {
                by_type
                    .entry(ps.service_type.clone())
                    .or_default()
                    .push(ps.scraped_at);
            }
        }
        Ok(by_type
            .into_iter()
            .map(|(service_type, stamps)| {
                let known: Vec<DateTime<Utc>> = stamps.into_iter().flatten().collect();
                ScrapeAgeRow {
                    service_type,
                    oldest_scraped_at: known.iter().min().copied(),
                    newest_scraped_at: known.iter().max().copied(),
                }
            })
            .collect())
    }

    async fn capacity_report(
        &self,
        cluster_id: &str,
    ) -> Result<Vec<CapacityReportRow>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut rows = Vec::new();
        for service in state.cluster_services.values() {
            if service.cluster_id != cluster_id {
                continue;
            }
            for resource in state.cluster_resources.values() {
                if resource.service_id == service.id {
                    rows.push(CapacityReportRow {
                        service_type: service.service_type.clone(),
                        resource_name: resource.name.clone(),
                        capacity: resource.capacity,
                        capacity_per_az: resource.capacity_per_az.clone(),
                        subcapacities: resource.subcapacities.clone(),
                        comment: resource.comment.clone(),
                        scraped_at: service.scraped_at,
                    });
                }
            }
        }
        rows.sort_by(|a, b| {
            (&a.service_type, &a.resource_name).cmp(&(&b.service_type, &b.resource_name))
        });
        Ok(rows)
    }

    async fn domain_report(&self, cluster_id: &str) -> Result<Vec<DomainReportRow>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut rows = Vec::new();
        for domain in state.domains.values() {
            if domain.cluster_id != cluster_id {
                continue;
            }
            for service in state.domain_services.values() {
                if service.domain_id != domain.id {
                    continue;
                }
                for resource in state.domain_resources.values() {
                    if resource.service_id == service.id {
                        rows.push(DomainReportRow {
                            domain_name: domain.name.clone(),
                            domain_uuid: domain.uuid.clone(),
                            service_type: service.service_type.clone(),
                            resource_name: resource.name.clone(),
                            quota: resource.quota,
                        });
                    }
                }
            }
        }
        rows.sort_by(|a, b| {
            (&a.domain_name, &a.service_type, &a.resource_name)
                .cmp(&(&b.domain_name, &b.service_type, &b.resource_name))
        });
        Ok(rows)
    }

    async fn project_report(&self, cluster_id: &str) -> Result<Vec<ProjectReportRow>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut rows = Vec::new();
        for project in state.projects.values() {
            let Some(domain) = state.domains.get(&project.domain_id) else {
                continue;
            };
            if domain.cluster_id != cluster_id {
                continue;
            }
            for service in state.project_services.values() {
                if service.project_id != project.id {
                    continue;
                }
                for resource in state.project_resources.values() {
                    if resource.service_id == service.id {
                        rows.push(ProjectReportRow {
                            domain_name: domain.name.clone(),
                            domain_uuid: domain.uuid.clone(),
                            project_name: project.name.clone(),
                            project_uuid: project.uuid.clone(),
                            service_type: service.service_type.clone(),
                            resource_name: resource.name.clone(),
                            quota: resource.quota,
                            usage: resource.usage,
                            physical_usage: resource.physical_usage,
                            backend_quota: resource.backend_quota,
                            desired_backend_quota: resource.desired_backend_quota,
                        });
                    }
                }
            }
        }
        rows.sort_by(|a, b| {
            (&a.domain_name, &a.project_name, &a.service_type, &a.resource_name).cmp(&(
                &b.domain_name,
                &b.project_name,
                &b.service_type,
                &b.resource_name,
            ))
        });
        Ok(rows)
    }
}
