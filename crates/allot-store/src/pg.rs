//! PostgreSQL [`Store`].
//!
//! Each write operation runs in one transaction; the scrape writes
//! additionally set a 5 s `idle_in_transaction_session_timeout` so a stuck
//! connection fails loudly instead of holding locks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use allot_core::clock::unix_epoch;
use allot_core::config::TimingConfig;
use allot_core::models::{KeystoneDomain, KeystoneProject};

use crate::error::StoreError;
use crate::ops::{
    CapacityPass, CapacityReportRow, DomainReconciliation, DomainReportRow, NewProjectService,
    ProjectReconciliation, ProjectReportRow, RatesFailure, RatesSuccess, ResourceUpsert,
    ScrapeAgeRow, ScrapeFailure, ScrapeSuccess, ScrapeTarget,
};
use crate::rows::{
    ClusterCapacitorRow, ClusterResourceRow, ClusterServiceRow, DomainResourceRow, DomainRow,
    DomainServiceRow, ProjectRateRow, ProjectResourceRow, ProjectRow, ProjectServiceRow,
    MANUAL_COMMENT,
};
use crate::store::Store;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect and bring the schema up to date. A migration checksum
    /// mismatch or unreachable database is a startup failure.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(PgStore { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        PgStore { pool }
    }
}

fn project_service_from_row(row: &PgRow) -> Result<ProjectServiceRow, sqlx::Error> {
    Ok(ProjectServiceRow {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        service_type: row.try_get("type")?,
        scraped_at: row.try_get("scraped_at")?,
        checked_at: row.try_get("checked_at")?,
        stale: row.try_get("stale")?,
        scrape_duration_secs: row.try_get("scrape_duration_secs")?,
        serialized_metrics: row.try_get("serialized_metrics")?,
        scrape_error_message: row.try_get("scrape_error_message")?,
        rates_scraped_at: row.try_get("rates_scraped_at")?,
        rates_checked_at: row.try_get("rates_checked_at")?,
        rates_stale: row.try_get("rates_stale")?,
        rates_scrape_duration_secs: row.try_get("rates_scrape_duration_secs")?,
        rates_scrape_error_message: row.try_get("rates_scrape_error_message")?,
        rates_scrape_state: row.try_get("rates_scrape_state")?,
    })
}

fn project_from_row(row: &PgRow) -> Result<ProjectRow, sqlx::Error> {
    Ok(ProjectRow {
        id: row.try_get("id")?,
        domain_id: row.try_get("domain_id")?,
        name: row.try_get("name")?,
        uuid: row.try_get("uuid")?,
        parent_uuid: row.try_get("parent_uuid")?,
        has_bursting: row.try_get("has_bursting")?,
    })
}

fn domain_from_row(row: &PgRow) -> Result<DomainRow, sqlx::Error> {
    Ok(DomainRow {
        id: row.try_get("id")?,
        cluster_id: row.try_get("cluster_id")?,
        name: row.try_get("name")?,
        uuid: row.try_get("uuid")?,
    })
}

fn project_resource_from_row(row: &PgRow) -> Result<ProjectResourceRow, sqlx::Error> {
    Ok(ProjectResourceRow {
        id: row.try_get("id")?,
        service_id: row.try_get("service_id")?,
        name: row.try_get("name")?,
        quota: row.try_get::<Option<i64>, _>("quota")?.map(|q| q.max(0) as u64),
        usage: row.try_get::<i64, _>("usage")?.max(0) as u64,
        physical_usage: row
            .try_get::<Option<i64>, _>("physical_usage")?
            .map(|u| u.max(0) as u64),
        backend_quota: row.try_get("backend_quota")?,
        desired_backend_quota: row.try_get("desired_backend_quota")?,
        subresources: row.try_get("subresources")?,
    })
}

/// The `$3`/`$4` cutoffs of the scrape-selection query.
fn selection_cutoffs(now: DateTime<Utc>, timing: &TimingConfig) -> (DateTime<Utc>, DateTime<Utc>) {
    (now - timing.scrape_interval(), now - timing.recheck_interval())
}

async fn upsert_project_resource(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    service_id: i64,
    upsert: &ResourceUpsert,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO project_resources \
             (service_id, name, quota, usage, physical_usage, backend_quota, \
              desired_backend_quota, subresources) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         ON CONFLICT (service_id, name) DO UPDATE SET \
             quota = EXCLUDED.quota, \
             usage = EXCLUDED.usage, \
             physical_usage = EXCLUDED.physical_usage, \
             backend_quota = EXCLUDED.backend_quota, \
             desired_backend_quota = EXCLUDED.desired_backend_quota, \
             subresources = EXCLUDED.subresources",
    )
    .bind(service_id)
    .bind(&upsert.name)
    .bind(upsert.quota.map(|q| q as i64))
    .bind(upsert.usage as i64)
    .bind(upsert.physical_usage.map(|u| u as i64))
    .bind(upsert.backend_quota)
    .bind(upsert.desired_backend_quota)
    .bind(&upsert.subresources)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl Store for PgStore {
    async fn sync_cluster_services(
        &self,
        cluster_id: &str,
        enabled: &[String],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM cluster_services WHERE cluster_id = $1 AND type <> ALL($2)")
            .bind(cluster_id)
            .bind(enabled)
            .execute(&mut *tx)
            .await?;
        for service_type in enabled {
            sqlx::query(
                "INSERT INTO cluster_services (cluster_id, type) VALUES ($1, $2) \
                 ON CONFLICT (cluster_id, type) DO NOTHING",
            )
            .bind(cluster_id)
            .bind(service_type)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn cluster_services(
        &self,
        cluster_id: &str,
    ) -> Result<Vec<ClusterServiceRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, cluster_id, type, scraped_at FROM cluster_services \
             WHERE cluster_id = $1 ORDER BY type",
        )
        .bind(cluster_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(ClusterServiceRow {
                    id: row.try_get("id")?,
                    cluster_id: row.try_get("cluster_id")?,
                    service_type: row.try_get("type")?,
                    scraped_at: row.try_get("scraped_at")?,
                })
            })
            .collect::<Result<_, sqlx::Error>>()
            .map_err(StoreError::from)
    }

    async fn cluster_resources(
        &self,
        service_id: i64,
    ) -> Result<Vec<ClusterResourceRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, service_id, name, capacity, capacity_per_az, subcapacities, comment \
             FROM cluster_resources WHERE service_id = $1 ORDER BY name",
        )
        .bind(service_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(ClusterResourceRow {
                    id: row.try_get("id")?,
                    service_id: row.try_get("service_id")?,
                    name: row.try_get("name")?,
                    capacity: row.try_get::<i64, _>("capacity")?.max(0) as u64,
                    capacity_per_az: row.try_get("capacity_per_az")?,
                    subcapacities: row.try_get("subcapacities")?,
                    comment: row.try_get("comment")?,
                })
            })
            .collect::<Result<_, sqlx::Error>>()
            .map_err(StoreError::from)
    }

    async fn put_cluster_resource(
        &self,
        cluster_id: &str,
        service_type: &str,
        resource_name: &str,
        capacity: u64,
        comment: &str,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO cluster_services (cluster_id, type) VALUES ($1, $2) \
             ON CONFLICT (cluster_id, type) DO NOTHING",
        )
        .bind(cluster_id)
        .bind(service_type)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO cluster_resources (service_id, name, capacity, comment) \
             SELECT cs.id, $3, $4, $5 FROM cluster_services cs \
             WHERE cs.cluster_id = $1 AND cs.type = $2 \
             ON CONFLICT (service_id, name) DO UPDATE SET \
                 capacity = EXCLUDED.capacity, comment = EXCLUDED.comment",
        )
        .bind(cluster_id)
        .bind(service_type)
        .bind(resource_name)
        .bind(capacity as i64)
        .bind(comment)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn write_capacity_pass(
        &self,
        cluster_id: &str,
        pass: CapacityPass,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        for upsert in &pass.capacitors {
            sqlx::query(
                "INSERT INTO cluster_capacitors \
                     (cluster_id, capacitor_id, scraped_at, scrape_duration_secs, \
                      serialized_metrics) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (cluster_id, capacitor_id) DO UPDATE SET \
                     scraped_at = EXCLUDED.scraped_at, \
                     scrape_duration_secs = EXCLUDED.scrape_duration_secs, \
                     serialized_metrics = EXCLUDED.serialized_metrics",
            )
            .bind(cluster_id)
            .bind(&upsert.capacitor_id)
            .bind(upsert.scraped_at)
            .bind(upsert.scrape_duration_secs)
            .bind(&upsert.serialized_metrics)
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query(
            "DELETE FROM cluster_capacitors WHERE cluster_id = $1 AND capacitor_id <> ALL($2)",
        )
        .bind(cluster_id)
        .bind(&pass.configured_capacitor_ids)
        .execute(&mut *tx)
        .await?;

        for service_type in pass.values.keys() {
            sqlx::query(
                "INSERT INTO cluster_services (cluster_id, type) VALUES ($1, $2) \
                 ON CONFLICT (cluster_id, type) DO NOTHING",
            )
            .bind(cluster_id)
            .bind(service_type)
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query("UPDATE cluster_services SET scraped_at = $2 WHERE cluster_id = $1")
            .bind(cluster_id)
            .bind(pass.scraped_at)
            .execute(&mut *tx)
            .await?;

        let services = sqlx::query("SELECT id, type FROM cluster_services WHERE cluster_id = $1")
            .bind(cluster_id)
            .fetch_all(&mut *tx)
            .await?;
        let empty = std::collections::BTreeMap::new();
        for service in &services {
            let service_id: i64 = service.try_get("id")?;
            let service_type: String = service.try_get("type")?;
            let reported = pass.values.get(&service_type).unwrap_or(&empty);

            let existing =
                sqlx::query("SELECT id, name, comment FROM cluster_resources WHERE service_id = $1")
                    .bind(service_id)
                    .fetch_all(&mut *tx)
                    .await?;
            for row in &existing {
                let id: i64 = row.try_get("id")?;
                let name: String = row.try_get("name")?;
                let comment: String = row.try_get("comment")?;
                match reported.get(&name) {
                    Some(update) => {
                        sqlx::query(
                            "UPDATE cluster_resources SET capacity = $2, capacity_per_az = $3, \
                             subcapacities = $4, comment = '' WHERE id = $1",
                        )
                        .bind(id)
                        .bind(update.capacity as i64)
                        .bind(&update.capacity_per_az)
                        .bind(&update.subcapacities)
                        .execute(&mut *tx)
                        .await?;
                    }
                    None if comment == MANUAL_COMMENT => {}
                    None => {
                        sqlx::query("DELETE FROM cluster_resources WHERE id = $1")
                            .bind(id)
                            .execute(&mut *tx)
                            .await?;
                    }
                }
            }

            for (name, update) in reported {
                sqlx::query(
                    "INSERT INTO cluster_resources \
                         (service_id, name, capacity, capacity_per_az, subcapacities) \
                     VALUES ($1, $2, $3, $4, $5) \
                     ON CONFLICT (service_id, name) DO NOTHING",
                )
                .bind(service_id)
                .bind(name)
                .bind(update.capacity as i64)
                .bind(&update.capacity_per_az)
                .bind(&update.subcapacities)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn cluster_capacitors(
        &self,
        cluster_id: &str,
    ) -> Result<Vec<ClusterCapacitorRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, cluster_id, capacitor_id, scraped_at, scrape_duration_secs, \
                    serialized_metrics \
             FROM cluster_capacitors WHERE cluster_id = $1 ORDER BY capacitor_id",
        )
        .bind(cluster_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(ClusterCapacitorRow {
                    id: row.try_get("id")?,
                    cluster_id: row.try_get("cluster_id")?,
                    capacitor_id: row.try_get("capacitor_id")?,
                    scraped_at: row.try_get("scraped_at")?,
                    scrape_duration_secs: row.try_get("scrape_duration_secs")?,
                    serialized_metrics: row.try_get("serialized_metrics")?,
                })
            })
            .collect::<Result<_, sqlx::Error>>()
            .map_err(StoreError::from)
    }

    async fn domains(&self, cluster_id: &str) -> Result<Vec<DomainRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, cluster_id, name, uuid FROM domains \
             WHERE cluster_id = $1 ORDER BY name, id",
        )
        .bind(cluster_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(domain_from_row)
            .collect::<Result<_, sqlx::Error>>()
            .map_err(StoreError::from)
    }

    async fn create_domain(
        &self,
        cluster_id: &str,
        domain: &KeystoneDomain,
    ) -> Result<DomainRow, StoreError> {
        let row = sqlx::query(
            "INSERT INTO domains (cluster_id, name, uuid) VALUES ($1, $2, $3) \
             RETURNING id, cluster_id, name, uuid",
        )
        .bind(cluster_id)
        .bind(&domain.name)
        .bind(&domain.uuid)
        .fetch_one(&self.pool)
        .await?;
        domain_from_row(&row).map_err(StoreError::from)
    }

    async fn rename_domain(&self, domain_id: i64, new_name: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE domains SET name = $2 WHERE id = $1")
            .bind(domain_id)
            .bind(new_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_domain(&self, domain_id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM domains WHERE id = $1")
            .bind(domain_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn projects(&self, domain_id: i64) -> Result<Vec<ProjectRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, domain_id, name, uuid, parent_uuid, has_bursting FROM projects \
             WHERE domain_id = $1 ORDER BY name, id",
        )
        .bind(domain_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(project_from_row)
            .collect::<Result<_, sqlx::Error>>()
            .map_err(StoreError::from)
    }

    async fn create_project(
        &self,
        domain_id: i64,
        project: &KeystoneProject,
        services: &[NewProjectService],
    ) -> Result<ProjectRow, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "INSERT INTO projects (domain_id, name, uuid, parent_uuid) \
             VALUES ($1, $2, $3, $4) \
             RETURNING id, domain_id, name, uuid, parent_uuid, has_bursting",
        )
        .bind(domain_id)
        .bind(&project.name)
        .bind(&project.uuid)
        .bind(&project.parent_uuid)
        .fetch_one(&mut *tx)
        .await?;
        let created = project_from_row(&row)?;

        for service in services {
            let service_row = sqlx::query(
                "INSERT INTO project_services (project_id, type) VALUES ($1, $2) RETURNING id",
            )
            .bind(created.id)
            .bind(&service.service_type)
            .fetch_one(&mut *tx)
            .await?;
            let service_id: i64 = service_row.try_get("id")?;
            for (resource_name, quota) in &service.initial_resources {
                sqlx::query(
                    "INSERT INTO project_resources (service_id, name, quota) VALUES ($1, $2, $3)",
                )
                .bind(service_id)
                .bind(resource_name)
                .bind(*quota as i64)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(created)
    }

    async fn update_project(
        &self,
        project_id: i64,
        name: &str,
        parent_uuid: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE projects SET name = $2, parent_uuid = $3 WHERE id = $1")
            .bind(project_id)
            .bind(name)
            .bind(parent_uuid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_project(&self, project_id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM projects WHERE id = $1")
            .bind(project_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_project_has_bursting(
        &self,
        project_id: i64,
        has_bursting: bool,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE projects SET has_bursting = $2 WHERE id = $1")
            .bind(project_id)
            .bind(has_bursting)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_project_quota(
        &self,
        service_id: i64,
        resource_name: &str,
        quota: u64,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE project_resources SET quota = $3 WHERE service_id = $1 AND name = $2",
        )
        .bind(service_id)
        .bind(resource_name)
        .bind(quota as i64)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(
                "project resource",
                format!("{service_id}/{resource_name}"),
            ));
        }
        Ok(())
    }

    async fn project_by_uuid(
        &self,
        cluster_id: &str,
        project_uuid: &str,
    ) -> Result<Option<(DomainRow, ProjectRow)>, StoreError> {
        let Some(row) = sqlx::query(
            "SELECT p.id, p.domain_id, p.name, p.uuid, p.parent_uuid, p.has_bursting \
             FROM projects p JOIN domains d ON d.id = p.domain_id \
             WHERE d.cluster_id = $1 AND p.uuid = $2",
        )
        .bind(cluster_id)
        .bind(project_uuid)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };
        let project = project_from_row(&row)?;
        let domain_row = sqlx::query("SELECT id, cluster_id, name, uuid FROM domains WHERE id = $1")
            .bind(project.domain_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(Some((domain_from_row(&domain_row)?, project)))
    }

    async fn domain_services(&self, domain_id: i64) -> Result<Vec<DomainServiceRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, domain_id, type FROM domain_services WHERE domain_id = $1 ORDER BY type",
        )
        .bind(domain_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(DomainServiceRow {
                    id: row.try_get("id")?,
                    domain_id: row.try_get("domain_id")?,
                    service_type: row.try_get("type")?,
                })
            })
            .collect::<Result<_, sqlx::Error>>()
            .map_err(StoreError::from)
    }

    async fn domain_resources(
        &self,
        service_id: i64,
    ) -> Result<Vec<DomainResourceRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, service_id, name, quota FROM domain_resources \
             WHERE service_id = $1 ORDER BY name",
        )
        .bind(service_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(DomainResourceRow {
                    id: row.try_get("id")?,
                    service_id: row.try_get("service_id")?,
                    name: row.try_get("name")?,
                    quota: row.try_get::<i64, _>("quota")?.max(0) as u64,
                })
            })
            .collect::<Result<_, sqlx::Error>>()
            .map_err(StoreError::from)
    }

    async fn apply_domain_reconciliation(
        &self,
        domain_id: i64,
        reconciliation: DomainReconciliation,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        if !reconciliation.delete_services.is_empty() {
            sqlx::query("DELETE FROM domain_services WHERE id = ANY($1)")
                .bind(&reconciliation.delete_services)
                .execute(&mut *tx)
                .await?;
        }
        for service_type in &reconciliation.create_services {
            sqlx::query(
                "INSERT INTO domain_services (domain_id, type) VALUES ($1, $2) \
                 ON CONFLICT (domain_id, type) DO NOTHING",
            )
            .bind(domain_id)
            .bind(service_type)
            .execute(&mut *tx)
            .await?;
        }
        for (service_type, resource_name, quota) in &reconciliation.upsert_resources {
            sqlx::query(
                "INSERT INTO domain_resources (service_id, name, quota) \
                 SELECT ds.id, $3, $4 FROM domain_services ds \
                 WHERE ds.domain_id = $1 AND ds.type = $2 \
                 ON CONFLICT (service_id, name) DO UPDATE SET quota = EXCLUDED.quota",
            )
            .bind(domain_id)
            .bind(service_type)
            .bind(resource_name)
            .bind(*quota as i64)
            .execute(&mut *tx)
            .await?;
        }
        for (service_type, resource_name) in &reconciliation.delete_resources {
            sqlx::query(
                "DELETE FROM domain_resources dr USING domain_services ds \
                 WHERE dr.service_id = ds.id AND ds.domain_id = $1 AND ds.type = $2 \
                   AND dr.name = $3",
            )
            .bind(domain_id)
            .bind(service_type)
            .bind(resource_name)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn project_services(
        &self,
        project_id: i64,
    ) -> Result<Vec<ProjectServiceRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM project_services WHERE project_id = $1 ORDER BY type",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(project_service_from_row)
            .collect::<Result<_, sqlx::Error>>()
            .map_err(StoreError::from)
    }

    async fn apply_project_reconciliation(
        &self,
        project_id: i64,
        reconciliation: ProjectReconciliation,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        if !reconciliation.delete_services.is_empty() {
            sqlx::query("DELETE FROM project_services WHERE id = ANY($1)")
                .bind(&reconciliation.delete_services)
                .execute(&mut *tx)
                .await?;
        }
        for service_type in &reconciliation.create_services {
            sqlx::query(
                "INSERT INTO project_services (project_id, type) VALUES ($1, $2) \
                 ON CONFLICT (project_id, type) DO NOTHING",
            )
            .bind(project_id)
            .bind(service_type)
            .execute(&mut *tx)
            .await?;
        }
        for (service_type, resource_name, quota) in &reconciliation.seed_resources {
            sqlx::query(
                "INSERT INTO project_resources (service_id, name, quota) \
                 SELECT ps.id, $3, $4 FROM project_services ps \
                 WHERE ps.project_id = $1 AND ps.type = $2 \
                 ON CONFLICT (service_id, name) DO NOTHING",
            )
            .bind(project_id)
            .bind(service_type)
            .bind(resource_name)
            .bind(*quota as i64)
            .execute(&mut *tx)
            .await?;
        }
        if !reconciliation.mark_stale.is_empty() {
            sqlx::query("UPDATE project_services SET stale = TRUE WHERE id = ANY($1)")
                .bind(&reconciliation.mark_stale)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn next_scrape_target(
        &self,
        cluster_id: &str,
        service_type: &str,
        now: DateTime<Utc>,
        timing: &TimingConfig,
    ) -> Result<Option<ScrapeTarget>, StoreError> {
        let (scrape_cutoff, recheck_cutoff) = selection_cutoffs(now, timing);
        let Some(row) = sqlx::query(
            "SELECT ps.* FROM project_services ps \
             JOIN projects p ON p.id = ps.project_id \
             JOIN domains d ON d.id = p.domain_id \
             WHERE d.cluster_id = $1 AND ps.type = $2 AND ( \
                 ps.stale \
                 OR ps.scraped_at IS NULL \
                 OR ps.scraped_at < $3 \
                 OR (ps.scraped_at <> ps.checked_at AND ps.checked_at < $4) \
             ) \
             ORDER BY ps.stale DESC, \
                      COALESCE(ps.checked_at, '-infinity'::timestamptz) ASC, \
                      ps.id ASC \
             LIMIT 1",
        )
        .bind(cluster_id)
        .bind(service_type)
        .bind(scrape_cutoff)
        .bind(recheck_cutoff)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };
        let service = project_service_from_row(&row)?;
        self.load_target_context(service).await.map(Some)
    }

    async fn next_rates_target(
        &self,
        cluster_id: &str,
        service_type: &str,
        now: DateTime<Utc>,
        timing: &TimingConfig,
    ) -> Result<Option<ScrapeTarget>, StoreError> {
        let (scrape_cutoff, recheck_cutoff) = selection_cutoffs(now, timing);
        let Some(row) = sqlx::query(
            "SELECT ps.* FROM project_services ps \
             JOIN projects p ON p.id = ps.project_id \
             JOIN domains d ON d.id = p.domain_id \
             WHERE d.cluster_id = $1 AND ps.type = $2 AND ( \
                 ps.rates_stale \
                 OR ps.rates_scraped_at IS NULL \
                 OR ps.rates_scraped_at < $3 \
                 OR (ps.rates_scraped_at <> ps.rates_checked_at \
                     AND ps.rates_checked_at < $4) \
             ) \
             ORDER BY ps.rates_stale DESC, \
                      COALESCE(ps.rates_checked_at, '-infinity'::timestamptz) ASC, \
                      ps.id ASC \
             LIMIT 1",
        )
        .bind(cluster_id)
        .bind(service_type)
        .bind(scrape_cutoff)
        .bind(recheck_cutoff)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };
        let service = project_service_from_row(&row)?;
        self.load_target_context(service).await.map(Some)
    }

    async fn project_resources(
        &self,
        service_id: i64,
    ) -> Result<Vec<ProjectResourceRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM project_resources WHERE service_id = $1 ORDER BY name",
        )
        .bind(service_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(project_resource_from_row)
            .collect::<Result<_, sqlx::Error>>()
            .map_err(StoreError::from)
    }

    async fn project_rates(&self, service_id: i64) -> Result<Vec<ProjectRateRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, service_id, name, usage_as_bigint FROM project_rates \
             WHERE service_id = $1 ORDER BY name",
        )
        .bind(service_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(ProjectRateRow {
                    id: row.try_get("id")?,
                    service_id: row.try_get("service_id")?,
                    name: row.try_get("name")?,
                    usage_as_bigint: row.try_get("usage_as_bigint")?,
                })
            })
            .collect::<Result<_, sqlx::Error>>()
            .map_err(StoreError::from)
    }

    async fn write_scrape_success(
        &self,
        service_id: i64,
        outcome: ScrapeSuccess,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET LOCAL idle_in_transaction_session_timeout = '5s'")
            .execute(&mut *tx)
            .await?;

        for upsert in &outcome.resources {
            upsert_project_resource(&mut tx, service_id, upsert).await?;
        }
        let declared: Vec<String> = outcome.resources.iter().map(|r| r.name.clone()).collect();
        sqlx::query("DELETE FROM project_resources WHERE service_id = $1 AND name <> ALL($2)")
            .bind(service_id)
            .bind(&declared)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE project_services SET \
                 scraped_at = $2, checked_at = $2, stale = FALSE, \
                 scrape_error_message = '', scrape_duration_secs = $3, \
                 serialized_metrics = $4 \
             WHERE id = $1",
        )
        .bind(service_id)
        .bind(outcome.completed_at)
        .bind(outcome.duration_secs)
        .bind(&outcome.serialized_metrics)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn write_scrape_failure(
        &self,
        service_id: i64,
        outcome: ScrapeFailure,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET LOCAL idle_in_transaction_session_timeout = '5s'")
            .execute(&mut *tx)
            .await?;

        if let Some(dummies) = &outcome.first_time_dummies {
            for upsert in dummies {
                // Seeded rows keep their quota; only the backend view is
                // stamped as unknown.
                sqlx::query(
                    "INSERT INTO project_resources \
                         (service_id, name, quota, usage, backend_quota) \
                     VALUES ($1, $2, $3, $4, $5) \
                     ON CONFLICT (service_id, name) DO UPDATE SET \
                         backend_quota = EXCLUDED.backend_quota",
                )
                .bind(service_id)
                .bind(&upsert.name)
                .bind(upsert.quota.map(|q| q as i64))
                .bind(upsert.usage as i64)
                .bind(upsert.backend_quota)
                .execute(&mut *tx)
                .await?;
            }
            sqlx::query("UPDATE project_services SET scraped_at = $2 WHERE id = $1")
                .bind(service_id)
                .bind(unix_epoch())
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            "UPDATE project_services SET \
                 checked_at = $2, stale = FALSE, scrape_error_message = $3, \
                 scrape_duration_secs = $4 \
             WHERE id = $1",
        )
        .bind(service_id)
        .bind(outcome.checked_at)
        .bind(&outcome.error_message)
        .bind(outcome.duration_secs)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn write_rates_success(
        &self,
        service_id: i64,
        outcome: RatesSuccess,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET LOCAL idle_in_transaction_session_timeout = '5s'")
            .execute(&mut *tx)
            .await?;

        for (name, usage) in &outcome.rates {
            sqlx::query(
                "INSERT INTO project_rates (service_id, name, usage_as_bigint) \
                 VALUES ($1, $2, $3) \
                 ON CONFLICT (service_id, name) DO UPDATE SET \
                     usage_as_bigint = EXCLUDED.usage_as_bigint",
            )
            .bind(service_id)
            .bind(name)
            .bind(usage)
            .execute(&mut *tx)
            .await?;
        }
        let declared: Vec<String> = outcome.rates.iter().map(|(name, _)| name.clone()).collect();
        sqlx::query("DELETE FROM project_rates WHERE service_id = $1 AND name <> ALL($2)")
            .bind(service_id)
            .bind(&declared)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE project_services SET \
                 rates_scraped_at = $2, rates_checked_at = $2, rates_stale = FALSE, \
                 rates_scrape_error_message = '', rates_scrape_duration_secs = $3, \
                 rates_scrape_state = $4 \
             WHERE id = $1",
        )
        .bind(service_id)
        .bind(outcome.completed_at)
        .bind(outcome.duration_secs)
        .bind(&outcome.scrape_state)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn write_rates_failure(
        &self,
        service_id: i64,
        outcome: RatesFailure,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE project_services SET \
                 rates_checked_at = $2, rates_stale = FALSE, \
                 rates_scrape_error_message = $3, rates_scrape_duration_secs = $4 \
             WHERE id = $1",
        )
        .bind(service_id)
        .bind(outcome.checked_at)
        .bind(&outcome.error_message)
        .bind(outcome.duration_secs)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_desired_backend_quota(
        &self,
        service_id: i64,
        values: &[(String, i64)],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for (name, desired) in values {
            sqlx::query(
                "UPDATE project_resources SET desired_backend_quota = $3 \
                 WHERE service_id = $1 AND name = $2",
            )
            .bind(service_id)
            .bind(name)
            .bind(desired)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn set_backend_quota(
        &self,
        service_id: i64,
        values: &[(String, i64)],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for (name, quota) in values {
            sqlx::query(
                "UPDATE project_resources SET backend_quota = $3 \
                 WHERE service_id = $1 AND name = $2",
            )
            .bind(service_id)
            .bind(name)
            .bind(quota)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn scrape_age_extremes(
        &self,
        cluster_id: &str,
    ) -> Result<Vec<ScrapeAgeRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT ps.type, MIN(ps.scraped_at) AS oldest, MAX(ps.scraped_at) AS newest \
             FROM project_services ps \
             JOIN projects p ON p.id = ps.project_id \
             JOIN domains d ON d.id = p.domain_id \
             WHERE d.cluster_id = $1 GROUP BY ps.type ORDER BY ps.type",
        )
        .bind(cluster_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(ScrapeAgeRow {
                    service_type: row.try_get("type")?,
                    oldest_scraped_at: row.try_get("oldest")?,
                    newest_scraped_at: row.try_get("newest")?,
                })
            })
            .collect::<Result<_, sqlx::Error>>()
            .map_err(StoreError::from)
    }

    async fn capacity_report(
        &self,
        cluster_id: &str,
    ) -> Result<Vec<CapacityReportRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT cs.type, cs.scraped_at, cr.name, cr.capacity, cr.capacity_per_az, \
                    cr.subcapacities, cr.comment \
             FROM cluster_resources cr \
             JOIN cluster_services cs ON cs.id = cr.service_id \
             WHERE cs.cluster_id = $1 ORDER BY cs.type, cr.name",
        )
        .bind(cluster_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(CapacityReportRow {
                    service_type: row.try_get("type")?,
                    resource_name: row.try_get("name")?,
                    capacity: row.try_get::<i64, _>("capacity")?.max(0) as u64,
                    capacity_per_az: row.try_get("capacity_per_az")?,
                    subcapacities: row.try_get("subcapacities")?,
                    comment: row.try_get("comment")?,
                    scraped_at: row.try_get("scraped_at")?,
                })
            })
            .collect::<Result<_, sqlx::Error>>()
            .map_err(StoreError::from)
    }

    async fn domain_report(&self, cluster_id: &str) -> Result<Vec<DomainReportRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT d.name AS domain_name, d.uuid AS domain_uuid, ds.type, \
                    dr.name AS resource_name, dr.quota \
             FROM domain_resources dr \
             JOIN domain_services ds ON ds.id = dr.service_id \
             JOIN domains d ON d.id = ds.domain_id \
             WHERE d.cluster_id = $1 ORDER BY d.name, ds.type, dr.name",
        )
        .bind(cluster_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(DomainReportRow {
                    domain_name: row.try_get("domain_name")?,
                    domain_uuid: row.try_get("domain_uuid")?,
                    service_type: row.try_get("type")?,
                    resource_name: row.try_get("resource_name")?,
                    quota: row.try_get::<i64, _>("quota")?.max(0) as u64,
                })
            })
            .collect::<Result<_, sqlx::Error>>()
            .map_err(StoreError::from)
    }

    async fn project_report(&self, cluster_id: &str) -> Result<Vec<ProjectReportRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT d.name AS domain_name, d.uuid AS domain_uuid, \
                    p.name AS project_name, p.uuid AS project_uuid, \
                    ps.type, pr.name AS resource_name, pr.quota, pr.usage, \
                    pr.physical_usage, pr.backend_quota, pr.desired_backend_quota \
             FROM project_resources pr \
             JOIN project_services ps ON ps.id = pr.service_id \
             JOIN projects p ON p.id = ps.project_id \
             JOIN domains d ON d.id = p.domain_id \
             WHERE d.cluster_id = $1 ORDER BY d.name, p.name, ps.type, pr.name",
        )
        .bind(cluster_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(ProjectReportRow {
                    domain_name: row.try_get("domain_name")?,
                    domain_uuid: row.try_get("domain_uuid")?,
                    project_name: row.try_get("project_name")?,
                    project_uuid: row.try_get("project_uuid")?,
                    service_type: row.try_get("type")?,
                    resource_name: row.try_get("resource_name")?,
                    quota: row.try_get::<Option<i64>, _>("quota")?.map(|q| q.max(0) as u64),
                    usage: row.try_get::<i64, _>("usage")?.max(0) as u64,
                    physical_usage: row
                        .try_get::<Option<i64>, _>("physical_usage")?
                        .map(|u| u.max(0) as u64),
                    backend_quota: row.try_get("backend_quota")?,
                    desired_backend_quota: row.try_get("desired_backend_quota")?,
                })
            })
            .collect::<Result<_, sqlx::Error>>()
            .map_err(StoreError::from)
    }
}

impl PgStore {
    async fn load_target_context(
        &self,
        service: ProjectServiceRow,
    ) -> Result<ScrapeTarget, StoreError> {
        let project_row = sqlx::query(
            "SELECT id, domain_id, name, uuid, parent_uuid, has_bursting \
             FROM projects WHERE id = $1",
        )
        .bind(service.project_id)
        .fetch_one(&self.pool)
        .await?;
        let project = project_from_row(&project_row)?;
        let domain_row = sqlx::query("SELECT id, cluster_id, name, uuid FROM domains WHERE id = $1")
            .bind(project.domain_id)
            .fetch_one(&self.pool)
            .await?;
        let domain = domain_from_row(&domain_row)?;
        Ok(ScrapeTarget {
            service,
            project,
            domain,
        })
    }
}
