use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};

use allot_core::clock::unix_epoch;
use allot_core::config::TimingConfig;
use allot_core::models::{KeystoneDomain, KeystoneProject};
use allot_store::ops::{
    CapacityPass, CapacityResourceUpdate, CapacitorUpsert, NewProjectService, ResourceUpsert,
    ScrapeFailure, ScrapeSuccess,
};
use allot_store::rows::MANUAL_COMMENT;
use allot_store::{MemStore, Store};

const CLUSTER: &str = "west";

fn at(secs: i64) -> DateTime<Utc> {
    DateTime::UNIX_EPOCH + TimeDelta::seconds(secs)
}

fn upsert(name: &str, quota: u64, usage: u64, backend_quota: i64) -> ResourceUpsert {
    ResourceUpsert {
        name: name.to_string(),
        quota: Some(quota),
        usage,
        physical_usage: None,
        backend_quota: Some(backend_quota),
        desired_backend_quota: None,
        subresources: String::new(),
    }
}

async fn seed_project(store: &MemStore, domain: &str, project: &str) -> (i64, i64) {
    let domain_row = store
        .create_domain(
            CLUSTER,
            &KeystoneDomain {
                uuid: format!("uuid-for-{domain}"),
                name: domain.to_string(),
            },
        )
        .await
        .unwrap();
    let project_row = store
        .create_project(
            domain_row.id,
            &KeystoneProject {
                uuid: format!("uuid-for-{project}"),
                name: project.to_string(),
                parent_uuid: domain_row.uuid.clone(),
            },
            &[NewProjectService {
                service_type: "shared".to_string(),
                initial_resources: vec![],
            }],
        )
        .await
        .unwrap();
    let services = store.project_services(project_row.id).await.unwrap();
    (project_row.id, services[0].id)
}

#[tokio::test]
async fn never_scraped_services_are_selected_first() {
    let store = MemStore::new();
    let timing = TimingConfig::default();
    let (_, service_id) = seed_project(&store, "germany", "berlin").await;

    let target = store
        .next_scrape_target(CLUSTER, "shared", at(1000), &timing)
        .await
        .unwrap()
        .expect("a never-scraped service is always due");
    assert_eq!(target.service.id, service_id);
    assert_eq!(target.project.name, "berlin");
    assert_eq!(target.domain.name, "germany");
}

#[tokio::test]
async fn freshly_scraped_services_are_not_due() {
    let store = MemStore::new();
    let timing = TimingConfig::default();
    let (_, service_id) = seed_project(&store, "germany", "berlin").await;

    store
        .write_scrape_success(
            service_id,
            ScrapeSuccess {
                resources: vec![upsert("capacity", 0, 0, 100)],
                duration_secs: 0.1,
                serialized_metrics: String::new(),
                completed_at: at(1000),
            },
        )
        .await
        .unwrap();

    // Within the 30 min scrape interval: nothing to do.
    let target = store
        .next_scrape_target(CLUSTER, "shared", at(1010), &timing)
        .await
        .unwrap();
    assert!(target.is_none());

    // After the scrape interval has passed, the service is due again.
    let target = store
        .next_scrape_target(CLUSTER, "shared", at(1000 + 1801), &timing)
        .await
        .unwrap();
    assert_eq!(target.unwrap().service.id, service_id);
}

#[tokio::test]
async fn stale_beats_older_checked_at() {
    let store = MemStore::new();
    let timing = TimingConfig::default();
    let (_, old_service) = seed_project(&store, "germany", "berlin").await;
    let (fresh_project, fresh_service) = seed_project(&store, "germany2", "dresden").await;

    // berlin was checked long ago; dresden just now, but is marked stale.
    store
        .write_scrape_success(
            old_service,
            ScrapeSuccess {
                resources: vec![],
                duration_secs: 0.1,
                serialized_metrics: String::new(),
                completed_at: at(0),
            },
        )
        .await
        .unwrap();
    store
        .write_scrape_success(
            fresh_service,
            ScrapeSuccess {
                resources: vec![],
                duration_secs: 0.1,
                serialized_metrics: String::new(),
                completed_at: at(5000),
            },
        )
        .await
        .unwrap();
    store
        .apply_project_reconciliation(
            fresh_project,
            allot_store::ops::ProjectReconciliation {
                mark_stale: vec![fresh_service],
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let target = store
        .next_scrape_target(CLUSTER, "shared", at(10_000), &timing)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(target.service.id, fresh_service);
}

#[tokio::test]
async fn recheck_applies_only_after_failed_checks() {
    let store = MemStore::new();
    let timing = TimingConfig::default();
    let (_, service_id) = seed_project(&store, "germany", "berlin").await;

    store
        .write_scrape_success(
            service_id,
            ScrapeSuccess {
                resources: vec![],
                duration_secs: 0.1,
                serialized_metrics: String::new(),
                completed_at: at(1000),
            },
        )
        .await
        .unwrap();
    // A failed check moves checked_at past scraped_at.
    store
        .write_scrape_failure(
            service_id,
            ScrapeFailure {
                checked_at: at(1100),
                duration_secs: 0.1,
                error_message: "backend error: 502".to_string(),
                first_time_dummies: None,
            },
        )
        .await
        .unwrap();

    // Before the recheck interval elapses, not due.
    assert!(store
        .next_scrape_target(CLUSTER, "shared", at(1200), &timing)
        .await
        .unwrap()
        .is_none());
    // After 5 min since the failed check, due again.
    let target = store
        .next_scrape_target(CLUSTER, "shared", at(1100 + 301), &timing)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(target.service.id, service_id);
    // scraped_at was not touched by the failure.
    assert_eq!(target.service.scraped_at, Some(at(1000)));
    assert_eq!(target.service.scrape_error_message, "backend error: 502");
}

#[tokio::test]
async fn scrape_success_prunes_undeclared_resources() {
    let store = MemStore::new();
    let (_, service_id) = seed_project(&store, "germany", "berlin").await;

    store
        .write_scrape_success(
            service_id,
            ScrapeSuccess {
                resources: vec![upsert("capacity", 0, 0, 100), upsert("things", 0, 2, 42)],
                duration_secs: 0.1,
                serialized_metrics: String::new(),
                completed_at: at(1000),
            },
        )
        .await
        .unwrap();
    store
        .write_scrape_success(
            service_id,
            ScrapeSuccess {
                resources: vec![upsert("capacity", 0, 0, 100)],
                duration_secs: 0.1,
                serialized_metrics: String::new(),
                completed_at: at(2000),
            },
        )
        .await
        .unwrap();

    let resources = store.project_resources(service_id).await.unwrap();
    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0].name, "capacity");
}

#[tokio::test]
async fn first_failure_dummies_pin_scraped_at_to_epoch_and_keep_seeded_quota() {
    let store = MemStore::new();
    let domain = store
        .create_domain(
            CLUSTER,
            &KeystoneDomain {
                uuid: "uuid-for-germany".to_string(),
                name: "germany".to_string(),
            },
        )
        .await
        .unwrap();
    let project = store
        .create_project(
            domain.id,
            &KeystoneProject {
                uuid: "uuid-for-dresden".to_string(),
                name: "dresden".to_string(),
                parent_uuid: domain.uuid.clone(),
            },
            &[NewProjectService {
                service_type: "shared".to_string(),
                // Seeded by a constraint minimum at discovery time.
                initial_resources: vec![("capacity".to_string(), 10)],
            }],
        )
        .await
        .unwrap();
    let service_id = store.project_services(project.id).await.unwrap()[0].id;

    store
        .write_scrape_failure(
            service_id,
            ScrapeFailure {
                checked_at: at(50),
                duration_secs: 0.1,
                error_message: "endpoint not found in service catalog: shared".to_string(),
                first_time_dummies: Some(vec![
                    ResourceUpsert {
                        name: "capacity".to_string(),
                        quota: Some(0),
                        usage: 0,
                        physical_usage: None,
                        backend_quota: Some(-1),
                        desired_backend_quota: None,
                        subresources: String::new(),
                    },
                    ResourceUpsert {
                        name: "things".to_string(),
                        quota: Some(0),
                        usage: 0,
                        physical_usage: None,
                        backend_quota: Some(-1),
                        desired_backend_quota: None,
                        subresources: String::new(),
                    },
                ]),
            },
        )
        .await
        .unwrap();

    let services = store.project_services(project.id).await.unwrap();
    assert_eq!(services[0].scraped_at, Some(unix_epoch()));
    assert!(!services[0].scrape_error_message.is_empty());

    let resources = store.project_resources(service_id).await.unwrap();
    assert_eq!(resources.len(), 2);
    // The seeded row keeps its constraint-derived quota.
    assert_eq!(resources[0].name, "capacity");
    assert_eq!(resources[0].quota, Some(10));
    assert_eq!(resources[0].backend_quota, Some(-1));
    // The fresh dummy starts at zero.
    assert_eq!(resources[1].name, "things");
    assert_eq!(resources[1].quota, Some(0));
    assert_eq!(resources[1].backend_quota, Some(-1));
}

#[tokio::test]
async fn deleting_a_domain_cascades_to_all_descendants() {
    let store = MemStore::new();
    let (_, service_id) = seed_project(&store, "germany", "berlin").await;
    store
        .write_scrape_success(
            service_id,
            ScrapeSuccess {
                resources: vec![upsert("capacity", 0, 0, 100)],
                duration_secs: 0.1,
                serialized_metrics: String::new(),
                completed_at: at(1000),
            },
        )
        .await
        .unwrap();

    let domain_id = store.domains(CLUSTER).await.unwrap()[0].id;
    store.delete_domain(domain_id).await.unwrap();

    assert!(store.domains(CLUSTER).await.unwrap().is_empty());
    assert!(store.project_resources(service_id).await.unwrap().is_empty());
    assert!(store.project_report(CLUSTER).await.unwrap().is_empty());
}

#[tokio::test]
async fn sync_cluster_services_drops_disabled_types() {
    let store = MemStore::new();
    let enabled: Vec<String> = vec!["shared".to_string(), "unshared".to_string()];
    store.sync_cluster_services(CLUSTER, &enabled).await.unwrap();
    assert_eq!(store.cluster_services(CLUSTER).await.unwrap().len(), 2);

    // Shrink the enabled set; the stale row and its resources go away.
    let enabled: Vec<String> = vec!["shared".to_string()];
    store.sync_cluster_services(CLUSTER, &enabled).await.unwrap();
    let services = store.cluster_services(CLUSTER).await.unwrap();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].service_type, "shared");

    // Idempotent: a second run changes nothing.
    let before = store.cluster_services(CLUSTER).await.unwrap();
    store.sync_cluster_services(CLUSTER, &enabled).await.unwrap();
    assert_eq!(store.cluster_services(CLUSTER).await.unwrap(), before);
}

fn capacity_pass(
    values: BTreeMap<String, BTreeMap<String, CapacityResourceUpdate>>,
    scraped_at: DateTime<Utc>,
) -> CapacityPass {
    CapacityPass {
        capacitors: vec![CapacitorUpsert {
            capacitor_id: "unittest".to_string(),
            scraped_at,
            scrape_duration_secs: 0.2,
            serialized_metrics: String::new(),
        }],
        configured_capacitor_ids: vec!["unittest".to_string()],
        values,
        scraped_at,
    }
}

fn flat(capacity: u64) -> CapacityResourceUpdate {
    CapacityResourceUpdate {
        capacity,
        capacity_per_az: None,
        subcapacities: String::new(),
    }
}

#[tokio::test]
async fn capacity_pass_preserves_unreported_manual_rows() {
    let store = MemStore::new();
    store
        .sync_cluster_services(CLUSTER, &["shared".to_string()])
        .await
        .unwrap();
    store
        .put_cluster_resource(CLUSTER, "shared", "capacity", 999, MANUAL_COMMENT)
        .await
        .unwrap();

    let mut values = BTreeMap::new();
    values.insert(
        "shared".to_string(),
        [("things".to_string(), flat(42))].into_iter().collect(),
    );
    store
        .write_capacity_pass(CLUSTER, capacity_pass(values, at(100)))
        .await
        .unwrap();

    let report = store.capacity_report(CLUSTER).await.unwrap();
    assert_eq!(report.len(), 2);
    assert_eq!(report[0].resource_name, "capacity");
    assert_eq!(report[0].comment, MANUAL_COMMENT);
    assert_eq!(report[0].capacity, 999);
    assert_eq!(report[1].resource_name, "things");
    assert_eq!(report[1].capacity, 42);

    // Once a plugin starts reporting the resource, the manual row is
    // overwritten and its comment cleared.
    let mut values = BTreeMap::new();
    values.insert(
        "shared".to_string(),
        [
            ("capacity".to_string(), flat(7)),
            ("things".to_string(), flat(42)),
        ]
        .into_iter()
        .collect(),
    );
    store
        .write_capacity_pass(CLUSTER, capacity_pass(values, at(200)))
        .await
        .unwrap();

    let report = store.capacity_report(CLUSTER).await.unwrap();
    assert_eq!(report[0].resource_name, "capacity");
    assert_eq!(report[0].capacity, 7);
    assert_eq!(report[0].comment, "");
}

#[tokio::test]
async fn capacity_pass_drops_unconfigured_capacitors() {
    let store = MemStore::new();
    let mut pass = capacity_pass(BTreeMap::new(), at(100));
    pass.capacitors.push(CapacitorUpsert {
        capacitor_id: "legacy".to_string(),
        scraped_at: at(100),
        scrape_duration_secs: 0.1,
        serialized_metrics: String::new(),
    });
    pass.configured_capacitor_ids.push("legacy".to_string());
    store.write_capacity_pass(CLUSTER, pass).await.unwrap();
    assert_eq!(store.cluster_capacitors(CLUSTER).await.unwrap().len(), 2);

    // "legacy" is no longer configured: its row is deleted.
    store
        .write_capacity_pass(CLUSTER, capacity_pass(BTreeMap::new(), at(200)))
        .await
        .unwrap();
    let capacitors = store.cluster_capacitors(CLUSTER).await.unwrap();
    assert_eq!(capacitors.len(), 1);
    assert_eq!(capacitors[0].capacitor_id, "unittest");
}
