mod common;

use allot_collect::scrape::{self, WorkerOutcome};
use allot_collect::{discovery, LoopMode};
use allot_core::clock::unix_epoch;
use allot_core::constraints::QuotaConstraintSet;
use allot_core::models::{ResourceData, ResourceInfo};
use allot_plugins::PluginError;
use allot_store::ops::ProjectReconciliation;
use allot_store::Store;

use common::{build, constraints, service_id, CLUSTER};

#[tokio::test]
async fn first_scrape_records_backend_data_and_rescrape_within_interval_is_a_noop() {
    let fixture = build(false, QuotaConstraintSet::default());
    discovery::discover_once(&fixture.ctx).await.unwrap();

    scrape::run_scrape_loop(&fixture.ctx, "unshared", LoopMode::Once).await;

    let berlin = service_id(&fixture.store, CLUSTER, "uuid-for-berlin", "unshared").await;
    let resources = fixture.store.project_resources(berlin).await.unwrap();
    assert_eq!(resources.len(), 2);
    assert_eq!(resources[0].name, "capacity");
    assert_eq!(resources[0].quota, Some(0));
    assert_eq!(resources[0].backend_quota, Some(100));
    assert_eq!(resources[0].usage, 0);
    assert_eq!(resources[1].name, "things");
    assert_eq!(resources[1].quota, Some(0));
    assert_eq!(resources[1].backend_quota, Some(42));
    assert_eq!(resources[1].usage, 2);

    let (_, project) = fixture
        .store
        .project_by_uuid(CLUSTER, "uuid-for-berlin")
        .await
        .unwrap()
        .unwrap();
    let service = fixture
        .store
        .project_services(project.id)
        .await
        .unwrap()
        .into_iter()
        .find(|s| s.service_type == "unshared")
        .unwrap();
    assert!(service.scraped_at.is_some());
    assert_eq!(service.scraped_at, service.checked_at);
    assert!(!service.stale);
    assert_eq!(service.scrape_error_message, "");
    assert!(service.serialized_metrics.contains("scrape_count"));

    // Within the scrape interval nothing is due, and nothing changes.
    let before = fixture.store.project_resources(berlin).await.unwrap();
    let outcome = scrape::scrape_next(&fixture.ctx, "unshared").await.unwrap();
    assert_eq!(outcome, WorkerOutcome::Idle);
    assert_eq!(fixture.store.project_resources(berlin).await.unwrap(), before);
}

#[tokio::test]
async fn auto_approval_adopts_the_backend_quota_exactly_once() {
    use std::sync::Arc;
    // capacity auto-approves at 100, which is exactly what the unittest
    // plugin reports as the backend quota.
    let unshared = Arc::new(
        allot_plugins::unittest::UnitTestQuotaPlugin::new("unshared").with_resources(vec![
            ResourceInfo {
                auto_approve_initial_quota: Some(100),
                ..ResourceInfo::new("capacity")
            },
            ResourceInfo::new("things"),
        ]),
    );
    let shared = Arc::new(allot_plugins::unittest::UnitTestQuotaPlugin::new("shared"));
    let fixture = common::build_with_plugins(
        common::cluster_config(false),
        Default::default(),
        QuotaConstraintSet::default(),
        shared,
        unshared,
        Vec::new(),
    );

    discovery::discover_once(&fixture.ctx).await.unwrap();
    let outcome = scrape::scrape_next(&fixture.ctx, "unshared").await.unwrap();
    assert_eq!(outcome, WorkerOutcome::Worked);

    let berlin = service_id(&fixture.store, CLUSTER, "uuid-for-berlin", "unshared").await;
    let resources = fixture.store.project_resources(berlin).await.unwrap();
    // The backend reported exactly the auto-approval value: adopted.
    assert_eq!(resources[0].name, "capacity");
    assert_eq!(resources[0].quota, Some(100));

    // A later change of the backend quota does not alter the stored quota:
    // auto-approval only fires while the stored quota is zero.
    fixture.unshared.set_resource_data(
        "capacity",
        ResourceData {
            quota: 100,
            usage: 7,
            ..ResourceData::default()
        },
    );
    fixture
        .store
        .apply_project_reconciliation(
            fixture
                .store
                .project_by_uuid(CLUSTER, "uuid-for-berlin")
                .await
                .unwrap()
                .unwrap()
                .1
                .id,
            ProjectReconciliation {
                mark_stale: vec![berlin],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let outcome = scrape::scrape_next(&fixture.ctx, "unshared").await.unwrap();
    assert_eq!(outcome, WorkerOutcome::Worked);

    let resources = fixture.store.project_resources(berlin).await.unwrap();
    assert_eq!(resources[0].quota, Some(100));
    assert_eq!(resources[0].usage, 7);
}

#[tokio::test]
async fn constraints_are_applied_to_the_stored_quota_on_scrape() {
    let fixture = build(
        false,
        constraints(
            r#"
projects:
  germany/berlin:
    unshared:
      capacity: { minimum: 30 }
"#,
        ),
    );
    discovery::discover_once(&fixture.ctx).await.unwrap();

    // berlin is the first unshared target (lowest service id).
    let outcome = scrape::scrape_next(&fixture.ctx, "unshared").await.unwrap();
    assert_eq!(outcome, WorkerOutcome::Worked);

    let berlin = service_id(&fixture.store, CLUSTER, "uuid-for-berlin", "unshared").await;
    let resources = fixture.store.project_resources(berlin).await.unwrap();
    assert_eq!(resources[0].name, "capacity");
    assert_eq!(resources[0].quota, Some(30));
    assert_eq!(resources[1].name, "things");
    assert_eq!(resources[1].quota, Some(0));
}

#[tokio::test]
async fn transient_failure_keeps_scraped_at_and_records_the_error() {
    let fixture = build(false, QuotaConstraintSet::default());
    discovery::discover_once(&fixture.ctx).await.unwrap();
    scrape::run_scrape_loop(&fixture.ctx, "unshared", LoopMode::Once).await;

    let berlin = service_id(&fixture.store, CLUSTER, "uuid-for-berlin", "unshared").await;
    let before = fixture
        .store
        .project_by_uuid(CLUSTER, "uuid-for-berlin")
        .await
        .unwrap()
        .unwrap();
    let before_service = fixture
        .store
        .project_services(before.1.id)
        .await
        .unwrap()
        .into_iter()
        .find(|s| s.id == berlin)
        .unwrap();

    // Force the next scrape (of berlin) to fail transiently.
    fixture
        .store
        .apply_project_reconciliation(
            before.1.id,
            ProjectReconciliation {
                mark_stale: vec![berlin],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    fixture
        .unshared
        .fail_next_scrape(PluginError::Backend("502 bad gateway".to_string()));

    let outcome = scrape::scrape_next(&fixture.ctx, "unshared").await.unwrap();
    assert_eq!(outcome, WorkerOutcome::Failed);

    let service = fixture
        .store
        .project_services(before.1.id)
        .await
        .unwrap()
        .into_iter()
        .find(|s| s.id == berlin)
        .unwrap();
    // scraped_at untouched, checked_at advanced, stale cleared, error set.
    assert_eq!(service.scraped_at, before_service.scraped_at);
    assert!(service.checked_at > before_service.checked_at);
    assert!(!service.stale);
    assert!(service.scrape_error_message.contains("502"));
}

#[tokio::test]
async fn endpoint_not_found_on_first_scrape_writes_dummies_and_suspends() {
    let fixture = build(
        false,
        constraints(
            r#"
projects:
  germany/berlin:
    unshared:
      capacity: { minimum: 10 }
"#,
        ),
    );
    discovery::discover_once(&fixture.ctx).await.unwrap();

    fixture
        .unshared
        .fail_next_scrape(PluginError::EndpointNotFound("unshared".to_string()));
    let outcome = scrape::scrape_next(&fixture.ctx, "unshared").await.unwrap();
    assert_eq!(outcome, WorkerOutcome::Suspended);

    let berlin = service_id(&fixture.store, CLUSTER, "uuid-for-berlin", "unshared").await;
    let (_, project) = fixture
        .store
        .project_by_uuid(CLUSTER, "uuid-for-berlin")
        .await
        .unwrap()
        .unwrap();
    let service = fixture
        .store
        .project_services(project.id)
        .await
        .unwrap()
        .into_iter()
        .find(|s| s.id == berlin)
        .unwrap();
    // The epoch sentinel: sorts after genuinely new work, retried
    // eventually.
    assert_eq!(service.scraped_at, Some(unix_epoch()));
    assert!(service
        .scrape_error_message
        .contains("endpoint not found"));

    let resources = fixture.store.project_resources(berlin).await.unwrap();
    assert_eq!(resources.len(), 2);
    assert_eq!(resources[0].name, "capacity");
    assert_eq!(resources[0].quota, Some(10));
    assert_eq!(resources[0].backend_quota, Some(-1));
    assert_eq!(resources[1].name, "things");
    assert_eq!(resources[1].quota, Some(0));
    assert_eq!(resources[1].backend_quota, Some(-1));

    // The never-scraped dresden sorts before the epoch-stamped berlin.
    let outcome = scrape::scrape_next(&fixture.ctx, "unshared").await.unwrap();
    assert_eq!(outcome, WorkerOutcome::Worked);
    let dresden = service_id(&fixture.store, CLUSTER, "uuid-for-dresden", "unshared").await;
    let (_, dresden_project) = fixture
        .store
        .project_by_uuid(CLUSTER, "uuid-for-dresden")
        .await
        .unwrap()
        .unwrap();
    let dresden_service = fixture
        .store
        .project_services(dresden_project.id)
        .await
        .unwrap()
        .into_iter()
        .find(|s| s.id == dresden)
        .unwrap();
    assert!(dresden_service.scraped_at > Some(unix_epoch()));
}

#[tokio::test]
async fn resources_no_longer_declared_are_pruned_and_new_ones_inserted() {
    let fixture = build(false, QuotaConstraintSet::default());
    discovery::discover_once(&fixture.ctx).await.unwrap();
    let outcome = scrape::scrape_next(&fixture.ctx, "unshared").await.unwrap();
    assert_eq!(outcome, WorkerOutcome::Worked);

    let berlin = service_id(&fixture.store, CLUSTER, "uuid-for-berlin", "unshared").await;
    assert_eq!(fixture.store.project_resources(berlin).await.unwrap().len(), 2);
}
