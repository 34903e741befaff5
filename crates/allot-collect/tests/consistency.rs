mod common;

use allot_collect::{consistency, discovery, scrape};
use allot_core::constraints::QuotaConstraintSet;
use allot_store::Store;

use common::{build, constraints, rebuild, service_id, CLUSTER};

#[tokio::test]
async fn cluster_services_match_the_enabled_set() {
    let fixture = build(false, QuotaConstraintSet::default());
    consistency::check_consistency_once(&fixture.ctx).await.unwrap();

    let services = fixture.store.cluster_services(CLUSTER).await.unwrap();
    assert_eq!(
        services.iter().map(|s| s.service_type.as_str()).collect::<Vec<_>>(),
        vec!["shared", "unshared"]
    );
}

#[tokio::test]
async fn missing_project_resource_mandated_by_constraint_is_seeded() {
    // The constraint appears only after discovery has run, the way an
    // operator would add it for an existing project.
    let fixture = build(false, QuotaConstraintSet::default());
    discovery::discover_once(&fixture.ctx).await.unwrap();

    let dresden_shared = service_id(&fixture.store, CLUSTER, "uuid-for-dresden", "shared").await;
    assert!(fixture
        .store
        .project_resources(dresden_shared)
        .await
        .unwrap()
        .is_empty());

    // Same store, new constraint set.
    let ctx = rebuild(
        common::cluster_config(false),
        fixture.store.clone(),
        constraints(
            r#"
projects:
  germany/dresden:
    shared:
      capacity: { minimum: 10 }
"#,
        ),
    );

    consistency::check_consistency_once(&ctx).await.unwrap();

    let resources = fixture.store.project_resources(dresden_shared).await.unwrap();
    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0].name, "capacity");
    assert_eq!(resources[0].quota, Some(10));
}

#[tokio::test]
async fn violated_project_constraint_marks_stale_and_scrape_corrects() {
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
    scrape::run_scrape_loop(&fixture.ctx, "unshared", allot_collect::LoopMode::Once).await;

    let berlin = service_id(&fixture.store, CLUSTER, "uuid-for-berlin", "unshared").await;
    // Out-of-band, the quota drops below the constraint minimum.
    fixture
        .store
        .set_project_quota(berlin, "capacity", 3)
        .await
        .unwrap();

    consistency::check_consistency_once(&fixture.ctx).await.unwrap();

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
    // Consistency never corrects inline; it only marks the service stale.
    assert!(service.stale);
    let resources = fixture.store.project_resources(berlin).await.unwrap();
    assert_eq!(resources[0].quota, Some(3));

    // The stale scrape then corrects the quota under the constraint rules.
    let outcome = scrape::scrape_next(&fixture.ctx, "unshared").await.unwrap();
    assert_eq!(outcome, scrape::WorkerOutcome::Worked);
    let resources = fixture.store.project_resources(berlin).await.unwrap();
    assert_eq!(resources[0].quota, Some(30));
}

#[tokio::test]
async fn consistency_twice_in_a_row_is_a_noop() {
    let fixture = build(
        false,
        constraints(
            r#"
domains:
  germany:
    shared:
      capacity: { minimum: 100 }
projects:
  germany/dresden:
    shared:
      capacity: { minimum: 10 }
"#,
        ),
    );
    discovery::discover_once(&fixture.ctx).await.unwrap();
    consistency::check_consistency_once(&fixture.ctx).await.unwrap();

    let domains_before = fixture.store.domain_report(CLUSTER).await.unwrap();
    let projects_before = fixture.store.project_report(CLUSTER).await.unwrap();
    assert!(!domains_before.is_empty());

    consistency::check_consistency_once(&fixture.ctx).await.unwrap();
    assert_eq!(fixture.store.domain_report(CLUSTER).await.unwrap(), domains_before);
    assert_eq!(fixture.store.project_report(CLUSTER).await.unwrap(), projects_before);
}

#[tokio::test]
async fn domain_quota_below_constraint_is_adjusted_directly() {
    let fixture = build(
        false,
        constraints(
            r#"
domains:
  germany:
    shared:
      capacity: { minimum: 100 }
"#,
        ),
    );
    discovery::discover_once(&fixture.ctx).await.unwrap();
    consistency::check_consistency_once(&fixture.ctx).await.unwrap();

    let report = fixture.store.domain_report(CLUSTER).await.unwrap();
    let germany_capacity = report
        .iter()
        .find(|r| r.domain_name == "germany" && r.resource_name == "capacity")
        .unwrap();
    assert_eq!(germany_capacity.quota, 100);
}

#[tokio::test]
async fn disabled_service_types_are_removed_from_projects() {
    let fixture = build(false, QuotaConstraintSet::default());
    discovery::discover_once(&fixture.ctx).await.unwrap();

    // The unshared service is decommissioned.
    let mut config = common::cluster_config(false);
    config.services.retain(|s| s.service_type != "unshared");
    let ctx = rebuild(config, fixture.store.clone(), QuotaConstraintSet::default());

    consistency::check_consistency_once(&ctx).await.unwrap();

    let (_, project) = fixture
        .store
        .project_by_uuid(CLUSTER, "uuid-for-berlin")
        .await
        .unwrap()
        .unwrap();
    let services = fixture.store.project_services(project.id).await.unwrap();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].service_type, "shared");
}
