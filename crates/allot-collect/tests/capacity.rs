mod common;

use std::sync::Arc;

use allot_collect::capacity;
use allot_core::constraints::QuotaConstraintSet;
use allot_core::models::{CapacityData, CapacityValue};
use allot_plugins::unittest::UnitTestCapacityPlugin;
use allot_plugins::PluginError;
use allot_store::rows::MANUAL_COMMENT;
use allot_store::Store;

use common::{build_full, cluster_config, CLUSTER};

fn capacity_data(entries: &[(&str, &str, u64)]) -> CapacityData {
    let mut data = CapacityData::new();
    for (service, resource, capacity) in entries {
        data.entry(service.to_string())
            .or_default()
            .insert(resource.to_string(), CapacityValue::flat(*capacity));
    }
    data
}

#[tokio::test]
async fn foreign_service_types_and_unadvertised_resources_are_dropped() {
    // unittest reports a foreign service type (whatever) and an
    // unadvertised resource (shared/items); unittest2 reports a foreign
    // service type too.
    let unittest = Arc::new(UnitTestCapacityPlugin::new(
        "unittest",
        capacity_data(&[
            ("shared", "things", 42),
            ("whatever", "things", 42),
            ("shared", "items", 42),
        ]),
    ));
    let unittest2 = Arc::new(UnitTestCapacityPlugin::new(
        "unittest2",
        capacity_data(&[("unshared", "capacity", 42), ("someother", "capacity", 42)]),
    ));
    let fixture = build_full(
        cluster_config(false),
        Default::default(),
        QuotaConstraintSet::default(),
        vec![unittest, unittest2],
    );

    capacity::scan_capacity_once(&fixture.ctx).await.unwrap();

    let report = fixture.store.capacity_report(CLUSTER).await.unwrap();
    let rows: Vec<(String, String, u64)> = report
        .iter()
        .map(|r| (r.service_type.clone(), r.resource_name.clone(), r.capacity))
        .collect();
    assert_eq!(
        rows,
        vec![
            ("shared".to_string(), "things".to_string(), 42),
            ("unshared".to_string(), "capacity".to_string(), 42),
        ]
    );

    // Both capacitors are recorded with their scrape bookkeeping.
    let capacitors = fixture.store.cluster_capacitors(CLUSTER).await.unwrap();
    assert_eq!(capacitors.len(), 2);
    assert_eq!(capacitors[0].capacitor_id, "unittest");
    assert!(capacitors[0].serialized_metrics.contains("unittest"));
}

#[tokio::test]
async fn manual_rows_survive_until_a_plugin_reports_them() {
    let unittest = Arc::new(UnitTestCapacityPlugin::new(
        "unittest",
        capacity_data(&[("shared", "things", 42)]),
    ));
    let fixture = build_full(
        cluster_config(false),
        Default::default(),
        QuotaConstraintSet::default(),
        vec![unittest.clone()],
    );

    // An operator pre-seeded shared/capacity by hand.
    fixture
        .store
        .put_cluster_resource(CLUSTER, "shared", "capacity", 999, MANUAL_COMMENT)
        .await
        .unwrap();

    capacity::scan_capacity_once(&fixture.ctx).await.unwrap();
    let report = fixture.store.capacity_report(CLUSTER).await.unwrap();
    assert_eq!(report.len(), 2);
    assert_eq!(report[0].resource_name, "capacity");
    assert_eq!(report[0].capacity, 999);
    assert_eq!(report[0].comment, MANUAL_COMMENT);

    // A plugin starts reporting shared/capacity: manual becomes automatic.
    unittest.set_data(capacity_data(&[
        ("shared", "things", 42),
        ("shared", "capacity", 7),
    ]));
    capacity::scan_capacity_once(&fixture.ctx).await.unwrap();
    let report = fixture.store.capacity_report(CLUSTER).await.unwrap();
    assert_eq!(report[0].resource_name, "capacity");
    assert_eq!(report[0].capacity, 7);
    assert_eq!(report[0].comment, "");

    // And when it stops reporting it again, the now-automatic row goes away.
    unittest.set_data(capacity_data(&[("shared", "things", 42)]));
    capacity::scan_capacity_once(&fixture.ctx).await.unwrap();
    let report = fixture.store.capacity_report(CLUSTER).await.unwrap();
    assert_eq!(report.len(), 1);
    assert_eq!(report[0].resource_name, "things");
}

#[tokio::test]
async fn a_failing_capacitor_is_skipped_and_the_others_still_land() {
    let healthy = Arc::new(UnitTestCapacityPlugin::new(
        "unittest",
        capacity_data(&[("shared", "things", 42)]),
    ));
    let broken = Arc::new(UnitTestCapacityPlugin::new(
        "unittest2",
        capacity_data(&[("unshared", "capacity", 42)]),
    ));
    broken.fail_next_scrape(PluginError::Backend("503".to_string()));
    let fixture = build_full(
        cluster_config(false),
        Default::default(),
        QuotaConstraintSet::default(),
        vec![healthy, broken],
    );

    capacity::scan_capacity_once(&fixture.ctx).await.unwrap();

    let report = fixture.store.capacity_report(CLUSTER).await.unwrap();
    assert_eq!(report.len(), 1);
    assert_eq!(report[0].service_type, "shared");
    // Only the healthy capacitor got a bookkeeping row.
    let capacitors = fixture.store.cluster_capacitors(CLUSTER).await.unwrap();
    assert_eq!(capacitors.len(), 1);
    assert_eq!(capacitors[0].capacitor_id, "unittest");
}

#[tokio::test]
async fn capacity_pass_touches_cluster_service_timestamps() {
    let unittest = Arc::new(UnitTestCapacityPlugin::new(
        "unittest",
        capacity_data(&[("shared", "things", 42)]),
    ));
    let fixture = build_full(
        cluster_config(false),
        Default::default(),
        QuotaConstraintSet::default(),
        vec![unittest],
    );
    let enabled: Vec<String> = vec!["shared".to_string(), "unshared".to_string()];
    fixture
        .store
        .sync_cluster_services(CLUSTER, &enabled)
        .await
        .unwrap();

    capacity::scan_capacity_once(&fixture.ctx).await.unwrap();

    for service in fixture.store.cluster_services(CLUSTER).await.unwrap() {
        assert!(service.scraped_at.is_some());
    }
}
