mod common;

use std::sync::Arc;

use allot_collect::rates;
use allot_collect::scrape::WorkerOutcome;
use allot_collect::discovery;
use allot_core::config::CollectorConfig;
use allot_core::constraints::QuotaConstraintSet;
use allot_core::models::{RateInfo, RateValue};
use allot_plugins::unittest::UnitTestQuotaPlugin;
use allot_plugins::PluginError;
use allot_store::Store;

use common::{build_with_plugins, cluster_config, service_id, CLUSTER};

fn rate_fixture() -> common::TestCluster {
    let shared = Arc::new(
        UnitTestQuotaPlugin::new("shared").with_rates(vec![
            RateInfo {
                name: "objects:create".to_string(),
                unit: Default::default(),
            },
            RateInfo {
                name: "objects:delete".to_string(),
                unit: Default::default(),
            },
        ]),
    );
    shared.set_rate_value("objects:create", RateValue::parse("1024").unwrap());
    let unshared = Arc::new(UnitTestQuotaPlugin::new("unshared"));
    // A zero scrape interval keeps every service permanently due, so the
    // test can drive several rounds without advancing the clock by hours.
    let mut collector = CollectorConfig::default();
    collector.timing.scrape_interval_secs = 0;
    build_with_plugins(
        cluster_config(false),
        collector,
        QuotaConstraintSet::default(),
        shared,
        unshared,
        Vec::new(),
    )
}

#[tokio::test]
async fn rate_scrape_writes_rows_and_threads_the_state() {
    let fixture = rate_fixture();
    discovery::discover_once(&fixture.ctx).await.unwrap();

    // First rate scrape lands on berlin (lowest service id).
    let outcome = rates::scrape_rates_next(&fixture.ctx, "shared").await.unwrap();
    assert_eq!(outcome, WorkerOutcome::Worked);

    let berlin = service_id(&fixture.store, CLUSTER, "uuid-for-berlin", "shared").await;
    let rows = fixture.store.project_rates(berlin).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].name, "objects:create");
    assert_eq!(rows[0].usage_as_bigint, "1024");
    assert_eq!(rows[1].name, "objects:delete");
    assert_eq!(rows[1].usage_as_bigint, "0");

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
    assert_eq!(service.rates_scrape_state, "1");
    assert!(service.rates_scraped_at.is_some());
    assert_eq!(service.rates_scraped_at, service.rates_checked_at);

    // Scrape the other two projects, then berlin again: the plugin sees its
    // previous state and advances it.
    for _ in 0..2 {
        let outcome = rates::scrape_rates_next(&fixture.ctx, "shared").await.unwrap();
        assert_eq!(outcome, WorkerOutcome::Worked);
    }
    let outcome = rates::scrape_rates_next(&fixture.ctx, "shared").await.unwrap();
    assert_eq!(outcome, WorkerOutcome::Worked);
    let service = fixture
        .store
        .project_services(project.id)
        .await
        .unwrap()
        .into_iter()
        .find(|s| s.id == berlin)
        .unwrap();
    assert_eq!(service.rates_scrape_state, "2");
}

#[tokio::test]
async fn failed_rate_scrape_keeps_rates_scraped_at() {
    let fixture = rate_fixture();
    discovery::discover_once(&fixture.ctx).await.unwrap();

    fixture
        .shared
        .fail_next_rate_scrape(PluginError::Backend("oops".to_string()));
    let outcome = rates::scrape_rates_next(&fixture.ctx, "shared").await.unwrap();
    assert_eq!(outcome, WorkerOutcome::Failed);

    let berlin = service_id(&fixture.store, CLUSTER, "uuid-for-berlin", "shared").await;
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
    assert_eq!(service.rates_scraped_at, None);
    assert!(service.rates_checked_at.is_some());
    assert!(service.rates_scrape_error_message.contains("oops"));
    assert!(fixture.store.project_rates(berlin).await.unwrap().is_empty());
}
