mod common;

use allot_collect::{discovery, metrics, scrape, LoopMode};
use allot_core::config::CollectorConfig;
use allot_core::constraints::QuotaConstraintSet;

use common::{build_full, cluster_config};

#[tokio::test]
async fn counters_and_aggregate_gauges_are_exposed() {
    let fixture = common::build(false, QuotaConstraintSet::default());
    discovery::run_discovery_loop(&fixture.ctx, LoopMode::Once).await;
    scrape::run_scrape_loop(&fixture.ctx, "unshared", LoopMode::Once).await;

    let exposition = metrics::render(&fixture.ctx).await.unwrap();

    assert!(exposition.contains("allot_successful_domain_discoveries{cluster=\"west\"} 1"));
    assert!(exposition.contains("allot_successful_scrapes{"));
    assert!(exposition.contains("service_name=\"unshared-unittest\""));
    assert!(exposition.contains("allot_oldest_scraped_at{cluster=\"west\",service=\"unshared\"}"));
    assert!(exposition.contains("allot_newest_scraped_at{cluster=\"west\",service=\"unshared\"}"));
    // Data gauges are off by default.
    assert!(!exposition.contains("allot_project_usage"));
}

#[tokio::test]
async fn data_gauges_respect_the_skip_zero_toggle() {
    let mut collector = CollectorConfig::default();
    collector.expose_data_metrics = true;
    collector.skip_zero = true;
    let fixture = build_full(
        cluster_config(false),
        collector,
        QuotaConstraintSet::default(),
        Vec::new(),
    );
    discovery::discover_once(&fixture.ctx).await.unwrap();
    scrape::run_scrape_loop(&fixture.ctx, "unshared", LoopMode::Once).await;

    let exposition = metrics::render(&fixture.ctx).await.unwrap();

    // things has usage 2 in every project; capacity has usage 0 and is
    // skipped.
    assert!(exposition.contains("resource=\"things\""));
    let usage_lines: Vec<&str> = exposition
        .lines()
        .filter(|l| l.starts_with("allot_project_usage{"))
        .collect();
    assert!(!usage_lines.is_empty());
    assert!(usage_lines.iter().all(|l| l.contains("resource=\"things\"")));

    // Unit multipliers are exposed alongside the data gauges.
    assert!(exposition.lines().any(|l| {
        l.starts_with("allot_unit_multiplier{")
            && l.contains("service=\"unshared\"")
            && l.contains("resource=\"capacity\"")
            && l.ends_with(" 1")
    }));
}

#[tokio::test]
async fn data_gauges_include_zero_values_without_skip_zero() {
    let mut collector = CollectorConfig::default();
    collector.expose_data_metrics = true;
    let fixture = build_full(
        cluster_config(false),
        collector,
        QuotaConstraintSet::default(),
        Vec::new(),
    );
    discovery::discover_once(&fixture.ctx).await.unwrap();
    scrape::run_scrape_loop(&fixture.ctx, "unshared", LoopMode::Once).await;

    let exposition = metrics::render(&fixture.ctx).await.unwrap();
    let usage_lines: Vec<&str> = exposition
        .lines()
        .filter(|l| l.starts_with("allot_project_usage{"))
        .collect();
    assert!(usage_lines.iter().any(|l| l.contains("resource=\"capacity\"")));
}
