//! Counter set and Prometheus exposition.
//!
//! Counters are cumulative and live for the process lifetime. Gauge
//! families are rebuilt from Store queries on every exposition, so rows
//! deleted from the store disappear from the metrics at the next scrape
//! without any bookkeeping.

use prometheus::{GaugeVec, IntCounterVec, Opts, Registry, TextEncoder};

use allot_plugins::QuotaPlugin;
use allot_store::Store;

use crate::context::ClusterContext;
use crate::error::CollectError;

fn counter_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<IntCounterVec, prometheus::Error> {
    let vec = IntCounterVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(vec.clone()))?;
    Ok(vec)
}

/// Process-wide cumulative counters, written concurrently by all loops.
#[derive(Clone)]
pub struct CollectorMetrics {
    pub registry: Registry,
    pub successful_scrapes: IntCounterVec,
    pub failed_scrapes: IntCounterVec,
    pub suspended_scrapes: IntCounterVec,
    pub successful_rate_scrapes: IntCounterVec,
    pub failed_rate_scrapes: IntCounterVec,
    pub successful_domain_discoveries: IntCounterVec,
    pub failed_domain_discoveries: IntCounterVec,
    pub successful_project_discoveries: IntCounterVec,
    pub failed_project_discoveries: IntCounterVec,
    pub successful_capacity_scrapes: IntCounterVec,
    pub failed_capacity_scrapes: IntCounterVec,
}

impl CollectorMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let scrape_labels = ["cluster", "service", "service_name"];
        Ok(CollectorMetrics {
            successful_scrapes: counter_vec(
                &registry,
                "allot_successful_scrapes",
                "Number of successful resource scrapes.",
                &scrape_labels,
            )?,
            failed_scrapes: counter_vec(
                &registry,
                "allot_failed_scrapes",
                "Number of failed resource scrapes.",
                &scrape_labels,
            )?,
            suspended_scrapes: counter_vec(
                &registry,
                "allot_suspended_scrapes",
                "Number of scrapes suspended because the service endpoint is not deployed.",
                &scrape_labels,
            )?,
            successful_rate_scrapes: counter_vec(
                &registry,
                "allot_successful_rate_scrapes",
                "Number of successful rate scrapes.",
                &scrape_labels,
            )?,
            failed_rate_scrapes: counter_vec(
                &registry,
                "allot_failed_rate_scrapes",
                "Number of failed rate scrapes.",
                &scrape_labels,
            )?,
            successful_domain_discoveries: counter_vec(
                &registry,
                "allot_successful_domain_discoveries",
                "Number of successful domain discovery passes.",
                &["cluster"],
            )?,
            failed_domain_discoveries: counter_vec(
                &registry,
                "allot_failed_domain_discoveries",
                "Number of failed domain discovery passes.",
                &["cluster"],
            )?,
            successful_project_discoveries: counter_vec(
                &registry,
                "allot_successful_project_discoveries",
                "Number of successful project discovery passes.",
                &["cluster", "domain"],
            )?,
            failed_project_discoveries: counter_vec(
                &registry,
                "allot_failed_project_discoveries",
                "Number of failed project discovery passes.",
                &["cluster", "domain"],
            )?,
            successful_capacity_scrapes: counter_vec(
                &registry,
                "allot_successful_capacity_scrapes",
                "Number of successful capacity scrapes.",
                &["cluster", "capacitor"],
            )?,
            failed_capacity_scrapes: counter_vec(
                &registry,
                "allot_failed_capacity_scrapes",
                "Number of failed capacity scrapes.",
                &["cluster", "capacitor"],
            )?,
            registry,
        })
    }
}

fn gauge_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<GaugeVec, prometheus::Error> {
    let vec = GaugeVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(vec.clone()))?;
    Ok(vec)
}

fn set(vec: &GaugeVec, labels: &[&str], value: f64, skip_zero: bool) {
    if skip_zero && value == 0.0 {
        return;
    }
    vec.with_label_values(labels).set(value);
}

/// Render the full exposition: cumulative counters plus gauges freshly
/// derived from the store.
pub async fn render(ctx: &ClusterContext) -> Result<String, CollectError> {
    let mut families = ctx.metrics.registry.gather();

    let gauges = Registry::new();

    // Aggregate gauges are always exposed.
    let oldest = gauge_vec(
        &gauges,
        "allot_oldest_scraped_at",
        "UNIX timestamp of the least recent successful scrape per service.",
        &["cluster", "service"],
    )?;
    let newest = gauge_vec(
        &gauges,
        "allot_newest_scraped_at",
        "UNIX timestamp of the most recent successful scrape per service.",
        &["cluster", "service"],
    )?;
    for row in ctx.store.scrape_age_extremes(&ctx.cluster_id).await? {
        if let Some(at) = row.oldest_scraped_at {
            oldest
                .with_label_values(&[&ctx.cluster_id, &row.service_type])
                .set(at.timestamp() as f64);
        }
        if let Some(at) = row.newest_scraped_at {
            newest
                .with_label_values(&[&ctx.cluster_id, &row.service_type])
                .set(at.timestamp() as f64);
        }
    }

    if ctx.collector.expose_data_metrics {
        let skip_zero = ctx.collector.skip_zero;

        let cluster_capacity = gauge_vec(
            &gauges,
            "allot_cluster_capacity",
            "Cluster capacity per resource, scaled by the overcommit factor.",
            &["cluster", "service", "resource"],
        )?;
        for row in ctx.store.capacity_report(&ctx.cluster_id).await? {
            let overcommit = ctx
                .cluster
                .resource_behavior(&row.service_type, &row.resource_name)
                .overcommit_factor;
            set(
                &cluster_capacity,
                &[&ctx.cluster_id, &row.service_type, &row.resource_name],
                row.capacity as f64 * overcommit,
                skip_zero,
            );
        }

        let domain_quota = gauge_vec(
            &gauges,
            "allot_domain_quota",
            "Assigned quota per domain and resource.",
            &["cluster", "domain", "service", "resource"],
        )?;
        for row in ctx.store.domain_report(&ctx.cluster_id).await? {
            set(
                &domain_quota,
                &[
                    &ctx.cluster_id,
                    &row.domain_name,
                    &row.service_type,
                    &row.resource_name,
                ],
                row.quota as f64,
                skip_zero,
            );
        }

        let project_labels = ["cluster", "domain", "project", "service", "resource"];
        let project_quota = gauge_vec(
            &gauges,
            "allot_project_quota",
            "Assigned quota per project and resource.",
            &project_labels,
        )?;
        let project_backend_quota = gauge_vec(
            &gauges,
            "allot_project_backend_quota",
            "Quota enforced in the backend per project and resource.",
            &project_labels,
        )?;
        let project_usage = gauge_vec(
            &gauges,
            "allot_project_usage",
            "Usage per project and resource.",
            &project_labels,
        )?;
        let project_physical_usage = gauge_vec(
            &gauges,
            "allot_project_physical_usage",
            "Physical usage per project and resource, where the backend reports it.",
            &project_labels,
        )?;
        for row in ctx.store.project_report(&ctx.cluster_id).await? {
            let labels = [
                ctx.cluster_id.as_str(),
                row.domain_name.as_str(),
                row.project_name.as_str(),
                row.service_type.as_str(),
                row.resource_name.as_str(),
            ];
            if let Some(quota) = row.quota {
                set(&project_quota, &labels, quota as f64, skip_zero);
            }
            if let Some(backend_quota) = row.backend_quota {
                set(&project_backend_quota, &labels, backend_quota as f64, skip_zero);
            }
            set(&project_usage, &labels, row.usage as f64, skip_zero);
            if let Some(physical) = row.physical_usage {
                set(&project_physical_usage, &labels, physical as f64, skip_zero);
            }
        }

        let unit_multiplier = gauge_vec(
            &gauges,
            "allot_unit_multiplier",
            "Multiplier that converts a resource's counted values into base units.",
            &["service", "resource"],
        )?;
        for (service_type, plugin) in ctx.registry.quota_plugins() {
            for info in plugin.resources() {
                unit_multiplier
                    .with_label_values(&[service_type, &info.name])
                    .set(info.unit.multiplier() as f64);
            }
        }
    }

    families.extend(gauges.gather());

    let encoder = TextEncoder::new();
    let mut output = String::new();
    encoder.encode_utf8(&families, &mut output)?;
    Ok(output)
}
