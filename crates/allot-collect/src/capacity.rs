//! Capacity loop: one pass invokes every capacity plugin and rewrites the
//! cluster-level capacity rows in a single transaction.

use std::collections::BTreeMap;
use std::time::Duration;

use allot_core::models::CapacityValue;
use allot_plugins::CapacityPlugin;
use allot_store::ops::{CapacityPass, CapacityResourceUpdate, CapacitorUpsert};
use allot_store::Store;

use crate::context::ClusterContext;
use crate::error::CollectError;
use crate::runner::LoopMode;

fn convert_value(value: &CapacityValue) -> Result<CapacityResourceUpdate, CollectError> {
    let capacity_per_az = value
        .capacity_per_az
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let subcapacities = if value.subcapacities.is_empty() {
        String::new()
    } else {
        serde_json::to_string(&value.subcapacities)?
    };
    Ok(CapacityResourceUpdate {
        capacity: value.capacity,
        capacity_per_az,
        subcapacities,
    })
}

/// One capacity pass: scrape all capacitors, filter the collected values to
/// enabled service types and advertised resource names, and persist.
pub async fn scan_capacity_once(ctx: &ClusterContext) -> Result<(), CollectError> {
    let cluster = ctx.cluster_ref();
    let mut capacitors = Vec::new();
    // BTreeMaps keep service types and resource names in lexicographic
    // order, which makes the persisted pass deterministic.
    let mut values: BTreeMap<String, BTreeMap<String, CapacityResourceUpdate>> = BTreeMap::new();

    for (capacitor_id, plugin) in ctx.registry.capacity_plugins() {
        let started = ctx.clock.now();
        let result = plugin.scrape(&cluster).await;
        let finished = ctx.clock.now();
        let duration_secs = (finished - started).num_milliseconds() as f64 / 1000.0;
        if duration_secs > 60.0 {
            tracing::info!(
                capacitor = capacitor_id,
                duration_secs,
                "capacity scrape took unusually long"
            );
        }

        let labels = [ctx.cluster_id.as_str(), capacitor_id];
        let (data, serialized_metrics) = match result {
            Ok(result) => result,
            Err(error) => {
                // A failing capacitor is skipped; the others still land.
                tracing::error!(capacitor = capacitor_id, %error, "capacity scrape failed");
                ctx.metrics
                    .failed_capacity_scrapes
                    .with_label_values(&labels)
                    .inc();
                continue;
            }
        };
        ctx.metrics
            .successful_capacity_scrapes
            .with_label_values(&labels)
            .inc();
        capacitors.push(CapacitorUpsert {
            capacitor_id: capacitor_id.to_string(),
            scraped_at: finished,
            scrape_duration_secs: duration_secs,
            serialized_metrics,
        });

        for (service_type, resources) in &data {
            if !ctx.cluster.has_service(service_type) {
                tracing::debug!(
                    capacitor = capacitor_id,
                    service = %service_type,
                    "discarding capacity for service type not enabled in this cluster"
                );
                continue;
            }
            let advertised = ctx.registry.advertised_resources(service_type);
            for (resource_name, value) in resources {
                if !advertised.contains(resource_name) {
                    tracing::debug!(
                        capacitor = capacitor_id,
                        service = %service_type,
                        resource = %resource_name,
                        "discarding capacity for resource not advertised by the quota plugin"
                    );
                    continue;
                }
                values
                    .entry(service_type.clone())
                    .or_default()
                    .insert(resource_name.clone(), convert_value(value)?);
            }
        }
    }

    let configured_capacitor_ids: Vec<String> = ctx
        .registry
        .capacity_plugins()
        .map(|(id, _)| id.to_string())
        .collect();
    ctx.store
        .write_capacity_pass(
            &ctx.cluster_id,
            CapacityPass {
                capacitors,
                configured_capacitor_ids,
                values,
                scraped_at: ctx.clock.now(),
            },
        )
        .await?;
    Ok(())
}

/// The capacity worker: an initial delay, then one pass per scan interval.
pub async fn run_capacity_loop(ctx: &ClusterContext, mode: LoopMode) {
    if mode == LoopMode::Forever {
        tokio::time::sleep(Duration::from_secs(
            ctx.timing().capacity_initial_delay_secs,
        ))
        .await;
    }
    loop {
        if let Err(error) = scan_capacity_once(ctx).await {
            tracing::error!(%error, "capacity pass failed");
        }
        if mode == LoopMode::Once {
            return;
        }
        tokio::time::sleep(Duration::from_secs(ctx.timing().capacity_scan_interval_secs)).await;
    }
}
