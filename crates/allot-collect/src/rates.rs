//! Rate scrape loop, the per-service-type analogue of the resource scrape
//! loop, keyed on the `rates_*` bookkeeping columns.

use std::time::Duration;

use allot_plugins::QuotaPlugin;
use allot_store::ops::{RatesFailure, RatesSuccess};
use allot_store::Store;

use crate::context::ClusterContext;
use crate::error::CollectError;
use crate::runner::LoopMode;
use crate::scrape::WorkerOutcome;

/// Pick and scrape rates for the next due project-service of this service
/// type.
pub async fn scrape_rates_next(
    ctx: &ClusterContext,
    service_type: &str,
) -> Result<WorkerOutcome, CollectError> {
    let now = ctx.clock.now();
    let Some(target) = ctx
        .store
        .next_rates_target(&ctx.cluster_id, service_type, now, ctx.timing())
        .await?
    else {
        return Ok(WorkerOutcome::Idle);
    };
    let plugin = ctx
        .registry
        .quota_plugin(service_type)
        .ok_or_else(|| CollectError::MissingPlugin(service_type.to_string()))?;
    let project = ClusterContext::project_ref(&target.domain, &target.project);

    let prev_state = if target.service.rates_scrape_state.is_empty() {
        None
    } else {
        Some(target.service.rates_scrape_state.as_str())
    };
    let started = ctx.clock.now();
    let result = plugin.scrape_rates(&project, prev_state).await;
    let finished = ctx.clock.now();
    let duration_secs = (finished - started).num_milliseconds() as f64 / 1000.0;

    let labels = [
        ctx.cluster_id.as_str(),
        service_type,
        plugin.service_info().product_name.as_str(),
    ];
    match result {
        Ok(data) => {
            let rates: Vec<(String, String)> = plugin
                .rates()
                .iter()
                .map(|info| {
                    let usage = data
                        .rates
                        .get(&info.name)
                        .map(|v| v.as_str().to_string())
                        .unwrap_or_else(|| "0".to_string());
                    (info.name.clone(), usage)
                })
                .collect();
            ctx.store
                .write_rates_success(
                    target.service.id,
                    RatesSuccess {
                        rates,
                        scrape_state: data.scrape_state,
                        duration_secs,
                        completed_at: finished,
                    },
                )
                .await?;
            ctx.metrics
                .successful_rate_scrapes
                .with_label_values(&labels)
                .inc();
            Ok(WorkerOutcome::Worked)
        }
        Err(error) => {
            tracing::error!(
                project = %target.project.name,
                service = service_type,
                %error,
                "rate scrape failed"
            );
            let suspended = error.is_endpoint_not_found();
            ctx.store
                .write_rates_failure(
                    target.service.id,
                    RatesFailure {
                        checked_at: finished,
                        duration_secs,
                        error_message: error.to_string(),
                    },
                )
                .await?;
            ctx.metrics.failed_rate_scrapes.with_label_values(&labels).inc();
            if suspended {
                Ok(WorkerOutcome::Suspended)
            } else {
                Ok(WorkerOutcome::Failed)
            }
        }
    }
}

/// The rate scrape worker for one service type. Not spawned at all for
/// services that declare no rates.
pub async fn run_rates_loop(ctx: &ClusterContext, service_type: &str, mode: LoopMode) {
    loop {
        let outcome = match scrape_rates_next(ctx, service_type).await {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::error!(service = service_type, %error, "rate scrape iteration failed");
                WorkerOutcome::Failed
            }
        };
        match (outcome, mode) {
            (WorkerOutcome::Worked, _) => {}
            (WorkerOutcome::Failed | WorkerOutcome::Idle | WorkerOutcome::Suspended, LoopMode::Once) => {
                return;
            }
            (WorkerOutcome::Idle | WorkerOutcome::Failed, LoopMode::Forever) => {
                tokio::time::sleep(Duration::from_secs(ctx.timing().idle_interval_secs)).await;
            }
            (WorkerOutcome::Suspended, LoopMode::Forever) => {
                tracing::info!(
                    service = service_type,
                    "service endpoint not deployed; suspending rate scrapes"
                );
                tokio::time::sleep(Duration::from_secs(
                    ctx.timing().service_not_deployed_interval_secs,
                ))
                .await;
            }
        }
    }
}
