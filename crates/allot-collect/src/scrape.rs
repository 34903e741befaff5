//! Resource scrape loop, one worker per enabled service type.
//!
//! Selection happens entirely in the store (stale first, oldest check
//! next); the retry mechanism is that same ordering, not an in-memory
//! queue.

use std::time::Duration;

use chrono::{DateTime, Utc};

use allot_core::models::ResourceData;
use allot_plugins::QuotaPlugin;
use allot_store::ops::{ResourceUpsert, ScrapeFailure, ScrapeSuccess, ScrapeTarget};
use allot_store::Store;

use crate::context::ClusterContext;
use crate::error::CollectError;
use crate::quota;
use crate::runner::LoopMode;

/// A scrape round-trip taking longer than this is worth a log line.
const EXCESS_SCRAPE_DURATION_SECS: f64 = 5.0 * 60.0;

/// What one worker iteration did, which decides how long to sleep before
/// the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Scraped successfully; poll again immediately.
    Worked,
    /// The scrape failed transiently; sleep the idle interval.
    Failed,
    /// The backend endpoint is not deployed; suspend the worker.
    Suspended,
    /// Nothing to do; sleep the idle interval (or exit in once mode).
    Idle,
}

/// Pick and scrape the next due project-service of this service type.
pub async fn scrape_next(
    ctx: &ClusterContext,
    service_type: &str,
) -> Result<WorkerOutcome, CollectError> {
    let now = ctx.clock.now();
    let Some(target) = ctx
        .store
        .next_scrape_target(&ctx.cluster_id, service_type, now, ctx.timing())
        .await?
    else {
        return Ok(WorkerOutcome::Idle);
    };
    let plugin = ctx
        .registry
        .quota_plugin(service_type)
        .ok_or_else(|| CollectError::MissingPlugin(service_type.to_string()))?;
    let project = ClusterContext::project_ref(&target.domain, &target.project);

    tracing::debug!(
        project = %target.project.name,
        service = service_type,
        "scraping project service"
    );
    let started = ctx.clock.now();
    let result = plugin.scrape(&project).await;
    let finished = ctx.clock.now();
    let duration_secs = (finished - started).num_milliseconds() as f64 / 1000.0;
    if duration_secs > EXCESS_SCRAPE_DURATION_SECS {
        tracing::info!(
            project = %target.project.name,
            service = service_type,
            duration_secs,
            "scrape took unusually long"
        );
    }

    let labels = [
        ctx.cluster_id.as_str(),
        service_type,
        plugin.service_info().product_name.as_str(),
    ];
    match result {
        Ok(data) => {
            write_success(ctx, plugin, &target, data.resources, data.serialized_metrics, duration_secs, finished)
                .await?;
            ctx.metrics.successful_scrapes.with_label_values(&labels).inc();

            if ctx.cluster.authoritative {
                // Quota-application failure is non-fatal to the scrape; the
                // next scrape re-evaluates the drift.
                if let Err(error) = quota::apply_project_quota(ctx, plugin, &target).await {
                    tracing::error!(
                        project = %target.project.name,
                        service = service_type,
                        %error,
                        "applying backend quota failed"
                    );
                }
            }
            Ok(WorkerOutcome::Worked)
        }
        Err(error) => {
            let suspended = error.is_endpoint_not_found();
            write_failure(ctx, plugin, &target, error.to_string(), duration_secs, finished).await?;
            ctx.metrics.failed_scrapes.with_label_values(&labels).inc();
            if suspended {
                ctx.metrics.suspended_scrapes.with_label_values(&labels).inc();
                Ok(WorkerOutcome::Suspended)
            } else {
                Ok(WorkerOutcome::Failed)
            }
        }
    }
}

async fn write_success(
    ctx: &ClusterContext,
    plugin: &dyn QuotaPlugin,
    target: &ScrapeTarget,
    scraped: std::collections::BTreeMap<String, ResourceData>,
    serialized_metrics: String,
    duration_secs: f64,
    completed_at: DateTime<Utc>,
) -> Result<(), CollectError> {
    let existing = ctx.store.project_resources(target.service.id).await?;
    let mut resources = Vec::with_capacity(plugin.resources().len());
    for info in plugin.resources() {
        let data = scraped.get(&info.name).cloned().unwrap_or_default();
        let current = existing.iter().find(|r| r.name == info.name);

        let quota = if info.no_quota {
            None
        } else {
            let mut quota = current.and_then(|r| r.quota).unwrap_or(0);
            // A backend quota equal to the declared auto-approval value is
            // adopted as the initial stored quota, once.
            if quota == 0 {
                if let Some(auto) = info.auto_approve_initial_quota {
                    if data.quota == auto as i64 {
                        tracing::info!(
                            project = %target.project.name,
                            resource = %info.name,
                            quota = auto,
                            "auto-approving initial quota reported by backend"
                        );
                        quota = auto;
                    }
                }
            }
            if let Some(constraint) = ctx.constraints.for_project(
                &target.domain.name,
                &target.project.name,
                &target.service.service_type,
                &info.name,
            ) {
                quota = constraint.apply_to(quota);
            }
            Some(quota)
        };

        resources.push(ResourceUpsert {
            name: info.name.clone(),
            quota,
            usage: data.usage,
            physical_usage: data.physical_usage,
            backend_quota: if info.no_quota { None } else { Some(data.quota) },
            desired_backend_quota: current.and_then(|r| r.desired_backend_quota),
            subresources: serialize_subresources(&data)?,
        });
    }

    ctx.store
        .write_scrape_success(
            target.service.id,
            ScrapeSuccess {
                resources,
                duration_secs,
                serialized_metrics,
                completed_at,
            },
        )
        .await?;
    Ok(())
}

async fn write_failure(
    ctx: &ClusterContext,
    plugin: &dyn QuotaPlugin,
    target: &ScrapeTarget,
    error_message: String,
    duration_secs: f64,
    checked_at: DateTime<Utc>,
) -> Result<(), CollectError> {
    tracing::error!(
        project = %target.project.name,
        service = %target.service.service_type,
        error = %error_message,
        "scrape failed"
    );
    // On the first-ever scrape, write dummy rows so that reports see the
    // project at all; scraped_at = epoch keeps it behind genuinely new work
    // in the selection order.
    let first_time_dummies = if target.service.scraped_at.is_none() {
        Some(dummy_resources(ctx, plugin, target))
    } else {
        None
    };
    ctx.store
        .write_scrape_failure(
            target.service.id,
            ScrapeFailure {
                checked_at,
                duration_secs,
                error_message,
                first_time_dummies,
            },
        )
        .await?;
    Ok(())
}

fn dummy_resources(
    ctx: &ClusterContext,
    plugin: &dyn QuotaPlugin,
    target: &ScrapeTarget,
) -> Vec<ResourceUpsert> {
    plugin
        .resources()
        .iter()
        .map(|info| {
            let quota = if info.no_quota {
                None
            } else {
                let constraint = ctx.constraints.for_project(
                    &target.domain.name,
                    &target.project.name,
                    &target.service.service_type,
                    &info.name,
                );
                Some(constraint.map(|c| c.initial_quota()).unwrap_or(0))
            };
            ResourceUpsert {
                name: info.name.clone(),
                quota,
                usage: 0,
                physical_usage: None,
                backend_quota: if info.no_quota { None } else { Some(-1) },
                desired_backend_quota: None,
                subresources: String::new(),
            }
        })
        .collect()
}

fn serialize_subresources(data: &ResourceData) -> Result<String, CollectError> {
    if data.subresources.is_empty() {
        Ok(String::new())
    } else {
        Ok(serde_json::to_string(&data.subresources)?)
    }
}

/// The scrape worker for one service type.
pub async fn run_scrape_loop(ctx: &ClusterContext, service_type: &str, mode: LoopMode) {
    loop {
        let outcome = match scrape_next(ctx, service_type).await {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::error!(service = service_type, %error, "scrape iteration failed");
                WorkerOutcome::Failed
            }
        };
        match (outcome, mode) {
            (WorkerOutcome::Worked, _) => {}
            // In once mode a failed service stays eligible (its scraped_at
            // is old), so exiting is the only way to terminate.
            (WorkerOutcome::Failed | WorkerOutcome::Idle | WorkerOutcome::Suspended, LoopMode::Once) => {
                return;
            }
            (WorkerOutcome::Idle | WorkerOutcome::Failed, LoopMode::Forever) => {
                tokio::time::sleep(Duration::from_secs(ctx.timing().idle_interval_secs)).await;
            }
            (WorkerOutcome::Suspended, LoopMode::Forever) => {
                tracing::info!(
                    service = service_type,
                    "service endpoint not deployed; suspending scrapes"
                );
                tokio::time::sleep(Duration::from_secs(
                    ctx.timing().service_not_deployed_interval_secs,
                ))
                .await;
            }
        }
    }
}
