//! Loop supervision for the collect command.

use std::sync::Arc;

use allot_plugins::QuotaPlugin;
use tokio::task::JoinSet;

use crate::capacity::run_capacity_loop;
use crate::consistency::run_consistency_loop;
use crate::context::ClusterContext;
use crate::discovery::run_discovery_loop;
use crate::rates::run_rates_loop;
use crate::scrape::run_scrape_loop;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopMode {
    /// Run until the process is terminated.
    Forever,
    /// Run each loop for a single pass, then return. Used by tests and the
    /// one-shot CLI commands.
    Once,
}

/// Spawn all loops of one cluster and run them to completion.
///
/// In `Forever` mode this only returns if a worker panics; all expected
/// errors are handled inside the loops. Every loop is safe to kill at any
/// suspension point because all store mutations are transactional.
///
/// `Once` mode runs the loops sequentially (discovery before scrapes, so a
/// single pass observes a fully discovered catalog), then returns.
pub async fn run_collector(ctx: Arc<ClusterContext>, mode: LoopMode) {
    if mode == LoopMode::Once {
        run_discovery_loop(&ctx, mode).await;
        run_consistency_loop(&ctx, mode).await;
        run_capacity_loop(&ctx, mode).await;
        for service_type in ctx.cluster.service_types() {
            run_scrape_loop(&ctx, &service_type, mode).await;
            let has_rates = ctx
                .registry
                .quota_plugin(&service_type)
                .is_some_and(|p| !p.rates().is_empty());
            if has_rates {
                run_rates_loop(&ctx, &service_type, mode).await;
            }
        }
        return;
    }

    let mut workers = JoinSet::new();

    {
        let ctx = Arc::clone(&ctx);
        workers.spawn(async move { run_discovery_loop(&ctx, mode).await });
    }
    {
        let ctx = Arc::clone(&ctx);
        workers.spawn(async move { run_consistency_loop(&ctx, mode).await });
    }
    {
        let ctx = Arc::clone(&ctx);
        workers.spawn(async move { run_capacity_loop(&ctx, mode).await });
    }
    for service_type in ctx.cluster.service_types() {
        {
            let ctx = Arc::clone(&ctx);
            let service_type = service_type.clone();
            workers.spawn(async move { run_scrape_loop(&ctx, &service_type, mode).await });
        }
        let has_rates = ctx
            .registry
            .quota_plugin(&service_type)
            .is_some_and(|p| !p.rates().is_empty());
        if has_rates {
            let ctx = Arc::clone(&ctx);
            workers.spawn(async move { run_rates_loop(&ctx, &service_type, mode).await });
        }
    }

    while let Some(result) = workers.join_next().await {
        if let Err(error) = result {
            tracing::error!(%error, "collector worker terminated abnormally");
        }
    }
}
