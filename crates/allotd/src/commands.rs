use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;

use allot_collect::{capacity, metrics, runner, ClusterContext, LoopMode};
use allot_core::clock::Clock;
use allot_plugins::{BackendOptions, PluginRegistry, QuotaPlugin};
use allot_store::{PgStore, Store};

use crate::config::{load_config, load_constraints};

/// A fully wired cluster context over the live database.
async fn build_context(config_path: &Path, cluster_id: &str) -> eyre::Result<Arc<ClusterContext>> {
    let config = load_config(config_path)?;
    let cluster = config.cluster(cluster_id)?.clone();
    let constraints = load_constraints(config_path, &cluster)?;

    let backend = BackendOptions {
        insecure: std::env::var_os("ALLOT_INSECURE").is_some(),
    };
    if backend.insecure {
        tracing::warn!("TLS verification disabled via ALLOT_INSECURE; development only");
    }
    let registry = PluginRegistry::from_config(&cluster, backend)?;

    let store: Arc<dyn Store> = Arc::new(PgStore::connect(&config.database.url).await?);
    let ctx = ClusterContext::new(
        cluster_id,
        cluster,
        config.collector.clone(),
        constraints,
        registry,
        store,
        Clock::system(),
    )?;
    Ok(Arc::new(ctx))
}

async fn metrics_handler(
    axum::extract::State(ctx): axum::extract::State<Arc<ClusterContext>>,
) -> Result<String, axum::http::StatusCode> {
    metrics::render(&ctx).await.map_err(|error| {
        tracing::error!(%error, "metrics rendering failed");
        axum::http::StatusCode::INTERNAL_SERVER_ERROR
    })
}

pub async fn collect(config_path: &Path, cluster_id: &str, once: bool) -> eyre::Result<()> {
    let ctx = build_context(config_path, cluster_id).await?;

    if once {
        runner::run_collector(ctx, LoopMode::Once).await;
        return Ok(());
    }

    let metrics_listen = ctx.collector.metrics_listen.clone();
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(Arc::clone(&ctx));
    let listener = tokio::net::TcpListener::bind(&metrics_listen).await?;
    tracing::info!(listen = %metrics_listen, "metrics endpoint listening");

    tokio::select! {
        _ = runner::run_collector(Arc::clone(&ctx), LoopMode::Forever) => {}
        result = axum::serve(listener, app) => { result?; }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received interrupt; shutting down");
        }
    }
    Ok(())
}

pub async fn serve(config_path: &Path, cluster_id: &str) -> eyre::Result<()> {
    let config = load_config(config_path)?;
    config.cluster(cluster_id)?;
    let store: Arc<dyn Store> = Arc::new(PgStore::connect(&config.database.url).await?);

    let state = allot_api::state::AppState {
        store,
        cluster_id: cluster_id.to_string(),
        api: config.api.clone(),
    };
    tokio::select! {
        result = allot_api::serve(state) => { result?; }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received interrupt; shutting down");
        }
    }
    Ok(())
}

pub async fn test_scrape(
    config_path: &Path,
    cluster_id: &str,
    project_uuid: &str,
) -> eyre::Result<()> {
    let ctx = build_context(config_path, cluster_id).await?;

    let Some((domain, project)) = ctx.store.project_by_uuid(cluster_id, project_uuid).await?
    else {
        return Err(eyre::eyre!("no project with UUID {project_uuid} in cluster {cluster_id}"));
    };
    let project_ref = ClusterContext::project_ref(&domain, &project);

    let mut output: BTreeMap<&str, serde_json::Value> = BTreeMap::new();
    for (service_type, plugin) in ctx.registry.quota_plugins() {
        match plugin.scrape(&project_ref).await {
            Ok(data) => {
                output.insert(service_type, serde_json::to_value(&data.resources)?);
                ctx.metrics
                    .successful_scrapes
                    .with_label_values(&[
                        cluster_id,
                        service_type,
                        &plugin.service_info().product_name,
                    ])
                    .inc();
            }
            Err(error) => {
                tracing::error!(service = service_type, %error, "scrape failed");
                ctx.metrics
                    .failed_scrapes
                    .with_label_values(&[
                        cluster_id,
                        service_type,
                        &plugin.service_info().product_name,
                    ])
                    .inc();
            }
        }
    }
    println!("{}", serde_json::to_string_pretty(&output)?);

    dump_metrics(&ctx).await;
    Ok(())
}

pub async fn test_scan_capacity(config_path: &Path, cluster_id: &str) -> eyre::Result<()> {
    let ctx = build_context(config_path, cluster_id).await?;

    capacity::scan_capacity_once(&ctx).await?;

    let report = ctx.store.capacity_report(cluster_id).await?;
    let mut output: BTreeMap<String, BTreeMap<String, u64>> = BTreeMap::new();
    for row in report {
        output
            .entry(row.service_type)
            .or_default()
            .insert(row.resource_name, row.capacity);
    }
    println!("{}", serde_json::to_string_pretty(&output)?);

    dump_metrics(&ctx).await;
    Ok(())
}

async fn dump_metrics(ctx: &ClusterContext) {
    match metrics::render(ctx).await {
        Ok(exposition) => {
            for line in exposition.lines().filter(|l| !l.starts_with('#')) {
                tracing::info!(metric = line, "accumulated metric");
            }
        }
        Err(error) => tracing::error!(%error, "metrics rendering failed"),
    }
}
