//! Discovery loop: keeps the local catalog of domains and projects in sync
//! with the identity source.

use std::time::Duration;

use allot_core::models::KeystoneDomain;
use allot_plugins::DiscoveryPlugin;
use allot_store::ops::NewProjectService;
use allot_store::rows::DomainRow;
use allot_store::Store;

use crate::consistency;
use crate::context::ClusterContext;
use crate::error::CollectError;
use crate::runner::LoopMode;

/// One full discovery pass: reconcile domains, then descend into projects.
///
/// Returns the domains that were newly created, mostly for logging.
pub async fn discover_once(ctx: &ClusterContext) -> Result<Vec<DomainRow>, CollectError> {
    let filter = ctx.cluster.discovery.compile_filter()?;
    let upstream: Vec<KeystoneDomain> = ctx
        .registry
        .discovery()
        .list_domains()
        .await?
        .into_iter()
        .filter(|d| filter.matches(&d.name))
        .collect();
    let local = ctx.store.domains(&ctx.cluster_id).await?;

    // 1. Drop domains that disappeared upstream (cascades to everything
    //    below them).
    for domain in &local {
        if !upstream.iter().any(|up| up.uuid == domain.uuid) {
            tracing::info!(domain = %domain.name, uuid = %domain.uuid, "deleting domain");
            ctx.store.delete_domain(domain.id).await?;
        }
    }

    // 2. Create new domains, track renames of known ones.
    let mut created = Vec::new();
    for up in &upstream {
        match local.iter().find(|d| d.uuid == up.uuid) {
            None => {
                tracing::info!(domain = %up.name, uuid = %up.uuid, "discovered new domain");
                let row = ctx.store.create_domain(&ctx.cluster_id, up).await?;
                consistency::validate_domain_services(ctx, &row).await?;
                created.push(row);
            }
            Some(existing) if existing.name != up.name => {
                tracing::info!(
                    old = %existing.name,
                    new = %up.name,
                    "domain was renamed upstream"
                );
                ctx.store.rename_domain(existing.id, &up.name).await?;
            }
            Some(_) => {}
        }
    }

    // 3. Descend into projects: only newly created domains by default, all
    //    domains when scan_all_projects is set.
    let scan_list = if ctx.cluster.discovery.scan_all_projects {
        ctx.store.domains(&ctx.cluster_id).await?
    } else {
        created.clone()
    };
    for domain in &scan_list {
        match discover_projects(ctx, domain).await {
            Ok(()) => {
                ctx.metrics
                    .successful_project_discoveries
                    .with_label_values(&[&ctx.cluster_id, &domain.name])
                    .inc();
            }
            Err(error) => {
                tracing::error!(domain = %domain.name, %error, "project discovery failed");
                ctx.metrics
                    .failed_project_discoveries
                    .with_label_values(&[&ctx.cluster_id, &domain.name])
                    .inc();
            }
        }
    }

    Ok(created)
}

/// Reconcile the projects of one domain against the identity source.
async fn discover_projects(ctx: &ClusterContext, domain: &DomainRow) -> Result<(), CollectError> {
    let upstream = ctx
        .registry
        .discovery()
        .list_projects(&KeystoneDomain {
            uuid: domain.uuid.clone(),
            name: domain.name.clone(),
        })
        .await?;
    let local = ctx.store.projects(domain.id).await?;

    for project in &local {
        if !upstream.iter().any(|up| up.uuid == project.uuid) {
            tracing::info!(
                domain = %domain.name,
                project = %project.name,
                "deleting project"
            );
            ctx.store.delete_project(project.id).await?;
        }
    }

    for up in &upstream {
        match local.iter().find(|p| p.uuid == up.uuid) {
            None => {
                tracing::info!(domain = %domain.name, project = %up.name, "discovered new project");
                let services: Vec<NewProjectService> = ctx
                    .cluster
                    .service_types()
                    .into_iter()
                    .map(|service_type| {
                        let initial_resources = ctx.initial_project_resources(
                            &domain.name,
                            &up.name,
                            &service_type,
                        );
                        NewProjectService {
                            service_type,
                            initial_resources,
                        }
                    })
                    .collect();
                ctx.store.create_project(domain.id, up, &services).await?;
            }
            Some(existing)
                if existing.name != up.name || existing.parent_uuid != up.parent_uuid =>
            {
                ctx.store
                    .update_project(existing.id, &up.name, &up.parent_uuid)
                    .await?;
            }
            Some(_) => {}
        }
    }

    Ok(())
}

/// The discovery worker: one pass per discover interval.
pub async fn run_discovery_loop(ctx: &ClusterContext, mode: LoopMode) {
    loop {
        match discover_once(ctx).await {
            Ok(_) => {
                ctx.metrics
                    .successful_domain_discoveries
                    .with_label_values(&[&ctx.cluster_id])
                    .inc();
            }
            Err(error) => {
                tracing::error!(%error, "discovery pass failed");
                ctx.metrics
                    .failed_domain_discoveries
                    .with_label_values(&[&ctx.cluster_id])
                    .inc();
            }
        }
        if mode == LoopMode::Once {
            return;
        }
        tokio::time::sleep(Duration::from_secs(ctx.timing().discover_interval_secs)).await;
    }
}
