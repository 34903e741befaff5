//! Consistency loop: reconciles the configured service/resource set and the
//! quota constraints against persisted records.
//!
//! Domain records are adjusted directly. Project records are never corrected
//! here: a violated constraint only marks the service stale, and the scrape
//! loop applies the correction under its own rules.

use std::time::Duration;

use allot_plugins::QuotaPlugin;
use allot_store::ops::{DomainReconciliation, ProjectReconciliation};
use allot_store::rows::{DomainRow, ProjectRow};
use allot_store::Store;

use crate::context::ClusterContext;
use crate::error::CollectError;
use crate::runner::LoopMode;

/// One full consistency pass over the cluster.
pub async fn check_consistency_once(ctx: &ClusterContext) -> Result<(), CollectError> {
    ctx.store
        .sync_cluster_services(&ctx.cluster_id, &ctx.cluster.service_types())
        .await?;

    for domain in ctx.store.domains(&ctx.cluster_id).await? {
        validate_domain_services(ctx, &domain).await?;
        for project in ctx.store.projects(domain.id).await? {
            validate_project_services(ctx, &domain, &project).await?;
        }
    }
    Ok(())
}

/// Reconcile DomainService rows and DomainResource quotas for one domain,
/// in one transaction.
pub async fn validate_domain_services(
    ctx: &ClusterContext,
    domain: &DomainRow,
) -> Result<(), CollectError> {
    let enabled = ctx.cluster.service_types();
    let services = ctx.store.domain_services(domain.id).await?;

    let mut reconciliation = DomainReconciliation::default();
    for service in &services {
        if !enabled.contains(&service.service_type) {
            reconciliation.delete_services.push(service.id);
        }
    }
    for service_type in &enabled {
        if !services.iter().any(|s| &s.service_type == service_type) {
            reconciliation.create_services.push(service_type.clone());
        }
    }

    for service_type in &enabled {
        let Some(plugin) = ctx.registry.quota_plugin(service_type) else {
            tracing::error!(
                service = %service_type,
                "no quota plugin for enabled service type; skipping domain resources"
            );
            continue;
        };
        let existing = match services.iter().find(|s| &s.service_type == service_type) {
            Some(service) => ctx.store.domain_resources(service.id).await?,
            None => Vec::new(),
        };

        for info in plugin.resources() {
            if info.no_quota {
                continue;
            }
            let constraint =
                ctx.constraints
                    .for_domain(&domain.name, service_type, &info.name);
            match existing.iter().find(|r| r.name == info.name) {
                Some(resource) => {
                    if let Some(constraint) = constraint {
                        if !constraint.allows(resource.quota) {
                            let adjusted = constraint.apply_to(resource.quota);
                            tracing::info!(
                                domain = %domain.name,
                                service = %service_type,
                                resource = %info.name,
                                old = resource.quota,
                                new = adjusted,
                                "adjusting domain quota to satisfy constraint"
                            );
                            reconciliation.upsert_resources.push((
                                service_type.clone(),
                                info.name.clone(),
                                adjusted,
                            ));
                        }
                    }
                }
                None => {
                    let initial = match constraint {
                        Some(constraint) => constraint.initial_quota(),
                        None => {
                            ctx.cluster
                                .resource_behavior(service_type, &info.name)
                                .distribution
                                .initial_quota()
                        }
                    };
                    if initial > 0 {
                        reconciliation.upsert_resources.push((
                            service_type.clone(),
                            info.name.clone(),
                            initial,
                        ));
                    }
                }
            }
        }

        // Rows for names the plugin no longer advertises are pruned.
        for resource in &existing {
            if !plugin.resources().iter().any(|info| info.name == resource.name) {
                reconciliation
                    .delete_resources
                    .push((service_type.clone(), resource.name.clone()));
            }
        }
    }

    if !reconciliation.is_empty() {
        ctx.store
            .apply_domain_reconciliation(domain.id, reconciliation)
            .await?;
    }
    Ok(())
}

/// Reconcile ProjectService rows for one project and flag constraint
/// violations, in one transaction.
pub async fn validate_project_services(
    ctx: &ClusterContext,
    domain: &DomainRow,
    project: &ProjectRow,
) -> Result<(), CollectError> {
    let enabled = ctx.cluster.service_types();
    let services = ctx.store.project_services(project.id).await?;

    let mut reconciliation = ProjectReconciliation::default();
    for service in &services {
        if !enabled.contains(&service.service_type) {
            reconciliation.delete_services.push(service.id);
        }
    }
    for service_type in &enabled {
        if !services.iter().any(|s| &s.service_type == service_type) {
            reconciliation.create_services.push(service_type.clone());
        }
    }

    for service in &services {
        if !enabled.contains(&service.service_type) {
            continue;
        }
        let Some(plugin) = ctx.registry.quota_plugin(&service.service_type) else {
            continue;
        };
        let resources = ctx.store.project_resources(service.id).await?;

        let mut violated = false;
        for resource in &resources {
            let Some(quota) = resource.quota else {
                continue;
            };
            if let Some(constraint) = ctx.constraints.for_project(
                &domain.name,
                &project.name,
                &service.service_type,
                &resource.name,
            ) {
                if !constraint.allows(quota) {
                    tracing::info!(
                        project = %project.name,
                        service = %service.service_type,
                        resource = %resource.name,
                        quota,
                        "project quota violates constraint; marking service stale"
                    );
                    violated = true;
                }
            }
        }

        // Seed rows that a constraint or a centralized default mandates but
        // that no scrape has created yet (e.g. the constraint was configured
        // after the project appeared).
        for info in plugin.resources() {
            if info.no_quota || resources.iter().any(|r| r.name == info.name) {
                continue;
            }
            let initial = match ctx.constraints.for_project(
                &domain.name,
                &project.name,
                &service.service_type,
                &info.name,
            ) {
                Some(constraint) => constraint.initial_quota(),
                None => {
                    ctx.cluster
                        .resource_behavior(&service.service_type, &info.name)
                        .distribution
                        .initial_quota()
                }
            };
            if initial > 0 {
                reconciliation.seed_resources.push((
                    service.service_type.clone(),
                    info.name.clone(),
                    initial,
                ));
            }
        }

        if violated {
            reconciliation.mark_stale.push(service.id);
        }
    }

    if !reconciliation.is_empty() {
        ctx.store
            .apply_project_reconciliation(project.id, reconciliation)
            .await?;
    }
    Ok(())
}

/// The consistency worker: one pass per consistency interval.
pub async fn run_consistency_loop(ctx: &ClusterContext, mode: LoopMode) {
    loop {
        if let Err(error) = check_consistency_once(ctx).await {
            tracing::error!(%error, "consistency pass failed");
        }
        if mode == LoopMode::Once {
            return;
        }
        tokio::time::sleep(Duration::from_secs(ctx.timing().consistency_interval_secs)).await;
    }
}
