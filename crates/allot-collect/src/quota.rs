//! Quota application: pushes the desired backend quota into the backend and
//! records drift.

use std::collections::BTreeMap;

use allot_audit::QuotaChangeEvent;
use allot_core::config::DistributionModel;
use allot_plugins::QuotaPlugin;
use allot_store::ops::ScrapeTarget;
use allot_store::Store;

use crate::context::ClusterContext;
use crate::error::CollectError;

/// The backend quota this project should be granted for one resource:
/// the stored quota, raised by the bursting multiplier for projects with
/// bursting on hierarchically distributed resources.
fn desired_backend_quota(
    ctx: &ClusterContext,
    target: &ScrapeTarget,
    resource_name: &str,
    stored_quota: u64,
) -> u64 {
    let behavior = ctx
        .cluster
        .resource_behavior(&target.service.service_type, resource_name);
    if target.project.has_bursting && behavior.distribution.model == DistributionModel::Hierarchical
    {
        (stored_quota as f64 * (1.0 + ctx.cluster.bursting.max_multiplier)).floor() as u64
    } else {
        stored_quota
    }
}

/// Reconcile the backend quota of one project-service with the stored
/// quota.
///
/// Resources that are externally managed or no-quota are left alone. The
/// desired values are persisted *before* the backend call, so that a crash
/// mid-application still leaves the drift visible; `backend_quota` is only
/// advanced after the backend accepted the full map.
pub async fn apply_project_quota(
    ctx: &ClusterContext,
    plugin: &dyn QuotaPlugin,
    target: &ScrapeTarget,
) -> Result<(), CollectError> {
    let rows = ctx.store.project_resources(target.service.id).await?;

    let mut full_map: BTreeMap<String, u64> = BTreeMap::new();
    let mut marked: Vec<(String, i64)> = Vec::new();
    for info in plugin.resources() {
        if info.no_quota || info.externally_managed {
            continue;
        }
        let Some(row) = rows.iter().find(|r| r.name == info.name) else {
            continue;
        };
        let desired = desired_backend_quota(ctx, target, &info.name, row.quota.unwrap_or(0));
        full_map.insert(info.name.clone(), desired);

        let desired = desired as i64;
        let backend_drift = row
            .backend_quota
            .map_or(true, |backend| backend < 0 || backend != desired);
        if backend_drift || row.desired_backend_quota != Some(desired) {
            marked.push((info.name.clone(), desired));
        }
    }

    if marked.is_empty() {
        return Ok(());
    }

    ctx.store
        .set_desired_backend_quota(target.service.id, &marked)
        .await?;

    let project = ClusterContext::project_ref(&target.domain, &target.project);
    // Backends may require the complete quota set, so the call carries every
    // applicable resource, not only the drifted ones.
    match plugin.set_quota(&project, &full_map).await {
        Ok(()) => {
            ctx.store
                .set_backend_quota(target.service.id, &marked)
                .await?;
            let details: serde_json::Map<String, serde_json::Value> = marked
                .iter()
                .map(|(name, quota)| (name.clone(), serde_json::json!(quota)))
                .collect();
            QuotaChangeEvent::new(
                &ctx.cluster_id,
                &target.domain.name,
                &target.project.name,
                &target.project.uuid,
                &target.service.service_type,
            )
            .with_details(serde_json::Value::Object(details))
            .emit();
            tracing::info!(
                project = %target.project.name,
                service = %target.service.service_type,
                resources = marked.len(),
                "pushed desired quota into backend"
            );
            Ok(())
        }
        Err(error) => {
            // backend_quota stays untouched; the drift is re-evaluated by
            // the next scrape.
            tracing::error!(
                project = %target.project.name,
                service = %target.service.service_type,
                %error,
                "backend rejected quota update"
            );
            Ok(())
        }
    }
}
