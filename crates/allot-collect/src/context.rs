use std::sync::Arc;

use allot_core::clock::Clock;
use allot_core::config::{ClusterConfig, CollectorConfig, TimingConfig};
use allot_core::constraints::QuotaConstraintSet;
use allot_plugins::{ClusterRef, PluginRegistry, ProjectRef, QuotaPlugin};
use allot_store::rows::{DomainRow, ProjectRow};
use allot_store::Store;

use crate::metrics::CollectorMetrics;

/// Immutable-after-startup bundle shared by all loops of one cluster.
pub struct ClusterContext {
    pub cluster_id: String,
    pub cluster: ClusterConfig,
    pub collector: CollectorConfig,
    pub constraints: QuotaConstraintSet,
    pub registry: PluginRegistry,
    pub store: Arc<dyn Store>,
    pub clock: Clock,
    pub metrics: CollectorMetrics,
}

impl ClusterContext {
    pub fn new(
        cluster_id: impl Into<String>,
        cluster: ClusterConfig,
        collector: CollectorConfig,
        constraints: QuotaConstraintSet,
        registry: PluginRegistry,
        store: Arc<dyn Store>,
        clock: Clock,
    ) -> Result<Self, prometheus::Error> {
        Ok(ClusterContext {
            cluster_id: cluster_id.into(),
            cluster,
            collector,
            constraints,
            registry,
            store,
            clock,
            metrics: CollectorMetrics::new()?,
        })
    }

    pub fn timing(&self) -> &TimingConfig {
        &self.collector.timing
    }

    pub fn cluster_ref(&self) -> ClusterRef {
        ClusterRef {
            cluster_id: self.cluster_id.clone(),
            region: self.cluster.region.clone(),
        }
    }

    pub fn project_ref(domain: &DomainRow, project: &ProjectRow) -> ProjectRef {
        ProjectRef {
            uuid: project.uuid.clone(),
            name: project.name.clone(),
            domain_uuid: domain.uuid.clone(),
            domain_name: domain.name.clone(),
        }
    }

    /// The (resource name, quota) seeds a brand-new project receives for one
    /// service: constraint-mandated minima first, distribution-model
    /// defaults otherwise. Zero-quota seeds are omitted (the first scrape
    /// creates those rows anyway).
    pub fn initial_project_resources(
        &self,
        domain_name: &str,
        project_name: &str,
        service_type: &str,
    ) -> Vec<(String, u64)> {
        let Some(plugin) = self.registry.quota_plugin(service_type) else {
            return Vec::new();
        };
        let mut seeds = Vec::new();
        for info in plugin.resources() {
            if info.no_quota {
                continue;
            }
            let quota = match self
                .constraints
                .for_project(domain_name, project_name, service_type, &info.name)
            {
                Some(constraint) => constraint.initial_quota(),
                None => {
                    self.cluster
                        .resource_behavior(service_type, &info.name)
                        .distribution
                        .initial_quota()
                }
            };
            if quota > 0 {
                seeds.push((info.name.clone(), quota));
            }
        }
        seeds
    }
}
