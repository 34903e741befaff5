//! Shared fixture for the engine tests: a MemStore-backed cluster with the
//! unittest plugins and the deterministic test clock (t=0, +1 s per call).

use std::sync::Arc;

use allot_collect::ClusterContext;
use allot_core::clock::Clock;
use allot_core::config::{ClusterConfig, CollectorConfig};
use allot_core::constraints::QuotaConstraintSet;
use allot_plugins::static_discovery::StaticDiscoveryPlugin;
use allot_plugins::unittest::{UnitTestCapacityPlugin, UnitTestQuotaPlugin};
use allot_plugins::PluginRegistry;
use allot_store::MemStore;

pub const CLUSTER: &str = "west";

pub struct TestCluster {
    pub ctx: Arc<ClusterContext>,
    pub store: Arc<MemStore>,
    pub shared: Arc<UnitTestQuotaPlugin>,
    pub unshared: Arc<UnitTestQuotaPlugin>,
}

/// Two enabled services (shared, unshared), two domains with three projects:
/// germany/{berlin, dresden} and france/{paris}.
pub fn cluster_config(authoritative: bool) -> ClusterConfig {
    let yaml = format!(
        r#"
authoritative: {authoritative}
bursting: {{ max_multiplier: 0.2 }}
discovery:
  plugin: static
  static_domains:
    - uuid: uuid-for-germany
      name: germany
      projects:
        - {{ uuid: uuid-for-berlin, name: berlin, parent_uuid: uuid-for-germany }}
        - {{ uuid: uuid-for-dresden, name: dresden, parent_uuid: uuid-for-berlin }}
    - uuid: uuid-for-france
      name: france
      projects:
        - {{ uuid: uuid-for-paris, name: paris, parent_uuid: uuid-for-france }}
services:
  - {{ type: shared, plugin: unittest }}
  - {{ type: unshared, plugin: unittest }}
"#
    );
    serde_yaml::from_str(&yaml).unwrap()
}

pub fn constraints(yaml: &str) -> QuotaConstraintSet {
    let set: QuotaConstraintSet = serde_yaml::from_str(yaml).unwrap();
    set.validate().unwrap();
    set
}

pub fn build(authoritative: bool, constraints: QuotaConstraintSet) -> TestCluster {
    build_full(
        cluster_config(authoritative),
        CollectorConfig::default(),
        constraints,
        Vec::new(),
    )
}

pub fn build_full(
    config: ClusterConfig,
    collector: CollectorConfig,
    constraints: QuotaConstraintSet,
    capacitors: Vec<Arc<UnitTestCapacityPlugin>>,
) -> TestCluster {
    let shared = Arc::new(UnitTestQuotaPlugin::new("shared"));
    let unshared = Arc::new(UnitTestQuotaPlugin::new("unshared"));
    build_with_plugins(config, collector, constraints, shared, unshared, capacitors)
}

pub fn build_with_plugins(
    config: ClusterConfig,
    collector: CollectorConfig,
    constraints: QuotaConstraintSet,
    shared: Arc<UnitTestQuotaPlugin>,
    unshared: Arc<UnitTestQuotaPlugin>,
    capacitors: Vec<Arc<UnitTestCapacityPlugin>>,
) -> TestCluster {
    let store = Arc::new(MemStore::new());
    let discovery = Arc::new(StaticDiscoveryPlugin::new(&config.discovery.static_domains));

    let mut registry = PluginRegistry::new(discovery)
        .with_quota_plugin("shared", shared.clone())
        .with_quota_plugin("unshared", unshared.clone());
    for capacitor in capacitors {
        use allot_plugins::CapacityPlugin;
        let id = capacitor.capacitor_id().to_string();
        registry = registry.with_capacity_plugin(&id, capacitor);
    }

    let ctx = ClusterContext::new(
        CLUSTER,
        config,
        collector,
        constraints,
        registry,
        store.clone(),
        Clock::test(),
    )
    .unwrap();
    TestCluster {
        ctx: Arc::new(ctx),
        store,
        shared,
        unshared,
    }
}

/// A fresh context over an EXISTING store, for tests that change the
/// config, constraints or upstream seed between passes (the way a
/// collector restart would).
pub fn rebuild(
    config: ClusterConfig,
    store: Arc<MemStore>,
    constraints: QuotaConstraintSet,
) -> Arc<ClusterContext> {
    let discovery = Arc::new(StaticDiscoveryPlugin::new(&config.discovery.static_domains));
    let registry = PluginRegistry::new(discovery)
        .with_quota_plugin("shared", Arc::new(UnitTestQuotaPlugin::new("shared")))
        .with_quota_plugin("unshared", Arc::new(UnitTestQuotaPlugin::new("unshared")));
    Arc::new(
        ClusterContext::new(
            CLUSTER,
            config,
            CollectorConfig::default(),
            constraints,
            registry,
            store,
            Clock::test(),
        )
        .unwrap(),
    )
}

/// The id of a project's service row, looked up by project uuid and service
/// type.
pub async fn service_id(store: &MemStore, cluster: &str, project_uuid: &str, service_type: &str) -> i64 {
    use allot_store::Store;
    let (_, project) = store
        .project_by_uuid(cluster, project_uuid)
        .await
        .unwrap()
        .expect("project exists");
    store
        .project_services(project.id)
        .await
        .unwrap()
        .into_iter()
        .find(|s| s.service_type == service_type)
        .expect("service exists")
        .id
}
