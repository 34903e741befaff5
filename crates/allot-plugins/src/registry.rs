use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use allot_core::config::ClusterConfig;

use crate::error::PluginError;
use crate::interface::{CapacityPlugin, DiscoveryPlugin, QuotaPlugin};
use crate::static_discovery::StaticDiscoveryPlugin;
use crate::unittest::{UnitTestCapacityPlugin, UnitTestQuotaPlugin};

/// Options passed through to backend-facing plugins.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackendOptions {
    /// Disable TLS verification on backend connections. Development only.
    pub insecure: bool,
}

/// All plugin instances for one cluster, built once at startup and immutable
/// afterwards. Quota plugins are keyed by service type, capacity plugins by
/// capacitor id.
pub struct PluginRegistry {
    discovery: Arc<dyn DiscoveryPlugin>,
    quota: BTreeMap<String, Arc<dyn QuotaPlugin>>,
    capacity: BTreeMap<String, Arc<dyn CapacityPlugin>>,
    pub backend: BackendOptions,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("quota", &self.quota.keys().collect::<Vec<_>>())
            .field("capacity", &self.capacity.keys().collect::<Vec<_>>())
            .field("backend", &self.backend)
            .finish()
    }
}

impl PluginRegistry {
    /// Wire up the plugins named in the cluster config. Unknown plugin names
    /// are a startup failure.
    pub fn from_config(
        cluster: &ClusterConfig,
        backend: BackendOptions,
    ) -> Result<Self, PluginError> {
        let discovery: Arc<dyn DiscoveryPlugin> = match cluster.discovery.plugin.as_str() {
            "static" => Arc::new(StaticDiscoveryPlugin::new(&cluster.discovery.static_domains)),
            name => {
                return Err(PluginError::UnknownPlugin {
                    kind: "discovery",
                    name: name.to_string(),
                });
            }
        };

        let mut registry = PluginRegistry {
            discovery,
            quota: BTreeMap::new(),
            capacity: BTreeMap::new(),
            backend,
        };

        for service in &cluster.services {
            let plugin: Arc<dyn QuotaPlugin> = match service.plugin.as_str() {
                "unittest" => Arc::new(UnitTestQuotaPlugin::from_params(
                    &service.service_type,
                    &service.params,
                )?),
                name => {
                    return Err(PluginError::UnknownPlugin {
                        kind: "quota",
                        name: name.to_string(),
                    });
                }
            };
            registry
                .quota
                .insert(service.service_type.clone(), plugin);
        }

        for capacitor in &cluster.capacitors {
            let plugin: Arc<dyn CapacityPlugin> = match capacitor.plugin.as_str() {
                "unittest" => {
                    Arc::new(UnitTestCapacityPlugin::from_params(&capacitor.id, &capacitor.params)?)
                }
                name => {
                    return Err(PluginError::UnknownPlugin {
                        kind: "capacity",
                        name: name.to_string(),
                    });
                }
            };
            registry.capacity.insert(capacitor.id.clone(), plugin);
        }

        Ok(registry)
    }

    /// Assemble a registry from pre-built plugin instances. Tests use this to
    /// keep handles to the unittest plugins they poke.
    pub fn new(discovery: Arc<dyn DiscoveryPlugin>) -> Self {
        PluginRegistry {
            discovery,
            quota: BTreeMap::new(),
            capacity: BTreeMap::new(),
            backend: BackendOptions::default(),
        }
    }

    pub fn with_quota_plugin(
        mut self,
        service_type: &str,
        plugin: Arc<dyn QuotaPlugin>,
    ) -> Self {
        self.quota.insert(service_type.to_string(), plugin);
        self
    }

    pub fn with_capacity_plugin(mut self, id: &str, plugin: Arc<dyn CapacityPlugin>) -> Self {
        self.capacity.insert(id.to_string(), plugin);
        self
    }

    pub fn discovery(&self) -> &dyn DiscoveryPlugin {
        self.discovery.as_ref()
    }

    pub fn quota_plugin(&self, service_type: &str) -> Option<&dyn QuotaPlugin> {
        self.quota.get(service_type).map(|p| p.as_ref())
    }

    pub fn quota_plugins(&self) -> impl Iterator<Item = (&str, &dyn QuotaPlugin)> {
        self.quota.iter().map(|(k, v)| (k.as_str(), v.as_ref()))
    }

    pub fn capacity_plugins(&self) -> impl Iterator<Item = (&str, &dyn CapacityPlugin)> {
        self.capacity.iter().map(|(k, v)| (k.as_str(), v.as_ref()))
    }

    /// Resource names advertised by the quota plugin for a service type.
    /// Capacity values for names outside this set are discarded.
    pub fn advertised_resources(&self, service_type: &str) -> BTreeSet<String> {
        self.quota
            .get(service_type)
            .map(|p| p.resources().iter().map(|r| r.name.clone()).collect())
            .unwrap_or_default()
    }
}
