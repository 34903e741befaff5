use std::collections::BTreeMap;

use allot_core::config::StaticDomainConfig;
use allot_core::models::{KeystoneDomain, KeystoneProject};

use crate::error::PluginError;
use crate::interface::{BoxFuture, DiscoveryPlugin};

/// Serves the domain/project tree given inline in the cluster config.
/// Used for development setups and tests; production clusters plug in an
/// identity-source client instead.
pub struct StaticDiscoveryPlugin {
    domains: Vec<KeystoneDomain>,
    projects_by_domain: BTreeMap<String, Vec<KeystoneProject>>,
}

impl StaticDiscoveryPlugin {
    pub fn new(seed: &[StaticDomainConfig]) -> Self {
        let domains = seed
            .iter()
            .map(|d| KeystoneDomain {
                uuid: d.uuid.clone(),
                name: d.name.clone(),
            })
            .collect();
        let projects_by_domain = seed
            .iter()
            .map(|d| (d.uuid.clone(), d.projects.clone()))
            .collect();
        StaticDiscoveryPlugin {
            domains,
            projects_by_domain,
        }
    }
}

impl DiscoveryPlugin for StaticDiscoveryPlugin {
    fn list_domains(&self) -> BoxFuture<'_, Result<Vec<KeystoneDomain>, PluginError>> {
        Box::pin(async { Ok(self.domains.clone()) })
    }

    fn list_projects<'a>(
        &'a self,
        domain: &'a KeystoneDomain,
    ) -> BoxFuture<'a, Result<Vec<KeystoneProject>, PluginError>> {
        Box::pin(async {
            Ok(self
                .projects_by_domain
                .get(&domain.uuid)
                .cloned()
                .unwrap_or_default())
        })
    }
}
