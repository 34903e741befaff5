use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use allot_core::models::{
    CapacityData, KeystoneDomain, KeystoneProject, RateData, RateInfo, ResourceInfo, ScrapeData,
    ServiceInfo,
};

use crate::error::PluginError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The project a scrape or quota write targets, with enough identity context
/// for backends that scope requests by domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectRef {
    pub uuid: String,
    pub name: String,
    pub domain_uuid: String,
    pub domain_name: String,
}

/// The cluster a capacity scrape targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterRef {
    pub cluster_id: String,
    pub region: Option<String>,
}

/// Lists domains and projects from the identity source. Pure read.
pub trait DiscoveryPlugin: Send + Sync {
    fn list_domains(&self) -> BoxFuture<'_, Result<Vec<KeystoneDomain>, PluginError>>;

    fn list_projects<'a>(
        &'a self,
        domain: &'a KeystoneDomain,
    ) -> BoxFuture<'a, Result<Vec<KeystoneProject>, PluginError>>;
}

/// One impl per service type. Declares the service's resources and rates,
/// reads per-project usage and backend quota, and writes backend quota.
///
/// A quota plugin is driven by exactly one scrape worker and one rate worker;
/// implementations only need interior mutability for state they share between
/// those two.
pub trait QuotaPlugin: Send + Sync {
    fn service_info(&self) -> &ServiceInfo;

    /// Resources this service reports. Rows for names outside this set are
    /// pruned from the store.
    fn resources(&self) -> &[ResourceInfo];

    fn rates(&self) -> &[RateInfo];

    /// Read usage and backend-enforced quota for one project.
    fn scrape<'a>(
        &'a self,
        project: &'a ProjectRef,
    ) -> BoxFuture<'a, Result<ScrapeData, PluginError>>;

    /// Read cumulative rate usage for one project. `prev_state` is the opaque
    /// string returned by the previous call, if any; the returned
    /// `RateData::scrape_state` is persisted for the next one.
    fn scrape_rates<'a>(
        &'a self,
        project: &'a ProjectRef,
        prev_state: Option<&'a str>,
    ) -> BoxFuture<'a, Result<RateData, PluginError>>;

    /// Write the full set of desired quotas into the backend. Backends may
    /// require a complete map, so callers pass every resource, not only the
    /// changed ones.
    fn set_quota<'a>(
        &'a self,
        project: &'a ProjectRef,
        quotas: &'a BTreeMap<String, u64>,
    ) -> BoxFuture<'a, Result<(), PluginError>>;

    /// Whether the backend would accept the proposed quota set for this
    /// project. `Err` carries the human-readable rejection reason.
    fn is_quota_acceptable_for_project<'a>(
        &'a self,
        project: &'a ProjectRef,
        proposed: &'a BTreeMap<String, u64>,
    ) -> BoxFuture<'a, Result<(), String>>;
}

/// One impl per capacitor id: reports cluster-wide capacity for one or more
/// (service, resource) pairs.
pub trait CapacityPlugin: Send + Sync {
    fn capacitor_id(&self) -> &str;

    fn scrape<'a>(
        &'a self,
        cluster: &'a ClusterRef,
    ) -> BoxFuture<'a, Result<(CapacityData, String), PluginError>>;
}
