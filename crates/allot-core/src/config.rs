use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::TimeDelta;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::models::KeystoneProject;

/// Top-level configuration file: one database, one or more clusters, and the
/// collector/API sections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub clusters: BTreeMap<String, ClusterConfig>,
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

impl Config {
    pub fn cluster(&self, cluster_id: &str) -> Result<&ClusterConfig, CoreError> {
        self.clusters
            .get(cluster_id)
            .ok_or_else(|| CoreError::UnknownCluster(cluster_id.to_string()))
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        for (cluster_id, cluster) in &self.clusters {
            cluster.validate(cluster_id)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Immutable-after-startup description of one cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    /// Whether this collector pushes desired quota into the backend.
    #[serde(default)]
    pub authoritative: bool,
    #[serde(default)]
    pub bursting: BurstingConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub capacitors: Vec<CapacitorConfig>,
    /// Path to the quota-constraints file, relative to the config file.
    #[serde(default)]
    pub constraints: Option<PathBuf>,
}

impl ClusterConfig {
    pub fn service_types(&self) -> Vec<String> {
        self.services.iter().map(|s| s.service_type.clone()).collect()
    }

    pub fn service(&self, service_type: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.service_type == service_type)
    }

    pub fn has_service(&self, service_type: &str) -> bool {
        self.service(service_type).is_some()
    }

    pub fn resource_behavior(&self, service_type: &str, resource_name: &str) -> ResourceBehavior {
        self.service(service_type)
            .and_then(|s| s.resources.get(resource_name))
            .copied()
            .unwrap_or_default()
    }

    fn validate(&self, cluster_id: &str) -> Result<(), CoreError> {
        if self.services.is_empty() {
            return Err(CoreError::InvalidConfig(format!(
                "cluster {cluster_id}: no services configured"
            )));
        }
        let mut seen = std::collections::BTreeSet::new();
        for service in &self.services {
            if !seen.insert(&service.service_type) {
                return Err(CoreError::InvalidConfig(format!(
                    "cluster {cluster_id}: duplicate service type {:?}",
                    service.service_type
                )));
            }
        }
        let mut capacitor_ids = std::collections::BTreeSet::new();
        for capacitor in &self.capacitors {
            if !capacitor_ids.insert(&capacitor.id) {
                return Err(CoreError::InvalidConfig(format!(
                    "cluster {cluster_id}: duplicate capacitor id {:?}",
                    capacitor.id
                )));
            }
        }
        if self.bursting.max_multiplier < 0.0 {
            return Err(CoreError::InvalidConfig(format!(
                "cluster {cluster_id}: bursting.max_multiplier must not be negative"
            )));
        }
        self.discovery.compile_filter()?;
        Ok(())
    }
}

/// Credentials for the identity source and backend services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub auth_url: String,
    pub user_name: String,
    #[serde(default)]
    pub user_domain_name: String,
    pub password: String,
    #[serde(default)]
    pub project_name: String,
    #[serde(default)]
    pub project_domain_name: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BurstingConfig {
    /// Backend quota may exceed stored quota by this fraction for projects
    /// with bursting enabled, e.g. 0.2 allows 20% above.
    #[serde(default)]
    pub max_multiplier: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_discovery_plugin")]
    pub plugin: String,
    /// Only domains whose name matches are synchronised.
    #[serde(default)]
    pub include_domain_rx: Option<String>,
    /// Domains whose name matches are skipped even if included.
    #[serde(default)]
    pub exclude_domain_rx: Option<String>,
    /// Descend into all known domains on every pass instead of only into
    /// newly created ones.
    #[serde(default)]
    pub scan_all_projects: bool,
    /// Seed data for the `static` discovery plugin.
    #[serde(default)]
    pub static_domains: Vec<StaticDomainConfig>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            plugin: default_discovery_plugin(),
            include_domain_rx: None,
            exclude_domain_rx: None,
            scan_all_projects: false,
            static_domains: Vec::new(),
        }
    }
}

fn default_discovery_plugin() -> String {
    "static".to_string()
}

impl DiscoveryConfig {
    pub fn compile_filter(&self) -> Result<DomainFilter, CoreError> {
        Ok(DomainFilter {
            include: self
                .include_domain_rx
                .as_deref()
                .map(Regex::new)
                .transpose()?,
            exclude: self
                .exclude_domain_rx
                .as_deref()
                .map(Regex::new)
                .transpose()?,
        })
    }
}

/// Compiled include/exclude filter on domain names.
#[derive(Debug, Clone, Default)]
pub struct DomainFilter {
    include: Option<Regex>,
    exclude: Option<Regex>,
}

impl DomainFilter {
    pub fn matches(&self, domain_name: &str) -> bool {
        if let Some(exclude) = &self.exclude {
            if exclude.is_match(domain_name) {
                return false;
            }
        }
        match &self.include {
            Some(include) => include.is_match(domain_name),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticDomainConfig {
    pub uuid: String,
    pub name: String,
    #[serde(default)]
    pub projects: Vec<KeystoneProject>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(rename = "type")]
    pub service_type: String,
    pub plugin: String,
    /// Plugin-specific parameters, passed through verbatim.
    #[serde(default)]
    pub params: serde_json::Value,
    /// Per-resource behavior overrides, keyed by resource name.
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceBehavior>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceBehavior {
    /// Cluster capacity is multiplied by this factor in reports and metrics.
    #[serde(default = "default_overcommit_factor")]
    pub overcommit_factor: f64,
    #[serde(default)]
    pub distribution: DistributionConfig,
}

impl Default for ResourceBehavior {
    fn default() -> Self {
        ResourceBehavior {
            overcommit_factor: default_overcommit_factor(),
            distribution: DistributionConfig::default(),
        }
    }
}

fn default_overcommit_factor() -> f64 {
    1.0
}

/// How quota for a resource is distributed to projects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionModel {
    /// Projects start at zero; quota flows down from domain admins.
    #[default]
    Hierarchical,
    /// A central authority hands every project the same initial quota.
    Centralized,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DistributionConfig {
    #[serde(default)]
    pub model: DistributionModel,
    /// Initial project quota under the centralized model.
    #[serde(default)]
    pub default_initial_quota: u64,
}

impl DistributionConfig {
    /// The quota a brand-new project resource starts with, absent any
    /// constraint.
    pub fn initial_quota(&self) -> u64 {
        match self.model {
            DistributionModel::Hierarchical => 0,
            DistributionModel::Centralized => self.default_initial_quota,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacitorConfig {
    pub id: String,
    pub plugin: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    #[serde(default = "default_metrics_listen")]
    pub metrics_listen: String,
    /// Also expose per-domain/project data gauges, not only aggregates.
    #[serde(default)]
    pub expose_data_metrics: bool,
    /// Omit zero-valued data gauges from the exposition.
    #[serde(default)]
    pub skip_zero: bool,
    #[serde(default)]
    pub timing: TimingConfig,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        CollectorConfig {
            metrics_listen: default_metrics_listen(),
            expose_data_metrics: false,
            skip_zero: false,
            timing: TimingConfig::default(),
        }
    }
}

fn default_metrics_listen() -> String {
    "127.0.0.1:8080".to_string()
}

/// Loop intervals, in seconds. Defaults match the documented behavior of
/// each loop.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_discover_interval")]
    pub discover_interval_secs: u64,
    #[serde(default = "default_scrape_interval")]
    pub scrape_interval_secs: u64,
    #[serde(default = "default_recheck_interval")]
    pub recheck_interval_secs: u64,
    #[serde(default = "default_idle_interval")]
    pub idle_interval_secs: u64,
    #[serde(default = "default_service_not_deployed_interval")]
    pub service_not_deployed_interval_secs: u64,
    #[serde(default = "default_capacity_scan_interval")]
    pub capacity_scan_interval_secs: u64,
    #[serde(default = "default_capacity_initial_delay")]
    pub capacity_initial_delay_secs: u64,
    #[serde(default = "default_consistency_interval")]
    pub consistency_interval_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            discover_interval_secs: default_discover_interval(),
            scrape_interval_secs: default_scrape_interval(),
            recheck_interval_secs: default_recheck_interval(),
            idle_interval_secs: default_idle_interval(),
            service_not_deployed_interval_secs: default_service_not_deployed_interval(),
            capacity_scan_interval_secs: default_capacity_scan_interval(),
            capacity_initial_delay_secs: default_capacity_initial_delay(),
            consistency_interval_secs: default_consistency_interval(),
        }
    }
}

fn default_discover_interval() -> u64 {
    3 * 60
}
fn default_scrape_interval() -> u64 {
    30 * 60
}
fn default_recheck_interval() -> u64 {
    5 * 60
}
fn default_idle_interval() -> u64 {
    5
}
fn default_service_not_deployed_interval() -> u64 {
    5 * 60
}
fn default_capacity_scan_interval() -> u64 {
    15 * 60
}
fn default_capacity_initial_delay() -> u64 {
    60
}
fn default_consistency_interval() -> u64 {
    60 * 60
}

impl TimingConfig {
    pub fn scrape_interval(&self) -> TimeDelta {
        TimeDelta::seconds(self.scrape_interval_secs as i64)
    }

    pub fn recheck_interval(&self) -> TimeDelta {
        TimeDelta::seconds(self.recheck_interval_secs as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_listen")]
    pub listen: String,
    /// Origins allowed by CORS; empty means same-origin only.
    #[serde(default)]
    pub cors_allowed_origins: Vec<String>,
    /// Request paths that are not access-logged, e.g. "/healthz".
    #[serde(default)]
    pub request_log_exceptions: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            listen: default_api_listen(),
            cors_allowed_origins: Vec::new(),
            request_log_exceptions: Vec::new(),
        }
    }
}

fn default_api_listen() -> String {
    "127.0.0.1:8081".to_string()
}
