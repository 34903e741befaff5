use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::Deserialize;

use allot_core::models::{
    CapacityData, RateData, RateInfo, RateValue, ResourceData, ResourceInfo, ScrapeData,
    ServiceInfo,
};

use crate::error::PluginError;
use crate::interface::{BoxFuture, CapacityPlugin, ClusterRef, ProjectRef, QuotaPlugin};

/// Deterministic quota plugin for tests and development clusters.
///
/// Reports a fixed resource/rate set with configurable backend data, records
/// `set_quota` calls (and folds them back into the reported backend quota),
/// and fails on demand with either error kind.
pub struct UnitTestQuotaPlugin {
    info: ServiceInfo,
    resources: Vec<ResourceInfo>,
    rates: Vec<RateInfo>,
    data: Mutex<BTreeMap<String, ResourceData>>,
    rate_data: Mutex<BTreeMap<String, RateValue>>,
    scrape_count: Mutex<u64>,
    next_scrape_error: Mutex<Option<PluginError>>,
    next_rate_scrape_error: Mutex<Option<PluginError>>,
    next_set_quota_error: Mutex<Option<PluginError>>,
    set_quota_calls: Mutex<Vec<BTreeMap<String, u64>>>,
    max_acceptable_quota: Mutex<Option<u64>>,
}

#[derive(Debug, Default, Deserialize)]
struct UnitTestQuotaParams {
    #[serde(default)]
    resources: Option<Vec<ResourceInfo>>,
    #[serde(default)]
    rates: Vec<RateInfo>,
    #[serde(default)]
    data: Option<BTreeMap<String, ResourceData>>,
}

impl UnitTestQuotaPlugin {
    /// Default fixture: resources `capacity` (backend quota 100, usage 0)
    /// and `things` (backend quota 42, usage 2), no rates.
    pub fn new(service_type: &str) -> Self {
        let data = [
            (
                "capacity".to_string(),
                ResourceData {
                    quota: 100,
                    usage: 0,
                    ..ResourceData::default()
                },
            ),
            (
                "things".to_string(),
                ResourceData {
                    quota: 42,
                    usage: 2,
                    ..ResourceData::default()
                },
            ),
        ]
        .into_iter()
        .collect();

        UnitTestQuotaPlugin {
            info: ServiceInfo {
                service_type: service_type.to_string(),
                product_name: format!("{service_type}-unittest"),
            },
            resources: vec![
                ResourceInfo::new("capacity"),
                ResourceInfo::new("things"),
            ],
            rates: Vec::new(),
            data: Mutex::new(data),
            rate_data: Mutex::new(BTreeMap::new()),
            scrape_count: Mutex::new(0),
            next_scrape_error: Mutex::new(None),
            next_rate_scrape_error: Mutex::new(None),
            next_set_quota_error: Mutex::new(None),
            set_quota_calls: Mutex::new(Vec::new()),
            max_acceptable_quota: Mutex::new(None),
        }
    }

    pub fn from_params(
        service_type: &str,
        params: &serde_json::Value,
    ) -> Result<Self, PluginError> {
        let mut plugin = Self::new(service_type);
        if params.is_null() {
            return Ok(plugin);
        }
        let params: UnitTestQuotaParams = serde_json::from_value(params.clone())?;
        if let Some(resources) = params.resources {
            plugin.resources = resources;
        }
        plugin.rates = params.rates;
        if let Some(data) = params.data {
            plugin.data = Mutex::new(data);
        }
        Ok(plugin)
    }

    pub fn with_resources(mut self, resources: Vec<ResourceInfo>) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_rates(mut self, rates: Vec<RateInfo>) -> Self {
        self.rates = rates;
        self
    }

    /// Replace the backend view of one resource.
    pub fn set_resource_data(&self, name: &str, data: ResourceData) {
        self.data.lock().unwrap().insert(name.to_string(), data);
    }

    pub fn resource_data(&self, name: &str) -> Option<ResourceData> {
        self.data.lock().unwrap().get(name).cloned()
    }

    pub fn set_rate_value(&self, name: &str, value: RateValue) {
        self.rate_data
            .lock()
            .unwrap()
            .insert(name.to_string(), value);
    }

    /// The next `scrape` call fails with this error.
    pub fn fail_next_scrape(&self, error: PluginError) {
        *self.next_scrape_error.lock().unwrap() = Some(error);
    }

    /// The next `scrape_rates` call fails with this error.
    pub fn fail_next_rate_scrape(&self, error: PluginError) {
        *self.next_rate_scrape_error.lock().unwrap() = Some(error);
    }

    /// The next `set_quota` call fails with this error.
    pub fn fail_next_set_quota(&self, error: PluginError) {
        *self.next_set_quota_error.lock().unwrap() = Some(error);
    }

    /// Reject proposed quotas above this value in
    /// `is_quota_acceptable_for_project`.
    pub fn set_max_acceptable_quota(&self, max: Option<u64>) {
        *self.max_acceptable_quota.lock().unwrap() = max;
    }

    /// All quota maps passed to `set_quota`, in call order.
    pub fn set_quota_calls(&self) -> Vec<BTreeMap<String, u64>> {
        self.set_quota_calls.lock().unwrap().clone()
    }
}

impl QuotaPlugin for UnitTestQuotaPlugin {
    fn service_info(&self) -> &ServiceInfo {
        &self.info
    }

    fn resources(&self) -> &[ResourceInfo] {
        &self.resources
    }

    fn rates(&self) -> &[RateInfo] {
        &self.rates
    }

    fn scrape<'a>(
        &'a self,
        _project: &'a ProjectRef,
    ) -> BoxFuture<'a, Result<ScrapeData, PluginError>> {
        Box::pin(async {
            if let Some(error) = self.next_scrape_error.lock().unwrap().take() {
                return Err(error);
            }
            let mut count = self.scrape_count.lock().unwrap();
            *count += 1;
            let data = self.data.lock().unwrap();
            let resources = self
                .resources
                .iter()
                .map(|info| {
                    let data = data.get(&info.name).cloned().unwrap_or_default();
                    (info.name.clone(), data)
                })
                .collect();
            Ok(ScrapeData {
                resources,
                serialized_metrics: format!("{{\"scrape_count\":{}}}", *count),
            })
        })
    }

    fn scrape_rates<'a>(
        &'a self,
        _project: &'a ProjectRef,
        prev_state: Option<&'a str>,
    ) -> BoxFuture<'a, Result<RateData, PluginError>> {
        Box::pin(async move {
            if let Some(error) = self.next_rate_scrape_error.lock().unwrap().take() {
                return Err(error);
            }
            let rate_data = self.rate_data.lock().unwrap();
            let rates = self
                .rates
                .iter()
                .map(|info| {
                    let value = rate_data
                        .get(&info.name)
                        .cloned()
                        .unwrap_or_else(RateValue::zero);
                    (info.name.clone(), value)
                })
                .collect();
            let round = prev_state
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0);
            Ok(RateData {
                rates,
                scrape_state: (round + 1).to_string(),
            })
        })
    }

    fn set_quota<'a>(
        &'a self,
        _project: &'a ProjectRef,
        quotas: &'a BTreeMap<String, u64>,
    ) -> BoxFuture<'a, Result<(), PluginError>> {
        Box::pin(async move {
            if let Some(error) = self.next_set_quota_error.lock().unwrap().take() {
                return Err(error);
            }
            self.set_quota_calls.lock().unwrap().push(quotas.clone());
            let mut data = self.data.lock().unwrap();
            for (name, quota) in quotas {
                data.entry(name.clone()).or_default().quota = *quota as i64;
            }
            Ok(())
        })
    }

    fn is_quota_acceptable_for_project<'a>(
        &'a self,
        _project: &'a ProjectRef,
        proposed: &'a BTreeMap<String, u64>,
    ) -> BoxFuture<'a, Result<(), String>> {
        Box::pin(async move {
            if let Some(max) = *self.max_acceptable_quota.lock().unwrap() {
                for (name, quota) in proposed {
                    if *quota > max {
                        return Err(format!("quota for {name} exceeds backend limit {max}"));
                    }
                }
            }
            Ok(())
        })
    }
}

/// Deterministic capacity plugin: reports a configured capacity map.
pub struct UnitTestCapacityPlugin {
    id: String,
    data: Mutex<CapacityData>,
    next_scrape_error: Mutex<Option<PluginError>>,
}

#[derive(Debug, Default, Deserialize)]
struct UnitTestCapacityParams {
    #[serde(default)]
    values: CapacityData,
}

impl UnitTestCapacityPlugin {
    pub fn new(id: &str, data: CapacityData) -> Self {
        UnitTestCapacityPlugin {
            id: id.to_string(),
            data: Mutex::new(data),
            next_scrape_error: Mutex::new(None),
        }
    }

    pub fn from_params(id: &str, params: &serde_json::Value) -> Result<Self, PluginError> {
        if params.is_null() {
            return Ok(Self::new(id, CapacityData::default()));
        }
        let params: UnitTestCapacityParams = serde_json::from_value(params.clone())?;
        Ok(Self::new(id, params.values))
    }

    pub fn set_data(&self, data: CapacityData) {
        *self.data.lock().unwrap() = data;
    }

    pub fn fail_next_scrape(&self, error: PluginError) {
        *self.next_scrape_error.lock().unwrap() = Some(error);
    }
}

impl CapacityPlugin for UnitTestCapacityPlugin {
    fn capacitor_id(&self) -> &str {
        &self.id
    }

    fn scrape<'a>(
        &'a self,
        _cluster: &'a ClusterRef,
    ) -> BoxFuture<'a, Result<(CapacityData, String), PluginError>> {
        Box::pin(async {
            if let Some(error) = self.next_scrape_error.lock().unwrap().take() {
                return Err(error);
            }
            let data = self.data.lock().unwrap().clone();
            Ok((data, format!("{{\"capacitor\":{:?}}}", self.id)))
        })
    }
}
