pub mod capacity;
pub mod identity;
pub mod rate;
pub mod resource;
pub mod service;

pub use capacity::{AzCapacity, CapacityData, CapacityValue};
pub use identity::{KeystoneDomain, KeystoneProject};
pub use rate::{RateData, RateInfo, RateValue};
pub use resource::{ResourceData, ResourceInfo, ScrapeData};
pub use service::ServiceInfo;
