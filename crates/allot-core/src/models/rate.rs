use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::units::Unit;

/// Static metadata of one rate, as declared by its quota plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateInfo {
    pub name: String,
    #[serde(default)]
    pub unit: Unit,
}

/// Cumulative usage of one rate: a non-negative integer of unbounded size,
/// carried as its plain decimal representation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RateValue(String);

impl RateValue {
    pub fn parse(s: impl Into<String>) -> Result<Self, CoreError> {
        let s = s.into();
        if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
            Ok(RateValue(s))
        } else {
            Err(CoreError::InvalidBigInt(s))
        }
    }

    pub fn zero() -> Self {
        RateValue("0".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RateValue {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, CoreError> {
        RateValue::parse(s)
    }
}

impl From<RateValue> for String {
    fn from(v: RateValue) -> String {
        v.0
    }
}

impl std::fmt::Display for RateValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one rate scrape: rate name → cumulative usage, plus the new
/// opaque scrape state to persist for the next round.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateData {
    pub rates: BTreeMap<String, RateValue>,
    #[serde(default)]
    pub scrape_state: String,
}
