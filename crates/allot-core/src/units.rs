use serde::{Deserialize, Serialize};

/// Measurement unit of a resource, as reported by its quota plugin.
///
/// The metrics exporter publishes `multiplier` so that dashboards can convert
/// counted values into bytes without hardcoding unit tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Unit {
    #[default]
    #[serde(rename = "")]
    None,
    #[serde(rename = "B")]
    Bytes,
    #[serde(rename = "KiB")]
    Kibibytes,
    #[serde(rename = "MiB")]
    Mebibytes,
    #[serde(rename = "GiB")]
    Gibibytes,
    #[serde(rename = "TiB")]
    Tebibytes,
}

impl Unit {
    /// How many base units (bytes, or plain count for `None`) one step of
    /// this unit represents.
    pub fn multiplier(self) -> u64 {
        match self {
            Unit::None | Unit::Bytes => 1,
            Unit::Kibibytes => 1 << 10,
            Unit::Mebibytes => 1 << 20,
            Unit::Gibibytes => 1 << 30,
            Unit::Tebibytes => 1 << 40,
        }
    }
}

impl std::fmt::Display for Unit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Unit::None => "",
            Unit::Bytes => "B",
            Unit::Kibibytes => "KiB",
            Unit::Mebibytes => "MiB",
            Unit::Gibibytes => "GiB",
            Unit::Tebibytes => "TiB",
        };
        f.write_str(s)
    }
}
