//! Address decomposition: "Province-City-District-Street-POI" → ordered levels.

use serde::{Deserialize, Serialize};

use super::types::GeoError;

/// How the region hint sent with every query is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "camelCase")]
pub enum RegionHintPolicy {
    /// Level 0 only.
    #[default]
    TopLevel,
    /// Level 0 + level 1 when the query has both, otherwise level 0.
    TopTwoLevels,
}

/// Split an address into trimmed, non-empty segments, preserving order.
pub fn decompose(address: &str, delimiter: &str) -> Result<Vec<String>, GeoError> {
    if delimiter.is_empty() {
        return Err(GeoError::MalformedAddress(address.to_string()));
    }
    let levels: Vec<String> = address
        .split(delimiter)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    if levels.is_empty() {
        return Err(GeoError::MalformedAddress(address.to_string()));
    }
    Ok(levels)
}

/// Non-empty ordered administrative levels, broadest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressLevels(Vec<String>);

impl AddressLevels {
    pub fn parse(address: &str, delimiter: &str) -> Result<Self, GeoError> {
        decompose(address, delimiter).map(Self)
    }

    pub fn from_levels(levels: Vec<String>) -> Result<Self, GeoError> {
        let joined = levels.join("-");
        let cleaned: Vec<String> = levels
            .into_iter()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        if cleaned.is_empty() {
            return Err(GeoError::MalformedAddress(joined));
        }
        Ok(Self(cleaned))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    /// Broadest administrative unit (province or municipality).
    pub fn top(&self) -> &str {
        &self.0[0]
    }

    pub fn second(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }

    pub fn prefix(&self, depth: usize) -> &[String] {
        &self.0[..depth.min(self.0.len())]
    }

    /// Region hint for a query of `depth` levels.
    pub fn region_hint(&self, depth: usize, policy: RegionHintPolicy) -> String {
        match (policy, self.second()) {
            (RegionHintPolicy::TopTwoLevels, Some(second)) if depth >= 2 => {
                format!("{}{}", self.top(), second)
            }
            _ => self.top().to_string(),
        }
    }
}
