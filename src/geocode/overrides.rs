//! Per-title repairs for places the provider cannot resolve on its own.
//!
//! File format:
//! ```json
//! {
//!   "manual":   { "大都会舞厅": { "lat": 31.229, "lon": 121.451, "locality": "静安区" } },
//!   "rewrites": { "夜东京": "上海市-黄浦区-进贤路-夜东京" }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use super::types::{Candidate, GeoError, LatLon, MatchMethod, ResolutionOutcome};

pub const MANUAL_PROVIDER_ID: &str = "manual";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualPoint {
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub locality: String,
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Overrides {
    pub manual: HashMap<String, ManualPoint>,
    /// Title → replacement hierarchical address.
    pub rewrites: HashMap<String, String>,
}

impl Overrides {
    pub fn load(path: &Path) -> Result<Self, GeoError> {
        let data = std::fs::read_to_string(path)?;
        let overrides: Self = serde_json::from_str(&data)?;
        for (title, point) in &overrides.manual {
            if LatLon::new(point.lat, point.lon).is_none() {
                return Err(GeoError::Config(format!(
                    "manual point for '{}' is out of range: ({}, {})",
                    title, point.lat, point.lon
                )));
            }
        }
        tracing::info!(
            manual = overrides.manual.len(),
            rewrites = overrides.rewrites.len(),
            path = %path.display(),
            "loaded overrides"
        );
        Ok(overrides)
    }

    pub fn is_empty(&self) -> bool {
        self.manual.is_empty() && self.rewrites.is_empty()
    }

    /// A `manual` outcome when `title` has fixed coordinates.
    pub fn manual_outcome(&self, title: &str, address: &str) -> Option<ResolutionOutcome> {
        let point = self.manual.get(title)?;
        let position = LatLon::new(point.lat, point.lon)?;
        Some(ResolutionOutcome {
            candidate: Some(Candidate {
                position: Some(position),
                normalized_address: point.address.clone().unwrap_or_else(|| address.to_string()),
                locality: point.locality.clone(),
                matched_name: title.to_string(),
                provider_id: MANUAL_PROVIDER_ID.to_string(),
                place_id: None,
            }),
            match_level: Some(0),
            validation_passed: true,
            validation_detail: None,
            match_method: MatchMethod::Manual,
            needs_manual_review: false,
            reason: None,
        })
    }

    /// The address to resolve for `title`: its rewrite, or `address` unchanged.
    pub fn address_for<'a>(&'a self, title: &str, address: &'a str) -> &'a str {
        self.rewrites.get(title).map(String::as_str).unwrap_or(address)
    }
}
