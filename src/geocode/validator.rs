//! Candidate validation: administrative-unit consistency and distance plausibility.
//!
//! The validator only reports; what to do with a failed candidate is the
//! resolver's decision.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::address::AddressLevels;
use super::reference::ReferenceTable;
use super::types::{Candidate, LatLon, Query};

const EARTH_RADIUS_KM: f64 = 6371.0;

/// The four direct-controlled municipalities, where province and city collapse.
pub const MUNICIPALITIES: [&str; 4] = ["北京市", "上海市", "天津市", "重庆市"];

/// Administrative suffixes stripped when comparing unit names.
const UNIT_SUFFIXES: [&str; 6] = ["特别行政区", "自治区", "自治州", "地区", "省", "市"];

/// Great-circle distance in kilometres.
pub fn haversine_km(a: LatLon, b: LatLon) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lon = (b.lon - a.lon).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().min(1.0).asin()
}

pub fn is_municipality(unit: &str) -> bool {
    MUNICIPALITIES
        .iter()
        .any(|m| *m == unit || m.trim_end_matches('市') == unit)
}

/// "杭州市" → "杭州". Units that would shrink below two characters are kept whole.
fn unit_base(unit: &str) -> &str {
    for suffix in UNIT_SUFFIXES {
        if let Some(base) = unit.strip_suffix(suffix) {
            if base.chars().count() >= 2 {
                return base;
            }
        }
    }
    unit
}

fn mentions_unit(candidate: &Candidate, unit: &str) -> bool {
    let base = unit_base(unit);
    [&candidate.normalized_address, &candidate.locality]
        .iter()
        .any(|text| text.contains(unit) || text.contains(base))
}

/// Maximum plausible distance from the city reference, by query depth.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DistanceCeilings {
    pub street_km: f64,
    pub district_km: f64,
    pub city_km: f64,
    pub province_km: f64,
}

impl Default for DistanceCeilings {
    fn default() -> Self {
        Self {
            street_km: 20.0,
            district_km: 50.0,
            city_km: 150.0,
            province_km: 800.0,
        }
    }
}

impl DistanceCeilings {
    /// Ceiling for a query carrying `depth` levels.
    pub fn for_depth(&self, depth: usize) -> f64 {
        match depth {
            d if d >= 4 => self.street_km,
            3 => self.district_km,
            2 => self.city_km,
            _ => self.province_km,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ValidatorConfig {
    pub check_locality: bool,
    pub check_distance: bool,
    pub ceilings: DistanceCeilings,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            check_locality: true,
            check_distance: true,
            ceilings: DistanceCeilings::default(),
        }
    }
}

/// Per-check results for one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationDetail {
    pub locality_match: bool,
    /// Informational: matched name and the query's last level contain one another.
    pub name_match: bool,
    pub distance_km: Option<f64>,
    pub ceiling_km: f64,
    pub distance_ok: bool,
    /// Name of the reference point used, if one existed.
    pub reference: Option<String>,
    /// The distance check auto-passed because the candidate had no coordinates.
    pub degraded: bool,
}

impl ValidationDetail {
    pub fn passed(&self) -> bool {
        self.locality_match && self.distance_ok
    }
}

pub struct ResultValidator {
    config: ValidatorConfig,
    reference: Arc<ReferenceTable>,
}

impl ResultValidator {
    pub fn new(config: ValidatorConfig, reference: Arc<ReferenceTable>) -> Self {
        Self { config, reference }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Check `candidate`, produced by `query`, against the full original address.
    pub fn validate(&self, query: &Query, address: &AddressLevels, candidate: &Candidate) -> ValidationDetail {
        let locality_match = !self.config.check_locality || self.locality_matches(address, candidate);

        let name_match = {
            let name = candidate.matched_name.as_str();
            let last = query.last_level();
            !name.is_empty() && (name.contains(last) || last.contains(name))
        };
        if !name_match {
            tracing::debug!(
                query = query.raw_text(),
                matched = %candidate.matched_name,
                "matched name differs from query (informational)"
            );
        }

        let ceiling_km = self.config.ceilings.for_depth(query.depth());
        let reference_name = reference_unit(address);
        let reference = reference_name.and_then(|name| self.reference.get(name).map(|p| (name, p)));

        let (distance_km, distance_ok, degraded) = match (self.config.check_distance, reference, candidate.position) {
            (false, _, _) => (None, true, false),
            (true, reference, None) => {
                tracing::warn!(
                    query = query.raw_text(),
                    reference = reference.map(|(name, _)| name),
                    "candidate has no coordinates; distance check skipped (degraded)"
                );
                (None, true, true)
            }
            (true, None, Some(_)) => (None, true, false),
            (true, Some((_, centre)), Some(pos)) => {
                let d = haversine_km(centre, pos);
                (Some(d), d <= ceiling_km, false)
            }
        };

        ValidationDetail {
            locality_match,
            name_match,
            distance_km,
            ceiling_km,
            distance_ok,
            reference: reference.map(|(name, _)| name.to_string()),
            degraded,
        }
    }

    fn locality_matches(&self, address: &AddressLevels, candidate: &Candidate) -> bool {
        let top = address.top();
        if !mentions_unit(candidate, top) {
            return false;
        }
        if is_municipality(top) {
            return true;
        }
        match address.second() {
            Some(second) => mentions_unit(candidate, second),
            None => true,
        }
    }
}

/// The unit whose centre anchors distance checks: the city level, which for
/// municipalities is the top level itself.
fn reference_unit(address: &AddressLevels) -> Option<&str> {
    if is_municipality(address.top()) {
        Some(address.top())
    } else {
        address.second()
    }
}
