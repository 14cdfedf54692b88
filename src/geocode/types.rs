//! Core types for the geocoding subsystem.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::address::{AddressLevels, RegionHintPolicy};
use super::validator::ValidationDetail;

/// A point on the globe, guaranteed to be in range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

impl LatLon {
    /// Returns `None` for non-finite or out-of-range coordinates.
    pub fn new(lat: f64, lon: f64) -> Option<Self> {
        if lat.is_finite()
            && lon.is_finite()
            && (-90.0..=90.0).contains(&lat)
            && (-180.0..=180.0).contains(&lon)
        {
            Some(Self { lat, lon })
        } else {
            None
        }
    }
}

impl fmt::Display for LatLon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.6}, {:.6})", self.lat, self.lon)
    }
}

/// A single query sent to a provider: the first `depth` levels of an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    levels: Vec<String>,
    region_hint: String,
    raw_text: String,
}

impl Query {
    /// Build the query for the first `depth` levels (clamped to `1..=len`).
    pub fn at_depth(address: &AddressLevels, depth: usize, policy: RegionHintPolicy) -> Self {
        let depth = depth.clamp(1, address.len());
        let levels = address.prefix(depth).to_vec();
        let region_hint = address.region_hint(depth, policy);
        let raw_text = levels.concat();
        Self {
            levels,
            region_hint,
            raw_text,
        }
    }

    pub fn levels(&self) -> &[String] {
        &self.levels
    }

    /// Number of address levels present in this query.
    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    pub fn region_hint(&self) -> &str {
        &self.region_hint
    }

    pub fn raw_text(&self) -> &str {
        &self.raw_text
    }

    /// The most specific level of this query.
    pub fn last_level(&self) -> &str {
        self.levels.last().map(String::as_str).unwrap_or_default()
    }
}

/// A provider's answer for one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    /// `None` when the provider returned no usable coordinates.
    pub position: Option<LatLon>,
    pub normalized_address: String,
    pub locality: String,
    pub matched_name: String,
    pub provider_id: String,
    /// Backend-specific identifier (Amap POI id, OSM `type/id`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub place_id: Option<String>,
}

/// How an outcome was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MatchMethod {
    Exact,
    Fallback,
    CacheHit,
    Manual,
    Unresolved,
}

impl fmt::Display for MatchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact => write!(f, "exact"),
            Self::Fallback => write!(f, "fallback"),
            Self::CacheHit => write!(f, "cacheHit"),
            Self::Manual => write!(f, "manual"),
            Self::Unresolved => write!(f, "unresolved"),
        }
    }
}

/// Why an address could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UnresolvedReason {
    /// No level produced a candidate.
    NotFound,
    /// At least one candidate was returned, none passed validation.
    ValidationFailed,
    /// The address could not be decomposed.
    Malformed,
    /// The provider stayed unavailable past the retry budget.
    ProviderUnavailable,
}

impl fmt::Display for UnresolvedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "notFound"),
            Self::ValidationFailed => write!(f, "validationFailed"),
            Self::Malformed => write!(f, "malformed"),
            Self::ProviderUnavailable => write!(f, "providerUnavailable"),
        }
    }
}

/// The result of resolving one address. This is also the unit stored in the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionOutcome {
    pub candidate: Option<Candidate>,
    /// Number of trailing levels dropped before the match (0 = full address).
    pub match_level: Option<usize>,
    pub validation_passed: bool,
    pub validation_detail: Option<ValidationDetail>,
    pub match_method: MatchMethod,
    pub needs_manual_review: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<UnresolvedReason>,
}

impl ResolutionOutcome {
    /// A candidate that passed validation after dropping `match_level` levels.
    pub fn resolved(candidate: Candidate, detail: ValidationDetail, match_level: usize) -> Self {
        let method = if match_level == 0 {
            MatchMethod::Exact
        } else {
            MatchMethod::Fallback
        };
        Self {
            candidate: Some(candidate),
            match_level: Some(match_level),
            validation_passed: true,
            needs_manual_review: detail.degraded,
            validation_detail: Some(detail),
            match_method: method,
            reason: None,
        }
    }

    /// Terminal failure. `detail` carries the last rejected candidate's checks, if any.
    pub fn unresolved(reason: UnresolvedReason, detail: Option<ValidationDetail>) -> Self {
        Self {
            candidate: None,
            match_level: None,
            validation_passed: false,
            validation_detail: detail,
            match_method: MatchMethod::Unresolved,
            needs_manual_review: true,
            reason: Some(reason),
        }
    }

    /// A candidate that was returned but rejected by the validator.
    pub(crate) fn rejected(candidate: Candidate, detail: ValidationDetail) -> Self {
        Self {
            candidate: Some(candidate),
            ..Self::unresolved(UnresolvedReason::ValidationFailed, Some(detail))
        }
    }

    /// Re-label a stored positive outcome as a cache hit, with `detail` from
    /// re-checking it against the requesting address.
    pub(crate) fn as_cache_hit(&self, match_level: usize, detail: ValidationDetail) -> Self {
        Self {
            match_level: Some(match_level),
            match_method: MatchMethod::CacheHit,
            needs_manual_review: detail.degraded,
            validation_detail: Some(detail),
            ..self.clone()
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.candidate.is_some() && self.validation_passed
    }

    pub fn position(&self) -> Option<LatLon> {
        self.candidate.as_ref().and_then(|c| c.position)
    }
}

/// Geocoding errors. Not-found and validation failures are outcomes, not errors.
#[derive(Debug, thiserror::Error)]
pub enum GeoError {
    #[error("Malformed address: '{0}'")]
    MalformedAddress(String),

    #[error("Provider '{provider}' unavailable: {message}")]
    ProviderUnavailable { provider: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl GeoError {
    pub fn unavailable(provider: &str, message: impl Into<String>) -> Self {
        Self::ProviderUnavailable {
            provider: provider.to_string(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn levels(s: &str) -> AddressLevels {
        AddressLevels::parse(s, "-").unwrap()
    }

    #[test]
    fn test_latlon_range() {
        assert!(LatLon::new(39.9, 116.4).is_some());
        assert!(LatLon::new(90.0, 180.0).is_some());
        assert!(LatLon::new(90.1, 0.0).is_none());
        assert!(LatLon::new(0.0, -180.5).is_none());
        assert!(LatLon::new(f64::NAN, 0.0).is_none());
    }

    #[test]
    fn test_query_at_depth() {
        let addr = levels("浙江省-杭州市-上城区-孤山路25号-杭州博物馆");
        let q = Query::at_depth(&addr, 3, RegionHintPolicy::TopLevel);
        assert_eq!(q.depth(), 3);
        assert_eq!(q.raw_text(), "浙江省杭州市上城区");
        assert_eq!(q.region_hint(), "浙江省");
        assert_eq!(q.last_level(), "上城区");
    }

    #[test]
    fn test_query_depth_clamped() {
        let addr = levels("北京市-西城区");
        assert_eq!(Query::at_depth(&addr, 9, RegionHintPolicy::TopLevel).depth(), 2);
        assert_eq!(Query::at_depth(&addr, 0, RegionHintPolicy::TopLevel).depth(), 1);
    }

    #[test]
    fn test_unresolved_outcome_needs_review() {
        let outcome = ResolutionOutcome::unresolved(UnresolvedReason::NotFound, None);
        assert!(outcome.needs_manual_review);
        assert!(!outcome.is_resolved());
        assert_eq!(outcome.match_method, MatchMethod::Unresolved);
        assert_eq!(outcome.match_level, None);
    }

    #[test]
    fn test_outcome_serializes_camel_case() {
        let outcome = ResolutionOutcome::unresolved(UnresolvedReason::ProviderUnavailable, None);
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["matchMethod"], "unresolved");
        assert_eq!(json["needsManualReview"], true);
        assert_eq!(json["reason"], "providerUnavailable");
    }
}
