//! Geocoding backends: the `GeoProvider` capability and its Amap and Nominatim adapters.
//!
//! An adapter answers `Ok(None)` for "no match" and `Err(ProviderUnavailable)`
//! for anything that prevents a trustworthy answer (transport errors, timeouts,
//! 5xx, undecodable bodies, backend error statuses).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use super::limiter::RateLimiter;
use super::types::{Candidate, GeoError, LatLon, Query};
use crate::config::ProviderConfig;

/// One geocoding backend.
pub trait GeoProvider: Send + Sync {
    /// Stable identity, used in cache keys.
    fn id(&self) -> &str;

    /// Look up `q`, scoped to `q.region_hint()` wherever the backend supports it.
    fn query(&self, q: &Query) -> Result<Option<Candidate>, GeoError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Amap,
    Nominatim,
}

/// Construct the adapter selected by `cfg`. Every HTTP request it sends takes
/// a token from `limiter`.
pub fn build_provider(cfg: &ProviderConfig, limiter: Arc<RateLimiter>) -> Result<Arc<dyn GeoProvider>, GeoError> {
    let agent = ureq::AgentBuilder::new()
        .timeout(Duration::from_secs(cfg.timeout_secs.max(1)))
        .user_agent(&cfg.user_agent)
        .build();

    match cfg.kind {
        ProviderKind::Amap => {
            let key = cfg
                .amap_key
                .clone()
                .filter(|k| !k.trim().is_empty())
                .ok_or_else(|| GeoError::Config("the amap provider needs an API key (--amap-key or AMAP_KEY)".into()))?;
            let base_url = cfg.base_url.clone().unwrap_or_else(|| AMAP_BASE_URL.to_string());
            Ok(Arc::new(AmapProvider::new(agent, key, base_url, limiter)))
        }
        ProviderKind::Nominatim => {
            let base_url = cfg.base_url.clone().unwrap_or_else(|| NOMINATIM_BASE_URL.to_string());
            Ok(Arc::new(NominatimProvider::new(
                agent,
                base_url,
                cfg.language.clone(),
                cfg.country_codes.clone(),
                limiter,
            )))
        }
    }
}

/// GET a JSON body. 404 is a valid "nothing here" answer.
fn fetch_json(request: ureq::Request, provider: &str) -> Result<Option<Value>, GeoError> {
    match request.call() {
        Ok(response) => response
            .into_json::<Value>()
            .map(Some)
            .map_err(|e| GeoError::unavailable(provider, format!("invalid response body: {}", e))),
        Err(ureq::Error::Status(404, _)) => Ok(None),
        Err(ureq::Error::Status(code, _)) => Err(GeoError::unavailable(provider, format!("HTTP {}", code))),
        Err(ureq::Error::Transport(t)) => Err(GeoError::unavailable(provider, t.to_string())),
    }
}

/// Concatenate address units, skipping blanks and repeats (province == city in municipalities).
fn join_units(parts: &[&str]) -> String {
    let mut seen: Vec<&str> = Vec::new();
    for part in parts.iter().map(|p| p.trim()).filter(|p| !p.is_empty()) {
        if !seen.contains(&part) {
            seen.push(part);
        }
    }
    seen.concat()
}

// ─── Amap provider ──────────────────────────────────────────────

const AMAP_BASE_URL: &str = "https://restapi.amap.com";

/// Amap (高德) Web Service: place search first, then structured geocoding.
pub struct AmapProvider {
    agent: ureq::Agent,
    key: String,
    base_url: String,
    limiter: Arc<RateLimiter>,
}

impl AmapProvider {
    pub fn new(agent: ureq::Agent, key: String, base_url: String, limiter: Arc<RateLimiter>) -> Self {
        Self {
            agent,
            key,
            base_url,
            limiter,
        }
    }

    fn get(&self, path: &str, params: &[(&str, &str)]) -> Result<Option<Value>, GeoError> {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        let mut request = self.agent.get(&url).query("key", &self.key).query("output", "JSON");
        for (k, v) in params {
            request = request.query(k, v);
        }
        self.limiter.acquire();
        let body = fetch_json(request, self.id())?;
        if let Some(ref b) = body {
            check_amap_status(b).map_err(|msg| GeoError::unavailable(self.id(), msg))?;
        }
        Ok(body)
    }
}

impl GeoProvider for AmapProvider {
    fn id(&self) -> &str {
        "amap"
    }

    fn query(&self, q: &Query) -> Result<Option<Candidate>, GeoError> {
        let places = self.get(
            "/v3/place/text",
            &[
                ("keywords", q.raw_text()),
                ("city", q.region_hint()),
                ("citylimit", "true"),
                ("offset", "1"),
                ("page", "1"),
            ],
        )?;
        if let Some(poi) = places.as_ref().and_then(|b| first_of(b, "pois")) {
            return Ok(Some(amap_poi_candidate(poi, self.id())));
        }

        let geocodes = self.get(
            "/v3/geocode/geo",
            &[("address", q.raw_text()), ("city", q.region_hint())],
        )?;
        Ok(geocodes
            .as_ref()
            .and_then(|b| first_of(b, "geocodes"))
            .map(|geo| amap_geocode_candidate(geo, self.id())))
    }
}

fn first_of<'a>(body: &'a Value, field: &str) -> Option<&'a Value> {
    body.get(field).and_then(Value::as_array).and_then(|a| a.first())
}

/// Amap reports key, quota and parameter errors in-band with `status != "1"`.
fn check_amap_status(body: &Value) -> Result<(), String> {
    match body.get("status").and_then(Value::as_str) {
        Some("1") => Ok(()),
        status => Err(format!(
            "status {} info {} (infocode {})",
            status.unwrap_or("?"),
            amap_str(body, "info"),
            amap_str(body, "infocode"),
        )),
    }
}

/// String field, or empty. Amap sends `[]` instead of `""` for empty fields.
fn amap_str(v: &Value, field: &str) -> String {
    v.get(field).and_then(Value::as_str).unwrap_or_default().to_string()
}

/// Amap locations are `"lon,lat"`.
fn parse_amap_location(s: &str) -> Option<LatLon> {
    let (lon, lat) = s.split_once(',')?;
    LatLon::new(lat.trim().parse().ok()?, lon.trim().parse().ok()?)
}

fn amap_poi_candidate(poi: &Value, provider: &str) -> Candidate {
    let name = amap_str(poi, "name");
    let province = amap_str(poi, "pname");
    let city = amap_str(poi, "cityname");
    let district = amap_str(poi, "adname");
    let street = amap_str(poi, "address");
    let id = amap_str(poi, "id");

    Candidate {
        position: parse_amap_location(&amap_str(poi, "location")),
        normalized_address: join_units(&[province.as_str(), city.as_str(), district.as_str(), street.as_str(), name.as_str()]),
        locality: if district.is_empty() { city } else { district },
        matched_name: name,
        provider_id: provider.to_string(),
        place_id: if id.is_empty() { None } else { Some(id) },
    }
}

fn amap_geocode_candidate(geo: &Value, provider: &str) -> Candidate {
    let formatted = amap_str(geo, "formatted_address");
    let province = amap_str(geo, "province");
    let city = amap_str(geo, "city");
    let district = amap_str(geo, "district");

    let normalized = if formatted.is_empty() {
        join_units(&[province.as_str(), city.as_str(), district.as_str()])
    } else {
        formatted.clone()
    };
    let matched = if formatted.is_empty() { amap_str(geo, "level") } else { formatted };

    Candidate {
        position: parse_amap_location(&amap_str(geo, "location")),
        normalized_address: normalized,
        locality: if district.is_empty() { city } else { district },
        matched_name: matched,
        provider_id: provider.to_string(),
        place_id: None,
    }
}

// ─── Nominatim provider ─────────────────────────────────────────

const NOMINATIM_BASE_URL: &str = "https://nominatim.openstreetmap.org";

/// OpenStreetMap Nominatim free-text search.
pub struct NominatimProvider {
    agent: ureq::Agent,
    base_url: String,
    language: String,
    country_codes: Option<String>,
    limiter: Arc<RateLimiter>,
}

impl NominatimProvider {
    pub fn new(
        agent: ureq::Agent,
        base_url: String,
        language: String,
        country_codes: Option<String>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            agent,
            base_url,
            language,
            country_codes,
            limiter,
        }
    }
}

/// Nominatim cannot scope by region name, so the hint must be part of the text.
fn nominatim_text(q: &Query) -> String {
    if q.raw_text().contains(q.region_hint()) {
        q.raw_text().to_string()
    } else {
        format!("{} {}", q.region_hint(), q.raw_text())
    }
}

impl GeoProvider for NominatimProvider {
    fn id(&self) -> &str {
        "nominatim"
    }

    fn query(&self, q: &Query) -> Result<Option<Candidate>, GeoError> {
        let url = format!("{}/search", self.base_url.trim_end_matches('/'));
        let text = nominatim_text(q);
        let mut request = self
            .agent
            .get(&url)
            .query("format", "jsonv2")
            .query("q", &text)
            .query("addressdetails", "1")
            .query("limit", "1")
            .query("accept-language", &self.language);
        if let Some(ref cc) = self.country_codes {
            request = request.query("countrycodes", cc);
        }

        self.limiter.acquire();
        let body = match fetch_json(request, self.id())? {
            Some(b) => b,
            None => return Ok(None),
        };
        let results = body
            .as_array()
            .ok_or_else(|| GeoError::unavailable(self.id(), "expected a JSON array"))?;
        Ok(results.first().map(|item| nominatim_candidate(item, self.id())))
    }
}

fn nominatim_candidate(item: &Value, provider: &str) -> Candidate {
    let coord = |field: &str| item.get(field).and_then(Value::as_str).and_then(|s| s.parse::<f64>().ok());
    let position = match (coord("lat"), coord("lon")) {
        (Some(lat), Some(lon)) => LatLon::new(lat, lon),
        _ => None,
    };

    let display_name = item.get("display_name").and_then(Value::as_str).unwrap_or_default();
    let address = item.get("address");
    let locality = ["city", "town", "county", "state_district", "state"]
        .iter()
        .find_map(|k| address.and_then(|a| a.get(*k)).and_then(Value::as_str))
        .unwrap_or_default();

    let name = item
        .get("name")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| display_name.split(',').next().unwrap_or_default().trim());

    let place_id = match (item.get("osm_type").and_then(Value::as_str), item.get("osm_id").and_then(Value::as_u64)) {
        (Some(t), Some(id)) => Some(format!("{}/{}", t, id)),
        _ => None,
    };

    Candidate {
        position,
        normalized_address: display_name.to_string(),
        locality: locality.to_string(),
        matched_name: name.to_string(),
        provider_id: provider.to_string(),
        place_id,
    }
}
