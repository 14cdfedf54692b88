//! Run configuration: an optional JSON file with defaults for every field.
//!
//! Loaded once per run, overridden by CLI flags, validated, then shared
//! read-only by every component.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::geocode::address::RegionHintPolicy;
use crate::geocode::cache::CachePolicy;
use crate::geocode::providers::ProviderKind;
use crate::geocode::resolver::EngineConfig;
use crate::geocode::types::GeoError;
use crate::geocode::validator::ValidatorConfig;

const DEFAULT_USER_AGENT: &str = concat!("geolore/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub provider: ProviderConfig,
    pub cache: CacheConfig,
    pub engine: EngineSettings,
    pub batch: BatchConfig,
    /// Extra reference points merged over the built-in city centres.
    pub reference_path: Option<PathBuf>,
    pub overrides_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    /// Amap Web Service key. Required for `amap`.
    pub amap_key: Option<String>,
    /// Override the backend endpoint (tests, self-hosted Nominatim).
    pub base_url: Option<String>,
    pub timeout_secs: u64,
    /// Calls per second across all workers.
    pub rate_limit: f64,
    pub user_agent: String,
    pub language: String,
    /// Nominatim `countrycodes` filter, e.g. "cn".
    pub country_codes: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::Amap,
            amap_key: None,
            base_url: None,
            timeout_secs: 20,
            rate_limit: 30.0,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            language: "zh-CN".to_string(),
            country_codes: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    /// Defaults to `~/.geolore/geocode_cache.json`.
    pub path: Option<PathBuf>,
    pub positive_ttl_days: Option<i64>,
    pub not_found_ttl_days: Option<i64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: None,
            positive_ttl_days: Some(30),
            not_found_ttl_days: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineSettings {
    pub delimiter: String,
    pub region_hint: RegionHintPolicy,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    /// False = refresh mode: ignore cached entries, overwrite them.
    pub read_cache: bool,
    pub validation: ValidatorConfig,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            delimiter: "-".to_string(),
            region_hint: RegionHintPolicy::TopLevel,
            max_attempts: 3,
            retry_backoff_ms: 500,
            read_cache: true,
            validation: ValidatorConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BatchConfig {
    pub workers: usize,
    /// Flush the cache after this many completed items.
    pub flush_every: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            flush_every: 10,
        }
    }
}

impl Config {
    /// Read a config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, GeoError> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| GeoError::Config(format!("cannot read '{}': {}", path.display(), e)))?;
        serde_json::from_str(&data)
            .map_err(|e| GeoError::Config(format!("invalid config '{}': {}", path.display(), e)))
    }

    pub fn validate(&self) -> Result<(), GeoError> {
        if self.engine.delimiter.is_empty() {
            return Err(GeoError::Config("delimiter must not be empty".into()));
        }
        if self.engine.max_attempts == 0 {
            return Err(GeoError::Config("maxAttempts must be at least 1".into()));
        }
        if !(self.provider.rate_limit.is_finite() && self.provider.rate_limit > 0.0) {
            return Err(GeoError::Config(format!(
                "rateLimit must be positive, got {}",
                self.provider.rate_limit
            )));
        }
        if self.batch.workers == 0 {
            return Err(GeoError::Config("workers must be at least 1".into()));
        }
        let c = &self.engine.validation.ceilings;
        if [c.street_km, c.district_km, c.city_km, c.province_km]
            .iter()
            .any(|km| !km.is_finite() || *km <= 0.0)
        {
            return Err(GeoError::Config("distance ceilings must be positive".into()));
        }
        if self.provider.kind == ProviderKind::Amap
            && self.provider.amap_key.as_deref().map_or(true, |k| k.trim().is_empty())
        {
            return Err(GeoError::Config("an Amap key is required (--amap-key or AMAP_KEY)".into()));
        }
        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            delimiter: self.engine.delimiter.clone(),
            region_hint: self.engine.region_hint,
            max_attempts: self.engine.max_attempts,
            retry_backoff: Duration::from_millis(self.engine.retry_backoff_ms),
            read_cache: self.engine.read_cache,
        }
    }

    pub fn cache_policy(&self) -> CachePolicy {
        CachePolicy {
            positive_ttl: self.cache.positive_ttl_days.map(chrono::Duration::days),
            not_found_ttl: self.cache.not_found_ttl_days.map(chrono::Duration::days),
        }
    }
}
