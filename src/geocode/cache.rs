//! Per-level result cache, persisted as JSON (default `~/.geolore/geocode_cache.json`).
//!
//! Keys are (provider id, normalized query, region hint). Entries are replaced
//! wholesale; the last writer wins. `negativeInvalid` entries are kept for
//! diagnostics but never served as hits. Positive entries expire after a TTL
//! (30 days by default).
//!
//! Loading is partial: a missing or unreadable file gives an empty cache, and
//! individual malformed entries are skipped.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use super::types::{GeoError, Query, ResolutionOutcome};

const CACHE_VERSION: u32 = 1;
const DEFAULT_POSITIVE_TTL_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntryClass {
    Positive,
    NegativeNotFound,
    NegativeInvalid,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheKey {
    pub provider: String,
    pub query: String,
    pub region_hint: String,
}

impl CacheKey {
    pub fn new(provider: &str, query: &str, region_hint: &str) -> Self {
        Self {
            provider: provider.to_string(),
            query: normalize(query),
            region_hint: normalize(region_hint),
        }
    }

    pub fn for_query(provider: &str, query: &Query) -> Self {
        Self::new(provider, query.raw_text(), query.region_hint())
    }
}

/// Collapse runs of whitespace and trim.
fn normalize(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub outcome: ResolutionOutcome,
    pub class: EntryClass,
    /// Milliseconds since the Unix epoch.
    pub recorded_at: i64,
}

/// Expiry policy applied on lookup. `None` means never expires.
#[derive(Debug, Clone, Copy)]
pub struct CachePolicy {
    pub positive_ttl: Option<chrono::Duration>,
    pub not_found_ttl: Option<chrono::Duration>,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            positive_ttl: Some(chrono::Duration::days(DEFAULT_POSITIVE_TTL_DAYS)),
            not_found_ttl: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub positive: usize,
    pub not_found: usize,
    pub invalid: usize,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheRecord {
    #[serde(flatten)]
    key: CacheKey,
    #[serde(flatten)]
    entry: CacheEntry,
}

#[derive(Serialize)]
struct CacheFile<'a> {
    version: u32,
    entries: &'a [CacheRecord],
}

/// The shared result cache.
pub struct ResultCache {
    path: Option<PathBuf>,
    policy: CachePolicy,
    entries: DashMap<CacheKey, CacheEntry>,
    dirty: AtomicBool,
    flush_lock: Mutex<()>,
}

impl ResultCache {
    /// A cache that is never written to disk.
    pub fn in_memory(policy: CachePolicy) -> Self {
        Self {
            path: None,
            policy,
            entries: DashMap::new(),
            dirty: AtomicBool::new(false),
            flush_lock: Mutex::new(()),
        }
    }

    /// Load from the default location.
    pub fn load(policy: CachePolicy) -> Self {
        Self::load_from(Self::default_path(), policy)
    }

    /// Load from `path`. Never fails; unreadable content gives an empty cache.
    pub fn load_from(path: PathBuf, policy: CachePolicy) -> Self {
        let entries = DashMap::new();
        for record in Self::read_file(&path) {
            entries.insert(record.key, record.entry);
        }
        tracing::debug!(path = %path.display(), entries = entries.len(), "cache loaded");
        Self {
            path: Some(path),
            policy,
            entries,
            dirty: AtomicBool::new(false),
            flush_lock: Mutex::new(()),
        }
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".geolore")
            .join("geocode_cache.json")
    }

    fn read_file(path: &Path) -> Vec<CacheRecord> {
        let data = match fs::read_to_string(path) {
            Ok(d) => d,
            Err(_) => return Vec::new(),
        };
        let doc: serde_json::Value = match serde_json::from_str(&data) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cache file unreadable, starting empty");
                return Vec::new();
            }
        };
        let raw = match doc.get("entries").and_then(|e| e.as_array()) {
            Some(raw) => raw,
            None => {
                tracing::warn!(path = %path.display(), "cache file has no entries array, starting empty");
                return Vec::new();
            }
        };

        let mut skipped = 0usize;
        let records: Vec<CacheRecord> = raw
            .iter()
            .filter_map(|v| match serde_json::from_value(v.clone()) {
                Ok(r) => Some(r),
                Err(_) => {
                    skipped += 1;
                    None
                }
            })
            .collect();
        if skipped > 0 {
            tracing::warn!(path = %path.display(), skipped, "skipped malformed cache entries");
        }
        records
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    /// A servable entry: a non-expired positive or not-found entry.
    pub fn lookup(&self, key: &CacheKey) -> Option<CacheEntry> {
        let entry = self.entries.get(key)?;
        let ttl = match entry.class {
            EntryClass::Positive => self.policy.positive_ttl,
            EntryClass::NegativeNotFound => self.policy.not_found_ttl,
            EntryClass::NegativeInvalid => return None,
        };
        if let Some(ttl) = ttl {
            let now = chrono::Utc::now().timestamp_millis();
            if now - entry.recorded_at > ttl.num_milliseconds() {
                return None; // expired
            }
        }
        Some(entry.value().clone())
    }

    /// The raw entry regardless of class or age.
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    /// Store (or replace) the entry for `key`.
    pub fn store(&self, key: CacheKey, outcome: ResolutionOutcome, class: EntryClass) {
        debug_assert!(
            class != EntryClass::Positive || outcome.validation_passed,
            "only validated outcomes may be cached as positive"
        );
        let entry = CacheEntry {
            outcome,
            class,
            recorded_at: chrono::Utc::now().timestamp_millis(),
        };
        self.entries.insert(key, entry);
        self.dirty.store(true, Ordering::Release);
    }

    pub fn remove(&self, key: &CacheKey) -> Option<CacheEntry> {
        let removed = self.entries.remove(key).map(|(_, e)| e);
        if removed.is_some() {
            self.dirty.store(true, Ordering::Release);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for entry in self.entries.iter() {
            match entry.class {
                EntryClass::Positive => stats.positive += 1,
                EntryClass::NegativeNotFound => stats.not_found += 1,
                EntryClass::NegativeInvalid => stats.invalid += 1,
            }
        }
        stats
    }

    /// Write the cache to disk if anything changed since the last flush.
    pub fn flush(&self) -> Result<(), GeoError> {
        let path = match &self.path {
            Some(p) => p,
            None => return Ok(()),
        };
        let _guard = self.flush_lock.lock();
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let mut records: Vec<CacheRecord> = self
            .entries
            .iter()
            .map(|e| CacheRecord {
                key: e.key().clone(),
                entry: e.value().clone(),
            })
            .collect();
        records.sort_by(|a, b| {
            (&a.key.provider, &a.key.region_hint, &a.key.query)
                .cmp(&(&b.key.provider, &b.key.region_hint, &b.key.query))
        });

        let result = Self::write_atomic(path, &records);
        if result.is_err() {
            self.dirty.store(true, Ordering::Release);
        } else {
            tracing::debug!(path = %path.display(), entries = records.len(), "cache flushed");
        }
        result
    }

    fn write_atomic(path: &Path, records: &[CacheRecord]) -> Result<(), GeoError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&CacheFile {
            version: CACHE_VERSION,
            entries: records,
        })?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geocode::types::{Candidate, LatLon, UnresolvedReason};
    use crate::geocode::validator::ValidationDetail;
    use tempfile::TempDir;

    fn test_cache() -> (ResultCache, TempDir) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        (ResultCache::load_from(path, CachePolicy::default()), dir)
    }

    fn positive() -> ResolutionOutcome {
        let detail = ValidationDetail {
            locality_match: true,
            name_match: true,
            distance_km: Some(3.2),
            ceiling_km: 50.0,
            distance_ok: true,
            reference: Some("杭州市".into()),
            degraded: false,
        };
        let candidate = Candidate {
            position: LatLon::new(30.2526, 120.1437),
            normalized_address: "浙江省杭州市上城区".into(),
            locality: "上城区".into(),
            matched_name: "上城区".into(),
            provider_id: "amap".into(),
            place_id: None,
        };
        ResolutionOutcome::resolved(candidate, detail, 0)
    }

    fn key(q: &str) -> CacheKey {
        CacheKey::new("amap", q, "浙江省")
    }

    #[test]
    fn test_store_lookup_positive() {
        let (cache, _dir) = test_cache();
        cache.store(key("浙江省杭州市上城区"), positive(), EntryClass::Positive);

        let hit = cache.lookup(&key("浙江省杭州市上城区")).unwrap();
        assert_eq!(hit.class, EntryClass::Positive);
        assert_eq!(hit.outcome, positive());
    }

    #[test]
    fn test_invalid_entries_are_not_hits() {
        let (cache, _dir) = test_cache();
        let rejected = ResolutionOutcome::unresolved(UnresolvedReason::ValidationFailed, None);
        cache.store(key("q"), rejected, EntryClass::NegativeInvalid);

        assert!(cache.lookup(&key("q")).is_none());
        assert_eq!(cache.get(&key("q")).unwrap().class, EntryClass::NegativeInvalid);
    }

    #[test]
    fn test_not_found_is_hit() {
        let (cache, _dir) = test_cache();
        let miss = ResolutionOutcome::unresolved(UnresolvedReason::NotFound, None);
        cache.store(key("q"), miss, EntryClass::NegativeNotFound);
        assert_eq!(cache.lookup(&key("q")).unwrap().class, EntryClass::NegativeNotFound);
    }

    #[test]
    fn test_last_writer_wins() {
        let (cache, _dir) = test_cache();
        let miss = ResolutionOutcome::unresolved(UnresolvedReason::NotFound, None);
        cache.store(key("q"), miss, EntryClass::NegativeNotFound);
        cache.store(key("q"), positive(), EntryClass::Positive);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookup(&key("q")).unwrap().class, EntryClass::Positive);
    }

    #[test]
    fn test_key_normalizes_whitespace() {
        assert_eq!(CacheKey::new("amap", "  杭州市   上城区 ", "浙江省"), CacheKey::new("amap", "杭州市 上城区", "浙江省"));
        assert_ne!(CacheKey::new("amap", "q", "浙江省"), CacheKey::new("nominatim", "q", "浙江省"));
        assert_ne!(CacheKey::new("amap", "q", "浙江省"), CacheKey::new("amap", "q", "江苏省"));
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("cache.json");

        {
            let cache = ResultCache::load_from(path.clone(), CachePolicy::default());
            cache.store(key("a"), positive(), EntryClass::Positive);
            cache.store(
                key("b"),
                ResolutionOutcome::unresolved(UnresolvedReason::NotFound, None),
                EntryClass::NegativeNotFound,
            );
            cache.flush().unwrap();
        }

        let cache2 = ResultCache::load_from(path, CachePolicy::default());
        assert_eq!(cache2.len(), 2);
        assert_eq!(cache2.lookup(&key("a")).unwrap().outcome, positive());
        assert_eq!(cache2.stats(), CacheStats { positive: 1, not_found: 1, invalid: 0 });
    }

    #[test]
    fn test_flush_without_changes_does_not_write() {
        let (cache, dir) = test_cache();
        cache.flush().unwrap();
        assert!(!dir.path().join("cache.json").exists());
    }

    #[test]
    fn test_missing_and_corrupt_files_load_empty() {
        let dir = TempDir::new().unwrap();
        let missing = ResultCache::load_from(dir.path().join("nope.json"), CachePolicy::default());
        assert!(missing.is_empty());

        let path = dir.path().join("corrupt.json");
        fs::write(&path, "{ this is not json").unwrap();
        assert!(ResultCache::load_from(path, CachePolicy::default()).is_empty());
    }

    #[test]
    fn test_partial_load_skips_bad_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        let good = serde_json::json!({
            "provider": "amap",
            "query": "good",
            "regionHint": "浙江省",
            "class": "negativeNotFound",
            "recordedAt": chrono::Utc::now().timestamp_millis(),
            "outcome": ResolutionOutcome::unresolved(UnresolvedReason::NotFound, None),
        });
        let doc = serde_json::json!({
            "version": 1,
            "entries": [good, {"provider": "amap", "query": "broken"}, 42],
        });
        fs::write(&path, doc.to_string()).unwrap();

        let cache = ResultCache::load_from(path, CachePolicy::default());
        assert_eq!(cache.len(), 1);
        assert!(cache.lookup(&key("good")).is_some());
    }

    #[test]
    fn test_positive_ttl_expiry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        let old = chrono::Utc::now() - chrono::Duration::days(31);
        let doc = serde_json::json!({
            "version": 1,
            "entries": [{
                "provider": "amap",
                "query": "old",
                "regionHint": "浙江省",
                "class": "positive",
                "recordedAt": old.timestamp_millis(),
                "outcome": positive(),
            }],
        });
        fs::write(&path, doc.to_string()).unwrap();

        let cache = ResultCache::load_from(path.clone(), CachePolicy::default());
        assert!(cache.lookup(&key("old")).is_none());
        assert!(cache.get(&key("old")).is_some());

        let forever = CachePolicy {
            positive_ttl: None,
            not_found_ttl: None,
        };
        assert!(ResultCache::load_from(path, forever).lookup(&key("old")).is_some());
    }

    #[test]
    fn test_concurrent_writers() {
        let (cache, _dir) = test_cache();
        std::thread::scope(|s| {
            for t in 0..4 {
                let cache = &cache;
                s.spawn(move || {
                    for i in 0..50 {
                        cache.store(
                            key(&format!("q{}", i)),
                            ResolutionOutcome::unresolved(UnresolvedReason::NotFound, None),
                            if t % 2 == 0 { EntryClass::NegativeNotFound } else { EntryClass::NegativeInvalid },
                        );
                    }
                });
            }
        });
        assert_eq!(cache.len(), 50);
    }
}
