//! Batch geocoding: `[{title, address, ...}]` → `[{title, address, ..., outcome}]`.
//!
//! Addresses are spread over a bounded worker pool; levels within one address
//! stay sequential. Output order matches input order and every input yields
//! exactly one record. The cache is flushed periodically so an interrupted
//! run can be restarted without repeating finished work.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::overrides::Overrides;
use super::resolver::ResolutionEngine;
use super::types::{GeoError, MatchMethod, ResolutionOutcome, UnresolvedReason};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceInput {
    pub title: String,
    #[serde(default)]
    pub address: String,
    /// Fields the engine does not use, carried through unchanged.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceOutcome {
    pub title: String,
    pub address: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    pub outcome: ResolutionOutcome,
}

#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    pub workers: usize,
    /// Flush the cache after this many completed items (0 = only at the end).
    pub flush_every: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            flush_every: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub total: usize,
    pub exact: usize,
    pub fallback: usize,
    pub cache_hits: usize,
    pub manual: usize,
    pub not_found: usize,
    pub validation_failed: usize,
    pub malformed: usize,
    pub provider_unavailable: usize,
    pub needs_review: usize,
}

impl BatchSummary {
    pub fn from_outcomes(records: &[PlaceOutcome]) -> Self {
        let mut s = Self {
            total: records.len(),
            ..Self::default()
        };
        for record in records {
            let outcome = &record.outcome;
            match outcome.match_method {
                MatchMethod::Exact => s.exact += 1,
                MatchMethod::Fallback => s.fallback += 1,
                MatchMethod::CacheHit => s.cache_hits += 1,
                MatchMethod::Manual => s.manual += 1,
                MatchMethod::Unresolved => match outcome.reason {
                    Some(UnresolvedReason::ValidationFailed) => s.validation_failed += 1,
                    Some(UnresolvedReason::Malformed) => s.malformed += 1,
                    Some(UnresolvedReason::ProviderUnavailable) => s.provider_unavailable += 1,
                    Some(UnresolvedReason::NotFound) | None => s.not_found += 1,
                },
            }
            if outcome.needs_manual_review {
                s.needs_review += 1;
            }
        }
        s
    }

    pub fn resolved(&self) -> usize {
        self.exact + self.fallback + self.cache_hits + self.manual
    }
}

pub struct BatchRunner {
    engine: Arc<ResolutionEngine>,
    overrides: Arc<Overrides>,
    options: BatchOptions,
}

impl BatchRunner {
    pub fn new(engine: Arc<ResolutionEngine>, options: BatchOptions) -> Self {
        Self {
            engine,
            overrides: Arc::new(Overrides::default()),
            options,
        }
    }

    pub fn with_overrides(mut self, overrides: Arc<Overrides>) -> Self {
        self.overrides = overrides;
        self
    }

    /// Resolve every input, one record each. Only worker pool construction can fail.
    pub fn run(&self, inputs: Vec<PlaceInput>) -> Result<Vec<PlaceOutcome>, GeoError> {
        let total = inputs.len();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.workers.max(1))
            .thread_name(|i| format!("geolore-worker-{}", i))
            .build()
            .map_err(|e| GeoError::Config(format!("cannot start worker pool: {}", e)))?;

        tracing::info!(total, workers = self.options.workers, provider = self.engine.provider_id(), "batch started");
        let done = AtomicUsize::new(0);

        let records: Vec<PlaceOutcome> = pool.install(|| {
            inputs
                .into_par_iter()
                .map(|input| {
                    let record = self.resolve_one(input);
                    let n = done.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::info!(
                        "[{}/{}] {} → {}",
                        n,
                        total,
                        record.title,
                        describe(&record.outcome)
                    );
                    if self.options.flush_every > 0 && n % self.options.flush_every == 0 {
                        if let Err(e) = self.engine.cache().flush() {
                            tracing::warn!(error = %e, "periodic cache flush failed");
                        }
                    }
                    record
                })
                .collect()
        });

        if let Err(e) = self.engine.cache().flush() {
            tracing::warn!(error = %e, "final cache flush failed");
        }
        let summary = BatchSummary::from_outcomes(&records);
        tracing::info!(
            total = summary.total,
            resolved = summary.resolved(),
            cache_hits = summary.cache_hits,
            needs_review = summary.needs_review,
            "batch finished"
        );
        Ok(records)
    }

    fn resolve_one(&self, input: PlaceInput) -> PlaceOutcome {
        let PlaceInput {
            title,
            address,
            mut extra,
        } = input;
        extra.remove("outcome");

        let outcome = match self.overrides.manual_outcome(&title, &address) {
            Some(manual) => manual,
            None => {
                let target = self.overrides.address_for(&title, &address);
                if target != address {
                    tracing::debug!(%title, rewrite = target, "using rewritten address");
                }
                self.engine.resolve(target)
            }
        };

        PlaceOutcome {
            title,
            address,
            extra,
            outcome,
        }
    }
}

fn describe(outcome: &ResolutionOutcome) -> String {
    match (outcome.position(), outcome.reason) {
        (Some(p), _) => format!("{} {}", p, outcome.match_method),
        (None, Some(reason)) => format!("unresolved ({})", reason),
        (None, None) => outcome.match_method.to_string(),
    }
}

pub fn read_inputs(path: &Path) -> Result<Vec<PlaceInput>, GeoError> {
    let data = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&data)?)
}

pub fn write_outputs(path: &Path, records: &[PlaceOutcome]) -> Result<(), GeoError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(records)?;
    std::fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geocode::cache::{CachePolicy, ResultCache};
    use crate::geocode::providers::GeoProvider;
    use crate::geocode::reference::ReferenceTable;
    use crate::geocode::resolver::EngineConfig;
    use crate::geocode::types::{Candidate, LatLon, Query};
    use crate::geocode::validator::{ResultValidator, ValidatorConfig};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::time::Duration;

    /// Answers from a fixed table; `None` entries simulate an outage.
    struct TableProvider {
        answers: HashMap<String, Option<LatLon>>,
        calls: Mutex<Vec<String>>,
    }

    impl TableProvider {
        fn new(answers: &[(&str, Option<(f64, f64)>)]) -> Self {
            Self {
                answers: answers
                    .iter()
                    .map(|(q, p)| (q.to_string(), p.and_then(|(lat, lon)| LatLon::new(lat, lon))))
                    .collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    impl GeoProvider for TableProvider {
        fn id(&self) -> &str {
            "table"
        }

        fn query(&self, q: &Query) -> Result<Option<Candidate>, GeoError> {
            self.calls.lock().push(q.raw_text().to_string());
            match self.answers.get(q.raw_text()) {
                Some(Some(position)) => Ok(Some(Candidate {
                    position: Some(*position),
                    normalized_address: q.raw_text().to_string(),
                    locality: q.last_level().to_string(),
                    matched_name: q.last_level().to_string(),
                    provider_id: "table".into(),
                    place_id: None,
                })),
                Some(None) => Err(GeoError::unavailable("table", "connection reset")),
                None => Ok(None),
            }
        }
    }

    fn runner(provider: Arc<TableProvider>, cache: Arc<ResultCache>, workers: usize) -> BatchRunner {
        let validator = ResultValidator::new(ValidatorConfig::default(), Arc::new(ReferenceTable::builtin()));
        let config = EngineConfig {
            retry_backoff: Duration::ZERO,
            ..EngineConfig::default()
        };
        let engine = ResolutionEngine::new(provider, validator, cache, config);
        BatchRunner::new(
            Arc::new(engine),
            BatchOptions {
                workers,
                flush_every: 2,
            },
        )
    }

    fn input(title: &str, address: &str) -> PlaceInput {
        PlaceInput {
            title: title.into(),
            address: address.into(),
            extra: Map::new(),
        }
    }

    const WEST_LAKE: (f64, f64) = (30.2590, 120.1300);

    #[test]
    fn test_order_preserved_with_many_workers() {
        let provider = Arc::new(TableProvider::new(&[("浙江省杭州市西湖区", Some(WEST_LAKE))]));
        let cache = Arc::new(ResultCache::in_memory(CachePolicy::default()));
        let inputs: Vec<PlaceInput> = (0..24)
            .map(|i| input(&format!("place-{}", i), &format!("浙江省-杭州市-西湖区-无名地点{}", i)))
            .collect();

        let records = runner(provider, cache, 6).run(inputs).unwrap();

        assert_eq!(records.len(), 24);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.title, format!("place-{}", i));
            assert!(record.outcome.is_resolved());
        }
    }

    #[test]
    fn test_failures_are_isolated() {
        let provider = Arc::new(TableProvider::new(&[
            ("浙江省杭州市西湖区", Some(WEST_LAKE)),
            ("江苏省南京市玄武区", None),
        ]));
        let cache = Arc::new(ResultCache::in_memory(CachePolicy::default()));
        let records = runner(provider, cache, 3)
            .run(vec![
                input("ok", "浙江省-杭州市-西湖区"),
                input("down", "江苏省-南京市-玄武区"),
                input("blank", " - "),
                input("missing", "广东省-某某市"),
            ])
            .unwrap();

        let reasons: Vec<Option<UnresolvedReason>> = records.iter().map(|r| r.outcome.reason).collect();
        assert_eq!(
            reasons,
            vec![
                None,
                Some(UnresolvedReason::ProviderUnavailable),
                Some(UnresolvedReason::Malformed),
                Some(UnresolvedReason::NotFound),
            ]
        );
        let summary = BatchSummary::from_outcomes(&records);
        assert_eq!(summary.resolved(), 1);
        assert_eq!(summary.needs_review, 3);
    }

    #[test]
    fn test_overrides_applied_per_title() {
        let provider = Arc::new(TableProvider::new(&[("浙江省杭州市西湖区", Some(WEST_LAKE))]));
        let cache = Arc::new(ResultCache::in_memory(CachePolicy::default()));
        let mut overrides = Overrides::default();
        overrides.rewrites.insert("湖边".into(), "浙江省-杭州市-西湖区".into());
        overrides.manual.insert(
            "旧厂".into(),
            crate::geocode::overrides::ManualPoint {
                lat: 31.2,
                lon: 121.4,
                locality: "普陀区".into(),
                address: None,
            },
        );

        let records = runner(provider.clone(), cache, 2)
            .with_overrides(Arc::new(overrides))
            .run(vec![input("湖边", "浙江省-湖边"), input("旧厂", "上海市-旧厂")])
            .unwrap();

        assert_eq!(records[0].outcome.match_method, MatchMethod::Exact);
        assert_eq!(records[0].address, "浙江省-湖边");
        assert_eq!(records[1].outcome.match_method, MatchMethod::Manual);
        assert_eq!(provider.call_count(), 1);
    }

    #[test]
    fn test_extra_fields_carried_through() {
        let provider = Arc::new(TableProvider::new(&[]));
        let cache = Arc::new(ResultCache::in_memory(CachePolicy::default()));
        let inputs: Vec<PlaceInput> = serde_json::from_str(
            r#"[{"title": "t", "address": "北京市-无名", "chapter": 3, "outcome": "stale"}]"#,
        )
        .unwrap();

        let records = runner(provider, cache, 1).run(inputs).unwrap();
        let json = serde_json::to_value(&records[0]).unwrap();
        assert_eq!(json["chapter"], 3);
        assert_eq!(json["outcome"]["matchMethod"], "unresolved");
    }

    #[test]
    fn test_restart_reuses_persisted_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let inputs = || {
            vec![
                input("a", "浙江省-杭州市-西湖区-某茶馆"),
                input("b", "浙江省-杭州市-西湖区"),
                input("c", "湖南省-无名县"),
            ]
        };

        let first = Arc::new(TableProvider::new(&[("浙江省杭州市西湖区", Some(WEST_LAKE))]));
        let cache = Arc::new(ResultCache::load_from(path.clone(), CachePolicy::default()));
        let records = runner(first.clone(), cache, 2).run(inputs()).unwrap();
        assert!(first.call_count() > 0);
        assert!(path.exists());

        let second = Arc::new(TableProvider::new(&[("浙江省杭州市西湖区", Some(WEST_LAKE))]));
        let reloaded = Arc::new(ResultCache::load_from(path, CachePolicy::default()));
        let again = runner(second.clone(), reloaded, 2).run(inputs()).unwrap();

        assert_eq!(second.call_count(), 0);
        assert_eq!(again[0].outcome.match_method, MatchMethod::CacheHit);
        assert_eq!(again[0].outcome.position(), records[0].outcome.position());
        assert_eq!(again[2].outcome.reason, Some(UnresolvedReason::NotFound));
    }

    #[test]
    fn test_failed_final_flush_still_returns_records() {
        let blocker = tempfile::NamedTempFile::new().unwrap();
        let path = blocker.path().join("cache.json");
        let provider = Arc::new(TableProvider::new(&[("浙江省杭州市西湖区", Some(WEST_LAKE))]));
        let cache = Arc::new(ResultCache::load_from(path.clone(), CachePolicy::default()));

        let records = runner(provider, cache.clone(), 2)
            .run(vec![input("a", "浙江省-杭州市-西湖区"), input("b", "湖南省-无名县")])
            .unwrap();

        assert_eq!(records.len(), 2);
        assert!(records[0].outcome.is_resolved());
        assert_eq!(records[1].outcome.reason, Some(UnresolvedReason::NotFound));
        assert!(cache.flush().is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_io_helpers() {
        let dir = tempfile::tempdir().unwrap();
        let in_path = dir.path().join("in.json");
        std::fs::write(&in_path, r#"[{"title": "x", "address": "北京市-西城区"}, {"title": "y"}]"#).unwrap();

        let inputs = read_inputs(&in_path).unwrap();
        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs[1].address, "");

        let out_path = dir.path().join("out").join("result.json");
        let records = vec![PlaceOutcome {
            title: "x".into(),
            address: "北京市-西城区".into(),
            extra: Map::new(),
            outcome: ResolutionOutcome::unresolved(UnresolvedReason::NotFound, None),
        }];
        write_outputs(&out_path, &records).unwrap();
        let back: Vec<PlaceOutcome> = serde_json::from_str(&std::fs::read_to_string(&out_path).unwrap()).unwrap();
        assert_eq!(back, records);
    }
}
