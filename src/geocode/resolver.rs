//! Resolution engine — level-by-level fallback over a hierarchical address.
//!
//! Flow for an address of N levels, depth N down to 1:
//!   cache (positive → done, not-found → next level)
//!   → provider (retried while unavailable)
//!   → validator (pass → done, fail → next level)
//! Exhausting every level yields an unresolved outcome flagged for review.
//! A provider that stays unavailable aborts the whole resolution.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::address::{AddressLevels, RegionHintPolicy};
use super::cache::{CacheKey, EntryClass, ResultCache};
use super::limiter::RateLimiter;
use super::providers::{build_provider, GeoProvider};
use super::reference::ReferenceTable;
use crate::config::Config;
use super::types::{Candidate, GeoError, Query, ResolutionOutcome, UnresolvedReason};
use super::validator::{ResultValidator, ValidationDetail};

/// Engine settings, fixed for the lifetime of an engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub delimiter: String,
    pub region_hint: RegionHintPolicy,
    /// Provider attempts per level while it reports itself unavailable.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubled for each further attempt.
    pub retry_backoff: Duration,
    /// When false, cache entries are ignored on read but still written (cache repair).
    pub read_cache: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            delimiter: "-".to_string(),
            region_hint: RegionHintPolicy::TopLevel,
            max_attempts: 3,
            retry_backoff: Duration::from_millis(500),
            read_cache: true,
        }
    }
}

/// What happened at one level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AttemptResult {
    CachedPositive,
    /// A cached positive that fails validation against this address.
    CachedRejected,
    CachedNotFound,
    NotFound,
    Rejected,
    Accepted,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelAttempt {
    pub depth: usize,
    pub query: String,
    pub region_hint: String,
    pub result: AttemptResult,
}

/// An outcome together with how it was reached.
#[derive(Debug, Clone)]
pub struct ResolutionTrace {
    pub outcome: ResolutionOutcome,
    pub attempts: Vec<LevelAttempt>,
    pub provider_calls: u32,
}

/// Orchestrates decomposition, provider calls, validation and fallback.
pub struct ResolutionEngine {
    provider: Arc<dyn GeoProvider>,
    validator: ResultValidator,
    cache: Arc<ResultCache>,
    config: EngineConfig,
}

impl ResolutionEngine {
    pub fn new(
        provider: Arc<dyn GeoProvider>,
        validator: ResultValidator,
        cache: Arc<ResultCache>,
        config: EngineConfig,
    ) -> Self {
        Self {
            provider,
            validator,
            cache,
            config,
        }
    }

    /// Assemble provider, reference table, cache and limiter from a validated config.
    pub fn from_config(config: &Config) -> Result<Self, GeoError> {
        let limiter = Arc::new(RateLimiter::new(config.provider.rate_limit));
        let provider = build_provider(&config.provider, limiter)?;

        let mut reference = ReferenceTable::builtin();
        if let Some(path) = &config.reference_path {
            reference.merge(ReferenceTable::from_json_file(path)?);
        }
        let validator = ResultValidator::new(config.engine.validation, Arc::new(reference));

        let cache_path = config.cache.path.clone().unwrap_or_else(ResultCache::default_path);
        let cache = Arc::new(ResultCache::load_from(cache_path, config.cache_policy()));

        Ok(Self::new(provider, validator, cache, config.engine_config()))
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn provider_id(&self) -> &str {
        self.provider.id()
    }

    /// Resolve one address. Never fails: every failure is an outcome.
    pub fn resolve(&self, address: &str) -> ResolutionOutcome {
        self.resolve_traced(address).outcome
    }

    pub fn resolve_traced(&self, address: &str) -> ResolutionTrace {
        match AddressLevels::parse(address, &self.config.delimiter) {
            Ok(levels) => self.resolve_levels(&levels),
            Err(e) => {
                tracing::warn!(address, error = %e, "skipping malformed address");
                ResolutionTrace {
                    outcome: ResolutionOutcome::unresolved(UnresolvedReason::Malformed, None),
                    attempts: Vec::new(),
                    provider_calls: 0,
                }
            }
        }
    }

    pub fn resolve_levels(&self, levels: &AddressLevels) -> ResolutionTrace {
        let _span = tracing::debug_span!("resolve", address = %levels.as_slice().join("-")).entered();

        let total = levels.len();
        let provider_id = self.provider.id();
        let mut attempts = Vec::with_capacity(total);
        let mut provider_calls = 0u32;
        let mut last_rejection: Option<ValidationDetail> = None;

        for depth in (1..=total).rev() {
            let query = Query::at_depth(levels, depth, self.config.region_hint);
            let key = CacheKey::for_query(provider_id, &query);
            let mut record = |result: AttemptResult| {
                attempts.push(LevelAttempt {
                    depth,
                    query: query.raw_text().to_string(),
                    region_hint: query.region_hint().to_string(),
                    result,
                });
            };

            if self.config.read_cache {
                if let Some(entry) = self.cache.lookup(&key) {
                    match (entry.class, entry.outcome.candidate.as_ref()) {
                        (EntryClass::Positive, Some(cached)) => {
                            // The entry may have been validated against a different address.
                            let detail = self.validator.validate(&query, levels, cached);
                            if detail.passed() {
                                tracing::debug!(depth, query = query.raw_text(), "cache hit");
                                record(AttemptResult::CachedPositive);
                                return ResolutionTrace {
                                    outcome: entry.outcome.as_cache_hit(total - depth, detail),
                                    attempts,
                                    provider_calls,
                                };
                            }
                            tracing::debug!(
                                depth,
                                query = query.raw_text(),
                                locality_match = detail.locality_match,
                                distance_km = ?detail.distance_km,
                                "cached candidate does not fit this address, descending"
                            );
                            record(AttemptResult::CachedRejected);
                            last_rejection = Some(detail);
                            continue;
                        }
                        (EntryClass::Positive, None) => {}
                        (EntryClass::NegativeNotFound, _) => {
                            tracing::debug!(depth, query = query.raw_text(), "cached not-found, descending");
                            record(AttemptResult::CachedNotFound);
                            continue;
                        }
                        (EntryClass::NegativeInvalid, _) => {}
                    }
                }
            }

            let answer = match self.query_with_retry(&query, &mut provider_calls) {
                Ok(answer) => answer,
                Err(e) => {
                    tracing::warn!(depth, query = query.raw_text(), error = %e, "provider unavailable, aborting");
                    record(AttemptResult::Unavailable);
                    return ResolutionTrace {
                        outcome: ResolutionOutcome::unresolved(UnresolvedReason::ProviderUnavailable, last_rejection),
                        attempts,
                        provider_calls,
                    };
                }
            };

            let candidate = match answer {
                Some(c) => c,
                None => {
                    tracing::debug!(depth, query = query.raw_text(), "no match, descending");
                    record(AttemptResult::NotFound);
                    self.cache.store(
                        key,
                        ResolutionOutcome::unresolved(UnresolvedReason::NotFound, None),
                        EntryClass::NegativeNotFound,
                    );
                    continue;
                }
            };

            let detail = self.validator.validate(&query, levels, &candidate);
            if detail.passed() {
                record(AttemptResult::Accepted);
                let outcome = ResolutionOutcome::resolved(candidate, detail, total - depth);
                self.cache.store(key, outcome.clone(), EntryClass::Positive);
                log_resolved(&query, &outcome);
                return ResolutionTrace {
                    outcome,
                    attempts,
                    provider_calls,
                };
            }

            tracing::debug!(
                depth,
                query = query.raw_text(),
                locality_match = detail.locality_match,
                distance_km = ?detail.distance_km,
                ceiling_km = detail.ceiling_km,
                "candidate rejected, descending"
            );
            record(AttemptResult::Rejected);
            self.cache.store(
                key,
                ResolutionOutcome::rejected(candidate, detail.clone()),
                EntryClass::NegativeInvalid,
            );
            last_rejection = Some(detail);
        }

        let reason = if last_rejection.is_some() {
            UnresolvedReason::ValidationFailed
        } else {
            UnresolvedReason::NotFound
        };
        tracing::info!(address = %levels.as_slice().join("-"), %reason, "unresolved, needs manual review");
        ResolutionTrace {
            outcome: ResolutionOutcome::unresolved(reason, last_rejection),
            attempts,
            provider_calls,
        }
    }

    /// Call the provider, retrying with exponential backoff while it is unavailable.
    /// Rate limiting happens per HTTP request inside the adapters.
    fn query_with_retry(&self, query: &Query, calls: &mut u32) -> Result<Option<Candidate>, GeoError> {
        let attempts = self.config.max_attempts.max(1);
        let mut backoff = self.config.retry_backoff;
        let mut attempt = 1;
        loop {
            *calls += 1;
            match self.provider.query(query) {
                Ok(answer) => return Ok(answer),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    tracing::warn!(attempt, max_attempts = attempts, error = %e, "provider call failed, retrying");
                    if !backoff.is_zero() {
                        std::thread::sleep(backoff);
                    }
                    backoff = backoff.saturating_mul(2);
                    attempt += 1;
                }
            }
        }
    }
}

fn log_resolved(query: &Query, outcome: &ResolutionOutcome) {
    let position = outcome
        .position()
        .map(|p| p.to_string())
        .unwrap_or_else(|| "(no coordinates)".into());
    tracing::info!(
        query = query.raw_text(),
        method = %outcome.match_method,
        match_level = ?outcome.match_level,
        %position,
        "resolved"
    );
}
