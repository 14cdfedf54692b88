//! Hierarchical geocoding subsystem.
//!
//! Decomposes "Province-City-District-Street-POI" addresses, queries a
//! provider level by level from most to least specific, validates every
//! candidate against the address, and memoizes per-level results.

pub mod address;
pub mod batch;
pub mod cache;
pub mod limiter;
pub mod overrides;
pub mod providers;
pub mod reference;
pub mod resolver;
pub mod types;
pub mod validator;

pub use address::{decompose, AddressLevels, RegionHintPolicy};
pub use batch::{BatchOptions, BatchRunner, BatchSummary, PlaceInput, PlaceOutcome};
pub use cache::{CacheKey, CachePolicy, CacheStats, EntryClass, ResultCache};
pub use limiter::RateLimiter;
pub use overrides::Overrides;
pub use providers::{build_provider, GeoProvider, ProviderKind};
pub use reference::ReferenceTable;
pub use resolver::{EngineConfig, ResolutionEngine, ResolutionTrace};
pub use types::{Candidate, GeoError, LatLon, MatchMethod, Query, ResolutionOutcome, UnresolvedReason};
pub use validator::{ResultValidator, ValidationDetail, ValidatorConfig};
