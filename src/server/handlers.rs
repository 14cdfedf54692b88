use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

use crate::geocode::resolver::LevelAttempt;
use crate::geocode::{BatchRunner, BatchSummary, CacheStats, PlaceInput, PlaceOutcome, ResolutionOutcome};

use super::state::AppState;

// ─── Error response ──────────────────────────────────────────────

#[derive(Serialize)]
struct ApiErrorBody {
    error: String,
    code: u16,
}

pub(super) struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            error: self.1,
            code: self.0.as_u16(),
        };
        (self.0, Json(body)).into_response()
    }
}

fn api_error(status: StatusCode, msg: impl Into<String>) -> ApiError {
    ApiError(status, msg.into())
}

fn join_error(e: tokio::task::JoinError) -> ApiError {
    api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("worker failed: {}", e))
}

// ─── GET /health ─────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    provider: String,
    version: &'static str,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        provider: state.engine.provider_id().to_string(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ─── POST /api/resolve ───────────────────────────────────────────

#[derive(Deserialize)]
pub struct ResolveRequest {
    pub address: String,
    /// Include the per-level attempts in the response.
    #[serde(default)]
    pub trace: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveResponse {
    pub address: String,
    pub outcome: ResolutionOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<Vec<LevelAttempt>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_calls: Option<u32>,
    pub compute_ms: f64,
}

pub async fn resolve(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ResolveRequest>,
) -> Result<Json<ResolveResponse>, ApiError> {
    let start = Instant::now();
    let address = req.address.trim().to_string();
    if address.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "Missing 'address'"));
    }

    let engine = Arc::clone(&state.engine);
    let target = address.clone();
    let trace = tokio::task::spawn_blocking(move || engine.resolve_traced(&target))
        .await
        .map_err(join_error)?;

    let (attempts, provider_calls) = if req.trace {
        (Some(trace.attempts), Some(trace.provider_calls))
    } else {
        (None, None)
    };

    Ok(Json(ResolveResponse {
        address,
        outcome: trace.outcome,
        attempts,
        provider_calls,
        compute_ms: start.elapsed().as_secs_f64() * 1000.0,
    }))
}

// ─── POST /api/batch ─────────────────────────────────────────────

#[derive(Serialize)]
pub struct BatchResponse {
    pub summary: BatchSummary,
    pub results: Vec<PlaceOutcome>,
}

pub async fn batch(
    State(state): State<Arc<AppState>>,
    Json(inputs): Json<Vec<PlaceInput>>,
) -> Result<Json<BatchResponse>, ApiError> {
    if inputs.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "Empty batch"));
    }

    let runner = BatchRunner::new(Arc::clone(&state.engine), state.batch)
        .with_overrides(Arc::clone(&state.overrides));
    let results = tokio::task::spawn_blocking(move || runner.run(inputs))
        .await
        .map_err(join_error)?
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(BatchResponse {
        summary: BatchSummary::from_outcomes(&results),
        results,
    }))
}

// ─── GET /api/cache/stats ────────────────────────────────────────

#[derive(Serialize)]
pub struct CacheStatsResponse {
    pub entries: usize,
    #[serde(flatten)]
    pub stats: CacheStats,
}

pub async fn cache_stats(State(state): State<Arc<AppState>>) -> Json<CacheStatsResponse> {
    let cache = state.engine.cache();
    Json(CacheStatsResponse {
        entries: cache.len(),
        stats: cache.stats(),
    })
}
