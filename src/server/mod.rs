mod handlers;
mod state;

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

pub use state::AppState;

use crate::geocode::GeoError;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/resolve", post(handlers::resolve))
        .route("/api/batch", post(handlers::batch))
        .route("/api/cache/stats", get(handlers::cache_stats))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until Ctrl-C, then flush the cache.
pub async fn start(state: Arc<AppState>, host: &str, port: u16) -> Result<(), GeoError> {
    let engine = Arc::clone(&state.engine);
    let app = build_router(state);
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| GeoError::Config(format!("cannot bind to {}: {}", addr, e)))?;

    tracing::info!(provider = engine.provider_id(), "geolore server listening on http://{}", addr);
    eprintln!("  Press Ctrl+C to stop.");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!(entries = engine.cache().len(), "shutting down, flushing cache");
    tokio::task::spawn_blocking(move || engine.cache().flush())
        .await
        .map_err(|e| GeoError::Config(format!("cache flush task failed: {}", e)))?
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
