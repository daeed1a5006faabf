//! Hivetrap collector
//!
//! Central ingestion-and-scoring server for honeypot telemetry. Deceptive
//! service front-ends POST event records; the collector validates them,
//! enriches the source address with geolocation, scores each event with a
//! three-model ensemble, persists the result with content-based dedup, and
//! serves the aggregation queries behind the dashboard.

pub mod config;
pub mod db;
pub mod error;
pub mod geo;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod scoring;

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    error_handling::HandleErrorLayer,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    BoxError, Json, Router,
};
use tower::ServiceBuilder;
use tower::timeout::TimeoutLayer;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

pub use error::{AppError, AppResult};

/// Shared application state. One handle is created at startup and cloned
/// into every handler; the only mutable pieces are the store pool, the
/// enrichment cache, and the counters.
#[derive(Clone)]
pub struct Collector {
    pub pool: sqlx::SqlitePool,
    pub config: Arc<config::Config>,
    pub ensemble: Arc<scoring::Ensemble>,
    pub geo: Arc<geo::GeoEnricher>,
    pub metrics: Arc<metrics::Metrics>,
    pub inflight_writes: Arc<AtomicUsize>,
}

impl Collector {
    pub fn new(
        pool: sqlx::SqlitePool,
        config: config::Config,
        ensemble: scoring::Ensemble,
    ) -> Self {
        let geo = geo::GeoEnricher::new(&config.geo);
        Self {
            pool,
            config: Arc::new(config),
            ensemble: Arc::new(ensemble),
            geo: Arc::new(geo),
            metrics: Arc::new(metrics::Metrics::default()),
            inflight_writes: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// Create the main router with all routes
pub fn create_router(state: Collector) -> Router {
    let deadline = Duration::from_millis(state.config.request_deadline_ms);

    Router::new()
        // Write path (`/log` is the historical producer alias).
        .route("/ingest", post(handlers::ingest::ingest))
        .route("/log", post(handlers::ingest::ingest))
        // Read path.
        .route("/", get(handlers::index::index))
        .route("/events", get(handlers::events::live))
        .route("/logs", get(handlers::events::list))
        .route("/stats", get(handlers::stats::stats))
        .route("/analytics", get(handlers::analytics::analytics))
        .route("/map", get(handlers::map::map_data))
        .route("/ml-insights", get(handlers::insights::ml_insights))
        .route("/alerts", get(handlers::alerts::alerts))
        .route("/investigate/:source", get(handlers::investigate::investigate))
        .route("/health", get(handlers::health::health))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        // The timeout service is fallible, so it needs its error turned
        // back into a response before the router will accept the stack.
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(deadline_exceeded))
                .layer(TimeoutLayer::new(deadline)),
        )
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state)
}

/// The per-request deadline elapsed and the handler was aborted. A write
/// may already have committed; the producer retries and dedup collapses it.
async fn deadline_exceeded(err: BoxError) -> impl IntoResponse {
    tracing::warn!(%err, "request deadline exceeded");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        [(header::RETRY_AFTER, "1")],
        Json(serde_json::json!({
            "error": "deadline_exceeded",
            "detail": "request deadline exceeded",
        })),
    )
}
