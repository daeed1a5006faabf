//! Health check handler

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::metrics::MetricsSnapshot;
use crate::scoring::EnsembleSummary;
use crate::Collector;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub timestamp: String,
    pub database: bool,
    pub total_events: i64,
    pub models: EnsembleSummary,
    pub geo_cache_entries: u64,
    pub metrics: MetricsSnapshot,
}

/// `GET /health` - liveness plus per-component status. Always 200; a
/// broken store is reported in the body, not as a 5xx, so supervisors
/// can still read the counters.
pub async fn health(State(state): State<Collector>) -> Json<HealthResponse> {
    let total: Result<i64, sqlx::Error> = sqlx::query_scalar("SELECT COUNT(*) FROM events")
        .fetch_one(&state.pool)
        .await;

    let (database, total_events) = match total {
        Ok(count) => (true, count),
        Err(err) => {
            tracing::error!(%err, "health probe cannot reach store");
            (false, 0)
        }
    };

    Json(HealthResponse {
        status: if database { "healthy" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        timestamp: crate::models::format_ts(chrono::Utc::now()),
        database,
        total_events,
        models: state.ensemble.summary(),
        geo_cache_entries: state.geo.cache_size(),
        metrics: state.metrics.snapshot(),
    })
}
