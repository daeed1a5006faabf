//! Service index handler

use axum::Json;
use serde_json::json;

/// `GET /` - endpoint directory for people poking at the service.
pub async fn index() -> Json<serde_json::Value> {
    Json(json!({
        "service": "hivetrap-collector",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "ingest": "POST /ingest (alias POST /log)",
            "live_events": "GET /events",
            "raw_listing": "GET /logs",
            "statistics": "GET /stats",
            "analytics": "GET /analytics",
            "map": "GET /map",
            "ml_insights": "GET /ml-insights",
            "alerts": "GET /alerts",
            "investigate": "GET /investigate/{source}",
            "health": "GET /health"
        }
    }))
}
