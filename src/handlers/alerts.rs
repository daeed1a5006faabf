//! Alert feed handler

use std::collections::HashMap;

use axum::extract::{Query, State};
use axum::Json;
use serde::Serialize;

use crate::error::AppResult;
use crate::models::EventRow;
use crate::Collector;

use super::{counted, parse_param};

const DEFAULT_THRESHOLD: f64 = 0.5;
const DEFAULT_LIMIT: i64 = 100;

#[derive(Debug, Serialize)]
pub struct AlertsResponse {
    pub alerts: Vec<EventRow>,
    pub count: usize,
    pub threshold: f64,
}

/// `GET /alerts` - events at or above the score threshold, best first,
/// with full enrichment and payload fields.
pub async fn alerts(
    State(state): State<Collector>,
    Query(params): Query<HashMap<String, String>>,
) -> AppResult<Json<AlertsResponse>> {
    let threshold = parse_param(&params, "threshold")
        .map_err(|e| counted(&state, e))?
        .unwrap_or(DEFAULT_THRESHOLD);
    let limit = parse_param(&params, "limit")
        .map_err(|e| counted(&state, e))?
        .unwrap_or(DEFAULT_LIMIT);

    let alerts = EventRow::alerts(&state.pool, threshold, limit)
        .await
        .unwrap_or_else(|err| {
            tracing::error!(%err, "alert query failed");
            state.metrics.count_error("store_fatal");
            Vec::new()
        });

    let count = alerts.len();
    Ok(Json(AlertsResponse { alerts, count, threshold }))
}
