//! Live event feed and raw listing handlers

use std::collections::HashMap;

use axum::extract::{Query, State};
use axum::Json;
use serde::Serialize;

use crate::error::AppResult;
use crate::models::EventRow;
use crate::Collector;

use super::{counted, parse_param};

const DEFAULT_LIMIT: i64 = 100;

#[derive(Debug, Serialize)]
pub struct EventsResponse {
    pub events: Vec<EventRow>,
    pub count: usize,
}

/// `GET /events` - most recent events with optional source / score filters.
pub async fn live(
    State(state): State<Collector>,
    Query(params): Query<HashMap<String, String>>,
) -> AppResult<Json<EventsResponse>> {
    let limit = parse_param(&params, "limit")
        .map_err(|e| counted(&state, e))?
        .unwrap_or(DEFAULT_LIMIT);
    let min_score = parse_param(&params, "min_score").map_err(|e| counted(&state, e))?;
    let source = params.get("source").map(String::as_str);

    // The feed degrades to an empty list rather than a 5xx.
    let events = EventRow::live(&state.pool, limit, source, min_score)
        .await
        .unwrap_or_else(|err| {
            tracing::error!(%err, "live event query failed");
            state.metrics.count_error("store_fatal");
            Vec::new()
        });

    let count = events.len();
    Ok(Json(EventsResponse { events, count }))
}

/// `GET /logs` - paged raw listing with exact-match filters.
pub async fn list(
    State(state): State<Collector>,
    Query(params): Query<HashMap<String, String>>,
) -> AppResult<Json<EventsResponse>> {
    let limit = parse_param(&params, "limit")
        .map_err(|e| counted(&state, e))?
        .unwrap_or(DEFAULT_LIMIT);
    let offset = parse_param(&params, "offset")
        .map_err(|e| counted(&state, e))?
        .unwrap_or(0);
    let source = params.get("source").map(String::as_str);
    let action = params.get("action").map(String::as_str);
    let target_service = params.get("target_service").map(String::as_str);

    let events = EventRow::list(&state.pool, limit, offset, source, action, target_service)
        .await
        .map_err(|err| counted(&state, err.into()))?;

    let count = events.len();
    Ok(Json(EventsResponse { events, count }))
}
