//! Per-source investigation handler

use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use serde::Serialize;

use crate::error::{AppError, AppResult};
use crate::models::{
    hourly_series, BucketPoint, EventRow, SourceGeo, SourceSummary, MAX_QUERY_LIMIT,
};
use crate::Collector;

use super::counted;

#[derive(Debug, Serialize)]
pub struct Investigation {
    pub source: String,
    pub summary: SourceSummary,
    pub geo: Option<SourceGeo>,
    pub score_trend: Vec<BucketPoint>,
    pub events: Vec<EventRow>,
}

/// `GET /investigate/{source}` - everything known about one source.
/// 404 when the source has never been seen.
pub async fn investigate(
    State(state): State<Collector>,
    Path(source): Path<String>,
) -> AppResult<Json<Investigation>> {
    let events = EventRow::for_source(&state.pool, &source, MAX_QUERY_LIMIT)
        .await
        .map_err(|err| counted(&state, err.into()))?;

    if events.is_empty() {
        return Err(counted(
            &state,
            AppError::NotFound(format!("no events recorded for source {source}")),
        ));
    }

    let summary = SourceSummary::compute(&state.pool, &source)
        .await
        .map_err(|err| counted(&state, err.into()))?;
    let geo = SourceGeo::latest(&state.pool, &source)
        .await
        .map_err(|err| counted(&state, err.into()))?;
    let score_trend = hourly_series(&state.pool, Utc::now(), Some(&source))
        .await
        .map_err(|err| counted(&state, err.into()))?;

    Ok(Json(Investigation { source, summary, geo, score_trend, events }))
}
