//! Dashboard summary handler

use axum::extract::State;
use axum::Json;
use chrono::Utc;

use crate::error::AppResult;
use crate::models::Stats;
use crate::Collector;

use super::counted;

/// `GET /stats`
pub async fn stats(State(state): State<Collector>) -> AppResult<Json<Stats>> {
    let stats = Stats::compute(&state.pool, Utc::now())
        .await
        .map_err(|err| counted(&state, err.into()))?;
    Ok(Json(stats))
}
