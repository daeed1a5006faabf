//! Analytics page handler

use axum::extract::State;
use axum::Json;
use chrono::Utc;

use crate::error::AppResult;
use crate::models::Analytics;
use crate::Collector;

use super::counted;

/// `GET /analytics`
pub async fn analytics(State(state): State<Collector>) -> AppResult<Json<Analytics>> {
    let analytics = Analytics::compute(&state.pool, Utc::now())
        .await
        .map_err(|err| counted(&state, err.into()))?;
    Ok(Json(analytics))
}
