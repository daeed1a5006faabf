//! Map view handler

use axum::extract::State;
use axum::Json;

use crate::error::AppResult;
use crate::models::MapData;
use crate::Collector;

use super::counted;

/// `GET /map` - per-source points (geolocated rows only) plus the
/// per-country aggregation.
pub async fn map_data(State(state): State<Collector>) -> AppResult<Json<MapData>> {
    let map = MapData::compute(&state.pool)
        .await
        .map_err(|err| counted(&state, err.into()))?;
    Ok(Json(map))
}
