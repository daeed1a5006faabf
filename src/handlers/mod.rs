//! HTTP handlers

pub mod alerts;
pub mod analytics;
pub mod events;
pub mod health;
pub mod index;
pub mod ingest;
pub mod insights;
pub mod investigate;
pub mod map;
pub mod stats;

use std::collections::HashMap;
use std::str::FromStr;

use crate::error::{AppError, AppResult};
use crate::Collector;

/// Parse an optional query parameter, mapping garbage to a 400.
pub(crate) fn parse_param<T: FromStr>(
    params: &HashMap<String, String>,
    key: &str,
) -> AppResult<Option<T>> {
    match params.get(key) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| AppError::QueryParam(format!("{key}={raw}"))),
    }
}

/// Count an error in the metrics surface on its way out.
pub(crate) fn counted(state: &Collector, err: AppError) -> AppError {
    state.metrics.count_error(err.kind());
    err
}
