//! Ingest handler
//!
//! The full write pipeline for one event: canonicalize, hash, enrich,
//! score, persist. Enrichment and scoring failures never reject the
//! event; store failures do, so the producer can retry (dedup makes the
//! retry safe).

use std::sync::atomic::Ordering;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Serialize;

use crate::error::{AppError, AppResult};
use crate::geo::GeoStatus;
use crate::metrics::Metrics;
use crate::models::{canonicalize, content_hash, NewEvent, RawEvent, Score};
use crate::Collector;

use super::counted;

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub accepted: bool,
    pub inserted: bool,
    pub duplicate: bool,
    pub score: Score,
}

pub async fn ingest(
    State(state): State<Collector>,
    payload: Result<Json<RawEvent>, JsonRejection>,
) -> Response {
    let raw = match payload {
        Ok(Json(raw)) => raw,
        Err(rejection) => {
            let err = AppError::Schema(format!("invalid request body: {rejection}"));
            return counted(&state, err).into_response();
        }
    };

    match handle(&state, raw).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => counted(&state, err).into_response(),
    }
}

async fn handle(state: &Collector, raw: RawEvent) -> AppResult<IngestResponse> {
    if state.inflight_writes.load(Ordering::SeqCst) >= state.config.backpressure_high_watermark {
        return Err(AppError::Backpressure);
    }

    let event = canonicalize(&raw)?;
    let hash = content_hash(&event);

    // Enrichment is bounded by its own timeout and never fails the event.
    let geo = state.geo.enrich(&event.source_address).await;
    if geo.status == GeoStatus::Unresolved {
        Metrics::incr(&state.metrics.enrichment_unavailable);
    }

    let score = state.ensemble.score(&event);
    if score.degraded {
        Metrics::incr(&state.metrics.scoring_degraded);
    }

    let record = NewEvent {
        event: &event,
        geo: &geo,
        score: &score,
        content_hash: &hash,
        ingested_at: Utc::now(),
    };

    state.inflight_writes.fetch_add(1, Ordering::SeqCst);
    let result = record.insert_with_retry(&state.pool).await;
    state.inflight_writes.fetch_sub(1, Ordering::SeqCst);
    let inserted = result?;

    if inserted {
        Metrics::incr(&state.metrics.events_ingested);
        tracing::info!(
            source = %event.source_address,
            action = %event.action,
            score = score.value,
            band = score.band.as_str(),
            "event stored"
        );
    } else {
        Metrics::incr(&state.metrics.events_deduplicated);
        tracing::debug!(content_hash = %hash, "duplicate event ignored");
    }

    Ok(IngestResponse { accepted: true, inserted, duplicate: !inserted, score })
}
