//! Error and throughput counters exposed via `/health`

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Process-lifetime counters. Shared behind an `Arc`, lock-free.
#[derive(Debug, Default)]
pub struct Metrics {
    pub events_ingested: AtomicU64,
    pub events_deduplicated: AtomicU64,
    pub schema_errors: AtomicU64,
    pub payload_too_large: AtomicU64,
    pub enrichment_unavailable: AtomicU64,
    pub scoring_degraded: AtomicU64,
    pub store_transient: AtomicU64,
    pub store_fatal: AtomicU64,
    pub query_param_errors: AtomicU64,
    pub not_found: AtomicU64,
    pub backpressure_rejections: AtomicU64,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct MetricsSnapshot {
    pub events_ingested: u64,
    pub events_deduplicated: u64,
    pub schema_errors: u64,
    pub payload_too_large: u64,
    pub enrichment_unavailable: u64,
    pub scoring_degraded: u64,
    pub store_transient: u64,
    pub store_fatal: u64,
    pub query_param_errors: u64,
    pub not_found: u64,
    pub backpressure_rejections: u64,
}

impl Metrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an error by its taxonomy kind.
    pub fn count_error(&self, kind: &str) {
        let counter = match kind {
            "schema_error" => &self.schema_errors,
            "payload_too_large" => &self.payload_too_large,
            "query_param_error" => &self.query_param_errors,
            "not_found" => &self.not_found,
            "backpressure" => &self.backpressure_rejections,
            "store_transient" => &self.store_transient,
            "store_fatal" => &self.store_fatal,
            _ => return,
        };
        Self::incr(counter);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_ingested: self.events_ingested.load(Ordering::Relaxed),
            events_deduplicated: self.events_deduplicated.load(Ordering::Relaxed),
            schema_errors: self.schema_errors.load(Ordering::Relaxed),
            payload_too_large: self.payload_too_large.load(Ordering::Relaxed),
            enrichment_unavailable: self.enrichment_unavailable.load(Ordering::Relaxed),
            scoring_degraded: self.scoring_degraded.load(Ordering::Relaxed),
            store_transient: self.store_transient.load(Ordering::Relaxed),
            store_fatal: self.store_fatal.load(Ordering::Relaxed),
            query_param_errors: self.query_param_errors.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            backpressure_rejections: self.backpressure_rejections.load(Ordering::Relaxed),
        }
    }
}
