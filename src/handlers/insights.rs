//! ML insights handler

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde::Serialize;

use crate::models::MlInsights;
use crate::scoring::EnsembleSummary;
use crate::Collector;

#[derive(Debug, Serialize)]
pub struct MlInsightsResponse {
    #[serde(flatten)]
    pub insights: MlInsights,
    pub models: EnsembleSummary,
}

/// `GET /ml-insights` - scoring aggregates plus the static model block.
/// Degrades to an empty structure rather than a 5xx.
pub async fn ml_insights(State(state): State<Collector>) -> Json<MlInsightsResponse> {
    let insights = match MlInsights::compute(&state.pool, Utc::now()).await {
        Ok(insights) => insights,
        Err(err) => {
            tracing::error!(%err, "ml insights query failed");
            state.metrics.count_error("store_fatal");
            MlInsights {
                avg_anomaly_component: 0.0,
                anomaly_count: 0,
                score_trend: Vec::new(),
                high_score_sources: Vec::new(),
                band_histogram: Vec::new(),
                traffic_class_histogram: Vec::new(),
                suspicious_traffic_count: 0,
            }
        }
    };

    Json(MlInsightsResponse { insights, models: state.ensemble.summary() })
}
