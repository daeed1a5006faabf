//! Error handling
//!
//! Domain code returns these kinds as values; only the HTTP surface
//! converts them to status codes. Enrichment and scoring failures are
//! absorbed before they reach this type (see `geo` and `scoring`).

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    /// Missing or malformed input field on ingest.
    #[error("schema error: {0}")]
    Schema(String),

    /// Serialized payload exceeds the configured bound.
    #[error("payload too large")]
    PayloadTooLarge,

    /// Malformed query parameter on a read endpoint.
    #[error("invalid query parameter: {0}")]
    QueryParam(String),

    #[error("{0}")]
    NotFound(String),

    /// Too many writes in flight; producer should back off and retry.
    #[error("write backlog full")]
    Backpressure,

    /// Engine-transient write failure, already retried once.
    #[error("store transient error: {0}")]
    StoreTransient(String),

    /// Schema corruption or missing table.
    #[error("store fatal error: {0}")]
    StoreFatal(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable kind tag used in response bodies and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Schema(_) => "schema_error",
            AppError::PayloadTooLarge => "payload_too_large",
            AppError::QueryParam(_) => "query_param_error",
            AppError::NotFound(_) => "not_found",
            AppError::Backpressure => "backpressure",
            AppError::StoreTransient(_) => "store_transient",
            AppError::StoreFatal(_) => "store_fatal",
            AppError::Internal(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::Schema(_) | AppError::QueryParam(_) => StatusCode::BAD_REQUEST,
            AppError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Backpressure | AppError::StoreTransient(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::StoreFatal(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(kind = self.kind(), "{}", self);
        }

        let body = Json(json!({
            "error": self.kind(),
            "detail": self.to_string(),
        }));

        let mut response = (status, body).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, header::HeaderValue::from_static("1"));
        }
        response
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => {
                let msg = db.message();
                if msg.contains("locked") || msg.contains("busy") {
                    AppError::StoreTransient(msg.to_string())
                } else {
                    AppError::StoreFatal(msg.to_string())
                }
            }
            sqlx::Error::PoolTimedOut => AppError::StoreTransient(err.to_string()),
            _ => AppError::StoreFatal(err.to_string()),
        }
    }
}
