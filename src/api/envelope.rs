//! Response envelope and API errors.
//!
//! Success: `{ "data": ..., "meta": { "timestamp", "recordId"?, "collection"?, "count"? } }`.
//! Failure: `{ "error": { "code", "message" }, "meta": { "timestamp" } }`.
//! Handlers return `Result<ApiResponse<T>, ApiError>` and use `?` on store,
//! engine and payload errors.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::engines::EngineError;
use crate::storage::StoreError;
use crate::types::ValidationError;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMeta {
    pub timestamp: DateTime<Utc>,
    /// Id of the manual prediction stored by this request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    /// Store collection a history listing was read from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
}

impl ResponseMeta {
    pub fn now() -> Self {
        Self {
            timestamp: Utc::now(),
            record_id: None,
            collection: None,
            count: None,
        }
    }

    pub fn stored(record_id: String) -> Self {
        Self {
            record_id: Some(record_id),
            ..Self::now()
        }
    }

    pub fn listing(collection: &'static str, count: usize) -> Self {
        Self {
            collection: Some(collection),
            count: Some(count),
            ..Self::now()
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub data: T,
    pub meta: ResponseMeta,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self::with_meta(data, ResponseMeta::now())
    }

    pub fn with_meta(data: T, meta: ResponseMeta) -> Self {
        Self { data, meta }
    }
}

/// History listing; `meta` carries the collection and row count.
impl<T: Serialize> ApiResponse<Vec<T>> {
    pub fn listing(collection: &'static str, rows: Vec<T>) -> Self {
        let meta = ResponseMeta::listing(collection, rows.len());
        Self::with_meta(rows, meta)
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),
    /// Malformed query parameters.
    #[error("{0}")]
    BadQuery(String),
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("Store unavailable: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Engine(EngineError),
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Validation(e) => Self::Invalid(e),
            other => Self::Engine(other),
        }
    }
}

impl ApiError {
    const fn status(&self) -> (StatusCode, &'static str) {
        match self {
            Self::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            Self::BadQuery(_) | Self::Invalid(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            Self::Store(_) => (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE"),
            Self::Engine(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorDetail,
    meta: ResponseMeta,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status();
        if status.is_server_error() {
            warn!(code, error = %self, "API request failed");
        }
        let body = ErrorBody {
            error: ErrorDetail {
                code,
                message: self.to_string(),
            },
            meta: ResponseMeta::now(),
        };
        (status, Json(body)).into_response()
    }
}
