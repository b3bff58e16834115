use axum::{
    body::Body,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::AppError;
use crate::idempotency::StoredResponse;

/// Header set on responses served from a stored result.
pub const REPLAYED_HEADER: &str = "idempotent-replayed";

/// Standard API response wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ErrorResponse>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(error: ErrorResponse) -> ApiResponse<()> {
        ApiResponse {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

/// Error response structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }
}

/// Builds an error response in the standard envelope.
pub fn error_response(status: StatusCode, error: ErrorResponse) -> Response {
    (status, Json(ApiResponse::<()>::error(error))).into_response()
}

/// Maps a coordinator or store error to an HTTP response.
///
/// Infrastructure details are logged, never returned to the client.
pub fn app_error_response(err: &AppError) -> Response {
    match err {
        AppError::InvalidInput(msg) => {
            error_response(StatusCode::BAD_REQUEST, ErrorResponse::new(err.code(), msg.clone()))
        }
        e if e.is_unavailable() => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            ErrorResponse::new(err.code(), "Idempotency store unavailable, retry later"),
        ),
        AppError::CorruptRecord { .. } => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorResponse::new(err.code(), "Stored idempotency record is unreadable"),
        ),
        _ => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorResponse::new("INTERNAL_ERROR", "An internal error occurred"),
        ),
    }
}

/// 409 for a key reused with a different request.
pub fn conflict_response() -> Response {
    error_response(
        StatusCode::CONFLICT,
        ErrorResponse::new(
            "IDEMPOTENCY_KEY_REUSED",
            "Idempotency key was already used with different request parameters",
        ),
    )
}

/// 409 with `Retry-After` while another execution holds the key.
pub fn in_progress_response(retry_after: Duration) -> Response {
    let mut response = error_response(
        StatusCode::CONFLICT,
        ErrorResponse::new(
            "REQUEST_IN_PROGRESS",
            "A request with this idempotency key is currently being processed",
        )
        .with_retry_after(retry_after),
    );
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs(retry_after)));
    response
}

/// `Retry-After` is whole seconds; round up so clients never retry early.
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    let millis = retry_after.as_millis() as u64;
    millis.div_ceil(1000).max(1)
}

/// Renders a stored result with its original status and exact body bytes.
pub fn stored_response(stored: &StoredResponse, replayed: bool) -> Response {
    let status = StatusCode::from_u16(stored.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = Response::new(Body::from(stored.body.clone()));
    *response.status_mut() = status;

    let content_type = if serde_json::from_slice::<serde::de::IgnoredAny>(&stored.body).is_ok() {
        "application/json"
    } else {
        "application/octet-stream"
    };
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));

    if replayed {
        response
            .headers_mut()
            .insert(REPLAYED_HEADER, HeaderValue::from_static("true"));
    }
    response
}
