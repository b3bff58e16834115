use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;

use crate::api::operation::OperationInvocation;
use crate::api::responses::{
    app_error_response, conflict_response, error_response, in_progress_response, stored_response, ApiResponse,
    ErrorResponse,
};
use crate::error::AppError;
use crate::idempotency::{Decision, ExecuteRequest, IdempotencyKey, NormalizedRequest};
use crate::observability::{get_metrics, AggregatedHealth, LatencyTimer};

use super::routes::AppState;

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
pub const CLIENT_ID_HEADER: &str = "x-client-id";
/// Number of `409 Retry-After` answers the client has already received.
pub const RETRY_ATTEMPT_HEADER: &str = "x-retry-attempt";

/// Health check endpoint.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<ApiResponse<AggregatedHealth>>) {
    let health = state.health_checker.check_all().await;
    let status = if health.status.is_unhealthy() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (status, Json(ApiResponse::success(health)))
}

/// Readiness check endpoint.
pub async fn readiness_check(State(state): State<AppState>) -> StatusCode {
    if state.health_checker.is_ready().await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Liveness check endpoint.
pub async fn liveness_check(State(state): State<AppState>) -> StatusCode {
    if state.health_checker.is_alive() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Prometheus scrape endpoint.
pub async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    match &state.metrics_handle {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Coordinator statistics for this process.
pub async fn idempotency_stats(State(state): State<AppState>) -> Json<ApiResponse<crate::idempotency::StatsSnapshot>> {
    Json(ApiResponse::success(state.coordinator.stats().snapshot()))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<Option<&'a str>, AppError> {
    headers
        .get(name)
        .map(|value| {
            value
                .to_str()
                .map_err(|_| AppError::InvalidInput(format!("{} header must be visible ASCII", name)))
        })
        .transpose()
}

fn idempotency_key(headers: &HeaderMap) -> Result<Option<IdempotencyKey>, AppError> {
    let Some(raw) = header_str(headers, IDEMPOTENCY_KEY_HEADER)? else {
        return Ok(None);
    };

    let key = match header_str(headers, CLIENT_ID_HEADER)? {
        Some(client) => IdempotencyKey::scoped(client, raw)?,
        None => IdempotencyKey::new(raw)?,
    };
    Ok(Some(key))
}

fn retry_attempt(headers: &HeaderMap) -> Result<u32, AppError> {
    match header_str(headers, RETRY_ATTEMPT_HEADER)? {
        Some(raw) => raw
            .trim()
            .parse::<u32>()
            .map_err(|_| AppError::InvalidInput(format!("{} must be a non-negative integer", RETRY_ATTEMPT_HEADER))),
        None => Ok(0),
    }
}

/// Runs a mutating operation at most once per idempotency key.
pub async fn idempotent_operation(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let timer = LatencyTimer::new();
    let response = run_operation(&state, &method, &uri, &headers, body).await;
    get_metrics().record_http_request(
        method.as_str(),
        "/v1/operations",
        response.status().as_u16(),
        timer.elapsed_ms(),
    );
    response
}

async fn run_operation(state: &AppState, method: &Method, uri: &Uri, headers: &HeaderMap, body: Bytes) -> Response {
    let key = match idempotency_key(headers) {
        Ok(Some(key)) => key,
        Ok(None) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                ErrorResponse::new("MISSING_IDEMPOTENCY_KEY", "Idempotency-Key header is required"),
            );
        }
        Err(e) => return app_error_response(&e),
    };
    let attempt = match retry_attempt(headers) {
        Ok(attempt) => attempt,
        Err(e) => return app_error_response(&e),
    };

    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());
    let request = ExecuteRequest::new(key, NormalizedRequest::new(method.as_str(), path.clone(), body.to_vec()))
        .with_attempt(attempt);

    let decision = match state.coordinator.execute(&request).await {
        Ok(decision) => decision,
        Err(e) => return app_error_response(&e),
    };

    match decision {
        Decision::ExecuteNow(grant) => {
            let operation = Arc::clone(&state.operation);
            let invocation = OperationInvocation {
                method: method.as_str().to_string(),
                path,
                body: body.to_vec(),
                grant: grant.clone(),
            };

            match state
                .publisher
                .run_guarded(grant, move |_| async move { operation.handle(invocation).await })
                .await
            {
                Ok(execution) => stored_response(&execution.outcome.response, false),
                Err(e) => {
                    tracing::error!("Failed to publish operation result: {}", e);
                    app_error_response(&e)
                }
            }
        }
        Decision::Replay(outcome) => stored_response(&outcome.response, true),
        Decision::Conflict => conflict_response(),
        Decision::WaitOrRetry { retry_after } => in_progress_response(retry_after),
    }
}
