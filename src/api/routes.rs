use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use super::handlers;
use super::operation::OperationHandler;
use crate::idempotency::{CoordinatorConfig, IdempotencyCoordinator, LeaseStore, RecordStore, ResultPublisher};
use crate::observability::HealthChecker;

pub type SharedCoordinator = IdempotencyCoordinator<dyn RecordStore, dyn LeaseStore>;
pub type SharedPublisher = ResultPublisher<dyn RecordStore, dyn LeaseStore>;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<SharedCoordinator>,
    pub publisher: SharedPublisher,
    pub operation: Arc<dyn OperationHandler>,
    pub metrics_handle: Option<PrometheusHandle>,
    pub health_checker: Arc<HealthChecker>,
}

impl AppState {
    pub fn new(
        records: Arc<dyn RecordStore>,
        leases: Arc<dyn LeaseStore>,
        config: CoordinatorConfig,
        operation: Arc<dyn OperationHandler>,
    ) -> Self {
        Self {
            coordinator: Arc::new(IdempotencyCoordinator::new(
                Arc::clone(&records),
                Arc::clone(&leases),
                config,
            )),
            publisher: ResultPublisher::new(records, leases),
            operation,
            metrics_handle: None,
            health_checker: Arc::new(HealthChecker::new(Vec::new())),
        }
    }

    /// Adds metrics handle to the state.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    /// Adds health checker to the state.
    pub fn with_health_checker(mut self, checker: Arc<HealthChecker>) -> Self {
        self.health_checker = checker;
        self
    }
}

/// Creates the main API router with all routes.
pub fn create_router(state: AppState) -> Router {
    let operations = post(handlers::idempotent_operation)
        .put(handlers::idempotent_operation)
        .patch(handlers::idempotent_operation)
        .delete(handlers::idempotent_operation);

    Router::new()
        // Health endpoints
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/live", get(handlers::liveness_check))
        // Metrics endpoints
        .route("/metrics", get(handlers::metrics_endpoint))
        .route("/v1/idempotency/stats", get(handlers::idempotency_stats))
        // Idempotent operations
        .route("/v1/operations/*path", operations)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}
