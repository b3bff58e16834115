use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use crate::idempotency::{ExecutionGrant, OutcomeState, StoredOutcome, StoredResponse};

/// A request that has been granted execution rights.
#[derive(Debug, Clone)]
pub struct OperationInvocation {
    pub method: String,
    pub path: String,
    pub body: Vec<u8>,
    pub grant: ExecutionGrant,
}

/// Business logic executed at most once per idempotency key.
///
/// Returning `Err` publishes the key as `failed` with a generic 500 body.
/// A handler that wants a specific error status persisted returns
/// `Ok` with `OutcomeState::Failed`.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn handle(&self, invocation: OperationInvocation) -> anyhow::Result<StoredOutcome>;
}

/// Reference handler that echoes the request with a fresh operation id.
///
/// Replays return the same id, which makes double execution observable.
#[derive(Debug, Default, Clone)]
pub struct EchoOperation;

#[async_trait]
impl OperationHandler for EchoOperation {
    async fn handle(&self, invocation: OperationInvocation) -> anyhow::Result<StoredOutcome> {
        let body = if invocation.body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&invocation.body)
                .unwrap_or_else(|_| json!(String::from_utf8_lossy(&invocation.body)))
        };

        let response = StoredResponse::json(
            201,
            &json!({
                "operation_id": Uuid::new_v4(),
                "method": invocation.method,
                "path": invocation.path,
                "resumed_from": invocation.grant.recovery_point,
                "body": body,
            }),
        )?;

        Ok(StoredOutcome {
            state: OutcomeState::Completed,
            response,
        })
    }
}
