use crate::error::{AppError, Result};
use crate::idempotency::coordinator::ExecutionGrant;
use crate::idempotency::lease::{Lease, LeaseHeartbeat, LeaseStatus, LeaseStore};
use crate::idempotency::record::{IdempotencyRecord, OutcomeState, StoredOutcome, StoredResponse};
use crate::idempotency::storage::{CompletionOutcome, RecordStore};
use crate::observability::{get_metrics, mask_sensitive};
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Published(IdempotencyRecord),
    /// The lease was lost and the record was finalized, or is owned, elsewhere.
    LeaseLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointOutcome {
    Saved,
    LeaseLost,
}

/// Result of [`ResultPublisher::run_guarded`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardedExecution {
    /// Outcome produced by this execution.
    pub outcome: StoredOutcome,
    /// False when another lease holder finalized the record instead.
    pub published: bool,
}

/// Persists execution outcomes and releases the execution lease.
pub struct ResultPublisher<R: ?Sized, L: ?Sized> {
    records: Arc<R>,
    leases: Arc<L>,
    renew_during_execution: bool,
}

impl<R: ?Sized, L: ?Sized> Clone for ResultPublisher<R, L> {
    fn clone(&self) -> Self {
        Self {
            records: Arc::clone(&self.records),
            leases: Arc::clone(&self.leases),
            renew_during_execution: self.renew_during_execution,
        }
    }
}

impl<R, L> ResultPublisher<R, L>
where
    R: RecordStore + ?Sized + 'static,
    L: LeaseStore + ?Sized + 'static,
{
    pub fn new(records: Arc<R>, leases: Arc<L>) -> Self {
        Self {
            records,
            leases,
            renew_during_execution: true,
        }
    }

    /// Disables the lease heartbeat in [`ResultPublisher::run_guarded`].
    pub fn without_renewal(mut self) -> Self {
        self.renew_during_execution = false;
        self
    }

    /// Finalizes the record and always attempts to release the lease, even
    /// when finalizing fails.
    pub async fn publish(
        &self,
        grant: &ExecutionGrant,
        state: OutcomeState,
        response: StoredResponse,
    ) -> Result<PublishOutcome> {
        let masked = mask_sensitive(grant.key.as_str(), 4);
        let completion = self
            .records
            .complete_record(&grant.key, grant.token, state, &response)
            .await;

        match self.leases.release(&grant.key, grant.token).await {
            Ok(LeaseStatus::Held) => {}
            Ok(LeaseStatus::Lost) => {
                warn!(key = %masked, token = %grant.token, "Lease had already expired at release");
            }
            Err(e) => {
                warn!(key = %masked, token = %grant.token, "Failed to release lease, it will expire: {}", e);
            }
        }

        match completion {
            Ok(CompletionOutcome::Completed(record)) => {
                get_metrics().record_publish("published");
                info!(key = %masked, state = %record.state, "Published idempotent result");
                Ok(PublishOutcome::Published(record))
            }
            Ok(CompletionOutcome::Conflict) => {
                get_metrics().record_publish("lease_lost");
                warn!(
                    key = %masked,
                    token = %grant.token,
                    "Record no longer owned by this lease; keeping the existing result"
                );
                Ok(PublishOutcome::LeaseLost)
            }
            Err(e) => {
                get_metrics().record_publish("error");
                error!(key = %masked, "Failed to publish idempotent result: {}", e);
                Err(e)
            }
        }
    }

    /// Saves a recovery point so a takeover can resume a multi-step execution.
    pub async fn checkpoint(&self, grant: &ExecutionGrant, recovery_point: &str) -> Result<CheckpointOutcome> {
        if recovery_point.trim().is_empty() {
            return Err(AppError::InvalidInput("recovery point cannot be empty".to_string()));
        }

        let saved = self
            .records
            .save_checkpoint(&grant.key, grant.token, recovery_point)
            .await?;

        if saved {
            Ok(CheckpointOutcome::Saved)
        } else {
            warn!(key = %mask_sensitive(grant.key.as_str(), 4), "Checkpoint rejected, lease lost");
            Ok(CheckpointOutcome::LeaseLost)
        }
    }

    /// Runs the business handler and publishes its outcome.
    ///
    /// Handler and publish run on a spawned task, so dropping the returned
    /// future does not abandon publication. A handler error or panic is
    /// published as `failed` with a generic internal error response.
    pub async fn run_guarded<F, Fut>(&self, grant: ExecutionGrant, handler: F) -> Result<GuardedExecution>
    where
        F: FnOnce(ExecutionGrant) -> Fut,
        Fut: Future<Output = anyhow::Result<StoredOutcome>> + Send + 'static,
    {
        let publisher = self.clone();
        let execution = handler(grant.clone());

        let task = tokio::spawn(async move {
            let heartbeat = publisher.renew_during_execution.then(|| {
                LeaseHeartbeat::spawn(
                    Arc::clone(&publisher.leases),
                    Lease {
                        key: grant.key.clone(),
                        token: grant.token,
                        ttl: grant.lease_ttl,
                    },
                )
            });

            let outcome = match tokio::spawn(execution).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    error!(key = %mask_sensitive(grant.key.as_str(), 4), "Idempotent handler failed: {:#}", e);
                    failed_outcome()
                }
                Err(join_error) => {
                    error!(key = %mask_sensitive(grant.key.as_str(), 4), "Idempotent handler aborted: {}", join_error);
                    failed_outcome()
                }
            };

            if let Some(heartbeat) = heartbeat {
                heartbeat.stop().await;
            }

            let published = publisher
                .publish(&grant, outcome.state, outcome.response.clone())
                .await?;

            Ok(GuardedExecution {
                outcome,
                published: matches!(published, PublishOutcome::Published(_)),
            })
        });

        task.await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Publishing task failed: {}", e)))?
    }
}

fn failed_outcome() -> StoredOutcome {
    StoredOutcome {
        state: OutcomeState::Failed,
        response: StoredResponse::internal_error(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::coordinator::{CoordinatorConfig, Decision, ExecuteRequest, IdempotencyCoordinator};
    use crate::idempotency::fingerprint::NormalizedRequest;
    use crate::idempotency::key::IdempotencyKey;
    use crate::idempotency::lease::{InMemoryLeaseStore, LeaseToken, MockLeaseStore};
    use crate::idempotency::record::RecordState;
    use crate::idempotency::storage::{InMemoryRecordStore, MockRecordStore};

    async fn granted(
        records: Arc<InMemoryRecordStore>,
        leases: Arc<InMemoryLeaseStore>,
        raw_key: &str,
    ) -> ExecutionGrant {
        let coordinator = IdempotencyCoordinator::new(records, leases, CoordinatorConfig::default());
        let request = ExecuteRequest::new(
            IdempotencyKey::new(raw_key).unwrap(),
            NormalizedRequest::new("POST", "/orders", b"{}".to_vec()),
        );
        match coordinator.execute(&request).await.unwrap() {
            Decision::ExecuteNow(grant) => grant,
            other => panic!("expected ExecuteNow, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_publish_finalizes_and_releases() {
        let records = Arc::new(InMemoryRecordStore::new());
        let leases = Arc::new(InMemoryLeaseStore::new());
        let grant = granted(records.clone(), leases.clone(), "order-42").await;

        let publisher = ResultPublisher::new(records.clone(), leases.clone());
        let outcome = publisher
            .publish(&grant, OutcomeState::Completed, StoredResponse::new(200, b"ok".to_vec()))
            .await
            .unwrap();

        assert!(matches!(outcome, PublishOutcome::Published(ref r) if r.state == RecordState::Completed));
        assert_eq!(leases.live_count().await, 0);
    }

    #[tokio::test]
    async fn test_publish_with_stale_token_reports_lease_lost() {
        let records = Arc::new(InMemoryRecordStore::new());
        let leases = Arc::new(InMemoryLeaseStore::new());
        let mut grant = granted(records.clone(), leases.clone(), "order-42").await;
        grant.token = LeaseToken::new();

        let publisher = ResultPublisher::new(records.clone(), leases.clone());
        let outcome = publisher
            .publish(&grant, OutcomeState::Completed, StoredResponse::new(200, b"late".to_vec()))
            .await
            .unwrap();

        assert_eq!(outcome, PublishOutcome::LeaseLost);
        let stored = records.get_record(&grant.key).await.unwrap().unwrap();
        assert_eq!(stored.state, RecordState::Pending);
    }

    #[tokio::test]
    async fn test_release_attempted_when_complete_errors() {
        let mut records = MockRecordStore::new();
        records
            .expect_complete_record()
            .returning(|_, _, _, _| Err(AppError::StoreUnavailable("down".to_string())));
        let mut leases = MockLeaseStore::new();
        leases.expect_release().times(1).returning(|_, _| Ok(LeaseStatus::Held));

        let publisher = ResultPublisher::new(Arc::new(records), Arc::new(leases));
        let grant = ExecutionGrant {
            key: IdempotencyKey::new("order-42").unwrap(),
            token: LeaseToken::new(),
            lease_ttl: std::time::Duration::from_secs(5),
            recovery_point: None,
        };

        let result = publisher
            .publish(&grant, OutcomeState::Completed, StoredResponse::new(200, Vec::new()))
            .await;
        assert!(matches!(result, Err(AppError::StoreUnavailable(_))));
    }

    #[tokio::test]
    async fn test_run_guarded_publishes_failure_on_handler_error() {
        let records = Arc::new(InMemoryRecordStore::new());
        let leases = Arc::new(InMemoryLeaseStore::new());
        let grant = granted(records.clone(), leases.clone(), "order-err").await;
        let key = grant.key.clone();

        let publisher = ResultPublisher::new(records.clone(), leases.clone());
        let execution = publisher
            .run_guarded(grant, |_| async { Err(anyhow::anyhow!("payment gateway exploded")) })
            .await
            .unwrap();

        assert!(execution.published);
        assert_eq!(execution.outcome.state, OutcomeState::Failed);
        let stored = records.get_record(&key).await.unwrap().unwrap();
        assert_eq!(stored.state, RecordState::Failed);
        assert_eq!(stored.response, Some(StoredResponse::internal_error()));
        assert_eq!(leases.live_count().await, 0);
    }

    #[tokio::test]
    async fn test_run_guarded_publishes_failure_on_panic() {
        let records = Arc::new(InMemoryRecordStore::new());
        let leases = Arc::new(InMemoryLeaseStore::new());
        let grant = granted(records.clone(), leases.clone(), "order-panic").await;
        let key = grant.key.clone();

        let publisher = ResultPublisher::new(records.clone(), leases.clone()).without_renewal();
        let execution = publisher
            .run_guarded(grant, |_| async {
                if true {
                    panic!("handler bug");
                }
                Ok(StoredOutcome {
                    state: OutcomeState::Completed,
                    response: StoredResponse::new(200, Vec::new()),
                })
            })
            .await
            .unwrap();

        assert_eq!(execution.outcome.state, OutcomeState::Failed);
        let stored = records.get_record(&key).await.unwrap().unwrap();
        assert_eq!(stored.state, RecordState::Failed);
    }

    #[tokio::test]
    async fn test_checkpoint_then_takeover_sees_recovery_point() {
        let records = Arc::new(InMemoryRecordStore::new());
        let leases = Arc::new(InMemoryLeaseStore::new());
        let grant = granted(records.clone(), leases.clone(), "file-upload").await;

        let publisher = ResultPublisher::new(records.clone(), leases.clone());
        assert_eq!(
            publisher.checkpoint(&grant, "FILE_CREATED").await.unwrap(),
            CheckpointOutcome::Saved
        );

        // Simulate the holder crashing: its lease disappears.
        leases.release(&grant.key, grant.token).await.unwrap();

        let takeover = granted(records.clone(), leases.clone(), "file-upload").await;
        assert_ne!(takeover.token, grant.token);
        assert_eq!(takeover.recovery_point.as_deref(), Some("FILE_CREATED"));
        assert_eq!(
            publisher.checkpoint(&grant, "FILE_UPLOADED").await.unwrap(),
            CheckpointOutcome::LeaseLost
        );
    }
}
