use crate::config::IdempotencySettings;
use crate::error::{AppError, Result};
use crate::idempotency::fingerprint::{Fingerprint, FingerprintEngine, NormalizedRequest};
use crate::idempotency::key::IdempotencyKey;
use crate::idempotency::lease::{LeaseAcquisition, LeaseStore, LeaseToken};
use crate::idempotency::record::{IdempotencyRecord, NewRecord, RequestAudit, StoredOutcome};
use crate::idempotency::storage::{CreateOutcome, RecordStore};
use crate::observability::{get_metrics, mask_sensitive};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lowest delay ever suggested to a waiting caller.
const MIN_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Execution rights handed to exactly one caller for a pending key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionGrant {
    pub key: IdempotencyKey,
    pub token: LeaseToken,
    pub lease_ttl: Duration,
    /// Last recovery point saved by a previous, abandoned execution.
    pub recovery_point: Option<String>,
}

/// What the caller must do with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    ExecuteNow(ExecutionGrant),
    Replay(StoredOutcome),
    /// The key was first seen with a different fingerprint.
    Conflict,
    WaitOrRetry { retry_after: Duration },
}

impl Decision {
    pub fn kind(&self) -> &'static str {
        match self {
            Decision::ExecuteNow(_) => "execute_now",
            Decision::Replay(_) => "replay",
            Decision::Conflict => "conflict",
            Decision::WaitOrRetry { .. } => "wait_or_retry",
        }
    }
}

/// Inbound request to the coordinator.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub key: IdempotencyKey,
    pub request: NormalizedRequest,
    /// Zero-based count of previous `WaitOrRetry` answers for this caller.
    pub attempt: u32,
}

impl ExecuteRequest {
    pub fn new(key: IdempotencyKey, request: NormalizedRequest) -> Self {
        Self {
            key,
            request,
            attempt: 0,
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }
}

/// Bounded exponential backoff for `WaitOrRetry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// `min(max, base * 2^attempt)`, further capped by the remaining lease
    /// time when known, and never below 10ms.
    pub fn delay(&self, attempt: u32, lease_remaining: Option<Duration>) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        let exponential = self.base.checked_mul(factor).unwrap_or(self.max).min(self.max);
        let capped = match lease_remaining {
            Some(remaining) => exponential.min(remaining),
            None => exponential,
        };
        capped.max(MIN_RETRY_DELAY)
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub lease_ttl: Duration,
    pub max_body_bytes: usize,
    pub backoff: BackoffPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::from(&IdempotencySettings::default())
    }
}

impl From<&IdempotencySettings> for CoordinatorConfig {
    fn from(settings: &IdempotencySettings) -> Self {
        Self {
            lease_ttl: settings.lease_ttl(),
            max_body_bytes: settings.max_body_bytes,
            backoff: BackoffPolicy {
                base: Duration::from_millis(settings.backoff_base_ms),
                max: Duration::from_millis(settings.backoff_max_ms),
            },
        }
    }
}

/// In-process counters for coordinator decisions.
#[derive(Debug, Default)]
pub struct CoordinatorStats {
    pub total_requests: AtomicU64,
    pub executions_granted: AtomicU64,
    pub replays: AtomicU64,
    pub conflicts: AtomicU64,
    pub waits: AtomicU64,
    pub errors: AtomicU64,
}

impl CoordinatorStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, result: &Result<Decision>) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let counter = match result {
            Ok(Decision::ExecuteNow(_)) => &self.executions_granted,
            Ok(Decision::Replay(_)) => &self.replays,
            Ok(Decision::Conflict) => &self.conflicts,
            Ok(Decision::WaitOrRetry { .. }) => &self.waits,
            Err(_) => &self.errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            executions_granted: self.executions_granted.load(Ordering::Relaxed),
            replays: self.replays.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub executions_granted: u64,
    pub replays: u64,
    pub conflicts: u64,
    pub waits: u64,
    pub errors: u64,
}

impl StatsSnapshot {
    pub fn replay_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.replays as f64 / self.total_requests as f64
        }
    }
}

/// Per-key state derived from the stored record.
enum KeyState {
    Unseen,
    Pending(IdempotencyRecord),
    Terminal(IdempotencyRecord),
    Conflict,
}

impl KeyState {
    fn classify(record: Option<IdempotencyRecord>, fingerprint: &Fingerprint) -> Self {
        match record {
            None => KeyState::Unseen,
            Some(record) if record.fingerprint != *fingerprint => KeyState::Conflict,
            Some(record) if record.is_terminal() => KeyState::Terminal(record),
            Some(record) => KeyState::Pending(record),
        }
    }
}

/// Decides, per request, whether to execute, wait, or replay.
///
/// Every call is a single non-blocking decision; polling cadence belongs to
/// the caller.
pub struct IdempotencyCoordinator<R: ?Sized, L: ?Sized> {
    records: Arc<R>,
    leases: Arc<L>,
    fingerprints: FingerprintEngine,
    config: CoordinatorConfig,
    stats: Arc<CoordinatorStats>,
}

impl<R, L> IdempotencyCoordinator<R, L>
where
    R: RecordStore + ?Sized,
    L: LeaseStore + ?Sized,
{
    pub fn new(records: Arc<R>, leases: Arc<L>, config: CoordinatorConfig) -> Self {
        Self {
            records,
            leases,
            fingerprints: FingerprintEngine::new(config.max_body_bytes),
            config,
            stats: Arc::new(CoordinatorStats::new()),
        }
    }

    pub fn stats(&self) -> Arc<CoordinatorStats> {
        Arc::clone(&self.stats)
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn fingerprint_engine(&self) -> &FingerprintEngine {
        &self.fingerprints
    }

    pub fn record_store(&self) -> Arc<R> {
        Arc::clone(&self.records)
    }

    pub fn lease_store(&self) -> Arc<L> {
        Arc::clone(&self.leases)
    }

    /// Fingerprints the request and runs the decision algorithm.
    /// Invalid input fails before any store I/O.
    pub async fn execute(&self, request: &ExecuteRequest) -> Result<Decision> {
        let fingerprint = match self.fingerprints.fingerprint(&request.request) {
            Ok(fingerprint) => fingerprint,
            Err(e) => {
                get_metrics().record_fingerprint_rejected();
                let result = Err(e);
                self.stats.record(&result);
                return result;
            }
        };

        let audit = RequestAudit {
            method: Some(request.request.method.to_ascii_uppercase()),
            path: Some(request.request.path.clone()),
        };

        self.execute_fingerprinted(&request.key, fingerprint, request.attempt, audit)
            .await
    }

    /// Runs the decision algorithm for an already computed fingerprint.
    pub async fn execute_fingerprinted(
        &self,
        key: &IdempotencyKey,
        fingerprint: Fingerprint,
        attempt: u32,
        audit: RequestAudit,
    ) -> Result<Decision> {
        let result = self.decide(key, fingerprint, attempt, audit).await;

        match &result {
            Ok(decision) => {
                get_metrics().record_decision(decision.kind());
                debug!(
                    key = %mask_sensitive(key.as_str(), 4),
                    decision = decision.kind(),
                    "Idempotency decision"
                );
            }
            Err(e) => {
                get_metrics().record_decision_error(e.code());
                warn!(key = %mask_sensitive(key.as_str(), 4), error = %e, "Idempotency decision failed");
            }
        }

        self.stats.record(&result);
        result
    }

    async fn decide(
        &self,
        key: &IdempotencyKey,
        fingerprint: Fingerprint,
        attempt: u32,
        audit: RequestAudit,
    ) -> Result<Decision> {
        let mut record = self.records.get_record(key).await?;

        // At most two passes: a lost first-observation race turns Unseen into
        // one of the other states on the re-fetch.
        for pass in 0..2 {
            match KeyState::classify(record.take(), &fingerprint) {
                KeyState::Conflict => return Ok(Decision::Conflict),
                KeyState::Terminal(existing) => return self.replay(existing),
                KeyState::Pending(existing) => {
                    return self.try_own(key, existing.recovery_point, attempt).await;
                }
                KeyState::Unseen if pass == 0 => {
                    let new = NewRecord {
                        key: key.clone(),
                        fingerprint,
                        audit: audit.clone(),
                    };
                    match self.records.create_pending(&new).await? {
                        CreateOutcome::Created(created) => {
                            info!(key = %mask_sensitive(key.as_str(), 4), "Created pending idempotency record");
                            return self.try_own(key, created.recovery_point, attempt).await;
                        }
                        CreateOutcome::AlreadyExists => {
                            debug!(key = %mask_sensitive(key.as_str(), 4), "Lost first-observation race, re-fetching");
                            record = self.records.get_record(key).await?;
                        }
                    }
                }
                KeyState::Unseen => break,
            }
        }

        // Created by someone else yet gone on re-fetch: purged in between.
        Ok(Decision::WaitOrRetry {
            retry_after: self.config.backoff.delay(attempt, None),
        })
    }

    fn replay(&self, record: IdempotencyRecord) -> Result<Decision> {
        record
            .outcome()
            .map(Decision::Replay)
            .ok_or_else(|| AppError::corrupt(record.key.as_str(), "terminal record has no response"))
    }

    async fn try_own(
        &self,
        key: &IdempotencyKey,
        recovery_point: Option<String>,
        attempt: u32,
    ) -> Result<Decision> {
        let lease = match self.leases.acquire(key, self.config.lease_ttl).await? {
            LeaseAcquisition::Acquired(lease) => lease,
            LeaseAcquisition::Busy { remaining } => {
                return Ok(Decision::WaitOrRetry {
                    retry_after: self.config.backoff.delay(attempt, remaining),
                });
            }
        };

        match self.records.assign_lease(key, lease.token).await {
            Ok(true) => Ok(Decision::ExecuteNow(ExecutionGrant {
                key: key.clone(),
                token: lease.token,
                lease_ttl: lease.ttl,
                recovery_point,
            })),
            outcome => {
                self.release_quietly(key, lease.token).await;
                match outcome {
                    // Finalized between our read and the lease win.
                    Ok(_) => match self.records.get_record(key).await? {
                        Some(record) if record.is_terminal() => self.replay(record),
                        _ => Ok(Decision::WaitOrRetry {
                            retry_after: self.config.backoff.delay(attempt, None),
                        }),
                    },
                    Err(e) => Err(e),
                }
            }
        }
    }

    async fn release_quietly(&self, key: &IdempotencyKey, token: LeaseToken) {
        if let Err(e) = self.leases.release(key, token).await {
            warn!(key = %mask_sensitive(key.as_str(), 4), "Failed to release lease: {}", e);
        }
    }
}
