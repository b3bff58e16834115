use crate::error::{AppError, Result};
use crate::idempotency::key::IdempotencyKey;
use crate::observability::{get_metrics, LatencyTimer};
use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// Unique identifier of one lease acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseToken(Uuid);

impl LeaseToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for LeaseToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A held lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: IdempotencyKey,
    pub token: LeaseToken,
    pub ttl: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseAcquisition {
    Acquired(Lease),
    /// Another holder owns the lease; `remaining` is its TTL when known.
    Busy { remaining: Option<Duration> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStatus {
    Held,
    /// The token no longer matches the current holder (expired or taken over).
    Lost,
}

/// Short-lived mutual exclusion over idempotency keys.
///
/// Every implementation must make `acquire` an atomic set-if-absent with
/// expiry, and make `renew`/`release` token-checked.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn acquire(&self, key: &IdempotencyKey, ttl: Duration) -> Result<LeaseAcquisition>;

    async fn renew(&self, key: &IdempotencyKey, token: LeaseToken, ttl: Duration) -> Result<LeaseStatus>;

    async fn release(&self, key: &IdempotencyKey, token: LeaseToken) -> Result<LeaseStatus>;
}

fn validate_ttl(ttl: Duration) -> Result<u64> {
    let ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
    if ms == 0 {
        return Err(AppError::InvalidInput("lease ttl must be at least 1ms".to_string()));
    }
    Ok(ms)
}

const RENEW_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
    return 0
end
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

/// Redis-backed leases using `SET NX PX` and Lua compare-and-act scripts.
pub struct RedisLeaseStore {
    client: redis::Client,
    key_prefix: String,
    renew_script: redis::Script,
    release_script: redis::Script,
}

impl RedisLeaseStore {
    pub fn new(client: redis::Client, key_prefix: impl Into<String>) -> Self {
        Self {
            client,
            key_prefix: key_prefix.into(),
            renew_script: redis::Script::new(RENEW_SCRIPT),
            release_script: redis::Script::new(RELEASE_SCRIPT),
        }
    }

    fn make_key(&self, key: &IdempotencyKey) -> String {
        key.lease_key(&self.key_prefix)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(AppError::Redis)
    }

    fn observe<T>(operation: &str, timer: &LatencyTimer, result: &Result<T>) {
        get_metrics().record_redis_operation(operation, timer.elapsed_ms(), result.is_ok());
    }
}

#[async_trait]
impl LeaseStore for RedisLeaseStore {
    async fn acquire(&self, key: &IdempotencyKey, ttl: Duration) -> Result<LeaseAcquisition> {
        let ttl_ms = validate_ttl(ttl)?;
        let timer = LatencyTimer::new();
        let redis_key = self.make_key(key);
        let token = LeaseToken::new();

        let result: Result<LeaseAcquisition> = async {
            let mut conn = self.connection().await?;
            let set: Option<String> = conn
                .set_options(
                    &redis_key,
                    token.to_string(),
                    redis::SetOptions::default()
                        .conditional_set(redis::ExistenceCheck::NX)
                        .with_expiration(redis::SetExpiry::PX(ttl_ms as usize)),
                )
                .await?;

            if set.is_some() {
                return Ok(LeaseAcquisition::Acquired(Lease {
                    key: key.clone(),
                    token,
                    ttl,
                }));
            }

            // Negative PTTL means the key vanished or has no expiry.
            let pttl: i64 = conn.pttl(&redis_key).await?;
            let remaining = u64::try_from(pttl).ok().filter(|ms| *ms > 0).map(Duration::from_millis);
            Ok(LeaseAcquisition::Busy { remaining })
        }
        .await;

        Self::observe("lease_acquire", &timer, &result);
        result
    }

    async fn renew(&self, key: &IdempotencyKey, token: LeaseToken, ttl: Duration) -> Result<LeaseStatus> {
        let ttl_ms = validate_ttl(ttl)?;
        let timer = LatencyTimer::new();

        let result: Result<LeaseStatus> = async {
            let mut conn = self.connection().await?;
            let renewed: i64 = self
                .renew_script
                .key(self.make_key(key))
                .arg(token.to_string())
                .arg(ttl_ms)
                .invoke_async(&mut conn)
                .await?;
            Ok(if renewed == 1 { LeaseStatus::Held } else { LeaseStatus::Lost })
        }
        .await;

        Self::observe("lease_renew", &timer, &result);
        result
    }

    async fn release(&self, key: &IdempotencyKey, token: LeaseToken) -> Result<LeaseStatus> {
        let timer = LatencyTimer::new();

        let result: Result<LeaseStatus> = async {
            let mut conn = self.connection().await?;
            let deleted: i64 = self
                .release_script
                .key(self.make_key(key))
                .arg(token.to_string())
                .invoke_async(&mut conn)
                .await?;
            Ok(if deleted == 1 { LeaseStatus::Held } else { LeaseStatus::Lost })
        }
        .await;

        Self::observe("lease_release", &timer, &result);
        result
    }
}

#[derive(Debug, Clone, Copy)]
struct HeldLease {
    token: LeaseToken,
    expires_at: Instant,
}

impl HeldLease {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Process-local lease store. Expiry follows `tokio::time`, so paused test
/// clocks apply.
#[derive(Debug, Default)]
pub struct InMemoryLeaseStore {
    leases: Mutex<HashMap<String, HeldLease>>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of unexpired leases.
    pub async fn live_count(&self) -> usize {
        let now = Instant::now();
        self.leases.lock().await.values().filter(|l| l.is_live(now)).count()
    }

    /// Number of tracked entries, expired ones included.
    pub async fn tracked_count(&self) -> usize {
        self.leases.lock().await.len()
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn acquire(&self, key: &IdempotencyKey, ttl: Duration) -> Result<LeaseAcquisition> {
        validate_ttl(ttl)?;
        let now = Instant::now();
        let mut leases = self.leases.lock().await;

        if let Some(held) = leases.get(key.as_str()) {
            if held.is_live(now) {
                return Ok(LeaseAcquisition::Busy {
                    remaining: Some(held.expires_at - now),
                });
            }
        }

        // Expired leases are otherwise only dropped on release.
        leases.retain(|_, held| held.is_live(now));

        let token = LeaseToken::new();
        leases.insert(
            key.as_str().to_string(),
            HeldLease {
                token,
                expires_at: now + ttl,
            },
        );
        Ok(LeaseAcquisition::Acquired(Lease {
            key: key.clone(),
            token,
            ttl,
        }))
    }

    async fn renew(&self, key: &IdempotencyKey, token: LeaseToken, ttl: Duration) -> Result<LeaseStatus> {
        validate_ttl(ttl)?;
        let now = Instant::now();
        let mut leases = self.leases.lock().await;

        match leases.get_mut(key.as_str()) {
            Some(held) if held.token == token && held.is_live(now) => {
                held.expires_at = now + ttl;
                Ok(LeaseStatus::Held)
            }
            _ => Ok(LeaseStatus::Lost),
        }
    }

    async fn release(&self, key: &IdempotencyKey, token: LeaseToken) -> Result<LeaseStatus> {
        let now = Instant::now();
        let mut leases = self.leases.lock().await;

        match leases.get(key.as_str()) {
            Some(held) if held.token == token => {
                let live = held.is_live(now);
                leases.remove(key.as_str());
                Ok(if live { LeaseStatus::Held } else { LeaseStatus::Lost })
            }
            _ => Ok(LeaseStatus::Lost),
        }
    }
}

/// Background renewal for executions that may outlive one lease TTL.
///
/// Renews every `ttl / 3`. Once a renewal reports the lease lost, renewal
/// stops and [`LeaseHeartbeat::is_lost`] turns true.
pub struct LeaseHeartbeat {
    stop: Option<oneshot::Sender<()>>,
    lost: watch::Receiver<bool>,
    handle: Option<JoinHandle<()>>,
}

impl LeaseHeartbeat {
    pub fn spawn<L>(store: Arc<L>, lease: Lease) -> Self
    where
        L: LeaseStore + ?Sized + 'static,
    {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let (lost_tx, lost_rx) = watch::channel(false);
        let period = (lease.ttl / 3).max(Duration::from_millis(10));

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = interval.tick() => {
                        match store.renew(&lease.key, lease.token, lease.ttl).await {
                            Ok(LeaseStatus::Held) => {
                                tracing::trace!(token = %lease.token, "Lease renewed");
                            }
                            Ok(LeaseStatus::Lost) => {
                                tracing::warn!(token = %lease.token, "Lease lost during execution");
                                let _ = lost_tx.send(true);
                                break;
                            }
                            Err(e) => {
                                tracing::warn!(token = %lease.token, "Lease renewal failed, retrying: {}", e);
                            }
                        }
                    }
                }
            }
        });

        Self {
            stop: Some(stop_tx),
            lost: lost_rx,
            handle: Some(handle),
        }
    }

    pub fn is_lost(&self) -> bool {
        *self.lost.borrow()
    }

    /// Resolves once the lease has been reported lost.
    pub async fn lost(&mut self) {
        while !*self.lost.borrow_and_update() {
            if self.lost.changed().await.is_err() {
                // Renewal task ended without losing the lease; never resolve.
                std::future::pending::<()>().await;
            }
        }
    }

    /// Stops renewing. Returns true if the lease was still held.
    pub async fn stop(mut self) -> bool {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        !self.is_lost()
    }
}

impl Drop for LeaseHeartbeat {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(raw: &str) -> IdempotencyKey {
        IdempotencyKey::new(raw).unwrap()
    }

    #[tokio::test]
    async fn test_acquire_is_exclusive() {
        let store = InMemoryLeaseStore::new();
        let k = key("order-42");

        let first = store.acquire(&k, Duration::from_secs(5)).await.unwrap();
        assert!(matches!(first, LeaseAcquisition::Acquired(_)));

        let second = store.acquire(&k, Duration::from_secs(5)).await.unwrap();
        match second {
            LeaseAcquisition::Busy { remaining } => {
                assert!(remaining.unwrap() <= Duration::from_secs(5));
            }
            other => panic!("expected busy, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_can_be_reacquired() {
        let store = InMemoryLeaseStore::new();
        let k = key("order-42");

        store.acquire(&k, Duration::from_secs(5)).await.unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;

        let again = store.acquire(&k, Duration::from_secs(5)).await.unwrap();
        assert!(matches!(again, LeaseAcquisition::Acquired(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_leases_are_pruned_on_acquire() {
        let store = InMemoryLeaseStore::new();
        for i in 0..10 {
            store.acquire(&key(&format!("abandoned-{}", i)), Duration::from_secs(1)).await.unwrap();
        }
        assert_eq!(store.tracked_count().await, 10);

        tokio::time::advance(Duration::from_secs(2)).await;
        store.acquire(&key("fresh"), Duration::from_secs(1)).await.unwrap();

        assert_eq!(store.tracked_count().await, 1);
        assert_eq!(store.live_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_holder_cannot_release_new_lease() {
        let store = InMemoryLeaseStore::new();
        let k = key("order-42");

        let LeaseAcquisition::Acquired(old) = store.acquire(&k, Duration::from_secs(1)).await.unwrap() else {
            panic!("expected lease");
        };
        tokio::time::advance(Duration::from_secs(2)).await;
        let LeaseAcquisition::Acquired(new) = store.acquire(&k, Duration::from_secs(1)).await.unwrap() else {
            panic!("expected lease");
        };

        assert_eq!(store.release(&k, old.token).await.unwrap(), LeaseStatus::Lost);
        assert_eq!(store.renew(&k, old.token, Duration::from_secs(1)).await.unwrap(), LeaseStatus::Lost);
        assert_eq!(store.release(&k, new.token).await.unwrap(), LeaseStatus::Held);
        assert_eq!(store.live_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_extends_expiry() {
        let store = InMemoryLeaseStore::new();
        let k = key("order-42");

        let LeaseAcquisition::Acquired(lease) = store.acquire(&k, Duration::from_secs(2)).await.unwrap() else {
            panic!("expected lease");
        };
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(store.renew(&k, lease.token, Duration::from_secs(2)).await.unwrap(), LeaseStatus::Held);
        tokio::time::advance(Duration::from_millis(1500)).await;

        assert!(matches!(
            store.acquire(&k, Duration::from_secs(2)).await.unwrap(),
            LeaseAcquisition::Busy { .. }
        ));
    }

    #[tokio::test]
    async fn test_zero_ttl_rejected() {
        let store = InMemoryLeaseStore::new();
        let result = store.acquire(&key("k"), Duration::ZERO).await;
        assert!(matches!(result, Err(AppError::InvalidInput(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_keeps_lease_alive() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let k = key("long-job");

        let LeaseAcquisition::Acquired(lease) = store.acquire(&k, Duration::from_secs(3)).await.unwrap() else {
            panic!("expected lease");
        };
        let heartbeat = LeaseHeartbeat::spawn(store.clone(), lease.clone());

        for _ in 0..10 {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        assert!(matches!(
            store.acquire(&k, Duration::from_secs(3)).await.unwrap(),
            LeaseAcquisition::Busy { .. }
        ));
        assert!(heartbeat.stop().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_reports_loss() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let k = key("long-job");

        let LeaseAcquisition::Acquired(lease) = store.acquire(&k, Duration::from_secs(3)).await.unwrap() else {
            panic!("expected lease");
        };
        let mut heartbeat = LeaseHeartbeat::spawn(store.clone(), lease.clone());

        store.release(&k, lease.token).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), heartbeat.lost())
            .await
            .expect("heartbeat should observe the loss");

        assert!(heartbeat.is_lost());
        assert!(!heartbeat.stop().await);
    }

    #[tokio::test]
    async fn test_mocked_lease_store_busy() {
        let mut mock = MockLeaseStore::new();
        mock.expect_acquire()
            .returning(|_, _| Ok(LeaseAcquisition::Busy { remaining: None }));

        let result = mock.acquire(&key("k"), Duration::from_secs(1)).await.unwrap();
        assert_eq!(result, LeaseAcquisition::Busy { remaining: None });
    }
}
