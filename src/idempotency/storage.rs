use crate::error::{AppError, Result};
use crate::idempotency::key::IdempotencyKey;
use crate::idempotency::lease::LeaseToken;
use crate::idempotency::record::{
    IdempotencyRecord, NewRecord, OutcomeState, RecordRow, RecordState, StoredResponse,
};
use crate::observability::{get_metrics, LatencyTimer};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Result of a compare-and-insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(IdempotencyRecord),
    AlreadyExists,
}

/// Result of a conditional finalize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    Completed(IdempotencyRecord),
    /// The record was no longer pending under the caller's lease token.
    Conflict,
}

/// Durable, strongly consistent persistence of idempotency records.
///
/// Writes are conditional: inserts never overwrite, and updates only apply
/// to records that are still pending under the expected lease token.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_record(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>>;

    async fn create_pending(&self, record: &NewRecord) -> Result<CreateOutcome>;

    /// Stamps the winning lease token onto a pending record.
    async fn assign_lease(&self, key: &IdempotencyKey, token: LeaseToken) -> Result<bool>;

    /// Stores a recovery point for a pending record owned by `token`.
    async fn save_checkpoint(
        &self,
        key: &IdempotencyKey,
        token: LeaseToken,
        recovery_point: &str,
    ) -> Result<bool>;

    async fn complete_record(
        &self,
        key: &IdempotencyKey,
        token: LeaseToken,
        outcome: OutcomeState,
        response: &StoredResponse,
    ) -> Result<CompletionOutcome>;

    /// Deletes terminal records completed before `cutoff`. Pending records
    /// are never touched.
    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

const RECORD_COLUMNS: &str = "idempotency_key, fingerprint, state, response_code, response_body, recovery_point, request_method, request_path, lease_token, created_at, updated_at, completed_at";

/// PostgreSQL-based record store.
pub struct PostgresRecordStore {
    pool: PgPool,
}

impl PostgresRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn observe<T>(query_type: &str, timer: &LatencyTimer, result: &Result<T>) {
        get_metrics().record_db_query(query_type, timer.elapsed_ms(), result.is_ok());
    }

    /// Counts records in a given state.
    pub async fn count_by_state(&self, state: RecordState) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM idempotency_records WHERE state = $1
            "#,
        )
        .bind(state.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row.0)
    }
}

#[async_trait]
impl RecordStore for PostgresRecordStore {
    async fn get_record(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>> {
        let timer = LatencyTimer::new();
        let result = sqlx::query_as::<_, RecordRow>(&format!(
            "SELECT {} FROM idempotency_records WHERE idempotency_key = $1",
            RECORD_COLUMNS
        ))
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database);
        Self::observe("record_get", &timer, &result);

        result?.map(IdempotencyRecord::try_from).transpose()
    }

    async fn create_pending(&self, record: &NewRecord) -> Result<CreateOutcome> {
        let timer = LatencyTimer::new();
        let result = sqlx::query_as::<_, RecordRow>(&format!(
            r#"
            INSERT INTO idempotency_records (idempotency_key, fingerprint, state, request_method, request_path, created_at, updated_at)
            VALUES ($1, $2, 'pending', $3, $4, NOW(), NOW())
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING {}
            "#,
            RECORD_COLUMNS
        ))
        .bind(record.key.as_str())
        .bind(record.fingerprint.to_hex())
        .bind(&record.audit.method)
        .bind(&record.audit.path)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database);
        Self::observe("record_create_pending", &timer, &result);

        match result? {
            Some(row) => Ok(CreateOutcome::Created(IdempotencyRecord::try_from(row)?)),
            None => Ok(CreateOutcome::AlreadyExists),
        }
    }

    async fn assign_lease(&self, key: &IdempotencyKey, token: LeaseToken) -> Result<bool> {
        let timer = LatencyTimer::new();
        let result = sqlx::query(
            r#"
            UPDATE idempotency_records
            SET lease_token = $2, updated_at = NOW()
            WHERE idempotency_key = $1 AND state = 'pending'
            "#,
        )
        .bind(key.as_str())
        .bind(token.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(AppError::Database);
        Self::observe("record_assign_lease", &timer, &result);

        Ok(result?.rows_affected() > 0)
    }

    async fn save_checkpoint(
        &self,
        key: &IdempotencyKey,
        token: LeaseToken,
        recovery_point: &str,
    ) -> Result<bool> {
        let timer = LatencyTimer::new();
        let result = sqlx::query(
            r#"
            UPDATE idempotency_records
            SET recovery_point = $3, updated_at = NOW()
            WHERE idempotency_key = $1 AND state = 'pending' AND lease_token = $2
            "#,
        )
        .bind(key.as_str())
        .bind(token.as_uuid())
        .bind(recovery_point)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database);
        Self::observe("record_save_checkpoint", &timer, &result);

        Ok(result?.rows_affected() > 0)
    }

    async fn complete_record(
        &self,
        key: &IdempotencyKey,
        token: LeaseToken,
        outcome: OutcomeState,
        response: &StoredResponse,
    ) -> Result<CompletionOutcome> {
        let timer = LatencyTimer::new();
        let result = sqlx::query_as::<_, RecordRow>(&format!(
            r#"
            UPDATE idempotency_records
            SET state = $3, response_code = $4, response_body = $5, completed_at = NOW(), updated_at = NOW()
            WHERE idempotency_key = $1 AND state = 'pending' AND lease_token = $2
            RETURNING {}
            "#,
            RECORD_COLUMNS
        ))
        .bind(key.as_str())
        .bind(token.as_uuid())
        .bind(RecordState::from(outcome).as_str())
        .bind(i32::from(response.status_code))
        .bind(&response.body)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database);
        Self::observe("record_complete", &timer, &result);

        match result? {
            Some(row) => Ok(CompletionOutcome::Completed(IdempotencyRecord::try_from(row)?)),
            None => Ok(CompletionOutcome::Conflict),
        }
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let timer = LatencyTimer::new();
        let result = sqlx::query(
            r#"
            DELETE FROM idempotency_records
            WHERE state IN ('completed', 'failed') AND completed_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database);
        Self::observe("record_purge", &timer, &result);

        Ok(result?.rows_affected())
    }
}

/// Process-local record store holding rows exactly as they would be
/// persisted, so reads go through the same validation as PostgreSQL rows.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    rows: Mutex<HashMap<String, RecordRow>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a raw row without validation.
    pub async fn insert_raw(&self, row: RecordRow) {
        self.rows.lock().await.insert(row.idempotency_key.clone(), row);
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }
}

fn owned_pending(row: &RecordRow, token: LeaseToken) -> bool {
    row.state == RecordState::Pending.as_str() && row.lease_token == Some(token.as_uuid())
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn get_record(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>> {
        let row = self.rows.lock().await.get(key.as_str()).cloned();
        row.map(IdempotencyRecord::try_from).transpose()
    }

    async fn create_pending(&self, record: &NewRecord) -> Result<CreateOutcome> {
        let mut rows = self.rows.lock().await;
        if rows.contains_key(record.key.as_str()) {
            return Ok(CreateOutcome::AlreadyExists);
        }

        let created = IdempotencyRecord::pending(record.clone(), Utc::now());
        rows.insert(record.key.as_str().to_string(), RecordRow::from(&created));
        Ok(CreateOutcome::Created(created))
    }

    async fn assign_lease(&self, key: &IdempotencyKey, token: LeaseToken) -> Result<bool> {
        let mut rows = self.rows.lock().await;
        match rows.get_mut(key.as_str()) {
            Some(row) if row.state == RecordState::Pending.as_str() => {
                row.lease_token = Some(token.as_uuid());
                row.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn save_checkpoint(
        &self,
        key: &IdempotencyKey,
        token: LeaseToken,
        recovery_point: &str,
    ) -> Result<bool> {
        let mut rows = self.rows.lock().await;
        match rows.get_mut(key.as_str()) {
            Some(row) if owned_pending(row, token) => {
                row.recovery_point = Some(recovery_point.to_string());
                row.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete_record(
        &self,
        key: &IdempotencyKey,
        token: LeaseToken,
        outcome: OutcomeState,
        response: &StoredResponse,
    ) -> Result<CompletionOutcome> {
        let mut rows = self.rows.lock().await;
        match rows.get_mut(key.as_str()) {
            Some(row) if owned_pending(row, token) => {
                let now = Utc::now();
                row.state = RecordState::from(outcome).as_str().to_string();
                row.response_code = Some(i32::from(response.status_code));
                row.response_body = Some(response.body.clone());
                row.completed_at = Some(now);
                row.updated_at = now;
                Ok(CompletionOutcome::Completed(IdempotencyRecord::try_from(row.clone())?))
            }
            _ => Ok(CompletionOutcome::Conflict),
        }
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut rows = self.rows.lock().await;
        let before = rows.len();
        rows.retain(|_, row| {
            let terminal = row.state != RecordState::Pending.as_str();
            !(terminal && row.completed_at.map_or(false, |at| at < cutoff))
        });
        Ok((before - rows.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::fingerprint::{FingerprintEngine, NormalizedRequest};
    use crate::idempotency::record::RequestAudit;

    fn new_record(key: &str, body: &str) -> NewRecord {
        NewRecord {
            key: IdempotencyKey::new(key).unwrap(),
            fingerprint: FingerprintEngine::default()
                .fingerprint(&NormalizedRequest::new("POST", "/orders", body.as_bytes().to_vec()))
                .unwrap(),
            audit: RequestAudit {
                method: Some("POST".to_string()),
                path: Some("/orders".to_string()),
            },
        }
    }

    #[tokio::test]
    async fn test_create_pending_is_compare_and_insert() {
        let store = InMemoryRecordStore::new();
        let record = new_record("order-1", "{}");

        let first = store.create_pending(&record).await.unwrap();
        assert!(matches!(first, CreateOutcome::Created(ref r) if r.state == RecordState::Pending));

        let second = store.create_pending(&new_record("order-1", r#"{"x":1}"#)).await.unwrap();
        assert_eq!(second, CreateOutcome::AlreadyExists);

        let stored = store.get_record(&record.key).await.unwrap().unwrap();
        assert_eq!(stored.fingerprint, record.fingerprint);
    }

    #[tokio::test]
    async fn test_complete_requires_matching_token() {
        let store = InMemoryRecordStore::new();
        let record = new_record("order-2", "{}");
        store.create_pending(&record).await.unwrap();

        let owner = LeaseToken::new();
        assert!(store.assign_lease(&record.key, owner).await.unwrap());

        let response = StoredResponse::new(200, b"ok".to_vec());
        let stale = store
            .complete_record(&record.key, LeaseToken::new(), OutcomeState::Completed, &response)
            .await
            .unwrap();
        assert_eq!(stale, CompletionOutcome::Conflict);

        let done = store
            .complete_record(&record.key, owner, OutcomeState::Completed, &response)
            .await
            .unwrap();
        assert!(matches!(done, CompletionOutcome::Completed(ref r) if r.completed_at.is_some()));
    }

    #[tokio::test]
    async fn test_terminal_record_is_final() {
        let store = InMemoryRecordStore::new();
        let record = new_record("order-3", "{}");
        store.create_pending(&record).await.unwrap();
        let owner = LeaseToken::new();
        store.assign_lease(&record.key, owner).await.unwrap();

        let first = StoredResponse::new(201, b"first".to_vec());
        store
            .complete_record(&record.key, owner, OutcomeState::Completed, &first)
            .await
            .unwrap();

        let again = store
            .complete_record(&record.key, owner, OutcomeState::Failed, &StoredResponse::internal_error())
            .await
            .unwrap();
        assert_eq!(again, CompletionOutcome::Conflict);
        assert!(!store.assign_lease(&record.key, LeaseToken::new()).await.unwrap());
        assert!(!store.save_checkpoint(&record.key, owner, "late").await.unwrap());

        let stored = store.get_record(&record.key).await.unwrap().unwrap();
        assert_eq!(stored.response, Some(first));
    }

    #[tokio::test]
    async fn test_checkpoint_guarded_by_token() {
        let store = InMemoryRecordStore::new();
        let record = new_record("order-4", "{}");
        store.create_pending(&record).await.unwrap();
        let owner = LeaseToken::new();
        store.assign_lease(&record.key, owner).await.unwrap();

        assert!(!store.save_checkpoint(&record.key, LeaseToken::new(), "FILE_CREATED").await.unwrap());
        assert!(store.save_checkpoint(&record.key, owner, "FILE_CREATED").await.unwrap());

        let stored = store.get_record(&record.key).await.unwrap().unwrap();
        assert_eq!(stored.recovery_point.as_deref(), Some("FILE_CREATED"));
    }

    #[tokio::test]
    async fn test_corrupt_row_is_scoped_to_its_key() {
        let store = InMemoryRecordStore::new();
        let healthy = new_record("healthy", "{}");
        store.create_pending(&healthy).await.unwrap();

        let mut bad = RecordRow::from(&IdempotencyRecord::pending(new_record("broken", "{}"), Utc::now()));
        bad.state = "exploded".to_string();
        store.insert_raw(bad).await;

        let err = store
            .get_record(&IdempotencyKey::new("broken").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::CorruptRecord { .. }));
        assert!(store.get_record(&healthy.key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_purge_only_removes_old_terminal_records() {
        let store = InMemoryRecordStore::new();
        let pending = new_record("pending", "{}");
        let done = new_record("done", "{}");
        store.create_pending(&pending).await.unwrap();
        store.create_pending(&done).await.unwrap();

        let owner = LeaseToken::new();
        store.assign_lease(&done.key, owner).await.unwrap();
        store
            .complete_record(&done.key, owner, OutcomeState::Completed, &StoredResponse::new(200, Vec::new()))
            .await
            .unwrap();

        let purged = store
            .purge_terminal_before(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert_eq!(store.len().await, 1);
        assert!(store.get_record(&pending.key).await.unwrap().is_some());
    }
}
