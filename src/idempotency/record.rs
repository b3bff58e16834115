use crate::error::AppError;
use crate::idempotency::fingerprint::Fingerprint;
use crate::idempotency::key::IdempotencyKey;
use crate::idempotency::lease::LeaseToken;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle state of an idempotency record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordState {
    Pending,
    Completed,
    Failed,
}

impl RecordState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordState::Pending => "pending",
            RecordState::Completed => "completed",
            RecordState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RecordState::Pending)
    }
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RecordState::Pending),
            "completed" => Ok(RecordState::Completed),
            "failed" => Ok(RecordState::Failed),
            other => Err(format!("unknown state '{}'", other)),
        }
    }
}

/// Terminal state written by the publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeState {
    Completed,
    Failed,
}

impl From<OutcomeState> for RecordState {
    fn from(state: OutcomeState) -> Self {
        match state {
            OutcomeState::Completed => RecordState::Completed,
            OutcomeState::Failed => RecordState::Failed,
        }
    }
}

/// Stored outcome of an execution, replayed byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
    pub status_code: u16,
    pub body: Vec<u8>,
}

impl StoredResponse {
    pub fn new(status_code: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status_code,
            body: body.into(),
        }
    }

    pub fn json<T: Serialize>(status_code: u16, value: &T) -> crate::error::Result<Self> {
        let body = serde_json::to_vec(value)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to serialize response: {}", e)))?;
        Ok(Self { status_code, body })
    }

    /// Response published when the business handler errors or panics.
    pub fn internal_error() -> Self {
        Self::new(500, br#"{"error":"internal_error"}"#.to_vec())
    }
}

/// A terminal outcome as replayed to later callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredOutcome {
    pub state: OutcomeState,
    pub response: StoredResponse,
}

/// Request attributes kept for auditing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestAudit {
    pub method: Option<String>,
    pub path: Option<String>,
}

/// Values needed to create a pending record.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub key: IdempotencyKey,
    pub fingerprint: Fingerprint,
    pub audit: RequestAudit,
}

/// One record per idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: IdempotencyKey,
    pub fingerprint: Fingerprint,
    pub state: RecordState,
    pub response: Option<StoredResponse>,
    pub recovery_point: Option<String>,
    pub lease_token: Option<LeaseToken>,
    pub audit: RequestAudit,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl IdempotencyRecord {
    pub fn pending(new: NewRecord, now: DateTime<Utc>) -> Self {
        Self {
            key: new.key,
            fingerprint: new.fingerprint,
            state: RecordState::Pending,
            response: None,
            recovery_point: None,
            lease_token: None,
            audit: new.audit,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// The replayable outcome, if the record is terminal.
    pub fn outcome(&self) -> Option<StoredOutcome> {
        let state = match self.state {
            RecordState::Pending => return None,
            RecordState::Completed => OutcomeState::Completed,
            RecordState::Failed => OutcomeState::Failed,
        };
        self.response.clone().map(|response| StoredOutcome { state, response })
    }
}

/// Raw row as persisted; validated into an [`IdempotencyRecord`].
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RecordRow {
    pub idempotency_key: String,
    pub fingerprint: String,
    pub state: String,
    pub response_code: Option<i32>,
    pub response_body: Option<Vec<u8>>,
    pub recovery_point: Option<String>,
    pub request_method: Option<String>,
    pub request_path: Option<String>,
    pub lease_token: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<RecordRow> for IdempotencyRecord {
    type Error = AppError;

    fn try_from(row: RecordRow) -> Result<Self, Self::Error> {
        let key_text = row.idempotency_key.clone();
        let corrupt = |reason: String| AppError::corrupt(key_text.clone(), reason);

        let key = IdempotencyKey::parse_stored(&row.idempotency_key).map_err(|e| corrupt(e.to_string()))?;
        let fingerprint = row.fingerprint.parse::<Fingerprint>().map_err(corrupt)?;
        let state = row.state.parse::<RecordState>().map_err(corrupt)?;

        let response = match (row.response_code, row.response_body) {
            (Some(code), Some(body)) => {
                let status_code = u16::try_from(code)
                    .ok()
                    .filter(|c| (100..=599).contains(c))
                    .ok_or_else(|| corrupt(format!("invalid response code {}", code)))?;
                Some(StoredResponse { status_code, body })
            }
            (None, None) => None,
            _ => return Err(corrupt("response code and body must be set together".to_string())),
        };

        if state.is_terminal() && response.is_none() {
            return Err(corrupt(format!("{} record has no response", state)));
        }
        if state == RecordState::Pending && response.is_some() {
            return Err(corrupt("pending record carries a response".to_string()));
        }

        Ok(Self {
            key,
            fingerprint,
            state,
            response,
            recovery_point: row.recovery_point,
            lease_token: row.lease_token.map(LeaseToken::from_uuid),
            audit: RequestAudit {
                method: row.request_method,
                path: row.request_path,
            },
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

impl From<&IdempotencyRecord> for RecordRow {
    fn from(record: &IdempotencyRecord) -> Self {
        Self {
            idempotency_key: record.key.as_str().to_string(),
            fingerprint: record.fingerprint.to_hex(),
            state: record.state.as_str().to_string(),
            response_code: record.response.as_ref().map(|r| i32::from(r.status_code)),
            response_body: record.response.as_ref().map(|r| r.body.clone()),
            recovery_point: record.recovery_point.clone(),
            request_method: record.audit.method.clone(),
            request_path: record.audit.path.clone(),
            lease_token: record.lease_token.map(|t| t.as_uuid()),
            created_at: record.created_at,
            updated_at: record.updated_at,
            completed_at: record.completed_at,
        }
    }
}
