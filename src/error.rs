use thiserror::Error;

/// Errors surfaced by the idempotency engine.
///
/// Contention (`AlreadyExists`, `Busy`, fingerprint conflicts) is never an
/// error here; those are decisions returned by the coordinator.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Corrupt idempotency record for key '{key}': {reason}")]
    CorruptRecord { key: String, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn corrupt(key: impl Into<String>, reason: impl Into<String>) -> Self {
        AppError::CorruptRecord {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Transient infrastructure faults the caller should retry with backoff.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            AppError::StoreUnavailable(_) | AppError::Database(_) | AppError::Redis(_)
        )
    }

    /// Short machine-readable code used in API error bodies and metric labels.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::InvalidInput(_) => "INVALID_INPUT",
            AppError::StoreUnavailable(_) | AppError::Database(_) | AppError::Redis(_) => {
                "STORE_UNAVAILABLE"
            }
            AppError::CorruptRecord { .. } => "CORRUPT_RECORD",
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
