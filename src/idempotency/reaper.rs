use crate::error::{AppError, Result};
use crate::idempotency::storage::RecordStore;
use crate::observability::get_metrics;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

/// Periodically deletes terminal records older than the retention window.
///
/// Pending records are never purged, whatever their age.
pub struct RecordReaper<R: ?Sized> {
    records: Arc<R>,
    retention: Duration,
    interval: Duration,
}

impl<R> RecordReaper<R>
where
    R: RecordStore + ?Sized + 'static,
{
    pub fn new(records: Arc<R>, retention: Duration, interval: Duration) -> Self {
        Self {
            records,
            retention,
            interval,
        }
    }

    /// Runs the reaper once.
    pub async fn run_once(&self) -> Result<u64> {
        let retention = chrono::Duration::from_std(self.retention)
            .map_err(|e| AppError::InvalidInput(format!("retention out of range: {}", e)))?;
        let cutoff = Utc::now() - retention;

        let purged = self.records.purge_terminal_before(cutoff).await?;
        get_metrics().record_reaped(purged);
        Ok(purged)
    }

    /// Starts the reaper in a background task.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);

            loop {
                interval.tick().await;

                match self.run_once().await {
                    Ok(count) => {
                        if count > 0 {
                            tracing::info!("Purged {} expired idempotency records", count);
                        }
                    }
                    Err(e) => {
                        tracing::error!("Failed to purge expired idempotency records: {}", e);
                    }
                }
            }
        })
    }
}
