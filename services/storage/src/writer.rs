use crate::store::{EventStore, StoreError, TelemetryEventRow};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Result of one attempt to make a batch durable
#[derive(Debug)]
pub enum WriteOutcome {
    /// Every row is committed
    Committed { rows: u64 },
    /// Nothing was written; the same rows may be tried again later
    Retryable(StoreError),
    /// Nothing was written and retrying cannot help
    Fatal(StoreError),
}

impl WriteOutcome {
    /// Sort a store error into retryable or fatal
    pub fn from_error(err: StoreError) -> Self {
        match err {
            StoreError::Database(sqlx::Error::Configuration(_)) | StoreError::Migration(_) => {
                WriteOutcome::Fatal(err)
            }
            other => WriteOutcome::Retryable(other),
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, WriteOutcome::Committed { .. })
    }
}

/// All-or-nothing sink for a batch of telemetry rows.
///
/// Implementations never retry on their own; the caller decides.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BatchWriter: Send + Sync {
    async fn write_batch(&self, rows: &[TelemetryEventRow]) -> WriteOutcome;
}

/// [`BatchWriter`] backed by one PostgreSQL transaction per batch
pub struct PgBatchWriter {
    store: Arc<EventStore>,
}

impl PgBatchWriter {
    pub fn new(store: Arc<EventStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl BatchWriter for PgBatchWriter {
    async fn write_batch(&self, rows: &[TelemetryEventRow]) -> WriteOutcome {
        if rows.is_empty() {
            return WriteOutcome::Committed { rows: 0 };
        }

        match self.store.insert_events(rows).await {
            Ok(inserted) => {
                debug!(rows = inserted, "Batch written");
                WriteOutcome::Committed { rows: inserted }
            }
            Err(e) => {
                let outcome = WriteOutcome::from_error(e);
                match &outcome {
                    WriteOutcome::Fatal(e) => error!(error = %e, rows = rows.len(), "Batch write failed permanently"),
                    WriteOutcome::Retryable(e) => warn!(error = %e, rows = rows.len(), "Batch write failed"),
                    WriteOutcome::Committed { .. } => {}
                }
                outcome
            }
        }
    }
}
