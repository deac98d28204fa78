use crate::cache::{CacheEntry, CacheError, SetOutcome, VersionedCache};
use crate::config::SyncConfig;
use crate::source::{LatestStateSource, SourceError};
use std::sync::Arc;
use telemetry_pipeline::SyncLiveness;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Failed to read latest state: {0}")]
    Source(#[from] SourceError),

    #[error("Failed to update cache: {0}")]
    Cache(#[from] CacheError),
}

/// Outcome of one synchronization pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub total: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub event_count: i64,
}

/// Periodically republishes latest device state into a versioned cache
pub struct Synchronizer<S, C> {
    source: S,
    cache: C,
    config: SyncConfig,
    liveness: Arc<SyncLiveness>,
}

impl<S: LatestStateSource, C: VersionedCache> Synchronizer<S, C> {
    pub fn new(source: S, cache: C, config: SyncConfig, liveness: Arc<SyncLiveness>) -> Self {
        Self {
            source,
            cache,
            config,
            liveness,
        }
    }

    /// Run one pass: publish the event count, then every latest-state row
    pub async fn run_once(&self) -> Result<SyncReport, SyncError> {
        let event_count = self.source.count_events().await?;
        self.cache.set_count(event_count).await?;

        let rows = self.source.fetch_latest().await?;
        let entries = rows
            .iter()
            .map(CacheEntry::from_row)
            .collect::<Result<Vec<_>, _>>()?;

        let outcomes = self.cache.set_many_if_newer(&entries).await?;

        let mut report = SyncReport {
            total: entries.len(),
            event_count,
            ..SyncReport::default()
        };
        for (entry, outcome) in entries.iter().zip(&outcomes) {
            match outcome {
                SetOutcome::Updated => report.updated += 1,
                SetOutcome::Skipped => report.skipped += 1,
                SetOutcome::Failed(reason) => {
                    report.failed += 1;
                    warn!(device_uuid = %entry.device_uuid, reason = %reason, "Failed to update cache entry");
                }
            }
        }

        metrics::counter!("telemetry.cache.updated").increment(report.updated as u64);
        metrics::counter!("telemetry.cache.skipped").increment(report.skipped as u64);
        metrics::counter!("telemetry.cache.failed").increment(report.failed as u64);

        debug!(
            updated = report.updated,
            total = report.total,
            event_count,
            "Cache synchronization pass completed"
        );

        Ok(report)
    }

    /// Run passes until `shutdown` is cancelled, pausing `poll_interval` after each
    #[instrument(skip_all, fields(poll_interval_ms = self.config.poll_interval_ms))]
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("Starting cache synchronizer");

        while !shutdown.is_cancelled() {
            match self.run_once().await {
                Ok(report) => {
                    self.liveness.heartbeat().beat();
                    if report.failed > 0 {
                        warn!(failed = report.failed, total = report.total, "Cache pass left entries behind");
                    }
                }
                Err(e) => warn!(error = %e, "Cache synchronization pass failed"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }

        info!("Cache synchronizer stopped");
    }
}
