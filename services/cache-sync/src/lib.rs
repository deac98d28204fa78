//! Telemetry Cache Synchronizer
//!
//! Periodically reads every device's latest state and the total event count
//! from PostgreSQL and republishes them into Redis. Per-device entries are
//! written through a server-side set-if-newer script, so the cache never
//! moves backwards even when passes overlap or run out of order.

pub mod cache;
pub mod config;
pub mod source;
pub mod synchronizer;

pub use cache::{CacheEntry, CacheError, CacheKeys, RedisCache, SetOutcome, VersionedCache};
pub use config::Config;
pub use source::{LatestStateRow, LatestStateSource, PgLatestState, SourceError};
pub use synchronizer::{SyncError, SyncReport, Synchronizer};
