//! Versioned latest-state cache in Redis.
//!
//! Each device owns a key pair: the payload key and `<payload key>:version`.
//! Both are only ever written by [`SET_IF_NEWER`], which runs server-side and
//! therefore atomically with respect to every other client. A write carrying a
//! version that is not strictly greater than the stored one is a no-op, so
//! overlapping or reordered synchronizer passes cannot move a device backwards.

use crate::config::RedisConfig;
use crate::source::LatestStateRow;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, ErrorKind, RedisError, RedisResult, Script};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// KEYS[1] payload, KEYS[2] version; ARGV[1] incoming version, ARGV[2] payload.
/// Returns 1 when the pair was overwritten, 0 otherwise.
pub const SET_IF_NEWER: &str = r#"
local incoming = tonumber(ARGV[1])
local current = tonumber(redis.call('GET', KEYS[2]) or '0')

if incoming > current then
  redis.call('SET', KEYS[1], ARGV[2])
  redis.call('SET', KEYS[2], ARGV[1])
  return 1
end
return 0
"#;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Failed to encode cache payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// What a set-if-newer did to one key pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetOutcome {
    Updated,
    /// The cache already held an equal or newer version
    Skipped,
    Failed(String),
}

impl SetOutcome {
    fn from_reply(reply: i64) -> Self {
        match reply {
            1 => SetOutcome::Updated,
            0 => SetOutcome::Skipped,
            other => SetOutcome::Failed(format!("unexpected script result {}", other)),
        }
    }
}

/// A versioned payload for one device
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub device_uuid: Uuid,
    pub version: i64,
    /// Compact JSON
    pub payload: String,
}

impl CacheEntry {
    pub fn from_row(row: &LatestStateRow) -> Result<Self, CacheError> {
        Ok(Self {
            device_uuid: row.device_uuid,
            version: row.version(),
            payload: serde_json::to_string(row)?,
        })
    }
}

/// Key layout of the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKeys {
    latest_prefix: String,
    count_key: String,
}

impl CacheKeys {
    pub fn new(latest_prefix: impl Into<String>, count_key: impl Into<String>) -> Self {
        Self {
            latest_prefix: latest_prefix.into(),
            count_key: count_key.into(),
        }
    }

    pub fn data_key(&self, device_uuid: &Uuid) -> String {
        format!("{}:{}", self.latest_prefix, device_uuid)
    }

    pub fn version_key(&self, device_uuid: &Uuid) -> String {
        format!("{}:version", self.data_key(device_uuid))
    }

    pub fn count_key(&self) -> &str {
        &self.count_key
    }
}

impl Default for CacheKeys {
    fn default() -> Self {
        Self::new("telemetry:latest", "telemetry:count")
    }
}

impl From<&RedisConfig> for CacheKeys {
    fn from(config: &RedisConfig) -> Self {
        Self::new(config.latest_prefix.clone(), config.count_key.clone())
    }
}

/// A cache whose per-device entries only ever move forward in version
#[async_trait]
pub trait VersionedCache: Send + Sync {
    /// Atomically store `entry` if its version is greater than the stored one
    async fn set_if_newer(&self, entry: &CacheEntry) -> Result<SetOutcome, CacheError>;

    /// Apply [`set_if_newer`](Self::set_if_newer) to every entry, one outcome per entry.
    ///
    /// When a batched implementation has to fall back to per-entry writes,
    /// entries the batch already applied may be reported as `Skipped`.
    async fn set_many_if_newer(
        &self,
        entries: &[CacheEntry],
    ) -> Result<Vec<SetOutcome>, CacheError> {
        let mut outcomes = Vec::with_capacity(entries.len());
        for entry in entries {
            outcomes.push(self.set_if_newer(entry).await?);
        }
        Ok(outcomes)
    }

    /// Overwrite the total event count
    async fn set_count(&self, count: i64) -> Result<(), CacheError>;
}

/// [`VersionedCache`] on Redis, with automatic reconnection
pub struct RedisCache {
    connection: ConnectionManager,
    script: Script,
    keys: CacheKeys,
}

impl RedisCache {
    pub async fn connect(config: &RedisConfig) -> Result<Self, CacheError> {
        let client = redis::Client::open(config.url.as_str())?;
        let connection = client.get_connection_manager().await?;

        info!(latest_prefix = %config.latest_prefix, "Connected to Redis");

        Ok(Self {
            connection,
            script: Script::new(SET_IF_NEWER),
            keys: CacheKeys::from(config),
        })
    }

    async fn load_script(&self) -> Result<(), CacheError> {
        let mut connection = self.connection.clone();
        let sha: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(SET_IF_NEWER)
            .query_async(&mut connection)
            .await?;
        debug!(sha = %sha, "Loaded set-if-newer script");
        Ok(())
    }

    /// One EVALSHA per entry, sent as a single non-transactional pipeline
    async fn pipelined(&self, entries: &[CacheEntry]) -> RedisResult<Vec<i64>> {
        let mut pipe = redis::pipe();
        for entry in entries {
            pipe.cmd("EVALSHA")
                .arg(self.script.get_hash())
                .arg(2)
                .arg(self.keys.data_key(&entry.device_uuid))
                .arg(self.keys.version_key(&entry.device_uuid))
                .arg(entry.version)
                .arg(&entry.payload);
        }

        let mut connection = self.connection.clone();
        pipe.query_async(&mut connection).await
    }

    /// Isolate the keys that make a pipeline fail
    async fn one_by_one(&self, entries: &[CacheEntry]) -> Vec<SetOutcome> {
        let mut outcomes = Vec::with_capacity(entries.len());
        for entry in entries {
            let outcome = match self.set_if_newer(entry).await {
                Ok(outcome) => outcome,
                Err(e) => SetOutcome::Failed(e.to_string()),
            };
            outcomes.push(outcome);
        }
        outcomes
    }
}

fn is_connection_error(err: &RedisError) -> bool {
    err.is_io_error() || err.is_connection_dropped() || err.is_timeout()
}

#[async_trait]
impl VersionedCache for RedisCache {
    async fn set_if_newer(&self, entry: &CacheEntry) -> Result<SetOutcome, CacheError> {
        let mut connection = self.connection.clone();
        let reply: i64 = self
            .script
            .key(self.keys.data_key(&entry.device_uuid))
            .key(self.keys.version_key(&entry.device_uuid))
            .arg(entry.version)
            .arg(&entry.payload)
            .invoke_async(&mut connection)
            .await?;
        Ok(SetOutcome::from_reply(reply))
    }

    async fn set_many_if_newer(
        &self,
        entries: &[CacheEntry],
    ) -> Result<Vec<SetOutcome>, CacheError> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let replies = match self.pipelined(entries).await {
            Err(e) if e.kind() == ErrorKind::NoScriptError => {
                self.load_script().await?;
                self.pipelined(entries).await
            }
            other => other,
        };

        match replies {
            Ok(replies) => Ok(replies.into_iter().map(SetOutcome::from_reply).collect()),
            Err(e) if is_connection_error(&e) => Err(e.into()),
            Err(e) => {
                warn!(error = %e, entries = entries.len(), "Pipelined set-if-newer failed; retrying keys one by one");
                let outcomes = self.one_by_one(entries).await;

                // The failed pipeline still ran every other script, so entries it
                // already applied come back as skipped here.
                let skipped = outcomes.iter().filter(|o| **o == SetOutcome::Skipped).count();
                if skipped > 0 {
                    warn!(
                        skipped,
                        "Entries applied by the failed pipeline are reported as skipped; updated count for this pass is a lower bound"
                    );
                }
                Ok(outcomes)
            }
        }
    }

    async fn set_count(&self, count: i64) -> Result<(), CacheError> {
        let mut connection = self.connection.clone();
        connection
            .set::<_, _, ()>(self.keys.count_key(), count)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_key_layout() {
        let keys = CacheKeys::default();
        let device = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();

        assert_eq!(
            keys.data_key(&device),
            "telemetry:latest:550e8400-e29b-41d4-a716-446655440000"
        );
        assert_eq!(
            keys.version_key(&device),
            "telemetry:latest:550e8400-e29b-41d4-a716-446655440000:version"
        );
        assert_eq!(keys.count_key(), "telemetry:count");

        let custom = CacheKeys::new("fleet", "fleet:count");
        assert_eq!(custom.version_key(&device), format!("fleet:{}:version", device));
    }

    #[test]
    fn test_entry_payload_is_compact_row_json() {
        let row = LatestStateRow {
            device_uuid: Uuid::new_v4(),
            alias: None,
            x_coord: 10.5,
            y_coord: -2.0,
            device_time: None,
            system_time_utc: Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap(),
        };

        let entry = CacheEntry::from_row(&row).unwrap();
        assert_eq!(entry.version, row.system_time_utc.timestamp_millis());
        assert!(!entry.payload.contains(' '));

        let payload: serde_json::Value = serde_json::from_str(&entry.payload).unwrap();
        assert_eq!(payload["device_uuid"], row.device_uuid.to_string());
        assert_eq!(payload["alias"], serde_json::Value::Null);
        assert_eq!(payload["x_coord"], 10.5);
        assert_eq!(payload["device_time"], serde_json::Value::Null);
        assert_eq!(payload["system_time_utc"], "2024-01-15T10:30:00Z");
    }

    #[test]
    fn test_script_replies_map_to_outcomes() {
        assert_eq!(SetOutcome::from_reply(1), SetOutcome::Updated);
        assert_eq!(SetOutcome::from_reply(0), SetOutcome::Skipped);
        assert!(matches!(SetOutcome::from_reply(7), SetOutcome::Failed(_)));
    }
}
