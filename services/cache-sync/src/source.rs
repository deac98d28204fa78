use crate::config::DatabaseConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// One `telemetry_latest` row
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct LatestStateRow {
    pub device_uuid: Uuid,
    pub alias: Option<String>,
    pub x_coord: f64,
    pub y_coord: f64,
    pub device_time: Option<DateTime<Utc>>,
    pub system_time_utc: DateTime<Utc>,
}

impl LatestStateRow {
    /// Device clock when reported, else edge clock
    pub fn event_time(&self) -> DateTime<Utc> {
        self.device_time.unwrap_or(self.system_time_utc)
    }

    /// Cache version: event time in milliseconds since the Unix epoch
    pub fn version(&self) -> i64 {
        self.event_time().timestamp_millis()
    }
}

/// Read side of the durable store
#[async_trait]
pub trait LatestStateSource: Send + Sync {
    /// Total number of durable telemetry events
    async fn count_events(&self) -> Result<i64, SourceError>;

    /// Every latest-state row
    async fn fetch_latest(&self) -> Result<Vec<LatestStateRow>, SourceError>;
}

pub struct PgLatestState {
    pool: PgPool,
}

impl PgLatestState {
    pub async fn new(config: &DatabaseConfig) -> Result<Self, SourceError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout())
            .connect(&config.url)
            .await?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }
}

#[async_trait]
impl LatestStateSource for PgLatestState {
    async fn count_events(&self) -> Result<i64, SourceError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM telemetry_event")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn fetch_latest(&self) -> Result<Vec<LatestStateRow>, SourceError> {
        let rows = sqlx::query_as::<_, LatestStateRow>(
            r#"
            SELECT device_uuid, alias, x_coord, y_coord, device_time, system_time_utc
            FROM telemetry_latest
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
