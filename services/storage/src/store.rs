use crate::config::DatabaseConfig;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder, Transaction};
use telemetry_pipeline::TelemetryRecord;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Columns bound per event row
const COLUMNS_PER_ROW: usize = 5;

/// PostgreSQL caps a statement at 65535 bind parameters
const ROWS_PER_STATEMENT: usize = u16::MAX as usize / COLUMNS_PER_ROW;

/// Errors raised by the event store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// One `telemetry_event` row, ready to insert
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryEventRow {
    pub device_uuid: Uuid,
    pub x_coord: f64,
    pub y_coord: f64,
    /// Effective event time: device clock if reported, else edge clock
    pub device_time: DateTime<Utc>,
    pub system_time_utc: DateTime<Utc>,
}

impl From<&TelemetryRecord> for TelemetryEventRow {
    fn from(record: &TelemetryRecord) -> Self {
        Self {
            device_uuid: record.device_uuid,
            x_coord: record.x_coord,
            y_coord: record.y_coord,
            device_time: record.event_time(),
            system_time_utc: record.system_time_utc,
        }
    }
}

/// Append-only telemetry event store in PostgreSQL
pub struct EventStore {
    pool: PgPool,
}

impl EventStore {
    /// Create a new event store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations").run(&self.pool).await?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Insert all rows in a single transaction.
    ///
    /// Either every row is committed or, on any error, the transaction is
    /// rolled back and nothing is visible.
    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    pub async fn insert_events(&self, rows: &[TelemetryEventRow]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;

        match Self::insert_chunks(&mut tx, rows).await {
            Ok(inserted) => {
                tx.commit().await?;
                debug!(inserted, "Telemetry events committed");
                Ok(inserted)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "Rollback failed; connection will be discarded");
                }
                Err(e)
            }
        }
    }

    async fn insert_chunks(
        tx: &mut Transaction<'_, Postgres>,
        rows: &[TelemetryEventRow],
    ) -> Result<u64, StoreError> {
        let mut inserted = 0;

        for chunk in rows.chunks(ROWS_PER_STATEMENT) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO telemetry_event (device_uuid, x_coord, y_coord, device_time, system_time_utc) ",
            );
            builder.push_values(chunk, |mut b, row| {
                b.push_bind(row.device_uuid)
                    .push_bind(row.x_coord)
                    .push_bind(row.y_coord)
                    .push_bind(row.device_time)
                    .push_bind(row.system_time_utc);
            });

            inserted += builder.build().execute(&mut **tx).await?.rows_affected();
        }

        Ok(inserted)
    }
}
