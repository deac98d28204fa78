//! Telemetry Pipeline - shared plumbing for the IoT telemetry ingestion services
//!
//! This library provides the pieces shared by the storage consumer and the
//! cache synchronizer:
//!
//! - Kafka connection configuration with SSL/SASL support
//! - The validated telemetry record and its wire-format checks
//! - The [`TelemetryLog`] abstraction over a partitioned, offset-addressable
//!   log and its Kafka implementation
//! - Liveness tracking and the `/health` + `/ready` endpoints
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use telemetry_pipeline::{KafkaConfig, KafkaLog, TelemetryLog, TelemetryRecord};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let log = KafkaLog::connect(KafkaConfig::new("localhost:9092"))?;
//!
//!     for message in log.fetch_batch(Duration::from_millis(200), 500).await? {
//!         let record = TelemetryRecord::from_slice(&message.payload)?;
//!         println!("{} at {}", record.device_uuid, record.event_time());
//!     }
//!
//!     log.close().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod consumer;
pub mod health;
pub mod record;

// Re-export main types
pub use config::{
    ConfigError, ConsumerConfig, KafkaConfig, SaslConfig, SaslMechanism, SecurityProtocol,
    SslConfig, TopicConfig,
};
pub use consumer::{
    ConsumerError, IncomingMessage, KafkaLog, MessageMetadata, PartitionKey, Positions,
    TelemetryLog,
};
pub use health::{
    health_router, serve_health, CheckResult, ConsumerLiveness, HealthCheck, Heartbeat,
    SyncLiveness,
};
pub use record::{TelemetryRecord, ValidationError};

/// Async trait for log implementations (re-export for convenience)
pub use async_trait::async_trait;
