//! Telemetry Storage Service
//!
//! Batching consumer that moves IoT telemetry from Kafka into PostgreSQL.
//! Records are validated one by one, accumulated into batches, written in a
//! single transaction, and only then are the Kafka positions committed. A
//! failed write rewinds the affected partitions so nothing is lost.
//!
//! ## Architecture
//!
//! ```text
//! Kafka topic             Coordinator                      PostgreSQL
//! ┌──────────────┐       ┌──────────────────────┐        ┌──────────────────┐
//! │ telemetry    │──────▶│ validate             │        │ telemetry_event  │
//! └──────────────┘       │   │                  │        │   │ (trigger)    │
//!        ▲               │   ▼                  │        │   ▼              │
//!        │               │ accumulate ─▶ write ─┼───────▶│ telemetry_latest │
//!        │  commit/seek  │                 │    │        └──────────────────┘
//!        └───────────────┼─────────────────┘    │
//!                        └──────────────────────┘
//! ```

pub mod accumulator;
pub mod config;
pub mod coordinator;
pub mod store;
pub mod writer;

pub use accumulator::{BatchAccumulator, DrainedBatch};
pub use config::{BatchConfig, Config, ConsumerMode};
pub use coordinator::{Coordinator, CoordinatorError, Phase};
pub use store::{EventStore, StoreError, TelemetryEventRow};
pub use writer::{BatchWriter, PgBatchWriter, WriteOutcome};
