//! In-memory batch of rows awaiting one transactional write.
//!
//! Alongside the rows, the accumulator remembers for every partition the
//! offset of the first and the last message folded into the current batch.
//! The first offsets are where the log is rewound to when the write fails;
//! the last offsets (plus one) are what gets committed when it succeeds.

use std::collections::HashMap;
use telemetry_pipeline::{PartitionKey, Positions};

/// Everything taken out of the accumulator by [`BatchAccumulator::drain`]
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DrainedBatch<R> {
    pub rows: Vec<R>,
    pub first_positions: Positions,
    pub last_positions: Positions,
}

impl<R> DrainedBatch<R> {
    /// Positions to commit once the rows are durable: one past the last consumed offset
    pub fn commit_positions(&self) -> Positions {
        self.last_positions
            .iter()
            .map(|(partition, last)| (partition.clone(), last + 1))
            .collect()
    }
}

/// Rows plus per-partition first/last offsets since the last drain
#[derive(Debug)]
pub struct BatchAccumulator<R> {
    rows: Vec<R>,
    first_positions: Positions,
    last_positions: Positions,
}

impl<R> Default for BatchAccumulator<R> {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            first_positions: HashMap::new(),
            last_positions: HashMap::new(),
        }
    }
}

impl<R> BatchAccumulator<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a row consumed from `partition` at `position`.
    ///
    /// Positions within one partition arrive in log order.
    pub fn add(&mut self, row: R, partition: &PartitionKey, position: i64) {
        self.rows.push(row);
        self.track(partition, position);
    }

    /// Fold a rejected message into the batch without a row.
    ///
    /// Returns `true` when `partition` already has rows pending, in which case
    /// the skipped offset is committed together with them. Returns `false`
    /// otherwise; the caller may then commit past the message on its own.
    pub fn skip(&mut self, partition: &PartitionKey, position: i64) -> bool {
        if !self.first_positions.contains_key(partition) {
            return false;
        }
        self.track(partition, position);
        true
    }

    fn track(&mut self, partition: &PartitionKey, position: i64) {
        self.first_positions
            .entry(partition.clone())
            .or_insert(position);
        self.last_positions.insert(partition.clone(), position);
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Number of rows pending
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Take the pending rows and offsets, leaving the accumulator empty
    pub fn drain(&mut self) -> DrainedBatch<R> {
        DrainedBatch {
            rows: std::mem::take(&mut self.rows),
            first_positions: std::mem::take(&mut self.first_positions),
            last_positions: std::mem::take(&mut self.last_positions),
        }
    }
}
