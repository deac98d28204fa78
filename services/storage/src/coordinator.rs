//! The consume → accumulate → write → commit loop.
//!
//! Positions are committed only after the rows they cover are durable. When a
//! write (or the commit that follows it) fails, every partition in the batch
//! is sought back to its first position so the same records are fetched
//! again. Duplicates are possible after such a replay; loss is not.

use crate::accumulator::{BatchAccumulator, DrainedBatch};
use crate::config::{BatchConfig, ConsumerMode};
use crate::store::{StoreError, TelemetryEventRow};
use crate::writer::{BatchWriter, WriteOutcome};
use std::fmt;
use std::sync::Arc;
use telemetry_pipeline::{
    ConsumerError, ConsumerLiveness, IncomingMessage, Positions, TelemetryLog, TelemetryRecord,
};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

/// Errors that stop the consumer loop
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Unrecoverable write failure: {0}")]
    Fatal(#[source] StoreError),

    #[error("Failed to rewind after a failed flush: {0}")]
    Rewind(#[source] ConsumerError),
}

/// Where the loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Polling,
    Accumulating,
    Flushing,
    Committing,
    RetryBackoff,
    ShuttingDown,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Polling => "polling",
            Phase::Accumulating => "accumulating",
            Phase::Flushing => "flushing",
            Phase::Committing => "committing",
            Phase::RetryBackoff => "retry_backoff",
            Phase::ShuttingDown => "shutting_down",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Drives one log consumer into one batch writer
pub struct Coordinator<L, W> {
    log: L,
    writer: W,
    config: BatchConfig,
    liveness: Arc<ConsumerLiveness>,
    accumulator: BatchAccumulator<TelemetryEventRow>,
    phase: Phase,
    last_flush: Instant,
    last_ping: Option<Instant>,
}

impl<L: TelemetryLog, W: BatchWriter> Coordinator<L, W> {
    pub fn new(log: L, writer: W, config: BatchConfig, liveness: Arc<ConsumerLiveness>) -> Self {
        Self {
            log,
            writer,
            config,
            liveness,
            accumulator: BatchAccumulator::new(),
            phase: Phase::Idle,
            last_flush: Instant::now(),
            last_ping: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Consume until `shutdown` is cancelled or a fatal error occurs.
    ///
    /// On cancellation any pending rows get one last flush and commit. The log
    /// is closed before returning in every case.
    #[instrument(skip_all, fields(mode = ?self.config.mode))]
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<(), CoordinatorError> {
        info!(
            batch_size = self.config.batch_size,
            flush_interval_ms = self.config.flush_interval_ms,
            retry_backoff_ms = self.config.retry_backoff_ms,
            "Starting telemetry consumer loop"
        );

        self.last_flush = Instant::now();

        let result = match self.consume(&shutdown).await {
            Ok(()) => self.drain_on_shutdown(&shutdown).await,
            Err(e) => Err(e),
        };

        self.log.close().await;
        info!("Telemetry consumer loop stopped");
        result
    }

    async fn consume(&mut self, shutdown: &CancellationToken) -> Result<(), CoordinatorError> {
        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }

            self.set_phase(Phase::Polling);
            let poll_timeout = self.config.poll_timeout();
            let max_records = self.config.max_poll_records;

            let fetched = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                fetched = self.log.fetch_batch(poll_timeout, max_records) => fetched,
            };

            let messages = match fetched {
                Ok(messages) => {
                    if !messages.is_empty() {
                        self.liveness.set_connected(true);
                    }
                    messages
                }
                Err(e) => {
                    self.liveness.set_connected(false);
                    warn!(error = %e, "Failed to poll telemetry log");
                    self.back_off(shutdown).await;
                    continue;
                }
            };
            let caught_up = messages.is_empty();

            match self.config.mode {
                ConsumerMode::Transactional => self.step_transactional(messages, shutdown).await?,
                ConsumerMode::AutoCommit => self.step_auto_commit(messages, shutdown).await?,
            }

            // A caught-up consumer has nothing to commit but is still healthy,
            // as long as the broker actually answers
            if caught_up && self.accumulator.is_empty() && self.broker_reachable().await {
                self.liveness.heartbeat().beat();
            }
        }
    }

    /// Confirm the broker answers, at most once per flush interval while connected
    async fn broker_reachable(&mut self) -> bool {
        let ping_due = !self.liveness.is_connected()
            || self
                .last_ping
                .map_or(true, |at| at.elapsed() >= self.config.flush_interval());
        if !ping_due {
            return true;
        }

        self.last_ping = Some(Instant::now());
        match self.log.ping().await {
            Ok(()) => {
                self.liveness.set_connected(true);
                true
            }
            Err(e) => {
                self.liveness.set_connected(false);
                warn!(error = %e, "Telemetry log broker is unreachable");
                false
            }
        }
    }

    async fn step_transactional(
        &mut self,
        messages: Vec<IncomingMessage>,
        shutdown: &CancellationToken,
    ) -> Result<(), CoordinatorError> {
        if !messages.is_empty() {
            self.set_phase(Phase::Accumulating);
            for message in messages {
                self.accumulate(message).await;
            }
        }

        if self.flush_due() {
            self.flush(shutdown).await?;
        }

        Ok(())
    }

    async fn accumulate(&mut self, message: IncomingMessage) {
        let partition = message.partition_key();
        let offset = message.offset();

        match validate(&message) {
            Some(row) => self.accumulator.add(row, &partition, offset),
            None => {
                if self.accumulator.skip(&partition, offset) {
                    return;
                }

                let positions = Positions::from([(partition, offset + 1)]);
                match self.log.commit(&positions).await {
                    Ok(()) => self.liveness.heartbeat().beat(),
                    Err(e) => warn!(error = %e, offset, "Failed to commit past rejected record"),
                }
            }
        }
    }

    fn flush_due(&self) -> bool {
        !self.accumulator.is_empty()
            && (self.accumulator.len() >= self.config.batch_size
                || self.last_flush.elapsed() >= self.config.flush_interval())
    }

    async fn flush(&mut self, shutdown: &CancellationToken) -> Result<(), CoordinatorError> {
        let batch = self.accumulator.drain();
        self.last_flush = Instant::now();
        self.set_phase(Phase::Flushing);

        let started = Instant::now();
        let outcome = self.writer.write_batch(&batch.rows).await;
        metrics::histogram!("telemetry.flush.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        match outcome {
            WriteOutcome::Committed { rows } => {
                self.set_phase(Phase::Committing);
                match self.log.commit(&batch.commit_positions()).await {
                    Ok(()) => {
                        self.liveness.heartbeat().beat();
                        metrics::counter!("telemetry.batches.flushed").increment(1);
                        info!(
                            rows,
                            partitions = batch.last_positions.len(),
                            "Batch written and committed"
                        );
                    }
                    Err(e) => {
                        // Rows are durable; the replay will write them again
                        warn!(error = %e, rows, "Failed to commit positions after write");
                        metrics::counter!("telemetry.batches.failed").increment(1);
                        self.rewind(&batch).await?;
                        self.back_off(shutdown).await;
                    }
                }
                Ok(())
            }
            WriteOutcome::Retryable(e) => {
                warn!(
                    error = %e,
                    rows = batch.rows.len(),
                    backoff_ms = self.config.retry_backoff_ms,
                    "Batch write failed; rewinding"
                );
                metrics::counter!("telemetry.batches.failed").increment(1);
                self.rewind(&batch).await?;
                self.back_off(shutdown).await;
                Ok(())
            }
            WriteOutcome::Fatal(e) => {
                error!(error = %e, rows = batch.rows.len(), "Batch write cannot succeed; stopping");
                metrics::counter!("telemetry.batches.failed").increment(1);
                self.rewind(&batch).await?;
                Err(CoordinatorError::Fatal(e))
            }
        }
    }

    /// Seek every partition of a failed batch back to its first position
    async fn rewind(&self, batch: &DrainedBatch<TelemetryEventRow>) -> Result<(), CoordinatorError> {
        let mut firsts: Vec<_> = batch.first_positions.iter().collect();
        firsts.sort();

        for (partition, offset) in firsts {
            self.log
                .seek(partition, *offset)
                .await
                .map_err(CoordinatorError::Rewind)?;
            debug!(partition = %partition, offset, "Rewound partition");
        }

        Ok(())
    }

    async fn back_off(&mut self, shutdown: &CancellationToken) {
        self.set_phase(Phase::RetryBackoff);
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(self.config.retry_backoff()) => {}
        }
    }

    /// Write whatever one poll returned and commit its positions regardless
    async fn step_auto_commit(
        &mut self,
        messages: Vec<IncomingMessage>,
        shutdown: &CancellationToken,
    ) -> Result<(), CoordinatorError> {
        if messages.is_empty() {
            return Ok(());
        }

        self.set_phase(Phase::Accumulating);
        let mut rows = Vec::with_capacity(messages.len());
        let mut positions = Positions::new();

        for message in &messages {
            if let Some(row) = validate(message) {
                rows.push(row);
            }
            let next = positions.entry(message.partition_key()).or_insert(0);
            *next = (*next).max(message.offset() + 1);
        }

        let mut write_failed = false;
        if !rows.is_empty() {
            self.set_phase(Phase::Flushing);
            match self.writer.write_batch(&rows).await {
                WriteOutcome::Committed { rows } => {
                    metrics::counter!("telemetry.batches.flushed").increment(1);
                    debug!(rows, "Batch written");
                }
                WriteOutcome::Retryable(e) => {
                    warn!(error = %e, rows = rows.len(), "Batch write failed; positions are committed anyway");
                    metrics::counter!("telemetry.batches.failed").increment(1);
                    write_failed = true;
                }
                WriteOutcome::Fatal(e) => {
                    error!(error = %e, rows = rows.len(), "Batch write cannot succeed; stopping");
                    metrics::counter!("telemetry.batches.failed").increment(1);
                    return Err(CoordinatorError::Fatal(e));
                }
            }
        }

        self.set_phase(Phase::Committing);
        match self.log.commit(&positions).await {
            Ok(()) => self.liveness.heartbeat().beat(),
            Err(e) => warn!(error = %e, "Failed to commit positions"),
        }

        if write_failed {
            self.back_off(shutdown).await;
        }

        Ok(())
    }

    async fn drain_on_shutdown(&mut self, shutdown: &CancellationToken) -> Result<(), CoordinatorError> {
        self.set_phase(Phase::ShuttingDown);

        if !self.accumulator.is_empty() {
            info!(rows = self.accumulator.len(), "Flushing pending rows before shutdown");
            self.flush(shutdown).await?;
            self.set_phase(Phase::ShuttingDown);
        }

        Ok(())
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            trace!(from = %self.phase, to = %phase, "Consumer phase change");
            self.phase = phase;
        }
    }
}

/// Validate one message, logging and counting rejections
fn validate(message: &IncomingMessage) -> Option<TelemetryEventRow> {
    match TelemetryRecord::from_slice(&message.payload) {
        Ok(record) => {
            metrics::counter!("telemetry.records.accepted").increment(1);
            Some(TelemetryEventRow::from(&record))
        }
        Err(e) => {
            warn!(
                topic = %message.metadata.topic,
                partition = message.metadata.partition,
                offset = message.offset(),
                error = %e,
                "Rejected telemetry record"
            );
            metrics::counter!("telemetry.records.rejected").increment(1);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::MockBatchWriter;
    use async_trait::async_trait;
    use std::collections::{BTreeMap, HashMap, HashSet};
    use std::sync::Mutex;
    use std::time::Duration;
    use telemetry_pipeline::{HealthCheck, MessageMetadata, PartitionKey};
    use uuid::Uuid;

    #[derive(Debug, Clone, PartialEq)]
    enum Step {
        Wrote(Vec<Uuid>),
        WriteFailed(usize),
        Committed(Positions),
        Seeked(PartitionKey, i64),
    }

    type Journal = Arc<Mutex<Vec<Step>>>;

    fn partition(n: i32) -> PartitionKey {
        PartitionKey::new("telemetry", n)
    }

    /// Device id that encodes where the record sits in the log
    fn device(partition: i32, offset: i64) -> Uuid {
        Uuid::from_u128(((partition as u128) << 64) | offset as u128)
    }

    fn valid_payload(device_uuid: Uuid) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "device_uuid": device_uuid.to_string(),
            "x_coord": 12.5,
            "y_coord": -3.0,
            "device_time": "2024-01-15T10:30:00Z",
            "system_time_utc": "2024-01-15T10:30:01Z",
        }))
        .unwrap()
    }

    #[derive(Default)]
    struct LogState {
        partitions: BTreeMap<PartitionKey, BTreeMap<i64, Vec<u8>>>,
        read_positions: HashMap<PartitionKey, i64>,
        failing_commits: usize,
        failing_polls: usize,
        outage: bool,
        pings: usize,
        closed: bool,
    }

    /// In-memory log with Kafka's read/commit/seek semantics
    #[derive(Clone)]
    struct FakeLog {
        state: Arc<Mutex<LogState>>,
        journal: Journal,
    }

    impl FakeLog {
        fn publish(&self, n: i32, offset: i64, payload: Vec<u8>) {
            let mut state = self.state.lock().unwrap();
            state
                .partitions
                .entry(partition(n))
                .or_default()
                .insert(offset, payload);
        }

        fn publish_valid(&self, n: i32, offsets: std::ops::Range<i64>) {
            for offset in offsets {
                self.publish(n, offset, valid_payload(device(n, offset)));
            }
        }

        fn fail_next_commits(&self, count: usize) {
            self.state.lock().unwrap().failing_commits = count;
        }

        /// Brokers vanish: one poll reports it, later polls come back empty
        fn start_outage(&self) {
            let mut state = self.state.lock().unwrap();
            state.failing_polls = 1;
            state.outage = true;
        }

        fn end_outage(&self) {
            self.state.lock().unwrap().outage = false;
        }

        fn pings(&self) -> usize {
            self.state.lock().unwrap().pings
        }

        fn read_position(&self, n: i32) -> i64 {
            let state = self.state.lock().unwrap();
            state.read_positions.get(&partition(n)).copied().unwrap_or(0)
        }

        fn is_closed(&self) -> bool {
            self.state.lock().unwrap().closed
        }
    }

    #[async_trait]
    impl TelemetryLog for FakeLog {
        async fn fetch_batch(
            &self,
            timeout: Duration,
            max_records: usize,
        ) -> Result<Vec<IncomingMessage>, ConsumerError> {
            let batch = {
                let mut state = self.state.lock().unwrap();
                if state.failing_polls > 0 {
                    state.failing_polls -= 1;
                    return Err(ConsumerError::PollError(
                        "All broker connections are down".to_string(),
                    ));
                }
                let outage = state.outage;
                let LogState {
                    partitions,
                    read_positions,
                    ..
                } = &mut *state;

                let mut batch = Vec::new();
                for (key, messages) in partitions.iter().filter(|_| !outage) {
                    let position = read_positions.entry(key.clone()).or_insert(0);
                    for (offset, payload) in messages.range(*position..) {
                        if batch.len() >= max_records {
                            break;
                        }
                        batch.push(IncomingMessage {
                            payload: payload.clone(),
                            metadata: MessageMetadata {
                                topic: key.topic.clone(),
                                partition: key.partition,
                                offset: *offset,
                                key: None,
                                timestamp: None,
                                headers: HashMap::new(),
                            },
                        });
                        *position = offset + 1;
                    }
                }
                batch
            };

            if batch.is_empty() {
                tokio::time::sleep(timeout).await;
            }
            Ok(batch)
        }

        async fn commit(&self, positions: &Positions) -> Result<(), ConsumerError> {
            let mut state = self.state.lock().unwrap();
            if state.failing_commits > 0 {
                state.failing_commits -= 1;
                return Err(ConsumerError::CommitError("broker unavailable".to_string()));
            }
            self.journal
                .lock()
                .unwrap()
                .push(Step::Committed(positions.clone()));
            Ok(())
        }

        async fn seek(&self, key: &PartitionKey, offset: i64) -> Result<(), ConsumerError> {
            let mut state = self.state.lock().unwrap();
            state.read_positions.insert(key.clone(), offset);
            self.journal
                .lock()
                .unwrap()
                .push(Step::Seeked(key.clone(), offset));
            Ok(())
        }

        async fn ping(&self) -> Result<(), ConsumerError> {
            let mut state = self.state.lock().unwrap();
            state.pings += 1;
            if state.outage {
                return Err(ConsumerError::Unreachable("connection refused".to_string()));
            }
            Ok(())
        }

        async fn close(&self) {
            self.state.lock().unwrap().closed = true;
        }
    }

    /// Writer that fails a set number of times before succeeding
    #[derive(Clone)]
    struct FakeWriter {
        failures: Arc<Mutex<usize>>,
        journal: Journal,
    }

    #[async_trait]
    impl BatchWriter for FakeWriter {
        async fn write_batch(&self, rows: &[TelemetryEventRow]) -> WriteOutcome {
            let mut failures = self.failures.lock().unwrap();
            let mut journal = self.journal.lock().unwrap();

            if *failures > 0 {
                *failures -= 1;
                journal.push(Step::WriteFailed(rows.len()));
                return WriteOutcome::Retryable(StoreError::Database(sqlx::Error::PoolTimedOut));
            }

            journal.push(Step::Wrote(rows.iter().map(|r| r.device_uuid).collect()));
            WriteOutcome::Committed {
                rows: rows.len() as u64,
            }
        }
    }

    struct Harness {
        log: FakeLog,
        writer: FakeWriter,
        journal: Journal,
        liveness: Arc<ConsumerLiveness>,
    }

    impl Harness {
        fn new() -> Self {
            let journal: Journal = Arc::default();
            Self {
                log: FakeLog {
                    state: Arc::default(),
                    journal: journal.clone(),
                },
                writer: FakeWriter {
                    failures: Arc::default(),
                    journal: journal.clone(),
                },
                journal,
                liveness: Arc::new(ConsumerLiveness::new(Duration::from_secs(60))),
            }
        }

        fn fail_next_writes(&self, count: usize) {
            *self.writer.failures.lock().unwrap() = count;
        }

        fn coordinator(&self, config: BatchConfig) -> Coordinator<FakeLog, FakeWriter> {
            Coordinator::new(
                self.log.clone(),
                self.writer.clone(),
                config,
                self.liveness.clone(),
            )
        }

        fn steps(&self) -> Vec<Step> {
            self.journal.lock().unwrap().clone()
        }

        fn written(&self) -> Vec<Uuid> {
            self.steps()
                .into_iter()
                .filter_map(|step| match step {
                    Step::Wrote(ids) => Some(ids),
                    _ => None,
                })
                .flatten()
                .collect()
        }

        fn last_commit(&self, n: i32) -> Option<i64> {
            self.steps().into_iter().rev().find_map(|step| match step {
                Step::Committed(positions) => positions.get(&partition(n)).copied(),
                _ => None,
            })
        }
    }

    fn batch_config(batch_size: usize, flush_interval_ms: u64) -> BatchConfig {
        BatchConfig {
            batch_size,
            flush_interval_ms,
            ..BatchConfig::default()
        }
    }

    /// Run the loop in the background until `done` holds, then cancel it
    async fn run_until<L, W>(
        mut coordinator: Coordinator<L, W>,
        done: impl Fn() -> bool,
    ) -> Result<(), CoordinatorError>
    where
        L: TelemetryLog + 'static,
        W: BatchWriter + 'static,
    {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { coordinator.run(token).await });

        for _ in 0..10_000 {
            if done() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        shutdown.cancel();
        handle.await.unwrap()
    }

    #[test]
    fn test_new_coordinator_is_idle() {
        let harness = Harness::new();
        let coordinator = harness.coordinator(BatchConfig::default());
        assert_eq!(coordinator.phase(), Phase::Idle);
        assert_eq!(Phase::RetryBackoff.to_string(), "retry_backoff");
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_triggered_flush_writes_small_batch() {
        let harness = Harness::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        harness.log.publish(0, 0, valid_payload(a));
        harness.log.publish(0, 1, valid_payload(b));
        harness.log.publish(0, 2, valid_payload(a));

        let started = Instant::now();
        let result = run_until(harness.coordinator(batch_config(500, 1000)), || {
            !harness.written().is_empty()
        })
        .await;

        assert!(result.is_ok());
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(harness.written(), vec![a, b, a]);
        assert_eq!(harness.last_commit(0), Some(3));
        assert!(harness.liveness.is_connected());
        assert!(harness.liveness.heartbeat().last_beat().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_is_rewound_and_retried() {
        let harness = Harness::new();
        harness.log.publish_valid(0, 0..500);
        harness.fail_next_writes(1);

        let result = run_until(harness.coordinator(batch_config(500, 60_000)), || {
            harness.written().len() >= 500
        })
        .await;

        assert!(result.is_ok());
        let expected: Vec<Uuid> = (0..500).map(|offset| device(0, offset)).collect();
        assert_eq!(
            harness.steps(),
            vec![
                Step::WriteFailed(500),
                Step::Seeked(partition(0), 0),
                Step::Wrote(expected),
                Step::Committed(Positions::from([(partition(0), 500)])),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_record_commits_with_its_batch() {
        let harness = Harness::new();
        for offset in 1..=20 {
            let payload = if offset == 10 {
                b"{not json".to_vec()
            } else {
                valid_payload(device(0, offset))
            };
            harness.log.publish(0, offset, payload);
        }

        let result = run_until(harness.coordinator(batch_config(500, 1000)), || {
            harness.last_commit(0).is_some()
        })
        .await;

        assert!(result.is_ok());
        let written = harness.written();
        assert_eq!(written.len(), 19);
        assert!(!written.contains(&device(0, 10)));

        let commits: Vec<_> = harness
            .steps()
            .into_iter()
            .filter(|step| matches!(step, Step::Committed(_)))
            .collect();
        assert_eq!(
            commits,
            vec![Step::Committed(Positions::from([(partition(0), 21)]))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_record_alone_is_committed_directly() {
        let harness = Harness::new();
        harness.log.publish(
            0,
            0,
            serde_json::to_vec(&serde_json::json!({
                "device_uuid": "not-a-uuid",
                "x_coord": 1.0,
                "y_coord": 2.0,
                "system_time_utc": "2024-01-15T10:30:01Z",
            }))
            .unwrap(),
        );

        let result = run_until(harness.coordinator(batch_config(500, 1000)), || {
            harness.last_commit(0).is_some()
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(
            harness.steps(),
            vec![Step::Committed(Positions::from([(partition(0), 1)]))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_failure_replays_written_batch() {
        let harness = Harness::new();
        harness.log.publish_valid(0, 0..4);
        harness.log.fail_next_commits(1);

        let result = run_until(harness.coordinator(batch_config(4, 60_000)), || {
            harness.last_commit(0) == Some(4)
        })
        .await;

        assert!(result.is_ok());
        let ids: Vec<Uuid> = (0..4).map(|offset| device(0, offset)).collect();
        assert_eq!(
            harness.steps(),
            vec![
                Step::Wrote(ids.clone()),
                Step::Seeked(partition(0), 0),
                Step::Wrote(ids),
                Step::Committed(Positions::from([(partition(0), 4)])),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_commits_never_pass_unwritten_rows() {
        let harness = Harness::new();
        harness.log.publish_valid(0, 0..30);
        harness.log.publish_valid(1, 0..25);
        harness.log.publish(1, 7, b"[]".to_vec());
        harness.fail_next_writes(2);

        let config = BatchConfig {
            max_poll_records: 7,
            ..batch_config(10, 500)
        };
        let result = run_until(harness.coordinator(config), || {
            harness.last_commit(0) == Some(30) && harness.last_commit(1) == Some(25)
        })
        .await;
        assert!(result.is_ok());

        let mut written = HashSet::new();
        for step in harness.steps() {
            match step {
                Step::Wrote(ids) => written.extend(ids),
                Step::Committed(positions) => {
                    for (key, next) in positions {
                        for offset in 0..next {
                            let rejected = key.partition == 1 && offset == 7;
                            assert!(
                                rejected || written.contains(&device(key.partition, offset)),
                                "{key} committed to {next} before offset {offset} was written"
                            );
                        }
                    }
                }
                _ => {}
            }
        }

        // Nothing lost after two rewinds
        assert_eq!(written.len(), 30 + 24);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_pending_rows() {
        let harness = Harness::new();
        harness.log.publish_valid(0, 0..5);

        let result = run_until(harness.coordinator(batch_config(500, 3_600_000)), || {
            harness.log.read_position(0) == 5
        })
        .await;

        tokio_test::assert_ok!(result);
        assert_eq!(harness.written().len(), 5);
        assert_eq!(harness.last_commit(0), Some(5));
        assert!(harness.log.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_write_rewinds_and_stops() {
        let harness = Harness::new();
        harness.log.publish_valid(0, 0..3);

        let mut writer = MockBatchWriter::new();
        writer
            .expect_write_batch()
            .times(1)
            .withf(|rows| rows.len() == 3)
            .returning(|_| {
                WriteOutcome::Fatal(StoreError::Database(sqlx::Error::Configuration(
                    "password authentication failed".into(),
                )))
            });

        let mut coordinator = Coordinator::new(
            harness.log.clone(),
            writer,
            batch_config(3, 60_000),
            harness.liveness.clone(),
        );
        let result = coordinator.run(CancellationToken::new()).await;

        assert!(matches!(result, Err(CoordinatorError::Fatal(_))));
        assert_eq!(harness.steps(), vec![Step::Seeked(partition(0), 0)]);
        assert!(harness.log.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_commit_mode_does_not_rewind() {
        let harness = Harness::new();
        harness.log.publish_valid(0, 0..3);
        harness.fail_next_writes(usize::MAX);

        let config = BatchConfig {
            mode: ConsumerMode::AutoCommit,
            ..BatchConfig::default()
        };
        let result = run_until(harness.coordinator(config), || {
            harness.last_commit(0).is_some()
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(
            harness.steps(),
            vec![
                Step::WriteFailed(3),
                Step::Committed(Positions::from([(partition(0), 3)])),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_broker_outage_is_not_reported_ready() {
        let harness = Harness::new();
        harness.log.start_outage();

        let mut coordinator = harness.coordinator(BatchConfig::default());
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { coordinator.run(token).await });

        // Silent empty polls for five minutes after the single error
        tokio::time::sleep(Duration::from_secs(300)).await;
        let check = harness.liveness.check(chrono::Utc::now());
        assert!(!check.healthy, "{}", check.detail);
        assert!(!harness.liveness.is_connected());
        assert!(harness.liveness.heartbeat().last_beat().is_none());
        assert!(harness.log.pings() > 1);

        harness.log.end_outage();
        for _ in 0..100 {
            if harness.liveness.heartbeat().last_beat().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(harness.liveness.is_connected());
        assert!(harness.liveness.check(chrono::Utc::now()).healthy);

        shutdown.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_pings_are_rate_limited() {
        let harness = Harness::new();

        let started = Instant::now();
        let result = run_until(harness.coordinator(batch_config(500, 1000)), || {
            started.elapsed() >= Duration::from_secs(10)
        })
        .await;

        assert!(result.is_ok());
        // 200ms polls would ping ~50 times without the limit
        assert!(harness.log.pings() <= 12, "{} pings", harness.log.pings());
        assert!(harness.liveness.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_consumer_stays_live() {
        let harness = Harness::new();

        let result = run_until(harness.coordinator(BatchConfig::default()), || {
            harness.liveness.heartbeat().last_beat().is_some()
        })
        .await;

        assert!(result.is_ok());
        assert!(harness.liveness.is_connected());
        assert!(harness.steps().is_empty());
        assert!(harness.log.is_closed());
    }
}
