//! Kafka-backed telemetry log.
//!
//! The ingestion loop only needs three things from the log: fetch the next
//! batch with a bounded wait, commit a position per partition, and seek a
//! partition back to an earlier position. [`TelemetryLog`] captures exactly
//! that, plus a broker round trip used to tell "caught up" from "cut off".
//! [`KafkaLog`] implements it on top of an rdkafka `StreamConsumer`.

use crate::config::{ConfigError, KafkaConfig};
use async_trait::async_trait;
use rdkafka::client::ClientContext;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Headers, Message as KafkaMessage};
use rdkafka::{Offset, TopicPartitionList};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Errors that can occur while talking to the log
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Invalid consumer configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to create consumer: {0}")]
    CreationError(String),

    #[error("Failed to subscribe to topics: {0}")]
    SubscriptionError(String),

    #[error("Failed to commit offsets: {0}")]
    CommitError(String),

    #[error("Failed to seek {partition} to offset {offset}: {message}")]
    SeekError {
        partition: PartitionKey,
        offset: i64,
        message: String,
    },

    #[error("Consumer poll error: {0}")]
    PollError(String),

    #[error("Broker unreachable: {0}")]
    Unreachable(String),
}

/// A topic partition, the unit of ordering and of position tracking
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    pub topic: String,
    pub partition: i32,
}

impl PartitionKey {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition)
    }
}

/// Next-offset-to-read per partition
pub type Positions = HashMap<PartitionKey, i64>;

/// Metadata about a received message
#[derive(Debug, Clone)]
pub struct MessageMetadata {
    /// Topic the message was received from
    pub topic: String,
    /// Partition the message was received from
    pub partition: i32,
    /// Offset of the message in the partition
    pub offset: i64,
    /// Message key (if present)
    pub key: Option<Vec<u8>>,
    /// Broker timestamp of the message
    pub timestamp: Option<i64>,
    /// Message headers
    pub headers: HashMap<String, String>,
}

/// A received message with payload and metadata
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Raw message payload, empty for tombstones
    pub payload: Vec<u8>,
    /// Message metadata
    pub metadata: MessageMetadata,
}

impl IncomingMessage {
    /// The partition this message belongs to
    pub fn partition_key(&self) -> PartitionKey {
        PartitionKey::new(self.metadata.topic.clone(), self.metadata.partition)
    }

    /// Offset of this message within its partition
    pub fn offset(&self) -> i64 {
        self.metadata.offset
    }

    /// Get the message key as a string
    pub fn key_str(&self) -> Option<String> {
        self.metadata
            .key
            .as_ref()
            .and_then(|k| String::from_utf8(k.clone()).ok())
    }

    /// Get a header value
    pub fn header(&self, key: &str) -> Option<&str> {
        self.metadata.headers.get(key).map(|s| s.as_str())
    }
}

/// An ordered, partitioned, offset-addressable source of telemetry messages
#[async_trait]
pub trait TelemetryLog: Send + Sync {
    /// Wait at most `timeout` for messages and return up to `max_records` of them.
    ///
    /// An empty vector means nothing arrived before the timeout.
    async fn fetch_batch(
        &self,
        timeout: Duration,
        max_records: usize,
    ) -> Result<Vec<IncomingMessage>, ConsumerError>;

    /// Commit the given next-to-read positions for the consumer group
    async fn commit(&self, positions: &Positions) -> Result<(), ConsumerError>;

    /// Move the read position of one partition so `offset` is the next message fetched
    async fn seek(&self, partition: &PartitionKey, offset: i64) -> Result<(), ConsumerError>;

    /// Complete one request/response exchange with the broker.
    ///
    /// An empty fetch cannot distinguish an idle topic from an unreachable
    /// broker; this can.
    async fn ping(&self) -> Result<(), ConsumerError>;

    /// Release the log connection. Called once, after the last commit.
    async fn close(&self);
}

/// Client context that tracks whether librdkafka has lost the brokers.
///
/// librdkafka reports an outage once through the error callback and then
/// keeps reconnecting silently, so the flag stays down until a ping gets an
/// answer from a broker.
#[derive(Debug, Default)]
pub struct LogContext {
    brokers_down: AtomicBool,
}

impl LogContext {
    pub fn brokers_down(&self) -> bool {
        self.brokers_down.load(Ordering::Relaxed)
    }

    fn mark_reachable(&self) {
        if self.brokers_down.swap(false, Ordering::Relaxed) {
            info!("Kafka brokers reachable again");
        }
    }
}

fn is_connectivity_error(error: &KafkaError) -> bool {
    matches!(
        error.rdkafka_error_code(),
        Some(
            RDKafkaErrorCode::AllBrokersDown
                | RDKafkaErrorCode::BrokerTransportFailure
                | RDKafkaErrorCode::Resolve
                | RDKafkaErrorCode::Authentication
        )
    )
}

impl ClientContext for LogContext {
    fn error(&self, error: KafkaError, reason: &str) {
        if is_connectivity_error(&error) {
            self.brokers_down.store(true, Ordering::Relaxed);
            warn!(error = %error, reason, "Lost connection to Kafka brokers");
        } else {
            error!(error = %error, reason, "librdkafka error");
        }
    }
}

impl ConsumerContext for LogContext {}

/// Kafka consumer owned by one ingestion loop
pub struct KafkaLog {
    consumer: Arc<StreamConsumer<LogContext>>,
    config: Arc<KafkaConfig>,
}

impl KafkaLog {
    /// Create the consumer and subscribe to the configured topics.
    ///
    /// Failures here are fatal to the process; once connected, broker outages
    /// are handled by librdkafka's own reconnection.
    pub fn connect(config: KafkaConfig) -> Result<Self, ConsumerError> {
        config.validate()?;

        info!(
            bootstrap_servers = %config.bootstrap_servers,
            group = %config.consumer.group_id,
            "Creating Kafka consumer"
        );

        let consumer: StreamConsumer<LogContext> = config
            .build_consumer_config()
            .create_with_context(LogContext::default())
            .map_err(|e| ConsumerError::CreationError(e.to_string()))?;

        let topics = config.topics.subscriptions();
        consumer
            .subscribe(&topics)
            .map_err(|e| ConsumerError::SubscriptionError(e.to_string()))?;

        info!(topics = ?topics, "Subscribed to Kafka topics");

        Ok(Self {
            consumer: Arc::new(consumer),
            config: Arc::new(config),
        })
    }

    /// Run a blocking librdkafka call on the blocking pool
    async fn blocking<T, F>(&self, call: F) -> Result<T, ConsumerError>
    where
        T: Send + 'static,
        F: FnOnce(&StreamConsumer<LogContext>) -> Result<T, ConsumerError> + Send + 'static,
    {
        let consumer = self.consumer.clone();
        tokio::task::spawn_blocking(move || call(&consumer))
            .await
            .map_err(|e| ConsumerError::PollError(format!("blocking Kafka call aborted: {}", e)))?
    }

    /// Get the configuration
    pub fn config(&self) -> &KafkaConfig {
        &self.config
    }

    /// Convert a borrowed Kafka message to our IncomingMessage type
    fn convert_message<M: KafkaMessage>(msg: &M) -> IncomingMessage {
        let payload = msg.payload().unwrap_or(&[]).to_vec();
        let key = msg.key().map(|k| k.to_vec());

        let mut headers = HashMap::new();
        if let Some(h) = msg.headers() {
            for header in h.iter() {
                if let Some(value) = header.value {
                    if let Ok(v) = String::from_utf8(value.to_vec()) {
                        headers.insert(header.key.to_string(), v);
                    }
                }
            }
        }

        IncomingMessage {
            payload,
            metadata: MessageMetadata {
                topic: msg.topic().to_string(),
                partition: msg.partition(),
                offset: msg.offset(),
                key,
                timestamp: msg.timestamp().to_millis(),
                headers,
            },
        }
    }
}

#[async_trait]
impl TelemetryLog for KafkaLog {
    async fn fetch_batch(
        &self,
        timeout: Duration,
        max_records: usize,
    ) -> Result<Vec<IncomingMessage>, ConsumerError> {
        let deadline = Instant::now() + timeout;
        let mut batch = Vec::new();

        while batch.len() < max_records {
            match tokio::time::timeout_at(deadline, self.consumer.recv()).await {
                Err(_) => break,
                Ok(Ok(message)) => batch.push(Self::convert_message(&message)),
                Ok(Err(e)) if batch.is_empty() => {
                    return Err(ConsumerError::PollError(e.to_string()));
                }
                Ok(Err(e)) => {
                    // Hand over what we already have; the error resurfaces on the next poll.
                    warn!(error = %e, fetched = batch.len(), "Kafka error mid-batch");
                    break;
                }
            }
        }

        if batch.is_empty() {
            // Silence after a reported outage is not "caught up" until a broker answers
            if self.consumer.context().brokers_down() {
                self.ping().await?;
            }
        } else {
            self.consumer.context().mark_reachable();
            debug!(records = batch.len(), "Fetched batch from Kafka");
        }

        Ok(batch)
    }

    #[instrument(skip(self, positions), fields(partitions = positions.len()))]
    async fn commit(&self, positions: &Positions) -> Result<(), ConsumerError> {
        if positions.is_empty() {
            return Ok(());
        }

        let mut tpl = TopicPartitionList::new();
        for (key, offset) in positions {
            tpl.add_partition_offset(&key.topic, key.partition, Offset::Offset(*offset))
                .map_err(|e| ConsumerError::CommitError(e.to_string()))?;
        }

        self.blocking(move |consumer| {
            consumer
                .commit(&tpl, CommitMode::Sync)
                .map_err(|e| ConsumerError::CommitError(e.to_string()))
        })
        .await
    }

    async fn seek(&self, partition: &PartitionKey, offset: i64) -> Result<(), ConsumerError> {
        let partition = partition.clone();
        let timeout = self.config.seek_timeout();

        self.blocking(move |consumer| {
            consumer
                .seek(
                    &partition.topic,
                    partition.partition,
                    Offset::Offset(offset),
                    timeout,
                )
                .map_err(|e| ConsumerError::SeekError {
                    partition: partition.clone(),
                    offset,
                    message: e.to_string(),
                })
        })
        .await
    }

    async fn ping(&self) -> Result<(), ConsumerError> {
        let topic = self.config.topics.telemetry.clone();
        let timeout = self.config.seek_timeout();

        self.blocking(move |consumer| {
            consumer
                .fetch_metadata(Some(&topic), timeout)
                .map_err(|e| ConsumerError::Unreachable(e.to_string()))?;
            consumer.context().mark_reachable();
            Ok(())
        })
        .await
    }

    async fn close(&self) {
        info!("Closing Kafka consumer");
        self.consumer.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(topic: &str, partition: i32, offset: i64) -> IncomingMessage {
        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());

        IncomingMessage {
            payload: br#"{"device_uuid":"x"}"#.to_vec(),
            metadata: MessageMetadata {
                topic: topic.to_string(),
                partition,
                offset,
                key: Some(b"device-1".to_vec()),
                timestamp: Some(1234567890),
                headers,
            },
        }
    }

    #[test]
    fn test_incoming_message_accessors() {
        let message = message("telemetry", 3, 100);

        assert_eq!(message.partition_key(), PartitionKey::new("telemetry", 3));
        assert_eq!(message.offset(), 100);
        assert_eq!(message.key_str(), Some("device-1".to_string()));
        assert_eq!(message.header("content-type"), Some("application/json"));
        assert_eq!(message.header("missing"), None);
    }

    #[test]
    fn test_partition_key_display_and_ordering() {
        let a = PartitionKey::new("telemetry", 0);
        let b = PartitionKey::new("telemetry", 1);

        assert_eq!(a.to_string(), "telemetry:0");
        assert!(a < b);
    }

    #[test]
    fn test_context_tracks_broker_outages() {
        let context = LogContext::default();
        assert!(!context.brokers_down());

        context.error(
            KafkaError::Global(RDKafkaErrorCode::MessageTimedOut),
            "slow produce",
        );
        assert!(!context.brokers_down());

        context.error(
            KafkaError::Global(RDKafkaErrorCode::AllBrokersDown),
            "3/3 brokers are down",
        );
        assert!(context.brokers_down());

        context.mark_reachable();
        assert!(!context.brokers_down());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_ping_unreachable_broker_keeps_runtime_responsive() {
        let mut config = KafkaConfig::new("127.0.0.1:1");
        config.consumer.seek_timeout_ms = 300;
        let log = KafkaLog::connect(config).unwrap();

        let ticks = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = ticks.clone();
        let ticker = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;
                counter.fetch_add(1, Ordering::Relaxed);
            }
        });

        let result = log.ping().await;
        ticker.abort();

        assert!(matches!(result, Err(ConsumerError::Unreachable(_))));
        assert!(ticks.load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn test_connect_rejects_invalid_config() {
        let config = KafkaConfig::new("");
        assert!(matches!(
            KafkaLog::connect(config),
            Err(ConsumerError::Config(ConfigError::MissingRequired(_)))
        ));
    }
}
