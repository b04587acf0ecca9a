//! Streaming bus abstraction
//!
//! Five partitioned topics carry the pipeline's traffic: raw events,
//! normalized events, processed events, dead letters and replay output.
//! Producers pick a partition from a stable hash of the message key, so
//! records for the same platform and event type keep their relative
//! order. The transport sits behind `StreamingBus`/`TopicConsumer`
//! traits; Redis Streams backs production deployments and an in-process
//! bus backs tests and single-node runs.

mod memory;
mod redis_streams;

pub use memory::MemoryBus;
pub use redis_streams::RedisStreamsBus;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::{IngestionError, Result};
use crate::schemas::{Platform, SocialEvent};

/// Pipeline topics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topic {
    RawEvents,
    NormalizedEvents,
    ProcessedEvents,
    DeadLetter,
    Replay,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::RawEvents => "raw-events",
            Topic::NormalizedEvents => "normalized-events",
            Topic::ProcessedEvents => "processed-events",
            Topic::DeadLetter => "dead-letter",
            Topic::Replay => "replay",
        }
    }

    pub const ALL: [Topic; 5] = [
        Topic::RawEvents,
        Topic::NormalizedEvents,
        Topic::ProcessedEvents,
        Topic::DeadLetter,
        Topic::Replay,
    ];
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Topic {
    type Err = IngestionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "raw-events" | "raw" => Ok(Topic::RawEvents),
            "normalized-events" | "normalized" => Ok(Topic::NormalizedEvents),
            "processed-events" | "processed" => Ok(Topic::ProcessedEvents),
            "dead-letter" => Ok(Topic::DeadLetter),
            "replay" => Ok(Topic::Replay),
            other => Err(IngestionError::TopicError(format!(
                "Unknown topic: {}",
                other
            ))),
        }
    }
}

/// Bus-wide configuration
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Stream name prefix, e.g. "pulse" yields "pulse:raw-events:0"
    pub prefix: String,
    /// Partitions per topic
    pub partitions: u32,
    /// Approximate per-partition retention caps, per topic. A topic
    /// absent from the map is uncapped.
    pub retention_max_len: HashMap<Topic, u64>,
    /// Producer identity stamped into message headers
    pub producer_id: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            prefix: "pulse".to_string(),
            partitions: 6,
            retention_max_len: Topic::ALL.iter().map(|t| (*t, 500_000)).collect(),
            producer_id: "pulse-ingestion".to_string(),
        }
    }
}

impl BusConfig {
    /// Retention cap for one topic, None when uncapped
    pub fn retention_for(&self, topic: Topic) -> Option<u64> {
        self.retention_max_len.get(&topic).copied()
    }

    /// Applies one cap to every topic; None uncaps them all
    pub fn with_uniform_retention(mut self, max_len: Option<u64>) -> Self {
        self.retention_max_len = match max_len {
            Some(n) => Topic::ALL.iter().map(|t| (*t, n)).collect(),
            None => HashMap::new(),
        };
        self
    }
}

/// How the partition key is derived from an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKeyStrategy {
    /// "platform:event_type", keeps per-platform-and-type ordering
    PlatformEventType,
    /// "platform", keeps whole-platform ordering
    Platform,
    /// Event id, spreads uniformly with no ordering guarantee
    EventId,
}

impl PartitionKeyStrategy {
    pub fn key_for(&self, event: &SocialEvent) -> String {
        match self {
            PartitionKeyStrategy::PlatformEventType => {
                format!("{}:{}", event.platform, event.event_type.as_str())
            }
            PartitionKeyStrategy::Platform => event.platform.to_string(),
            PartitionKeyStrategy::EventId => event.id.clone(),
        }
    }
}

impl std::str::FromStr for PartitionKeyStrategy {
    type Err = IngestionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "platform_event_type" => Ok(Self::PlatformEventType),
            "platform" => Ok(Self::Platform),
            "event_id" => Ok(Self::EventId),
            other => Err(IngestionError::ConfigError(config::ConfigError::Message(
                format!("Unknown partition key strategy: {}", other),
            ))),
        }
    }
}

/// Maps a key to a partition with a stable content hash, so the same key
/// always lands on the same partition regardless of process or restart
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    if partitions <= 1 {
        return 0;
    }
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % partitions as u64) as u32
}

/// Headers attached to every published message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHeaders {
    pub content_type: String,
    pub producer: String,
    pub timestamp: DateTime<Utc>,
    pub platform: String,
    pub event_type: String,
}

impl MessageHeaders {
    pub fn for_event(producer: &str, event: &SocialEvent) -> Self {
        Self {
            content_type: "application/json".to_string(),
            producer: producer.to_string(),
            timestamp: Utc::now(),
            platform: event.platform.to_string(),
            event_type: event.event_type.as_str().to_string(),
        }
    }

    pub fn new(producer: &str, platform: &str, event_type: &str) -> Self {
        Self {
            content_type: "application/json".to_string(),
            producer: producer.to_string(),
            timestamp: Utc::now(),
            platform: platform.to_string(),
            event_type: event_type.to_string(),
        }
    }
}

/// A message as read from or written to a topic partition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    pub id: String,
    pub topic: Topic,
    pub partition: u32,
    pub headers: MessageHeaders,
    /// JSON-serialized body
    pub payload: String,
    /// Transport offset, set on messages read from the bus
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<String>,
}

impl BusMessage {
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.payload).map_err(IngestionError::JsonError)
    }
}

/// Receipt returned for a successful publish
#[derive(Debug, Clone)]
pub struct PublishReceipt {
    pub message_id: String,
    pub topic: Topic,
    pub partition: u32,
    pub offset: String,
}

/// Wrapper republished to the dead-letter topic when processing fails
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEnvelope {
    pub original_topic: Topic,
    pub original_message_id: String,
    pub error: String,
    pub failed_at: DateTime<Utc>,
    pub attempts: u32,
    /// The failed message's body, verbatim
    pub payload: String,
    pub headers: MessageHeaders,
}

impl DeadLetterEnvelope {
    /// Envelope for a record that failed before ever reaching the bus
    /// (normalization or validation failures on the ingest path)
    pub fn from_record(
        original_topic: Topic,
        record_id: &str,
        error: &IngestionError,
        payload: String,
        headers: MessageHeaders,
    ) -> Self {
        Self {
            original_topic,
            original_message_id: record_id.to_string(),
            error: error.to_string(),
            failed_at: Utc::now(),
            attempts: 1,
            payload,
            headers,
        }
    }

    pub fn from_failure(message: &BusMessage, error: &IngestionError, attempts: u32) -> Self {
        Self {
            original_topic: message.topic,
            original_message_id: message.id.clone(),
            error: error.to_string(),
            failed_at: Utc::now(),
            attempts,
            payload: message.payload.clone(),
            headers: message.headers.clone(),
        }
    }
}

/// Bounds for a replay read. Offsets held by live consumer groups are
/// never touched; replay is a side read.
#[derive(Debug, Clone, Default)]
pub struct ReplayFilter {
    /// Restrict to one partition; all partitions otherwise
    pub partition: Option<u32>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub platform: Option<Platform>,
    pub limit: Option<usize>,
}

/// Producer/admin surface of the transport
#[async_trait]
pub trait StreamingBus: Send + Sync {
    /// Provisions every topic partition (idempotent)
    async fn create_topics(&self) -> Result<()>;

    /// Publishes one message to the partition selected by `key`
    async fn publish(
        &self,
        topic: Topic,
        key: &str,
        headers: MessageHeaders,
        payload: String,
    ) -> Result<PublishReceipt>;

    /// Creates a consumer-group reader over every partition of a topic
    async fn subscribe(
        &self,
        topic: Topic,
        group: &str,
        consumer: &str,
    ) -> Result<Box<dyn TopicConsumer>>;

    /// Re-reads historical messages without moving any group offsets
    async fn replay(&self, topic: Topic, filter: ReplayFilter) -> Result<Vec<BusMessage>>;

    async fn is_healthy(&self) -> bool;

    fn bus_type(&self) -> &'static str;
}

/// Consumer surface of the transport
#[async_trait]
pub trait TopicConsumer: Send + Sync {
    /// Reads up to `count` new messages, waiting at most `timeout`
    async fn read(&mut self, count: usize, timeout: Duration) -> Result<Vec<BusMessage>>;

    /// Marks a message as processed for this group
    async fn ack(&mut self, message: &BusMessage) -> Result<()>;
}

/// Per-message processing callback used by `run_consumer`
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &BusMessage) -> Result<()>;
}

/// Publishes a dead-letter envelope for a failed message
pub async fn publish_dead_letter(
    bus: &dyn StreamingBus,
    producer_id: &str,
    envelope: &DeadLetterEnvelope,
) -> Result<PublishReceipt> {
    let headers = MessageHeaders::new(
        producer_id,
        &envelope.headers.platform,
        &envelope.headers.event_type,
    );
    let payload = serde_json::to_string(envelope).map_err(IngestionError::JsonError)?;
    bus.publish(
        Topic::DeadLetter,
        &envelope.original_message_id,
        headers,
        payload,
    )
    .await
}

/// Re-reads matching history from a topic and publishes it onto the
/// replay topic, leaving the source topic and its group offsets alone.
/// Returns the number of messages replayed.
pub async fn replay_into_topic(
    bus: &dyn StreamingBus,
    producer_id: &str,
    source: Topic,
    filter: ReplayFilter,
) -> Result<usize> {
    let messages = bus.replay(source, filter).await?;
    let count = messages.len();

    for message in messages {
        let key = format!("{}:{}", message.headers.platform, message.headers.event_type);
        let headers = MessageHeaders::new(
            producer_id,
            &message.headers.platform,
            &message.headers.event_type,
        );
        bus.publish(Topic::Replay, &key, headers, message.payload)
            .await?;
    }

    info!(source = %source, count, "Replayed messages onto the replay topic");
    Ok(count)
}

/// Consumer loop: reads, dispatches to the handler, acks.
///
/// A handler failure routes the message to the dead-letter topic and the
/// loop continues; only a shutdown signal or a transport-level subscribe
/// failure ends it. Messages are acked even when dead-lettered, the
/// envelope carries their content.
pub async fn run_consumer(
    bus: Arc<dyn StreamingBus>,
    topic: Topic,
    group: &str,
    consumer_name: &str,
    producer_id: &str,
    handler: Arc<dyn MessageHandler>,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) -> Result<()> {
    let mut consumer = bus.subscribe(topic, group, consumer_name).await?;
    info!(topic = %topic, group = group, consumer = consumer_name, "Consumer started");

    loop {
        let batch = tokio::select! {
            _ = shutdown.recv() => {
                info!(topic = %topic, group = group, "Consumer shutting down");
                return Ok(());
            }
            result = consumer.read(10, Duration::from_secs(5)) => match result {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(topic = %topic, error = %e, "Consumer read failed, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            }
        };

        for message in batch {
            if let Err(e) = handler.handle(&message).await {
                error!(
                    topic = %topic,
                    message_id = %message.id,
                    error = %e,
                    "Handler failed, routing to dead-letter"
                );
                let envelope = DeadLetterEnvelope::from_failure(&message, &e, 1);
                if let Err(dl_err) = publish_dead_letter(bus.as_ref(), producer_id, &envelope).await
                {
                    error!(
                        message_id = %message.id,
                        error = %dl_err,
                        "Dead-letter publish failed, message dropped from group"
                    );
                }
            }
            if let Err(e) = consumer.ack(&message).await {
                warn!(message_id = %message.id, error = %e, "Ack failed");
            }
        }
    }
}

/// Creates a bus from configuration
pub async fn create_bus(
    bus_type: &str,
    redis_url: &str,
    config: BusConfig,
) -> Result<Arc<dyn StreamingBus>> {
    match bus_type.to_lowercase().as_str() {
        "redis" | "redis_streams" => {
            let bus = RedisStreamsBus::connect(redis_url, config).await?;
            Ok(Arc::new(bus))
        }
        "memory" => Ok(Arc::new(MemoryBus::new(config))),
        other => Err(IngestionError::ConfigError(config::ConfigError::Message(
            format!("Unknown bus type: {}", other),
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schemas::event::tests::sample_event;

    #[test]
    fn test_partition_is_stable_and_in_range() {
        for partitions in [1, 2, 6, 12] {
            for key in ["tiktok:POST", "reddit:COMMENT", "rss:POST"] {
                let p = partition_for(key, partitions);
                assert!(p < partitions);
                assert_eq!(p, partition_for(key, partitions));
            }
        }
    }

    #[test]
    fn test_partition_spreads_keys() {
        let partitions = 6;
        let assigned: std::collections::HashSet<u32> = (0..100)
            .map(|i| partition_for(&format!("key-{}", i), partitions))
            .collect();
        assert!(assigned.len() > 1);
    }

    #[test]
    fn test_partition_key_strategies() {
        let event = sample_event();
        assert_eq!(
            PartitionKeyStrategy::PlatformEventType.key_for(&event),
            "tiktok:POST"
        );
        assert_eq!(PartitionKeyStrategy::Platform.key_for(&event), "tiktok");
        assert_eq!(PartitionKeyStrategy::EventId.key_for(&event), event.id);
    }

    #[test]
    fn test_headers_for_event() {
        let event = sample_event();
        let headers = MessageHeaders::for_event("pulse-ingestion", &event);
        assert_eq!(headers.content_type, "application/json");
        assert_eq!(headers.producer, "pulse-ingestion");
        assert_eq!(headers.platform, "tiktok");
        assert_eq!(headers.event_type, "POST");
    }

    #[test]
    fn test_dead_letter_envelope_preserves_payload() {
        let message = BusMessage {
            id: "m1".to_string(),
            topic: Topic::NormalizedEvents,
            partition: 3,
            headers: MessageHeaders::new("pulse-ingestion", "tiktok", "POST"),
            payload: r#"{"hello":"world"}"#.to_string(),
            offset: Some("1-0".to_string()),
        };
        let error = IngestionError::ValidationError("bad record".to_string());

        let envelope = DeadLetterEnvelope::from_failure(&message, &error, 1);
        assert_eq!(envelope.original_topic, Topic::NormalizedEvents);
        assert_eq!(envelope.original_message_id, "m1");
        assert_eq!(envelope.payload, r#"{"hello":"world"}"#);
        assert!(envelope.error.contains("bad record"));
    }

    #[test]
    fn test_topic_names() {
        assert_eq!(Topic::RawEvents.as_str(), "raw-events");
        assert_eq!(Topic::DeadLetter.as_str(), "dead-letter");
        assert_eq!(Topic::ALL.len(), 5);
    }

    #[test]
    fn test_topic_parsing() {
        assert_eq!("normalized-events".parse::<Topic>().unwrap(), Topic::NormalizedEvents);
        assert_eq!("raw".parse::<Topic>().unwrap(), Topic::RawEvents);
        assert!("nonsense".parse::<Topic>().is_err());
    }

    struct FlakyHandler {
        succeed_on: String,
    }

    #[async_trait]
    impl MessageHandler for FlakyHandler {
        async fn handle(&self, message: &BusMessage) -> Result<()> {
            if message.payload.contains(&self.succeed_on) {
                Ok(())
            } else {
                Err(IngestionError::ValidationError("rejected".to_string()))
            }
        }
    }

    #[tokio::test]
    async fn test_consumer_loop_dead_letters_failures_and_survives() {
        let bus: Arc<dyn StreamingBus> = Arc::new(MemoryBus::new(BusConfig {
            partitions: 1,
            ..Default::default()
        }));
        bus.create_topics().await.unwrap();

        let headers = MessageHeaders::new("test", "tiktok", "POST");
        bus.publish(Topic::NormalizedEvents, "k", headers.clone(), "good-1".to_string())
            .await
            .unwrap();
        bus.publish(Topic::NormalizedEvents, "k", headers.clone(), "bad-1".to_string())
            .await
            .unwrap();
        bus.publish(Topic::NormalizedEvents, "k", headers, "good-2".to_string())
            .await
            .unwrap();

        let handler = Arc::new(FlakyHandler {
            succeed_on: "good".to_string(),
        });
        let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
        let loop_bus = bus.clone();
        let consumer = tokio::spawn(async move {
            run_consumer(
                loop_bus,
                Topic::NormalizedEvents,
                "test-group",
                "c1",
                "test",
                handler,
                shutdown_rx,
            )
            .await
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        let _ = shutdown_tx.send(());
        consumer.await.unwrap().unwrap();

        let dead = bus
            .replay(Topic::DeadLetter, ReplayFilter::default())
            .await
            .unwrap();
        assert_eq!(dead.len(), 1);
        let envelope: DeadLetterEnvelope = dead[0].decode().unwrap();
        assert_eq!(envelope.original_topic, Topic::NormalizedEvents);
        assert_eq!(envelope.payload, "bad-1");
        assert!(envelope.error.contains("rejected"));
    }

    #[tokio::test]
    async fn test_replay_into_topic_copies_without_consuming() {
        let bus = MemoryBus::new(BusConfig {
            partitions: 2,
            ..Default::default()
        });
        bus.create_topics().await.unwrap();

        for i in 0..4 {
            bus.publish(
                Topic::NormalizedEvents,
                "tiktok:POST",
                MessageHeaders::new("test", "tiktok", "POST"),
                format!("event-{}", i),
            )
            .await
            .unwrap();
        }

        let count = replay_into_topic(
            &bus,
            "test",
            Topic::NormalizedEvents,
            ReplayFilter {
                limit: Some(3),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(count, 3);
        assert_eq!(bus.topic_len(Topic::Replay), 3);
        // Source topic untouched
        assert_eq!(bus.topic_len(Topic::NormalizedEvents), 4);
    }
}
