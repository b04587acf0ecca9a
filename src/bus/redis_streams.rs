//! Redis Streams transport
//!
//! Each topic partition is its own stream, named
//! `{prefix}:{topic}:{partition}`. Publishes are atomic XADDs capped with
//! approximate MAXLEN trimming; consumer groups are created with MKSTREAM
//! and a BUSYGROUP reply is treated as success. Replay uses XRANGE, which
//! reads history without touching any consumer-group offset.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{
    aio::ConnectionManager,
    streams::{StreamReadOptions, StreamReadReply},
    AsyncCommands, Client, RedisResult,
};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{
    partition_for, BusConfig, BusMessage, MessageHeaders, PublishReceipt, ReplayFilter,
    StreamingBus, Topic, TopicConsumer,
};
use crate::error::{IngestionError, Result};

pub struct RedisStreamsBus {
    conn: ConnectionManager,
    config: BusConfig,
}

impl RedisStreamsBus {
    pub async fn connect(url: &str, config: BusConfig) -> Result<Self> {
        let client = Client::open(url).map_err(IngestionError::RedisError)?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(IngestionError::RedisError)?;

        info!(
            prefix = %config.prefix,
            partitions = config.partitions,
            "Connected to Redis Streams"
        );

        Ok(Self { conn, config })
    }

    fn stream_name(&self, topic: Topic, partition: u32) -> String {
        stream_name(&self.config.prefix, topic, partition)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut conn = self.conn.clone();

        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => {
                debug!(stream = %stream, group = %group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(IngestionError::RedisError(e)),
        }
    }
}

fn stream_name(prefix: &str, topic: Topic, partition: u32) -> String {
    format!("{}:{}:{}", prefix, topic.as_str(), partition)
}

/// Partition index is the last stream-name segment
fn partition_from_stream(stream: &str) -> u32 {
    stream
        .rsplit(':')
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

/// Numeric ordering for stream entry ids ("{millis}-{seq}"); a string
/// compare would put "10-0" before "9-0"
fn parse_stream_id(id: &str) -> (u64, u64) {
    match id.split_once('-') {
        Some((ms, seq)) => (ms.parse().unwrap_or(0), seq.parse().unwrap_or(0)),
        None => (id.parse().unwrap_or(0), 0),
    }
}

fn field_str(map: &HashMap<String, redis::Value>, key: &str) -> Option<String> {
    match map.get(key) {
        Some(redis::Value::BulkString(bytes)) => {
            Some(String::from_utf8_lossy(bytes).into_owned())
        }
        Some(redis::Value::SimpleString(s)) => Some(s.clone()),
        _ => None,
    }
}

fn entry_to_message(
    topic: Topic,
    partition: u32,
    entry_id: &str,
    map: &HashMap<String, redis::Value>,
) -> Option<BusMessage> {
    let payload = field_str(map, "payload")?;
    let headers = MessageHeaders {
        content_type: field_str(map, "content-type")
            .unwrap_or_else(|| "application/json".to_string()),
        producer: field_str(map, "producer").unwrap_or_default(),
        timestamp: field_str(map, "timestamp")
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now),
        platform: field_str(map, "platform").unwrap_or_default(),
        event_type: field_str(map, "event-type").unwrap_or_default(),
    };

    Some(BusMessage {
        id: field_str(map, "message-id").unwrap_or_else(|| entry_id.to_string()),
        topic,
        partition,
        headers,
        payload,
        offset: Some(entry_id.to_string()),
    })
}

#[async_trait]
impl StreamingBus for RedisStreamsBus {
    async fn create_topics(&self) -> Result<()> {
        // MKSTREAM against a bootstrap group materializes empty streams
        for topic in Topic::ALL {
            for partition in 0..self.config.partitions {
                let stream = self.stream_name(topic, partition);
                self.ensure_group(&stream, "pulse-bootstrap").await?;
            }
        }
        info!(
            topics = Topic::ALL.len(),
            partitions = self.config.partitions,
            "Provisioned topics"
        );
        Ok(())
    }

    async fn publish(
        &self,
        topic: Topic,
        key: &str,
        headers: MessageHeaders,
        payload: String,
    ) -> Result<PublishReceipt> {
        let partition = partition_for(key, self.config.partitions);
        let stream = self.stream_name(topic, partition);
        let message_id = uuid::Uuid::new_v4().to_string();
        let mut conn = self.conn.clone();

        let mut cmd = redis::cmd("XADD");
        cmd.arg(&stream);
        if let Some(max_len) = self.config.retention_for(topic) {
            cmd.arg("MAXLEN").arg("~").arg(max_len);
        }
        cmd.arg("*")
            .arg("message-id")
            .arg(&message_id)
            .arg("content-type")
            .arg(&headers.content_type)
            .arg("producer")
            .arg(&headers.producer)
            .arg("timestamp")
            .arg(headers.timestamp.to_rfc3339())
            .arg("platform")
            .arg(&headers.platform)
            .arg("event-type")
            .arg(&headers.event_type)
            .arg("payload")
            .arg(&payload);

        let offset: String = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| IngestionError::StreamingTransportError(e.to_string()))?;

        debug!(
            topic = %topic,
            partition = partition,
            offset = %offset,
            "Published message"
        );

        Ok(PublishReceipt {
            message_id,
            topic,
            partition,
            offset,
        })
    }

    async fn subscribe(
        &self,
        topic: Topic,
        group: &str,
        consumer: &str,
    ) -> Result<Box<dyn TopicConsumer>> {
        let streams: Vec<String> = (0..self.config.partitions)
            .map(|p| self.stream_name(topic, p))
            .collect();

        for stream in &streams {
            self.ensure_group(stream, group).await?;
        }

        Ok(Box::new(RedisTopicConsumer {
            conn: self.conn.clone(),
            topic,
            streams,
            group: group.to_string(),
            consumer: consumer.to_string(),
        }))
    }

    async fn replay(&self, topic: Topic, filter: ReplayFilter) -> Result<Vec<BusMessage>> {
        let start = filter
            .from
            .map(|t| format!("{}-0", t.timestamp_millis()))
            .unwrap_or_else(|| "-".to_string());
        let end = filter
            .to
            .map(|t| t.timestamp_millis().to_string())
            .unwrap_or_else(|| "+".to_string());

        let partitions: Vec<u32> = match filter.partition {
            Some(p) => vec![p],
            None => (0..self.config.partitions).collect(),
        };

        let mut conn = self.conn.clone();
        let mut messages = Vec::new();

        for partition in partitions {
            let stream = self.stream_name(topic, partition);
            let reply: redis::streams::StreamRangeReply = redis::cmd("XRANGE")
                .arg(&stream)
                .arg(&start)
                .arg(&end)
                .query_async(&mut conn)
                .await
                .map_err(|e| IngestionError::StreamingTransportError(e.to_string()))?;

            for entry in reply.ids {
                if let Some(message) = entry_to_message(topic, partition, &entry.id, &entry.map) {
                    let platform_ok = filter
                        .platform
                        .map_or(true, |p| message.headers.platform == p.as_str());
                    if platform_ok {
                        messages.push(message);
                    }
                }
            }
        }

        messages.sort_by_key(|m| m.offset.as_deref().map(parse_stream_id).unwrap_or((0, 0)));
        if let Some(limit) = filter.limit {
            messages.truncate(limit);
        }

        info!(topic = %topic, messages = messages.len(), "Replay read complete");
        Ok(messages)
    }

    async fn is_healthy(&self) -> bool {
        let mut conn = self.conn.clone();
        let result: RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        result.is_ok()
    }

    fn bus_type(&self) -> &'static str {
        "redis_streams"
    }
}

pub struct RedisTopicConsumer {
    conn: ConnectionManager,
    topic: Topic,
    streams: Vec<String>,
    group: String,
    consumer: String,
}

#[async_trait]
impl TopicConsumer for RedisTopicConsumer {
    async fn read(&mut self, count: usize, timeout: Duration) -> Result<Vec<BusMessage>> {
        let opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(count)
            .block(timeout.as_millis() as usize);

        let keys: Vec<&str> = self.streams.iter().map(String::as_str).collect();
        let ids: Vec<&str> = self.streams.iter().map(|_| ">").collect();

        let result: RedisResult<StreamReadReply> =
            self.conn.xread_options(&keys, &ids, &opts).await;

        match result {
            Ok(reply) => {
                let mut messages = Vec::new();
                for stream_key in reply.keys {
                    let partition = partition_from_stream(&stream_key.key);
                    for entry in stream_key.ids {
                        match entry_to_message(self.topic, partition, &entry.id, &entry.map) {
                            Some(message) => messages.push(message),
                            None => {
                                warn!(
                                    stream = %stream_key.key,
                                    entry = %entry.id,
                                    "Skipping entry without payload"
                                );
                            }
                        }
                    }
                }
                Ok(messages)
            }
            // A blocked read that times out reports no messages
            Err(e) if e.is_timeout() => Ok(Vec::new()),
            Err(e) => Err(IngestionError::StreamingTransportError(e.to_string())),
        }
    }

    async fn ack(&mut self, message: &BusMessage) -> Result<()> {
        let offset = match message.offset {
            Some(ref offset) => offset,
            None => return Ok(()),
        };

        // Stream prefix is everything before the topic segment
        let stream = self
            .streams
            .iter()
            .find(|s| s.ends_with(&format!(":{}", message.partition)))
            .ok_or_else(|| {
                IngestionError::StreamingTransportError(format!(
                    "No stream for partition {}",
                    message.partition
                ))
            })?;

        let _: () = redis::cmd("XACK")
            .arg(stream)
            .arg(&self.group)
            .arg(offset)
            .query_async(&mut self.conn)
            .await
            .map_err(|e| IngestionError::StreamingTransportError(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_naming() {
        assert_eq!(
            stream_name("pulse", Topic::RawEvents, 3),
            "pulse:raw-events:3"
        );
        assert_eq!(partition_from_stream("pulse:raw-events:3"), 3);
        assert_eq!(partition_from_stream("pulse:dead-letter:0"), 0);
    }

    #[test]
    fn test_stream_id_ordering_is_numeric() {
        assert_eq!(parse_stream_id("1700000000000-0"), (1_700_000_000_000, 0));
        assert_eq!(parse_stream_id("9-0"), (9, 0));
        assert!(parse_stream_id("9-0") < parse_stream_id("10-0"));
        assert!(parse_stream_id("5-2") < parse_stream_id("5-10"));

        let mut ids = vec!["10-0", "9-0", "100-1", "9-2"];
        ids.sort_by_key(|id| parse_stream_id(id));
        assert_eq!(ids, vec!["9-0", "9-2", "10-0", "100-1"]);
    }

    #[test]
    fn test_entry_to_message() {
        let mut map = HashMap::new();
        map.insert(
            "payload".to_string(),
            redis::Value::BulkString(br#"{"a":1}"#.to_vec()),
        );
        map.insert(
            "message-id".to_string(),
            redis::Value::BulkString(b"m1".to_vec()),
        );
        map.insert(
            "platform".to_string(),
            redis::Value::BulkString(b"tiktok".to_vec()),
        );
        map.insert(
            "event-type".to_string(),
            redis::Value::BulkString(b"POST".to_vec()),
        );

        let message = entry_to_message(Topic::RawEvents, 2, "123-0", &map).unwrap();
        assert_eq!(message.id, "m1");
        assert_eq!(message.partition, 2);
        assert_eq!(message.headers.platform, "tiktok");
        assert_eq!(message.offset.as_deref(), Some("123-0"));
    }

    #[test]
    fn test_entry_without_payload_skipped() {
        let map = HashMap::new();
        assert!(entry_to_message(Topic::RawEvents, 0, "1-0", &map).is_none());
    }
}
