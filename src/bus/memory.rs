//! In-process bus
//!
//! Same topic/partition semantics as the Redis transport but backed by
//! per-partition logs in memory. Used by tests and single-node
//! deployments that do not want a Redis dependency. Messages are
//! considered delivered once read; there is no redelivery.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use super::{
    partition_for, BusConfig, BusMessage, MessageHeaders, PublishReceipt, ReplayFilter,
    StreamingBus, Topic, TopicConsumer,
};
use crate::error::Result;

#[derive(Default)]
struct PartitionLog {
    next_seq: u64,
    entries: VecDeque<(u64, BusMessage)>,
}

#[derive(Default)]
struct State {
    logs: HashMap<(Topic, u32), PartitionLog>,
    /// Next unread sequence per (topic, partition, group)
    group_offsets: HashMap<(Topic, u32, String), u64>,
}

pub struct MemoryBus {
    config: BusConfig,
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
}

impl MemoryBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(State::default())),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Total messages currently retained on a topic
    pub fn topic_len(&self, topic: Topic) -> usize {
        let state = self.state.lock();
        (0..self.config.partitions)
            .filter_map(|p| state.logs.get(&(topic, p)))
            .map(|log| log.entries.len())
            .sum()
    }
}

#[async_trait]
impl StreamingBus for MemoryBus {
    async fn create_topics(&self) -> Result<()> {
        let mut state = self.state.lock();
        for topic in Topic::ALL {
            for partition in 0..self.config.partitions {
                state.logs.entry((topic, partition)).or_default();
            }
        }
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
        let message_id = uuid::Uuid::new_v4().to_string();

        let offset = {
            let mut state = self.state.lock();
            let log = state.logs.entry((topic, partition)).or_default();
            let seq = log.next_seq;
            log.next_seq += 1;

            log.entries.push_back((
                seq,
                BusMessage {
                    id: message_id.clone(),
                    topic,
                    partition,
                    headers,
                    payload,
                    offset: Some(seq.to_string()),
                },
            ));

            if let Some(max_len) = self.config.retention_for(topic) {
                while log.entries.len() as u64 > max_len {
                    log.entries.pop_front();
                }
            }

            seq
        };

        self.notify.notify_waiters();

        Ok(PublishReceipt {
            message_id,
            topic,
            partition,
            offset: offset.to_string(),
        })
    }

    async fn subscribe(
        &self,
        topic: Topic,
        group: &str,
        _consumer: &str,
    ) -> Result<Box<dyn TopicConsumer>> {
        Ok(Box::new(MemoryConsumer {
            state: Arc::clone(&self.state),
            notify: Arc::clone(&self.notify),
            topic,
            partitions: self.config.partitions,
            group: group.to_string(),
        }))
    }

    async fn replay(&self, topic: Topic, filter: ReplayFilter) -> Result<Vec<BusMessage>> {
        let state = self.state.lock();
        let partitions: Vec<u32> = match filter.partition {
            Some(p) => vec![p],
            None => (0..self.config.partitions).collect(),
        };

        let mut messages = Vec::new();
        for partition in partitions {
            if let Some(log) = state.logs.get(&(topic, partition)) {
                for (_, message) in &log.entries {
                    let after_from = filter
                        .from
                        .map_or(true, |from| message.headers.timestamp >= from);
                    let before_to = filter.to.map_or(true, |to| message.headers.timestamp <= to);
                    let platform_ok = filter
                        .platform
                        .map_or(true, |p| message.headers.platform == p.as_str());
                    if after_from && before_to && platform_ok {
                        messages.push(message.clone());
                    }
                }
            }
        }

        messages.sort_by_key(|m| m.headers.timestamp);
        if let Some(limit) = filter.limit {
            messages.truncate(limit);
        }
        Ok(messages)
    }

    async fn is_healthy(&self) -> bool {
        true
    }

    fn bus_type(&self) -> &'static str {
        "memory"
    }
}

pub struct MemoryConsumer {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
    topic: Topic,
    partitions: u32,
    group: String,
}

impl MemoryConsumer {
    /// Drains available messages and advances the group offsets
    fn poll(&self, count: usize) -> Vec<BusMessage> {
        let mut state = self.state.lock();
        let mut messages = Vec::new();

        for partition in 0..self.partitions {
            if messages.len() >= count {
                break;
            }

            let offset_key = (self.topic, partition, self.group.clone());
            let current = state.group_offsets.get(&offset_key).copied().unwrap_or(0);
            let mut new_offset = current;

            if let Some(log) = state.logs.get(&(self.topic, partition)) {
                for (seq, message) in &log.entries {
                    if *seq < current || messages.len() >= count {
                        continue;
                    }
                    messages.push(message.clone());
                    new_offset = seq + 1;
                }
            }

            if new_offset != current {
                state.group_offsets.insert(offset_key, new_offset);
            }
        }

        messages
    }
}

#[async_trait]
impl TopicConsumer for MemoryConsumer {
    async fn read(&mut self, count: usize, timeout: Duration) -> Result<Vec<BusMessage>> {
        let deadline = Utc::now() + chrono::Duration::from_std(timeout).unwrap_or_default();

        loop {
            let messages = self.poll(count);
            if !messages.is_empty() {
                return Ok(messages);
            }

            let remaining = deadline - Utc::now();
            if remaining <= chrono::Duration::zero() {
                return Ok(Vec::new());
            }

            let wait = remaining.to_std().unwrap_or(Duration::from_millis(1));
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(wait) => return Ok(self.poll(count)),
            }
        }
    }

    async fn ack(&mut self, _message: &BusMessage) -> Result<()> {
        // Delivery advanced the group offset already
        Ok(())
    }
}
