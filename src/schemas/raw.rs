//! Raw platform records
//!
//! Ephemeral wrapper around an unprocessed platform payload. Consumed by
//! normalization and discarded; only the canonical event survives.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Platform;

/// Shape of the originating record as reported by the platform
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    Post,
    Comment,
    Mention,
    Message,
    Share,
    Reaction,
}

/// How the record entered the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestMetadata {
    /// "poll" or "webhook"
    pub channel: String,
    pub ingested_at: DateTime<Utc>,
    pub correlation_id: String,
}

/// A single unprocessed record fetched from a platform
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPlatformData {
    pub platform: Platform,
    /// Platform-assigned record id
    pub external_id: String,
    /// Record creation time as reported by the platform
    pub timestamp: DateTime<Utc>,
    pub record_type: RecordType,
    /// Opaque platform payload, interpreted only by that platform's rule
    pub payload: serde_json::Value,
    pub metadata: IngestMetadata,
}

impl RawPlatformData {
    pub fn new(
        platform: Platform,
        external_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        record_type: RecordType,
        payload: serde_json::Value,
        correlation_id: &str,
    ) -> Self {
        Self {
            platform,
            external_id: external_id.into(),
            timestamp,
            record_type,
            payload,
            metadata: IngestMetadata {
                channel: "poll".to_string(),
                ingested_at: Utc::now(),
                correlation_id: correlation_id.to_string(),
            },
        }
    }

    /// Marks this record as delivered via webhook push
    pub fn via_webhook(mut self) -> Self {
        self.metadata.channel = "webhook".to_string();
        self
    }
}
