//! Error types for the ingestion pipeline

use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestionError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON parsing failed: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Bad or expired credentials. Not retryable without new credentials.
    #[error("Authentication failed for {platform}: {message}")]
    AuthenticationError { platform: String, message: String },

    /// HTTP 429 from a platform, carrying the reset hints from the response.
    #[error("Rate limit exceeded for {platform}")]
    RateLimitError {
        platform: String,
        retry_after: Option<u64>,
        reset_time: Option<DateTime<Utc>>,
    },

    /// A raw record could not be mapped to the canonical schema.
    #[error("Normalization failed for {platform}/{external_id}: {message}")]
    NormalizationError {
        platform: String,
        external_id: String,
        message: String,
    },

    /// A built event violated a canonical-schema invariant.
    #[error("Invalid event: {0}")]
    ValidationError(String),

    /// Transport-level failure talking to the streaming bus.
    #[error("Streaming transport error: {0}")]
    StreamingTransportError(String),

    /// Dedup cache persistence failed. Non-fatal, cache continues in memory.
    #[error("Deduplication persistence error: {0}")]
    DedupPersistenceError(String),

    #[error("Circuit breaker open for platform: {0}")]
    CircuitBreakerOpen(String),

    #[error("API error: {code} - {message}")]
    ApiError { code: String, message: String },

    #[error("Platform not configured: {0}")]
    PlatformNotConfigured(String),

    #[error("Topic error: {0}")]
    TopicError(String),

    #[error("Ingestion run already in progress")]
    AlreadyRunning,

    #[error("Shutdown requested")]
    ShutdownRequested,
}

impl IngestionError {
    /// Transient errors are retried with capped jittered backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IngestionError::RateLimitError { .. }
                | IngestionError::StreamingTransportError(_)
                | IngestionError::HttpError(_)
        )
    }

    /// Per-record errors route to the dead-letter topic without aborting the batch.
    pub fn is_per_record(&self) -> bool {
        matches!(
            self,
            IngestionError::NormalizationError { .. } | IngestionError::ValidationError(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, IngestionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let rate_limited = IngestionError::RateLimitError {
            platform: "tiktok".to_string(),
            retry_after: Some(30),
            reset_time: None,
        };
        assert!(rate_limited.is_retryable());

        let auth = IngestionError::AuthenticationError {
            platform: "reddit".to_string(),
            message: "invalid_grant".to_string(),
        };
        assert!(!auth.is_retryable());
        assert!(!auth.is_per_record());
    }

    #[test]
    fn test_per_record_classification() {
        let norm = IngestionError::NormalizationError {
            platform: "youtube".to_string(),
            external_id: "vid-1".to_string(),
            message: "missing snippet".to_string(),
        };
        assert!(norm.is_per_record());

        let validation =
            IngestionError::ValidationError("engagement_rate out of range".to_string());
        assert!(validation.is_per_record());
    }
}
