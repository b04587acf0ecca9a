//! Configuration for the ingestion service

use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // Platform credentials
    pub tiktok_client_key: Option<String>,
    pub tiktok_client_secret: Option<String>,
    pub meta_access_token: Option<String>,
    pub meta_app_secret: Option<String>,
    pub youtube_api_key: Option<String>,
    pub reddit_client_id: Option<String>,
    pub reddit_client_secret: Option<String>,
    pub reddit_refresh_token: Option<String>,
    /// Comma-separated feed URLs for the RSS adapter
    pub rss_feed_urls: Option<String>,

    // Database / transport
    pub database_url: Option<String>,
    pub redis_url: Option<String>,

    // Rate limiting (requests per minute)
    #[serde(default = "default_rate_limit")]
    pub tiktok_rate_limit_rpm: u32,
    #[serde(default = "default_rate_limit")]
    pub meta_rate_limit_rpm: u32,
    #[serde(default = "default_youtube_rate_limit")]
    pub youtube_rate_limit_rpm: u32,
    #[serde(default = "default_rate_limit")]
    pub reddit_rate_limit_rpm: u32,
    #[serde(default = "default_rss_rate_limit")]
    pub rss_rate_limit_rpm: u32,

    // Ingestion orchestration
    #[serde(default = "default_adapter_batch_size")]
    pub adapter_batch_size: usize,
    #[serde(default = "default_batch_delay")]
    pub batch_delay_ms: u64,
    #[serde(default = "default_ingest_interval")]
    pub ingest_interval_ms: u64,
    #[serde(default = "default_fetch_limit")]
    pub fetch_limit: u32,

    // Concurrency
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    // Circuit breaker
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_failure_threshold: u32,
    #[serde(default = "default_circuit_breaker_timeout")]
    pub circuit_breaker_open_duration_secs: u64,

    // Deduplication
    #[serde(default = "default_dedup_cache_size")]
    pub dedup_cache_size: usize,
    #[serde(default = "default_dedup_window")]
    pub dedup_window_secs: i64,
    #[serde(default = "default_dedup_flush_interval")]
    pub dedup_flush_interval_secs: u64,
    #[serde(default = "default_dedup_ttl")]
    pub dedup_retention_secs: u64,

    // Streaming bus
    #[serde(default = "default_bus_type")]
    pub bus_type: String,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default = "default_partitions")]
    pub topic_partitions: u32,
    #[serde(default = "default_retention")]
    pub topic_retention_max_len: u64,
    #[serde(default = "default_producer_id")]
    pub producer_id: String,
    /// Partition key derivation: "platform", "event_id", or "platform_event_type"
    #[serde(default = "default_partition_key")]
    pub partition_key_strategy: String,

    // Monitoring
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
    #[serde(default = "default_collection_interval")]
    pub system_collection_interval_secs: u64,
    #[serde(default = "default_alert_interval")]
    pub alert_evaluation_interval_secs: u64,
}

fn default_rate_limit() -> u32 {
    60
}

fn default_youtube_rate_limit() -> u32 {
    100 // YouTube Data API quota units are generous for list calls
}

fn default_rss_rate_limit() -> u32 {
    30
}

fn default_adapter_batch_size() -> usize {
    3
}

fn default_batch_delay() -> u64 {
    2000
}

fn default_ingest_interval() -> u64 {
    300_000 // 5 minutes
}

fn default_fetch_limit() -> u32 {
    100
}

fn default_max_concurrent_requests() -> usize {
    10
}

fn default_circuit_breaker_threshold() -> u32 {
    5
}

fn default_circuit_breaker_timeout() -> u64 {
    30
}

fn default_dedup_cache_size() -> usize {
    100_000
}

fn default_dedup_window() -> i64 {
    60
}

fn default_dedup_flush_interval() -> u64 {
    300
}

fn default_dedup_ttl() -> u64 {
    86_400 // 24 hours
}

fn default_bus_type() -> String {
    "redis".to_string()
}

fn default_topic_prefix() -> String {
    "pulse".to_string()
}

fn default_partitions() -> u32 {
    6
}

fn default_retention() -> u64 {
    500_000
}

fn default_producer_id() -> String {
    format!("pulse-ingestion-{}", env!("CARGO_PKG_VERSION"))
}

fn default_partition_key() -> String {
    "platform_event_type".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_collection_interval() -> u64 {
    30
}

fn default_alert_interval() -> u64 {
    60
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load .env file
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Checks if TikTok credentials are present
    pub fn has_tiktok(&self) -> bool {
        self.tiktok_client_key.is_some() && self.tiktok_client_secret.is_some()
    }

    /// Checks if Meta (Instagram/Facebook) credentials are present
    pub fn has_meta(&self) -> bool {
        self.meta_access_token.is_some()
    }

    /// Checks if YouTube is configured
    pub fn has_youtube(&self) -> bool {
        self.youtube_api_key.is_some()
    }

    /// Checks if Reddit is configured
    pub fn has_reddit(&self) -> bool {
        self.reddit_client_id.is_some() && self.reddit_client_secret.is_some()
    }

    /// Checks if any RSS feeds are configured
    pub fn has_rss(&self) -> bool {
        self.rss_feed_urls
            .as_deref()
            .map(|urls| !urls.trim().is_empty())
            .unwrap_or(false)
    }

    /// Parsed list of RSS feed URLs
    pub fn rss_feeds(&self) -> Vec<String> {
        self.rss_feed_urls
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn base_config() -> Config {
        Config {
            tiktok_client_key: None,
            tiktok_client_secret: None,
            meta_access_token: None,
            meta_app_secret: None,
            youtube_api_key: None,
            reddit_client_id: None,
            reddit_client_secret: None,
            reddit_refresh_token: None,
            rss_feed_urls: None,
            database_url: None,
            redis_url: None,
            tiktok_rate_limit_rpm: default_rate_limit(),
            meta_rate_limit_rpm: default_rate_limit(),
            youtube_rate_limit_rpm: default_youtube_rate_limit(),
            reddit_rate_limit_rpm: default_rate_limit(),
            rss_rate_limit_rpm: default_rss_rate_limit(),
            adapter_batch_size: default_adapter_batch_size(),
            batch_delay_ms: default_batch_delay(),
            ingest_interval_ms: default_ingest_interval(),
            fetch_limit: default_fetch_limit(),
            max_concurrent_requests: default_max_concurrent_requests(),
            circuit_breaker_failure_threshold: default_circuit_breaker_threshold(),
            circuit_breaker_open_duration_secs: default_circuit_breaker_timeout(),
            dedup_cache_size: default_dedup_cache_size(),
            dedup_window_secs: default_dedup_window(),
            dedup_flush_interval_secs: default_dedup_flush_interval(),
            dedup_retention_secs: default_dedup_ttl(),
            bus_type: default_bus_type(),
            topic_prefix: default_topic_prefix(),
            topic_partitions: default_partitions(),
            topic_retention_max_len: default_retention(),
            producer_id: default_producer_id(),
            partition_key_strategy: default_partition_key(),
            metrics_port: default_metrics_port(),
            metrics_enabled: default_metrics_enabled(),
            system_collection_interval_secs: default_collection_interval(),
            alert_evaluation_interval_secs: default_alert_interval(),
        }
    }

    #[test]
    fn test_default_values() {
        let config = base_config();
        assert_eq!(config.adapter_batch_size, 3);
        assert_eq!(config.dedup_window_secs, 60);
        assert_eq!(config.max_concurrent_requests, 10);
        assert!(!config.has_tiktok());
    }

    #[test]
    fn test_rss_feed_parsing() {
        let mut config = base_config();
        config.rss_feed_urls =
            Some("https://a.example/feed.xml, https://b.example/rss ,".to_string());
        assert!(config.has_rss());
        assert_eq!(
            config.rss_feeds(),
            vec![
                "https://a.example/feed.xml".to_string(),
                "https://b.example/rss".to_string()
            ]
        );
    }
}
