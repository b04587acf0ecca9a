//! Ingestion orchestration
//!
//! Drives the full pipeline: adapters fetch raw records, normalization
//! maps them to canonical events, dedup flags repeats, and survivors are
//! published to the bus. Adapters run in small concurrent batches with a
//! delay between batches; one slow or failing platform never blocks the
//! others, and a cycle settles every platform before reporting.

use chrono::{Duration as ChronoDuration, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::adapters::{
    FetchParams, MetaAdapter, PlatformAdapter, RedditAdapter, RssAdapter, TikTokAdapter,
    YouTubeAdapter,
};
use crate::bus::{
    publish_dead_letter, DeadLetterEnvelope, MessageHeaders, PartitionKeyStrategy, StreamingBus,
    Topic,
};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::config::Config;
use crate::dedup::DedupEngine;
use crate::error::{IngestionError, Result};
use crate::http_client::{HttpClientConfig, ResilientHttpClient};
use crate::monitor::metrics;
use crate::normalize;
use crate::schemas::{Platform, RawPlatformData, RecordType, SocialEvent};

/// Maximum fetch attempts per platform per cycle when rate limited
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Outcome of one full ingestion cycle
#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct IngestionSummary {
    pub total_events: usize,
    pub events_by_platform: HashMap<String, usize>,
    pub duplicates_by_platform: HashMap<String, usize>,
    pub total_errors: usize,
    pub errors_by_platform: HashMap<String, usize>,
    pub successful_platforms: Vec<String>,
    pub failed_platforms: Vec<String>,
    pub processing_time_ms: u64,
}

/// Per-platform outcome of one cycle
struct PlatformOutcome {
    events: usize,
    duplicates: usize,
    errors: usize,
}

pub struct IngestionService {
    config: Config,
    adapters: Vec<Arc<dyn PlatformAdapter>>,
    bus: Arc<dyn StreamingBus>,
    dedup: Arc<DedupEngine>,
    partition_strategy: PartitionKeyStrategy,
    is_running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl IngestionService {
    pub fn new(
        config: Config,
        bus: Arc<dyn StreamingBus>,
        dedup: Arc<DedupEngine>,
    ) -> Result<Self> {
        let http_client = Arc::new(ResilientHttpClient::new(HttpClientConfig {
            max_concurrent_requests: config.max_concurrent_requests,
            ..Default::default()
        })?);

        let cb_config = CircuitBreakerConfig {
            failure_threshold: config.circuit_breaker_failure_threshold,
            open_duration: Duration::from_secs(config.circuit_breaker_open_duration_secs),
            ..Default::default()
        };

        let mut adapters: Vec<Arc<dyn PlatformAdapter>> = Vec::new();

        if config.has_tiktok() {
            adapters.push(Arc::new(TikTokAdapter::new(
                Arc::clone(&http_client),
                config.tiktok_client_key.clone().unwrap_or_default(),
                config.tiktok_client_secret.clone().unwrap_or_default(),
                config.tiktok_rate_limit_rpm,
                Arc::new(CircuitBreaker::new("tiktok", cb_config.clone())),
            )));
            info!("TikTok adapter initialized");
        }

        if config.has_meta() {
            adapters.push(Arc::new(MetaAdapter::new(
                Arc::clone(&http_client),
                config.meta_access_token.clone().unwrap_or_default(),
                config.meta_rate_limit_rpm,
                Arc::new(CircuitBreaker::new("meta", cb_config.clone())),
            )));
            info!("Meta adapter initialized");
        }

        if config.has_youtube() {
            adapters.push(Arc::new(YouTubeAdapter::new(
                Arc::clone(&http_client),
                config.youtube_api_key.clone().unwrap_or_default(),
                config.youtube_rate_limit_rpm,
                Arc::new(CircuitBreaker::new("youtube", cb_config.clone())),
            )));
            info!("YouTube adapter initialized");
        }

        if config.has_reddit() {
            adapters.push(Arc::new(RedditAdapter::new(
                Arc::clone(&http_client),
                config.reddit_client_id.clone().unwrap_or_default(),
                config.reddit_client_secret.clone().unwrap_or_default(),
                config.reddit_refresh_token.clone(),
                config.reddit_rate_limit_rpm,
                Arc::new(CircuitBreaker::new("reddit", cb_config.clone())),
            )));
            info!("Reddit adapter initialized");
        }

        if config.has_rss() {
            adapters.push(Arc::new(RssAdapter::new(
                Arc::clone(&http_client),
                config.rss_feeds(),
                config.rss_rate_limit_rpm,
                Arc::new(CircuitBreaker::new("rss", cb_config.clone())),
            )));
            info!("RSS adapter initialized");
        }

        if adapters.is_empty() {
            warn!("No platforms configured, ingestion cycles will be empty");
        }

        let partition_strategy = config.partition_key_strategy.parse()?;
        let (shutdown_tx, _) = broadcast::channel(4);

        Ok(Self {
            config,
            adapters,
            bus,
            dedup,
            partition_strategy,
            is_running: AtomicBool::new(false),
            shutdown_tx,
        })
    }

    /// Used by tests to inject mock-backed adapters
    #[cfg(test)]
    pub(crate) fn with_adapters(mut self, adapters: Vec<Arc<dyn PlatformAdapter>>) -> Self {
        self.adapters = adapters;
        self
    }

    pub fn platforms(&self) -> Vec<Platform> {
        self.adapters.iter().map(|a| a.platform()).collect()
    }

    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Signals every loop to stop after its current step
    pub fn shutdown(&self) {
        info!("Shutdown requested");
        let _ = self.shutdown_tx.send(());
    }

    /// Runs ingestion cycles on the configured interval until shutdown
    pub async fn run(&self) -> Result<()> {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.ingest_interval_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut shutdown = self.shutdown_tx.subscribe();

        info!(
            interval_ms = self.config.ingest_interval_ms,
            platforms = self.adapters.len(),
            "Ingestion service started"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Ingestion service stopping");
                    return Ok(());
                }
                _ = interval.tick() => {
                    match self.ingest_cycle().await {
                        Ok(summary) => {
                            info!(
                                events = summary.total_events,
                                errors = summary.total_errors,
                                duration_ms = summary.processing_time_ms,
                                "Ingestion cycle complete"
                            );
                        }
                        Err(IngestionError::AlreadyRunning) => {
                            warn!("Previous cycle still running, skipping tick");
                        }
                        Err(e) => {
                            error!(error = %e, "Ingestion cycle failed");
                        }
                    }
                }
            }
        }
    }

    /// Runs one full cycle across every configured platform.
    ///
    /// Only one cycle runs at a time; a second call while one is in
    /// flight fails with `AlreadyRunning`. Adapters execute in batches of
    /// `adapter_batch_size`, and every adapter in a batch settles before
    /// the next batch starts.
    pub async fn ingest_cycle(&self) -> Result<IngestionSummary> {
        if self
            .is_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(IngestionError::AlreadyRunning);
        }

        let started = Instant::now();
        let mut summary = IngestionSummary::default();

        for (batch_index, batch) in self
            .adapters
            .chunks(self.config.adapter_batch_size)
            .enumerate()
        {
            if batch_index > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.batch_delay_ms)).await;
            }

            debug!(
                batch = batch_index,
                adapters = batch.len(),
                "Starting adapter batch"
            );

            let results = join_all(batch.iter().map(|adapter| {
                let adapter = Arc::clone(adapter);
                async move {
                    let platform = adapter.platform();
                    let outcome = self.ingest_platform(adapter.as_ref()).await;
                    (platform, outcome)
                }
            }))
            .await;

            for (platform, outcome) in results {
                let name = platform.to_string();
                match outcome {
                    Ok(outcome) => {
                        summary.total_events += outcome.events;
                        summary.total_errors += outcome.errors;
                        *summary.events_by_platform.entry(name.clone()).or_default() +=
                            outcome.events;
                        *summary
                            .duplicates_by_platform
                            .entry(name.clone())
                            .or_default() += outcome.duplicates;
                        if outcome.errors > 0 {
                            *summary.errors_by_platform.entry(name.clone()).or_default() +=
                                outcome.errors;
                        }
                        summary.successful_platforms.push(name);
                    }
                    Err(e) => {
                        error!(platform = %name, error = %e, "Platform ingestion failed");
                        metrics::record_ingest_error(&name);
                        summary.total_errors += 1;
                        *summary.errors_by_platform.entry(name.clone()).or_default() += 1;
                        summary.failed_platforms.push(name);
                    }
                }
            }
        }

        summary.processing_time_ms = started.elapsed().as_millis() as u64;
        self.is_running.store(false, Ordering::SeqCst);
        Ok(summary)
    }

    /// Fetches, normalizes, dedups and publishes for one platform
    async fn ingest_platform(&self, adapter: &dyn PlatformAdapter) -> Result<PlatformOutcome> {
        let platform = adapter.platform();
        let timer = metrics::StageTimer::start("fetch", platform.as_str());

        let since = Utc::now() - ChronoDuration::milliseconds(self.config.ingest_interval_ms as i64);
        let mut params = FetchParams::new()
            .since(since)
            .limit(self.config.fetch_limit);

        let mut records: Vec<RawPlatformData> = Vec::new();
        let mut attempt = 0u32;

        // Page until the limit is reached, backing off on 429s
        loop {
            match adapter.fetch_data(params.clone()).await {
                Ok(page) => {
                    attempt = 0;
                    records.extend(page.data);
                    let limit_reached = records.len() >= self.config.fetch_limit as usize;
                    match page.next_cursor {
                        Some(cursor) if page.has_more && !limit_reached => {
                            params = params.cursor(cursor);
                        }
                        _ => break,
                    }
                }
                Err(e @ IngestionError::RateLimitError { .. }) => {
                    if attempt >= MAX_RATE_LIMIT_RETRIES {
                        return Err(e);
                    }
                    adapter.handle_rate_limit(&e, attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
        records.truncate(self.config.fetch_limit as usize);
        timer.observe();

        debug!(platform = %platform, records = records.len(), "Fetched raw records");

        let mut outcome = PlatformOutcome {
            events: 0,
            duplicates: 0,
            errors: 0,
        };

        for raw in &records {
            if let Err(e) = self.publish_raw(raw).await {
                warn!(platform = %platform, external_id = %raw.external_id, error = %e, "Raw publish failed");
                outcome.errors += 1;
            }
        }

        let batch = normalize::normalize_batch(records);
        for (raw, error) in batch.failures {
            outcome.errors += 1;
            metrics::record_normalization_failure(platform.as_str());
            self.dead_letter_record(&raw, &error).await;
        }

        for event in batch.events {
            let dedup_outcome = self.dedup.check(&event).await;
            if dedup_outcome.is_duplicate {
                outcome.duplicates += 1;
                metrics::record_duplicate(platform.as_str());
                debug!(
                    platform = %platform,
                    event_id = %event.id,
                    duplicate_of = ?dedup_outcome.duplicate_of,
                    confidence = dedup_outcome.confidence,
                    "Skipping duplicate"
                );
                continue;
            }

            match self.publish_event(&event).await {
                Ok(_) => {
                    outcome.events += 1;
                    metrics::record_event_ingested(platform.as_str(), event.event_type.as_str());
                }
                Err(e) => {
                    warn!(platform = %platform, event_id = %event.id, error = %e, "Publish failed");
                    outcome.errors += 1;
                }
            }
        }

        info!(
            platform = %platform,
            events = outcome.events,
            duplicates = outcome.duplicates,
            errors = outcome.errors,
            "Platform cycle complete"
        );

        Ok(outcome)
    }

    async fn publish_raw(&self, raw: &RawPlatformData) -> Result<()> {
        let headers = MessageHeaders::new(
            &self.config.producer_id,
            raw.platform.as_str(),
            record_type_label(raw.record_type),
        );
        let payload = serde_json::to_string(raw).map_err(IngestionError::JsonError)?;
        let key = format!("{}:{}", raw.platform, record_type_label(raw.record_type));

        self.bus
            .publish(Topic::RawEvents, &key, headers, payload)
            .await?;
        Ok(())
    }

    async fn publish_event(&self, event: &SocialEvent) -> Result<()> {
        let headers = MessageHeaders::for_event(&self.config.producer_id, event);
        let payload = serde_json::to_string(event).map_err(IngestionError::JsonError)?;
        let key = self.partition_strategy.key_for(event);

        self.bus
            .publish(Topic::NormalizedEvents, &key, headers, payload)
            .await?;
        Ok(())
    }

    /// Routes an unprocessable raw record to the dead-letter topic.
    /// Dead-letter failures are logged, never propagated.
    async fn dead_letter_record(&self, raw: &RawPlatformData, error: &IngestionError) {
        let headers = MessageHeaders::new(
            &self.config.producer_id,
            raw.platform.as_str(),
            record_type_label(raw.record_type),
        );
        let payload = serde_json::to_string(raw).unwrap_or_else(|_| raw.payload.to_string());
        let envelope = DeadLetterEnvelope::from_record(
            Topic::RawEvents,
            &raw.external_id,
            error,
            payload,
            headers,
        );

        metrics::record_dead_letter(raw.platform.as_str());
        if let Err(e) =
            publish_dead_letter(self.bus.as_ref(), &self.config.producer_id, &envelope).await
        {
            error!(
                platform = %raw.platform,
                external_id = %raw.external_id,
                error = %e,
                "Dead-letter publish failed"
            );
        }
    }

    /// Feeds a pushed payload through the exact same normalize, dedup and
    /// publish path as polled records. Returns the published event, or
    /// `None` when the record was a duplicate.
    pub async fn handle_webhook(
        &self,
        platform: Platform,
        payload: serde_json::Value,
    ) -> Result<Option<SocialEvent>> {
        let external_id = payload
            .get("id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let raw = RawPlatformData::new(
            platform,
            external_id,
            Utc::now(),
            RecordType::Post,
            payload,
            &uuid::Uuid::new_v4().to_string(),
        )
        .via_webhook();

        self.publish_raw(&raw).await?;

        let event = match normalize::normalize(&raw) {
            Ok(event) => event,
            Err(e) => {
                self.dead_letter_record(&raw, &e).await;
                return Err(e);
            }
        };

        let dedup_outcome = self.dedup.check(&event).await;
        if dedup_outcome.is_duplicate {
            debug!(
                platform = %platform,
                duplicate_of = ?dedup_outcome.duplicate_of,
                "Webhook record was a duplicate"
            );
            return Ok(None);
        }

        self.publish_event(&event).await?;
        metrics::record_event_ingested(platform.as_str(), event.event_type.as_str());
        Ok(Some(event))
    }
}

fn record_type_label(record_type: RecordType) -> &'static str {
    match record_type {
        RecordType::Post => "POST",
        RecordType::Comment => "COMMENT",
        RecordType::Mention => "MENTION",
        RecordType::Message => "MESSAGE",
        RecordType::Share => "SHARE",
        RecordType::Reaction => "REACTION",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{AdapterMetrics, AuthToken, FetchPage};
    use crate::bus::MemoryBus;
    use crate::dedup::DedupConfig;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct StubAdapter {
        platform: Platform,
        records: Vec<RawPlatformData>,
        fail: bool,
        fetch_calls: AtomicU32,
        metrics: AdapterMetrics,
    }

    impl StubAdapter {
        fn new(platform: Platform, records: Vec<RawPlatformData>) -> Self {
            Self {
                platform,
                records,
                fail: false,
                fetch_calls: AtomicU32::new(0),
                metrics: AdapterMetrics::new(),
            }
        }

        fn failing(platform: Platform) -> Self {
            Self {
                platform,
                records: vec![],
                fail: true,
                fetch_calls: AtomicU32::new(0),
                metrics: AdapterMetrics::new(),
            }
        }
    }

    #[async_trait]
    impl PlatformAdapter for StubAdapter {
        fn platform(&self) -> Platform {
            self.platform
        }

        fn metrics(&self) -> &AdapterMetrics {
            &self.metrics
        }

        async fn authenticate(&self) -> Result<AuthToken> {
            Ok(AuthToken::bearer(self.platform, "stub", 3600))
        }

        async fn refresh_token(&self, _token: &AuthToken) -> Result<AuthToken> {
            self.authenticate().await
        }

        async fn fetch_data(&self, _params: FetchParams) -> Result<FetchPage> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(IngestionError::ApiError {
                    code: "500".to_string(),
                    message: "boom".to_string(),
                });
            }
            Ok(FetchPage::with_data(self.records.clone()))
        }
    }

    fn tiktok_record(id: &str, title: &str) -> RawPlatformData {
        RawPlatformData::new(
            Platform::Tiktok,
            id,
            Utc::now(),
            RecordType::Post,
            serde_json::json!({
                "id": id,
                "title": title,
                "like_count": 10,
                "view_count": 100
            }),
            "corr-test",
        )
    }

    fn base_config() -> Config {
        crate::config::tests::base_config()
    }

    async fn service_with(adapters: Vec<Arc<dyn PlatformAdapter>>) -> (IngestionService, Arc<MemoryBus>) {
        let bus = Arc::new(MemoryBus::new(crate::bus::BusConfig::default()));
        let dedup = Arc::new(DedupEngine::new(DedupConfig::default()));
        let service = IngestionService::new(base_config(), bus.clone(), dedup)
            .unwrap()
            .with_adapters(adapters);
        (service, bus)
    }

    #[tokio::test]
    async fn test_cycle_publishes_raw_and_normalized() {
        let adapter = Arc::new(StubAdapter::new(
            Platform::Tiktok,
            vec![tiktok_record("v1", "Hi #one"), tiktok_record("v2", "Yo #two")],
        ));
        let (service, bus) = service_with(vec![adapter]).await;

        let summary = service.ingest_cycle().await.unwrap();
        assert_eq!(summary.total_events, 2);
        assert_eq!(summary.events_by_platform["tiktok"], 2);
        assert_eq!(summary.successful_platforms, vec!["tiktok"]);
        assert!(summary.failed_platforms.is_empty());

        assert_eq!(bus.topic_len(Topic::RawEvents), 2);
        assert_eq!(bus.topic_len(Topic::NormalizedEvents), 2);
        assert_eq!(bus.topic_len(Topic::DeadLetter), 0);
    }

    #[tokio::test]
    async fn test_failing_platform_does_not_block_others() {
        let good = Arc::new(StubAdapter::new(
            Platform::Tiktok,
            vec![tiktok_record("v1", "Hello #tag")],
        ));
        let bad = Arc::new(StubAdapter::failing(Platform::Reddit));
        let (service, _bus) = service_with(vec![bad, good]).await;

        let summary = service.ingest_cycle().await.unwrap();
        assert_eq!(summary.total_events, 1);
        assert_eq!(summary.failed_platforms, vec!["reddit"]);
        assert_eq!(summary.successful_platforms, vec!["tiktok"]);
        assert_eq!(summary.errors_by_platform["reddit"], 1);
    }

    #[tokio::test]
    async fn test_unnormalizable_record_goes_to_dead_letter() {
        let empty = RawPlatformData::new(
            Platform::Tiktok,
            "v-empty",
            Utc::now(),
            RecordType::Post,
            serde_json::json!({}),
            "corr-test",
        );
        let adapter = Arc::new(StubAdapter::new(Platform::Tiktok, vec![empty]));
        let (service, bus) = service_with(vec![adapter]).await;

        let summary = service.ingest_cycle().await.unwrap();
        assert_eq!(summary.total_events, 0);
        assert_eq!(summary.total_errors, 1);
        assert_eq!(bus.topic_len(Topic::DeadLetter), 1);
        // The raw record was still archived to the raw topic
        assert_eq!(bus.topic_len(Topic::RawEvents), 1);
    }

    #[tokio::test]
    async fn test_duplicates_not_republished() {
        let adapter = Arc::new(StubAdapter::new(
            Platform::Tiktok,
            vec![
                tiktok_record("v1", "Same text #tag"),
                tiktok_record("v2", "Same text #tag"),
            ],
        ));
        let (service, bus) = service_with(vec![adapter]).await;

        let summary = service.ingest_cycle().await.unwrap();
        assert_eq!(summary.total_events, 1);
        assert_eq!(summary.duplicates_by_platform["tiktok"], 1);
        assert_eq!(bus.topic_len(Topic::NormalizedEvents), 1);
    }

    #[tokio::test]
    async fn test_concurrent_cycles_rejected() {
        let adapter = Arc::new(StubAdapter::new(Platform::Tiktok, vec![]));
        let (service, _bus) = service_with(vec![adapter]).await;

        service.is_running.store(true, Ordering::SeqCst);
        assert!(matches!(
            service.ingest_cycle().await,
            Err(IngestionError::AlreadyRunning)
        ));

        service.is_running.store(false, Ordering::SeqCst);
        assert!(service.ingest_cycle().await.is_ok());
    }

    #[tokio::test]
    async fn test_webhook_goes_through_normalize_path() {
        let (service, bus) = service_with(vec![]).await;

        let payload = serde_json::json!({
            "id": "hook-1",
            "title": "Webhook post #live",
            "like_count": 5,
            "view_count": 50
        });

        let event = service
            .handle_webhook(Platform::Tiktok, payload.clone())
            .await
            .unwrap()
            .expect("first delivery is unique");
        assert_eq!(event.platform_id, "hook-1");
        assert_eq!(event.content.hashtags, vec!["#live"]);
        assert_eq!(bus.topic_len(Topic::NormalizedEvents), 1);

        // Redelivery of the same payload dedups
        let second = service
            .handle_webhook(Platform::Tiktok, payload)
            .await
            .unwrap();
        assert!(second.is_none());
        assert_eq!(bus.topic_len(Topic::NormalizedEvents), 1);
    }
}
