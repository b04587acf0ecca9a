//! Platform adapters
//!
//! Each platform implements the `PlatformAdapter` trait for unified
//! ingestion: authenticate, fetch raw records page by page, normalize one
//! record at a time, and back off on rate limits.

pub mod meta;
pub mod reddit;
pub mod rss;
pub mod tiktok;
pub mod youtube;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{IngestionError, Result};
use crate::normalize;
use crate::schemas::{Platform, RawPlatformData, SocialEvent};

/// Tokens are refreshed when expiry is closer than this buffer.
pub const TOKEN_REFRESH_BUFFER_SECS: i64 = 300;

/// Floor and ceiling for rate-limit backoff sleeps.
pub const MIN_BACKOFF_MS: u64 = 1_000;
pub const MAX_BACKOFF_MS: u64 = 60_000;

/// OAuth-style token owned by exactly one adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthToken {
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub scopes: Vec<String>,
    pub platform: Platform,
    pub token_type: String,
}

impl AuthToken {
    pub fn bearer(
        platform: Platform,
        access_token: impl Into<String>,
        expires_in_secs: i64,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expires_at: Utc::now() + ChronoDuration::seconds(expires_in_secs),
            scopes: vec![],
            platform,
            token_type: "Bearer".to_string(),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// True once the token is within the refresh buffer of expiry
    pub fn needs_refresh(&self) -> bool {
        Utc::now() + ChronoDuration::seconds(TOKEN_REFRESH_BUFFER_SECS) >= self.expires_at
    }
}

/// Shared token slot used by adapters for authenticated -> refresh cycling
#[derive(Default)]
pub struct TokenStore {
    inner: tokio::sync::RwLock<Option<AuthToken>>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self) -> Option<AuthToken> {
        self.inner.read().await.clone()
    }

    pub async fn set(&self, token: AuthToken) {
        *self.inner.write().await = Some(token);
    }

    pub async fn clear(&self) {
        *self.inner.write().await = None;
    }
}

/// Rate-limit state reported by a platform response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub reset_at: Option<DateTime<Utc>>,
}

/// Parameters for a fetch call
#[derive(Debug, Clone, Default)]
pub struct FetchParams {
    /// Fetch records since this time
    pub since: Option<DateTime<Utc>>,
    /// Fetch records until this time
    pub until: Option<DateTime<Utc>>,
    /// Maximum number of records to fetch
    pub limit: Option<u32>,
    /// Pagination cursor
    pub cursor: Option<String>,
    /// Keyword filters (platform-dependent semantics)
    pub keywords: Vec<String>,
}

impl FetchParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn cursor(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }

    pub fn keyword(mut self, keyword: impl Into<String>) -> Self {
        self.keywords.push(keyword.into());
        self
    }
}

/// One page of raw records from a platform
#[derive(Debug)]
pub struct FetchPage {
    pub data: Vec<RawPlatformData>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
    pub rate_limit: Option<RateLimitInfo>,
}

impl FetchPage {
    pub fn empty() -> Self {
        Self {
            data: vec![],
            next_cursor: None,
            has_more: false,
            rate_limit: None,
        }
    }

    pub fn with_data(data: Vec<RawPlatformData>) -> Self {
        Self {
            data,
            next_cursor: None,
            has_more: false,
            rate_limit: None,
        }
    }
}

/// Per-adapter counters, updated lock-free from the fetch path
#[derive(Default)]
pub struct AdapterMetrics {
    events_processed: AtomicU64,
    errors_encountered: AtomicU64,
    rate_limit_hits: AtomicU64,
    processing_time_ms_total: AtomicU64,
    processing_samples: AtomicU64,
}

impl AdapterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_events(&self, count: u64) {
        self.events_processed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors_encountered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limit_hit(&self) {
        self.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processing_time(&self, elapsed: Duration) {
        self.processing_time_ms_total
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
        self.processing_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AdapterMetricsSnapshot {
        let samples = self.processing_samples.load(Ordering::Relaxed);
        let total = self.processing_time_ms_total.load(Ordering::Relaxed);
        AdapterMetricsSnapshot {
            events_processed: self.events_processed.load(Ordering::Relaxed),
            errors_encountered: self.errors_encountered.load(Ordering::Relaxed),
            rate_limit_hits: self.rate_limit_hits.load(Ordering::Relaxed),
            average_processing_time_ms: if samples == 0 {
                0.0
            } else {
                total as f64 / samples as f64
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AdapterMetricsSnapshot {
    pub events_processed: u64,
    pub errors_encountered: u64,
    pub rate_limit_hits: u64,
    pub average_processing_time_ms: f64,
}

/// Computes the backoff sleep for a rate-limit error.
///
/// Honors the platform's retry-after hint when present, otherwise doubles
/// per attempt. Always at least `MIN_BACKOFF_MS`, jittered, and never at or
/// above 61s.
pub fn rate_limit_backoff(retry_after_secs: Option<u64>, attempt: u32) -> Duration {
    let base_ms = match retry_after_secs {
        Some(secs) => secs.saturating_mul(1000),
        None => MIN_BACKOFF_MS.saturating_mul(1u64 << attempt.min(6)),
    };
    let clamped = base_ms.clamp(MIN_BACKOFF_MS, MAX_BACKOFF_MS);
    let jitter = (rand::random::<f64>() * 999.0) as u64;
    Duration::from_millis(clamped + jitter)
}

/// Contract shared by every platform adapter
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    /// Which platform this adapter covers
    fn platform(&self) -> Platform;

    /// Per-adapter counters
    fn metrics(&self) -> &AdapterMetrics;

    /// Exchanges configured credentials for a token.
    /// Fails with `AuthenticationError` on bad credentials; not retried.
    async fn authenticate(&self) -> Result<AuthToken>;

    /// Obtains a fresh token using the refresh grant
    async fn refresh_token(&self, token: &AuthToken) -> Result<AuthToken>;

    /// Fetches one page of raw records
    async fn fetch_data(&self, params: FetchParams) -> Result<FetchPage>;

    /// Maps one raw record to the canonical schema.
    /// Webhook payloads go through this exact same path.
    fn normalize_data(&self, raw: &RawPlatformData) -> Result<SocialEvent> {
        normalize::normalize(raw)
    }

    /// Sleeps out a rate-limit error. Suspends only this adapter's task.
    async fn handle_rate_limit(&self, err: &IngestionError, attempt: u32) {
        let retry_after = match err {
            IngestionError::RateLimitError {
                retry_after,
                reset_time,
                ..
            } => retry_after.or_else(|| {
                reset_time.map(|r| (r - Utc::now()).num_seconds().max(0) as u64)
            }),
            _ => None,
        };

        self.metrics().record_rate_limit_hit();
        let delay = rate_limit_backoff(retry_after, attempt);
        warn!(
            platform = %self.platform(),
            delay_ms = delay.as_millis() as u64,
            attempt = attempt,
            "Rate limited, backing off"
        );
        tokio::time::sleep(delay).await;
    }

    /// Checks if the platform API is reachable
    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

/// Fetches a page, refreshing the token first when it is near expiry.
///
/// Shared helper so every adapter cycles tokens the same way:
/// unauthenticated -> authenticated -> (near-expiry) refresh -> authenticated.
pub async fn ensure_token(
    adapter: &dyn PlatformAdapter,
    store: &TokenStore,
) -> Result<AuthToken> {
    match store.get().await {
        Some(token) if !token.needs_refresh() => Ok(token),
        Some(token) => {
            debug!(platform = %adapter.platform(), "Token near expiry, refreshing");
            match adapter.refresh_token(&token).await {
                Ok(fresh) => {
                    store.set(fresh.clone()).await;
                    Ok(fresh)
                }
                Err(e) => {
                    warn!(platform = %adapter.platform(), error = %e, "Refresh failed, re-authenticating");
                    let fresh = adapter.authenticate().await?;
                    store.set(fresh.clone()).await;
                    Ok(fresh)
                }
            }
        }
        None => {
            let token = adapter.authenticate().await?;
            store.set(token.clone()).await;
            Ok(token)
        }
    }
}

pub use meta::MetaAdapter;
pub use reddit::RedditAdapter;
pub use rss::RssAdapter;
pub use tiktok::TikTokAdapter;
pub use youtube::YouTubeAdapter;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_refresh_buffer() {
        let fresh = AuthToken::bearer(Platform::Tiktok, "tok", 3600);
        assert!(!fresh.is_expired());
        assert!(!fresh.needs_refresh());

        let near_expiry = AuthToken::bearer(Platform::Tiktok, "tok", 120);
        assert!(!near_expiry.is_expired());
        assert!(near_expiry.needs_refresh());

        let expired = AuthToken::bearer(Platform::Tiktok, "tok", -10);
        assert!(expired.is_expired());
    }

    #[test]
    fn test_backoff_bounds() {
        // retry_after honored, floor applied, hard cap below 61s
        for attempt in 0..10 {
            for retry_after in [None, Some(0), Some(1), Some(30), Some(120), Some(10_000)] {
                let delay = rate_limit_backoff(retry_after, attempt);
                let ms = delay.as_millis() as u64;
                let floor = retry_after
                    .map(|r| std::cmp::min(r * 1000, MIN_BACKOFF_MS))
                    .unwrap_or(MIN_BACKOFF_MS);
                assert!(ms >= floor, "delay {}ms below floor {}ms", ms, floor);
                assert!(ms < 61_000, "delay {}ms at or above 61s", ms);
            }
        }
    }

    #[test]
    fn test_backoff_respects_retry_after() {
        let delay = rate_limit_backoff(Some(30), 0);
        assert!(delay.as_millis() >= 30_000);
        assert!(delay.as_millis() < 31_000);
    }

    #[test]
    fn test_adapter_metrics_average() {
        let metrics = AdapterMetrics::new();
        metrics.record_events(10);
        metrics.record_processing_time(Duration::from_millis(100));
        metrics.record_processing_time(Duration::from_millis(300));

        let snap = metrics.snapshot();
        assert_eq!(snap.events_processed, 10);
        assert!((snap.average_processing_time_ms - 200.0).abs() < f64::EPSILON);
    }
}
