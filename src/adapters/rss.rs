//! RSS adapter
//!
//! Polls a configured list of RSS/Atom feed URLs. No authentication;
//! `authenticate` hands back a placeholder token so the adapter plumbing
//! stays uniform. A feed that fails to fetch or parse is logged and
//! skipped so one bad feed cannot starve the rest.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::{AdapterMetrics, AuthToken, FetchPage, FetchParams, PlatformAdapter};
use crate::circuit_breaker::CircuitBreaker;
use crate::error::{IngestionError, Result};
use crate::http_client::{PlatformHttpClient, ResilientHttpClient};
use crate::schemas::{Platform, RawPlatformData, RecordType};

pub struct RssAdapter {
    client: PlatformHttpClient,
    feed_urls: Vec<String>,
    metrics: AdapterMetrics,
}

impl RssAdapter {
    pub fn new(
        http_client: Arc<ResilientHttpClient>,
        feed_urls: Vec<String>,
        rate_limit_rpm: u32,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            client: PlatformHttpClient::new(http_client, "rss", rate_limit_rpm, circuit_breaker),
            feed_urls,
            metrics: AdapterMetrics::new(),
        }
    }

    async fn fetch_feed(&self, feed_url: &str, correlation_id: &str) -> Result<Vec<RawPlatformData>> {
        let response = self.client.get(feed_url).await?;
        let bytes = response.bytes().await.map_err(IngestionError::HttpError)?;

        let feed = feed_rs::parser::parse(&bytes[..]).map_err(|e| {
            IngestionError::ValidationError(format!("Feed parse failed for {}: {}", feed_url, e))
        })?;

        let feed_title = feed.title.as_ref().map(|t| t.content.clone());
        let records = feed
            .entries
            .into_iter()
            .filter_map(|entry| entry_to_raw(entry, feed_url, feed_title.as_deref(), correlation_id))
            .collect();

        Ok(records)
    }
}

fn entry_to_raw(
    entry: feed_rs::model::Entry,
    feed_url: &str,
    feed_title: Option<&str>,
    correlation_id: &str,
) -> Option<RawPlatformData> {
    let link = entry.links.first().map(|l| l.href.clone());

    // Feed ids are often the permalink; either works as external id
    let external_id = if entry.id.is_empty() {
        link.clone()?
    } else {
        entry.id.clone()
    };

    let timestamp = entry
        .published
        .or(entry.updated)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    let payload = serde_json::json!({
        "title": entry.title.map(|t| t.content),
        "summary": entry.summary.map(|s| s.content),
        "content": entry.content.and_then(|c| c.body),
        "link": link,
        "author": entry.authors.first().map(|a| a.name.clone()),
        "categories": entry
            .categories
            .iter()
            .map(|c| c.term.clone())
            .collect::<Vec<_>>(),
        "feed_url": feed_url,
        "feed_title": feed_title,
        "published": timestamp.to_rfc3339(),
    });

    Some(RawPlatformData::new(
        Platform::Rss,
        external_id,
        timestamp,
        RecordType::Post,
        payload,
        correlation_id,
    ))
}

#[async_trait]
impl PlatformAdapter for RssAdapter {
    fn platform(&self) -> Platform {
        Platform::Rss
    }

    fn metrics(&self) -> &AdapterMetrics {
        &self.metrics
    }

    async fn authenticate(&self) -> Result<AuthToken> {
        let mut token = AuthToken::bearer(Platform::Rss, "", 365 * 24 * 3600);
        token.token_type = "none".to_string();
        Ok(token)
    }

    async fn refresh_token(&self, _token: &AuthToken) -> Result<AuthToken> {
        self.authenticate().await
    }

    async fn fetch_data(&self, params: FetchParams) -> Result<FetchPage> {
        let started = Instant::now();
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let mut records = Vec::new();
        let mut failed_feeds = 0usize;

        for feed_url in &self.feed_urls {
            debug!(platform = "rss", feed = %feed_url, "Fetching feed");
            match self.fetch_feed(feed_url, &correlation_id).await {
                Ok(entries) => records.extend(entries),
                Err(e) => {
                    failed_feeds += 1;
                    self.metrics.record_error();
                    warn!(platform = "rss", feed = %feed_url, error = %e, "Feed fetch failed");
                }
            }
        }

        // All feeds down is a fetch failure, partial results are not
        if failed_feeds == self.feed_urls.len() && !self.feed_urls.is_empty() {
            return Err(IngestionError::ApiError {
                code: "all_feeds_failed".to_string(),
                message: format!("All {} configured feeds failed", failed_feeds),
            });
        }

        if let Some(since) = params.since {
            records.retain(|r| r.timestamp >= since);
        }
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if let Some(limit) = params.limit {
            records.truncate(limit as usize);
        }

        self.metrics.record_events(records.len() as u64);
        self.metrics.record_processing_time(started.elapsed());

        info!(
            platform = "rss",
            records = records.len(),
            feeds = self.feed_urls.len(),
            failed_feeds = failed_feeds,
            "Fetched feeds"
        );

        Ok(FetchPage::with_data(records))
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(!self.feed_urls.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Example Blog</title>
    <link>https://example.com</link>
    <item>
      <title>Launch day! #announcement</title>
      <link>https://example.com/posts/launch</link>
      <guid>https://example.com/posts/launch</guid>
      <description>We shipped the thing.</description>
      <pubDate>Wed, 15 Jan 2025 10:00:00 GMT</pubDate>
      <category>product</category>
    </item>
  </channel>
</rss>"#;

    #[test]
    fn test_feed_entry_to_raw() {
        let feed = feed_rs::parser::parse(SAMPLE_RSS.as_bytes()).unwrap();
        let feed_title = feed.title.as_ref().map(|t| t.content.clone());
        let entry = feed.entries.into_iter().next().unwrap();

        let raw = entry_to_raw(
            entry,
            "https://example.com/feed.xml",
            feed_title.as_deref(),
            "corr-1",
        )
        .unwrap();

        assert_eq!(raw.platform, Platform::Rss);
        assert_eq!(raw.record_type, RecordType::Post);
        assert_eq!(raw.payload["title"], "Launch day! #announcement");
        assert_eq!(raw.payload["link"], "https://example.com/posts/launch");
        assert_eq!(raw.payload["categories"][0], "product");
        assert_eq!(raw.payload["feed_title"], "Example Blog");
    }

    #[tokio::test]
    async fn test_placeholder_token_never_needs_refresh() {
        let adapter = RssAdapter::new(
            Arc::new(ResilientHttpClient::with_defaults().unwrap()),
            vec!["https://example.com/feed.xml".to_string()],
            60,
            Arc::new(CircuitBreaker::with_defaults("rss")),
        );
        let token = adapter.authenticate().await.unwrap();
        assert!(!token.needs_refresh());
        assert_eq!(token.token_type, "none");
    }
}
