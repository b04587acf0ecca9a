//! YouTube adapter
//!
//! Searches recent videos via the YouTube Data API v3, then hydrates
//! statistics with a videos.list call so engagement counts land in the
//! same payload. API-key auth only, no OAuth dance.
//! https://developers.google.com/youtube/v3/docs/search/list

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::{AdapterMetrics, AuthToken, FetchPage, FetchParams, PlatformAdapter};
use crate::circuit_breaker::CircuitBreaker;
use crate::error::{IngestionError, Result};
use crate::http_client::{PlatformHttpClient, ResilientHttpClient};
use crate::schemas::{Platform, RawPlatformData, RecordType};

const YOUTUBE_BASE_URL: &str = "https://www.googleapis.com/youtube/v3";

/// API keys do not expire; this just keeps the token plumbing uniform
const API_KEY_LIFETIME_SECS: i64 = 365 * 24 * 3600;

#[derive(Debug, Deserialize)]
struct SearchResponse {
    items: Option<Vec<SearchItem>>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
    error: Option<YouTubeError>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    id: SearchItemId,
    snippet: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct SearchItemId {
    #[serde(rename = "videoId")]
    video_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VideosResponse {
    items: Option<Vec<serde_json::Value>>,
    error: Option<YouTubeError>,
}

#[derive(Debug, Deserialize)]
struct YouTubeError {
    code: Option<i64>,
    message: Option<String>,
}

pub struct YouTubeAdapter {
    client: PlatformHttpClient,
    api_key: String,
    base_url: String,
    metrics: AdapterMetrics,
}

impl YouTubeAdapter {
    pub fn new(
        http_client: Arc<ResilientHttpClient>,
        api_key: String,
        rate_limit_rpm: u32,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            client: PlatformHttpClient::new(
                http_client,
                "youtube",
                rate_limit_rpm,
                circuit_breaker,
            ),
            api_key,
            base_url: YOUTUBE_BASE_URL.to_string(),
            metrics: AdapterMetrics::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn check_api_error(&self, error: Option<YouTubeError>) -> Result<()> {
        if let Some(e) = error {
            let code = e.code.unwrap_or(0);
            let message = e.message.unwrap_or_else(|| "Unknown error".to_string());
            if code == 401 || code == 403 {
                return Err(IngestionError::AuthenticationError {
                    platform: "youtube".to_string(),
                    message,
                });
            }
            return Err(IngestionError::ApiError {
                code: code.to_string(),
                message,
            });
        }
        Ok(())
    }

    /// Fetches snippet + statistics for a batch of video ids
    async fn hydrate_videos(&self, ids: &[String]) -> Result<Vec<serde_json::Value>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }

        let url = format!("{}/videos", self.base_url);
        let query = [
            ("part", "snippet,statistics".to_string()),
            ("id", ids.join(",")),
            ("key", self.api_key.clone()),
        ];

        let response = self.client.get_with_query(&url, &query).await?;
        let body: VideosResponse = response.json().await.map_err(IngestionError::HttpError)?;
        self.check_api_error(body.error)?;

        Ok(body.items.unwrap_or_default())
    }

    fn video_to_raw(&self, video: &serde_json::Value, correlation_id: &str) -> Option<RawPlatformData> {
        let id = video.get("id")?.as_str()?.to_string();
        let timestamp = video
            .get("snippet")
            .and_then(|s| s.get("publishedAt"))
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Some(RawPlatformData::new(
            Platform::Youtube,
            id,
            timestamp,
            RecordType::Post,
            video.clone(),
            correlation_id,
        ))
    }
}

#[async_trait]
impl PlatformAdapter for YouTubeAdapter {
    fn platform(&self) -> Platform {
        Platform::Youtube
    }

    fn metrics(&self) -> &AdapterMetrics {
        &self.metrics
    }

    async fn authenticate(&self) -> Result<AuthToken> {
        if self.api_key.is_empty() {
            return Err(IngestionError::AuthenticationError {
                platform: "youtube".to_string(),
                message: "API key is empty".to_string(),
            });
        }
        Ok(AuthToken::bearer(
            Platform::Youtube,
            self.api_key.clone(),
            API_KEY_LIFETIME_SECS,
        ))
    }

    async fn refresh_token(&self, _token: &AuthToken) -> Result<AuthToken> {
        self.authenticate().await
    }

    async fn fetch_data(&self, params: FetchParams) -> Result<FetchPage> {
        let started = Instant::now();

        let query_term = if params.keywords.is_empty() {
            "social media".to_string()
        } else {
            params.keywords.join(" | ")
        };

        let mut query: Vec<(&str, String)> = vec![
            ("part", "snippet".to_string()),
            ("type", "video".to_string()),
            ("order", "date".to_string()),
            ("q", query_term),
            ("maxResults", params.limit.unwrap_or(25).min(50).to_string()),
            ("key", self.api_key.clone()),
        ];
        if let Some(since) = params.since {
            query.push(("publishedAfter", since.to_rfc3339()));
        }
        if let Some(ref cursor) = params.cursor {
            query.push(("pageToken", cursor.clone()));
        }

        let url = format!("{}/search", self.base_url);
        debug!(platform = "youtube", cursor = ?params.cursor, "Searching videos");

        let response = self.client.get_with_query(&url, &query).await?;
        let body: SearchResponse = response.json().await.map_err(IngestionError::HttpError)?;

        if let Err(e) = self.check_api_error(body.error) {
            self.metrics.record_error();
            return Err(e);
        }

        let ids: Vec<String> = body
            .items
            .unwrap_or_default()
            .into_iter()
            .filter_map(|item| item.id.video_id)
            .collect();

        let videos = self.hydrate_videos(&ids).await?;

        let correlation_id = uuid::Uuid::new_v4().to_string();
        let records: Vec<RawPlatformData> = videos
            .iter()
            .filter_map(|v| self.video_to_raw(v, &correlation_id))
            .collect();

        self.metrics.record_events(records.len() as u64);
        self.metrics.record_processing_time(started.elapsed());

        info!(platform = "youtube", videos = records.len(), "Fetched videos");

        let has_more = body.next_page_token.is_some();
        Ok(FetchPage {
            data: records,
            next_cursor: body.next_page_token,
            has_more,
            rate_limit: None,
        })
    }

    async fn health_check(&self) -> Result<bool> {
        match self.fetch_data(FetchParams::new().limit(1)).await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!(platform = "youtube", error = %e, "Health check failed");
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> YouTubeAdapter {
        YouTubeAdapter::new(
            Arc::new(ResilientHttpClient::with_defaults().unwrap()),
            "api-key".to_string(),
            60,
            Arc::new(CircuitBreaker::with_defaults("youtube")),
        )
    }

    #[test]
    fn test_video_to_raw_reads_published_at() {
        let video = serde_json::json!({
            "id": "dQw4w9WgXcQ",
            "snippet": {
                "title": "Never Gonna Give You Up",
                "publishedAt": "2025-02-01T08:30:00Z"
            },
            "statistics": {"viewCount": "1000000", "likeCount": "50000"}
        });

        let raw = adapter().video_to_raw(&video, "corr-1").unwrap();
        assert_eq!(raw.external_id, "dQw4w9WgXcQ");
        assert_eq!(raw.timestamp.to_rfc3339(), "2025-02-01T08:30:00+00:00");
        assert_eq!(raw.payload["statistics"]["viewCount"], "1000000");
    }

    #[test]
    fn test_quota_error_maps_to_authentication() {
        let err = adapter()
            .check_api_error(Some(YouTubeError {
                code: Some(403),
                message: Some("quotaExceeded".to_string()),
            }))
            .unwrap_err();
        assert!(matches!(err, IngestionError::AuthenticationError { .. }));
    }

    #[tokio::test]
    async fn test_empty_api_key_rejected() {
        let adapter = YouTubeAdapter::new(
            Arc::new(ResilientHttpClient::with_defaults().unwrap()),
            String::new(),
            60,
            Arc::new(CircuitBreaker::with_defaults("youtube")),
        );
        assert!(adapter.authenticate().await.is_err());
    }
}
