//! TikTok adapter
//!
//! Fetches recent videos via the TikTok Open API (client-credentials
//! grant, then the video list endpoint).
//! https://developers.tiktok.com/doc/tiktok-api-v2-video-list

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::{
    ensure_token, AdapterMetrics, AuthToken, FetchPage, FetchParams, PlatformAdapter, TokenStore,
};
use crate::circuit_breaker::CircuitBreaker;
use crate::error::{IngestionError, Result};
use crate::http_client::{PlatformHttpClient, ResilientHttpClient};
use crate::schemas::{Platform, RawPlatformData, RecordType};

const TIKTOK_BASE_URL: &str = "https://open.tiktokapis.com";

const VIDEO_FIELDS: &str =
    "id,title,video_description,create_time,like_count,comment_count,share_count,view_count,share_url,cover_image_url";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<i64>,
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VideoListResponse {
    data: Option<VideoListData>,
    error: Option<TikTokError>,
}

#[derive(Debug, Deserialize)]
struct VideoListData {
    videos: Option<Vec<serde_json::Value>>,
    cursor: Option<i64>,
    has_more: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct TikTokError {
    code: Option<String>,
    message: Option<String>,
}

pub struct TikTokAdapter {
    client: PlatformHttpClient,
    client_key: String,
    client_secret: String,
    base_url: String,
    tokens: TokenStore,
    metrics: AdapterMetrics,
}

impl TikTokAdapter {
    pub fn new(
        http_client: Arc<ResilientHttpClient>,
        client_key: String,
        client_secret: String,
        rate_limit_rpm: u32,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            client: PlatformHttpClient::new(http_client, "tiktok", rate_limit_rpm, circuit_breaker),
            client_key,
            client_secret,
            base_url: TIKTOK_BASE_URL.to_string(),
            tokens: TokenStore::new(),
            metrics: AdapterMetrics::new(),
        }
    }

    /// Points the adapter at a different API host (tests)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn video_to_raw(&self, video: &serde_json::Value, correlation_id: &str) -> Option<RawPlatformData> {
        let id = video.get("id")?.as_str()?.to_string();
        let timestamp = video
            .get("create_time")
            .and_then(|v| v.as_i64())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .unwrap_or_else(Utc::now);

        Some(RawPlatformData::new(
            Platform::Tiktok,
            id,
            timestamp,
            RecordType::Post,
            video.clone(),
            correlation_id,
        ))
    }
}

#[async_trait]
impl PlatformAdapter for TikTokAdapter {
    fn platform(&self) -> Platform {
        Platform::Tiktok
    }

    fn metrics(&self) -> &AdapterMetrics {
        &self.metrics
    }

    async fn authenticate(&self) -> Result<AuthToken> {
        let url = format!("{}/v2/oauth/token/", self.base_url);
        let form = [
            ("client_key", self.client_key.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("grant_type", "client_credentials"),
        ];

        let response = self.client.post_form(&url, &form, None).await?;
        let token: TokenResponse = response.json().await.map_err(IngestionError::HttpError)?;

        match token.access_token {
            Some(access_token) => {
                let expires_in = token.expires_in.unwrap_or(7200);
                info!(platform = "tiktok", expires_in = expires_in, "Authenticated");
                Ok(AuthToken::bearer(Platform::Tiktok, access_token, expires_in))
            }
            None => Err(IngestionError::AuthenticationError {
                platform: "tiktok".to_string(),
                message: token
                    .error_description
                    .or(token.error)
                    .unwrap_or_else(|| "No access token in response".to_string()),
            }),
        }
    }

    async fn refresh_token(&self, _token: &AuthToken) -> Result<AuthToken> {
        // Client-credentials grants have no refresh flow; re-authenticate
        self.authenticate().await
    }

    async fn fetch_data(&self, params: FetchParams) -> Result<FetchPage> {
        let started = Instant::now();
        let token = ensure_token(self, &self.tokens).await?;

        let mut query: Vec<(&str, String)> = vec![
            ("fields", VIDEO_FIELDS.to_string()),
            ("max_count", params.limit.unwrap_or(20).min(20).to_string()),
        ];
        if let Some(ref cursor) = params.cursor {
            query.push(("cursor", cursor.clone()));
        }

        let url = format!("{}/v2/video/list/", self.base_url);
        debug!(platform = "tiktok", cursor = ?params.cursor, "Fetching videos");

        let response = self
            .client
            .get_with_bearer(&url, &token.access_token, &query)
            .await?;
        let body: VideoListResponse = response.json().await.map_err(IngestionError::HttpError)?;

        if let Some(error) = body.error {
            let code = error.code.unwrap_or_else(|| "unknown".to_string());
            // "ok" is TikTok's success code inside the error envelope
            if code != "ok" {
                self.metrics.record_error();
                return Err(IngestionError::ApiError {
                    code,
                    message: error.message.unwrap_or_else(|| "Unknown error".to_string()),
                });
            }
        }

        let data = body.data.unwrap_or(VideoListData {
            videos: None,
            cursor: None,
            has_more: None,
        });

        let correlation_id = uuid::Uuid::new_v4().to_string();
        let records: Vec<RawPlatformData> = data
            .videos
            .unwrap_or_default()
            .iter()
            .filter_map(|v| self.video_to_raw(v, &correlation_id))
            .filter(|r| params.since.map_or(true, |since| r.timestamp >= since))
            .collect();

        self.metrics.record_events(records.len() as u64);
        self.metrics.record_processing_time(started.elapsed());

        info!(platform = "tiktok", videos = records.len(), "Fetched videos");

        let has_more = data.has_more.unwrap_or(false);
        Ok(FetchPage {
            data: records,
            next_cursor: data.cursor.filter(|_| has_more).map(|c| c.to_string()),
            has_more,
            rate_limit: None,
        })
    }

    async fn health_check(&self) -> Result<bool> {
        match self.fetch_data(FetchParams::new().limit(1)).await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!(platform = "tiktok", error = %e, "Health check failed");
                Ok(false)
            }
        }
    }
}
