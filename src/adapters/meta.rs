//! Meta adapter
//!
//! Fetches page feed posts via the Graph API (covers Facebook and
//! Instagram page content). Uses a long-lived page access token from
//! configuration; `authenticate` validates it against `/me`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
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

const GRAPH_BASE_URL: &str = "https://graph.facebook.com";
const GRAPH_VERSION: &str = "v19.0";

/// Long-lived page tokens last about 60 days
const PAGE_TOKEN_LIFETIME_SECS: i64 = 60 * 24 * 3600;

const FEED_FIELDS: &str =
    "id,message,created_time,permalink_url,full_picture,from,likes.summary(true),comments.summary(true),shares";

#[derive(Debug, Deserialize)]
struct MeResponse {
    id: Option<String>,
    error: Option<GraphError>,
}

#[derive(Debug, Deserialize)]
struct FeedResponse {
    data: Option<Vec<serde_json::Value>>,
    paging: Option<Paging>,
    error: Option<GraphError>,
}

#[derive(Debug, Deserialize)]
struct Paging {
    cursors: Option<Cursors>,
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Cursors {
    after: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphError {
    message: Option<String>,
    code: Option<i64>,
    #[serde(rename = "type")]
    error_type: Option<String>,
}

pub struct MetaAdapter {
    client: PlatformHttpClient,
    access_token: String,
    base_url: String,
    tokens: TokenStore,
    metrics: AdapterMetrics,
}

impl MetaAdapter {
    pub fn new(
        http_client: Arc<ResilientHttpClient>,
        access_token: String,
        rate_limit_rpm: u32,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            client: PlatformHttpClient::new(http_client, "meta", rate_limit_rpm, circuit_breaker),
            access_token,
            base_url: GRAPH_BASE_URL.to_string(),
            tokens: TokenStore::new(),
            metrics: AdapterMetrics::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn post_to_raw(&self, post: &serde_json::Value, correlation_id: &str) -> Option<RawPlatformData> {
        let id = post.get("id")?.as_str()?.to_string();
        let timestamp = post
            .get("created_time")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%z").ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Some(RawPlatformData::new(
            Platform::Meta,
            id,
            timestamp,
            RecordType::Post,
            post.clone(),
            correlation_id,
        ))
    }

    fn check_graph_error(&self, error: Option<GraphError>) -> Result<()> {
        if let Some(e) = error {
            let code = e.code.unwrap_or(0);
            let message = e.message.unwrap_or_else(|| "Unknown error".to_string());
            // 190 is the Graph API's invalid-token code family
            if code == 190 || e.error_type.as_deref() == Some("OAuthException") {
                return Err(IngestionError::AuthenticationError {
                    platform: "meta".to_string(),
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
}

#[async_trait]
impl PlatformAdapter for MetaAdapter {
    fn platform(&self) -> Platform {
        Platform::Meta
    }

    fn metrics(&self) -> &AdapterMetrics {
        &self.metrics
    }

    async fn authenticate(&self) -> Result<AuthToken> {
        let url = format!("{}/{}/me", self.base_url, GRAPH_VERSION);
        let query = [
            ("fields", "id,name"),
            ("access_token", self.access_token.as_str()),
        ];

        let response = self.client.get_with_query(&url, &query).await?;
        let me: MeResponse = response.json().await.map_err(IngestionError::HttpError)?;

        self.check_graph_error(me.error)?;
        let page_id = me.id.ok_or_else(|| IngestionError::AuthenticationError {
            platform: "meta".to_string(),
            message: "Token validation returned no page id".to_string(),
        })?;

        info!(platform = "meta", page_id = %page_id, "Token validated");
        Ok(AuthToken::bearer(
            Platform::Meta,
            self.access_token.clone(),
            PAGE_TOKEN_LIFETIME_SECS,
        ))
    }

    async fn refresh_token(&self, _token: &AuthToken) -> Result<AuthToken> {
        // Page tokens are re-validated rather than refreshed
        self.authenticate().await
    }

    async fn fetch_data(&self, params: FetchParams) -> Result<FetchPage> {
        let started = Instant::now();
        let token = ensure_token(self, &self.tokens).await?;

        let mut query: Vec<(&str, String)> = vec![
            ("fields", FEED_FIELDS.to_string()),
            ("limit", params.limit.unwrap_or(25).to_string()),
            ("access_token", token.access_token.clone()),
        ];
        if let Some(since) = params.since {
            query.push(("since", since.timestamp().to_string()));
        }
        if let Some(until) = params.until {
            query.push(("until", until.timestamp().to_string()));
        }
        if let Some(ref cursor) = params.cursor {
            query.push(("after", cursor.clone()));
        }

        let url = format!("{}/{}/me/feed", self.base_url, GRAPH_VERSION);
        debug!(platform = "meta", cursor = ?params.cursor, "Fetching feed");

        let response = self.client.get_with_query(&url, &query).await?;
        let body: FeedResponse = response.json().await.map_err(IngestionError::HttpError)?;

        if let Err(e) = self.check_graph_error(body.error) {
            self.metrics.record_error();
            return Err(e);
        }

        let correlation_id = uuid::Uuid::new_v4().to_string();
        let records: Vec<RawPlatformData> = body
            .data
            .unwrap_or_default()
            .iter()
            .filter_map(|p| self.post_to_raw(p, &correlation_id))
            .collect();

        self.metrics.record_events(records.len() as u64);
        self.metrics.record_processing_time(started.elapsed());

        info!(platform = "meta", posts = records.len(), "Fetched feed posts");

        let next_cursor = body
            .paging
            .as_ref()
            .and_then(|p| p.cursors.as_ref())
            .and_then(|c| c.after.clone());
        let has_more = body.paging.as_ref().map_or(false, |p| p.next.is_some());

        Ok(FetchPage {
            data: records,
            next_cursor: next_cursor.filter(|_| has_more),
            has_more,
            rate_limit: None,
        })
    }

    async fn health_check(&self) -> Result<bool> {
        match self.authenticate().await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!(platform = "meta", error = %e, "Health check failed");
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> MetaAdapter {
        MetaAdapter::new(
            Arc::new(ResilientHttpClient::with_defaults().unwrap()),
            "page-token".to_string(),
            60,
            Arc::new(CircuitBreaker::with_defaults("meta")),
        )
    }

    #[test]
    fn test_post_to_raw() {
        let post = serde_json::json!({
            "id": "123_456",
            "message": "New product launch! #exciting",
            "created_time": "2025-01-15T10:00:00+0000",
            "likes": {"summary": {"total_count": 42}}
        });

        let raw = adapter().post_to_raw(&post, "corr-1").unwrap();
        assert_eq!(raw.external_id, "123_456");
        assert_eq!(raw.platform, Platform::Meta);
        assert_eq!(raw.timestamp.to_rfc3339(), "2025-01-15T10:00:00+00:00");
    }

    #[test]
    fn test_oauth_error_maps_to_authentication() {
        let err = adapter()
            .check_graph_error(Some(GraphError {
                message: Some("Invalid OAuth access token".to_string()),
                code: Some(190),
                error_type: Some("OAuthException".to_string()),
            }))
            .unwrap_err();
        assert!(matches!(err, IngestionError::AuthenticationError { .. }));
    }

    #[test]
    fn test_feed_paging_parsing() {
        let json = r#"{
            "data": [{"id": "1_2", "created_time": "2025-01-15T10:00:00+0000"}],
            "paging": {"cursors": {"after": "abc"}, "next": "https://graph.facebook.com/next"}
        }"#;
        let body: FeedResponse = serde_json::from_str(json).unwrap();
        assert_eq!(body.data.unwrap().len(), 1);
        assert_eq!(body.paging.unwrap().cursors.unwrap().after.unwrap(), "abc");
    }
}
