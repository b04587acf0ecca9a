//! Reddit adapter
//!
//! OAuth token exchange against www.reddit.com (refresh-token grant when
//! one is configured, script-app client-credentials otherwise), then
//! listing fetches against oauth.reddit.com. Listing children arrive as
//! `t3_` posts and `t1_` comments.
//! https://www.reddit.com/dev/api/#GET_new

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::{
    ensure_token, AdapterMetrics, AuthToken, FetchPage, FetchParams, PlatformAdapter,
    RateLimitInfo, TokenStore,
};
use crate::circuit_breaker::CircuitBreaker;
use crate::error::{IngestionError, Result};
use crate::http_client::{PlatformHttpClient, ResilientHttpClient};
use crate::schemas::{Platform, RawPlatformData, RecordType};

const REDDIT_AUTH_BASE_URL: &str = "https://www.reddit.com";
const REDDIT_API_BASE_URL: &str = "https://oauth.reddit.com";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<i64>,
    scope: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Listing {
    data: Option<ListingData>,
}

#[derive(Debug, Deserialize)]
struct ListingData {
    children: Option<Vec<ListingChild>>,
    after: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListingChild {
    kind: String,
    data: serde_json::Value,
}

pub struct RedditAdapter {
    client: PlatformHttpClient,
    client_id: String,
    client_secret: String,
    refresh_token: Option<String>,
    auth_base_url: String,
    api_base_url: String,
    /// Subreddit path to poll, e.g. "r/all"
    listing_path: String,
    tokens: TokenStore,
    metrics: AdapterMetrics,
}

impl RedditAdapter {
    pub fn new(
        http_client: Arc<ResilientHttpClient>,
        client_id: String,
        client_secret: String,
        refresh_token: Option<String>,
        rate_limit_rpm: u32,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            client: PlatformHttpClient::new(http_client, "reddit", rate_limit_rpm, circuit_breaker),
            client_id,
            client_secret,
            refresh_token,
            auth_base_url: REDDIT_AUTH_BASE_URL.to_string(),
            api_base_url: REDDIT_API_BASE_URL.to_string(),
            listing_path: "r/all".to_string(),
            tokens: TokenStore::new(),
            metrics: AdapterMetrics::new(),
        }
    }

    pub fn with_base_urls(
        mut self,
        auth_base_url: impl Into<String>,
        api_base_url: impl Into<String>,
    ) -> Self {
        self.auth_base_url = auth_base_url.into();
        self.api_base_url = api_base_url.into();
        self
    }

    pub fn with_listing_path(mut self, path: impl Into<String>) -> Self {
        self.listing_path = path.into();
        self
    }

    async fn exchange_token(&self, form: &[(&str, &str)]) -> Result<AuthToken> {
        let url = format!("{}/api/v1/access_token", self.auth_base_url);
        let response = self
            .client
            .post_form(
                &url,
                form,
                Some((self.client_id.as_str(), self.client_secret.as_str())),
            )
            .await?;
        let token: TokenResponse = response.json().await.map_err(IngestionError::HttpError)?;

        match token.access_token {
            Some(access_token) => {
                let expires_in = token.expires_in.unwrap_or(3600);
                let mut auth = AuthToken::bearer(Platform::Reddit, access_token, expires_in);
                auth.refresh_token = self.refresh_token.clone();
                auth.scopes = token
                    .scope
                    .map(|s| s.split(' ').map(str::to_string).collect())
                    .unwrap_or_default();
                info!(platform = "reddit", expires_in = expires_in, "Authenticated");
                Ok(auth)
            }
            None => Err(IngestionError::AuthenticationError {
                platform: "reddit".to_string(),
                message: token
                    .error
                    .unwrap_or_else(|| "No access token in response".to_string()),
            }),
        }
    }

    fn child_to_raw(&self, child: &ListingChild, correlation_id: &str) -> Option<RawPlatformData> {
        let record_type = match child.kind.as_str() {
            "t3" => RecordType::Post,
            "t1" => RecordType::Comment,
            _ => return None,
        };

        // Fullname ("t3_abc123") is the stable external id
        let external_id = child
            .data
            .get("name")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| {
                child
                    .data
                    .get("id")
                    .and_then(|v| v.as_str())
                    .map(|id| format!("{}_{}", child.kind, id))
            })?;

        let timestamp = child
            .data
            .get("created_utc")
            .and_then(|v| v.as_f64())
            .and_then(|secs| Utc.timestamp_opt(secs as i64, 0).single())
            .unwrap_or_else(Utc::now);

        Some(RawPlatformData::new(
            Platform::Reddit,
            external_id,
            timestamp,
            record_type,
            child.data.clone(),
            correlation_id,
        ))
    }

    fn rate_limit_from_headers(response: &reqwest::Response) -> Option<RateLimitInfo> {
        let header_f64 = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<f64>().ok())
        };

        let remaining = header_f64("x-ratelimit-remaining");
        let used = header_f64("x-ratelimit-used");
        let reset = header_f64("x-ratelimit-reset");
        if remaining.is_none() && used.is_none() && reset.is_none() {
            return None;
        }

        Some(RateLimitInfo {
            limit: match (remaining, used) {
                (Some(r), Some(u)) => Some((r + u) as u32),
                _ => None,
            },
            remaining: remaining.map(|r| r as u32),
            reset_at: reset.map(|secs| Utc::now() + chrono::Duration::seconds(secs as i64)),
        })
    }
}

#[async_trait]
impl PlatformAdapter for RedditAdapter {
    fn platform(&self) -> Platform {
        Platform::Reddit
    }

    fn metrics(&self) -> &AdapterMetrics {
        &self.metrics
    }

    async fn authenticate(&self) -> Result<AuthToken> {
        match self.refresh_token {
            Some(ref refresh) => {
                self.exchange_token(&[
                    ("grant_type", "refresh_token"),
                    ("refresh_token", refresh.as_str()),
                ])
                .await
            }
            None => {
                self.exchange_token(&[("grant_type", "client_credentials")])
                    .await
            }
        }
    }

    async fn refresh_token(&self, token: &AuthToken) -> Result<AuthToken> {
        match token.refresh_token {
            Some(ref refresh) => {
                self.exchange_token(&[
                    ("grant_type", "refresh_token"),
                    ("refresh_token", refresh.as_str()),
                ])
                .await
            }
            None => self.authenticate().await,
        }
    }

    async fn fetch_data(&self, params: FetchParams) -> Result<FetchPage> {
        let started = Instant::now();
        let token = ensure_token(self, &self.tokens).await?;

        let mut query: Vec<(&str, String)> = vec![
            ("limit", params.limit.unwrap_or(100).min(100).to_string()),
            ("raw_json", "1".to_string()),
        ];
        if let Some(ref cursor) = params.cursor {
            query.push(("after", cursor.clone()));
        }

        let url = format!("{}/{}/new", self.api_base_url, self.listing_path);
        debug!(platform = "reddit", path = %self.listing_path, cursor = ?params.cursor, "Fetching listing");

        let response = self
            .client
            .get_with_bearer(&url, &token.access_token, &query)
            .await?;
        let rate_limit = Self::rate_limit_from_headers(&response);
        let listing: Listing = response.json().await.map_err(IngestionError::HttpError)?;

        let data = listing.data.unwrap_or(ListingData {
            children: None,
            after: None,
        });

        let correlation_id = uuid::Uuid::new_v4().to_string();
        let records: Vec<RawPlatformData> = data
            .children
            .unwrap_or_default()
            .iter()
            .filter_map(|c| self.child_to_raw(c, &correlation_id))
            .filter(|r| params.since.map_or(true, |since| r.timestamp >= since))
            .collect();

        self.metrics.record_events(records.len() as u64);
        self.metrics.record_processing_time(started.elapsed());

        info!(platform = "reddit", records = records.len(), "Fetched listing");

        let has_more = data.after.is_some() && !records.is_empty();
        Ok(FetchPage {
            data: records,
            next_cursor: data.after,
            has_more,
            rate_limit,
        })
    }

    async fn health_check(&self) -> Result<bool> {
        match self.authenticate().await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!(platform = "reddit", error = %e, "Health check failed");
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> RedditAdapter {
        RedditAdapter::new(
            Arc::new(ResilientHttpClient::with_defaults().unwrap()),
            "client-id".to_string(),
            "client-secret".to_string(),
            None,
            60,
            Arc::new(CircuitBreaker::with_defaults("reddit")),
        )
    }

    #[test]
    fn test_post_child_to_raw() {
        let child = ListingChild {
            kind: "t3".to_string(),
            data: serde_json::json!({
                "name": "t3_abc123",
                "title": "Interesting post",
                "selftext": "Body text here",
                "created_utc": 1736899200.0,
                "ups": 42
            }),
        };

        let raw = adapter().child_to_raw(&child, "corr-1").unwrap();
        assert_eq!(raw.external_id, "t3_abc123");
        assert_eq!(raw.record_type, RecordType::Post);
    }

    #[test]
    fn test_comment_child_to_raw() {
        let child = ListingChild {
            kind: "t1".to_string(),
            data: serde_json::json!({
                "name": "t1_def456",
                "body": "Great point!",
                "parent_id": "t3_abc123",
                "created_utc": 1736899260.0
            }),
        };

        let raw = adapter().child_to_raw(&child, "corr-1").unwrap();
        assert_eq!(raw.external_id, "t1_def456");
        assert_eq!(raw.record_type, RecordType::Comment);
        assert_eq!(raw.payload["parent_id"], "t3_abc123");
    }

    #[test]
    fn test_unknown_kind_skipped() {
        let child = ListingChild {
            kind: "t5".to_string(),
            data: serde_json::json!({"name": "t5_sub"}),
        };
        assert!(adapter().child_to_raw(&child, "corr-1").is_none());
    }

    #[test]
    fn test_listing_parsing() {
        let json = r#"{
            "data": {
                "children": [
                    {"kind": "t3", "data": {"name": "t3_one", "created_utc": 1736899200.0}}
                ],
                "after": "t3_one"
            }
        }"#;
        let listing: Listing = serde_json::from_str(json).unwrap();
        let data = listing.data.unwrap();
        assert_eq!(data.children.unwrap().len(), 1);
        assert_eq!(data.after.unwrap(), "t3_one");
    }
}
