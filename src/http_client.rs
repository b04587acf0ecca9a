//! HTTP client layer
//!
//! Shared resilient client: semaphore-based concurrency limiting, capped
//! jittered exponential retry for transient statuses, fixed per-request
//! timeouts. Each platform adapter wraps it in a `PlatformHttpClient` that
//! adds a governor rate limiter and a circuit breaker.

use governor::{
    clock::DefaultClock, middleware::NoOpMiddleware, state::NotKeyed, Quota, RateLimiter,
};
use reqwest::{Client, Request, RequestBuilder, Response, StatusCode};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::error::{IngestionError, Result};

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Maximum concurrent requests across all platforms
    pub max_concurrent_requests: usize,
    /// Request timeout
    pub request_timeout: Duration,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Maximum retries for failed requests
    pub max_retries: u32,
    /// Initial retry delay
    pub initial_retry_delay: Duration,
    /// Maximum retry delay
    pub max_retry_delay: Duration,
    /// User agent string
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 10,
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_retries: 3,
            initial_retry_delay: Duration::from_millis(500),
            max_retry_delay: Duration::from_secs(30),
            user_agent: format!("pulse-ingestion/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Resilient HTTP client with concurrency limiting and retries
pub struct ResilientHttpClient {
    client: Client,
    semaphore: Arc<Semaphore>,
    config: HttpClientConfig,
}

impl ResilientHttpClient {
    pub fn new(config: HttpClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(&config.user_agent)
            .gzip(true)
            .brotli(true)
            .build()
            .map_err(IngestionError::HttpError)?;

        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_requests));

        Ok(Self {
            client,
            semaphore,
            config,
        })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(HttpClientConfig::default())
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Executes a request with capped jittered exponential retry
    pub async fn execute(&self, request: Request) -> Result<Response> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| IngestionError::StreamingTransportError("semaphore closed".to_string()))?;

        let url = request.url().clone();

        debug!(method = %request.method(), url = %url, "Executing HTTP request");

        let mut attempt = 0u32;
        let mut delay = self.config.initial_retry_delay;
        let max_retries = self.config.max_retries;

        loop {
            attempt += 1;

            // Clone keeps the body intact across attempts; streaming bodies
            // cannot be replayed and are rejected up front.
            let req = request.try_clone().ok_or_else(|| {
                IngestionError::StreamingTransportError(
                    "request body is not replayable across retries".to_string(),
                )
            })?;

            match self.client.execute(req).await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(response);
                    } else if status == StatusCode::TOO_MANY_REQUESTS {
                        // 429 is surfaced to the adapter which owns backoff policy
                        let retry_after = response
                            .headers()
                            .get("retry-after")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.parse::<u64>().ok());
                        return Err(IngestionError::RateLimitError {
                            platform: url.host_str().unwrap_or("unknown").to_string(),
                            retry_after,
                            reset_time: None,
                        });
                    } else if Self::is_retryable_status(status) && attempt <= max_retries {
                        warn!(
                            status = %status,
                            attempt = attempt,
                            max_retries = max_retries,
                            "Retryable error, will retry"
                        );
                        // Jitter: random factor between 0.5 and 1.5
                        let jitter = 0.5 + rand::random::<f64>();
                        let jittered = Duration::from_secs_f64(delay.as_secs_f64() * jitter);
                        tokio::time::sleep(jittered).await;
                        delay = std::cmp::min(delay * 2, self.config.max_retry_delay);
                    } else {
                        let body = response.text().await.unwrap_or_default();
                        return Err(IngestionError::ApiError {
                            code: status.to_string(),
                            message: body,
                        });
                    }
                }
                Err(e) => {
                    if (e.is_timeout() || e.is_connect()) && attempt <= max_retries {
                        warn!(error = %e, attempt = attempt, "Transient error, will retry");
                        let jitter = 0.5 + rand::random::<f64>();
                        let jittered = Duration::from_secs_f64(delay.as_secs_f64() * jitter);
                        tokio::time::sleep(jittered).await;
                        delay = std::cmp::min(delay * 2, self.config.max_retry_delay);
                    } else {
                        return Err(IngestionError::HttpError(e));
                    }
                }
            }
        }
    }

    fn is_retryable_status(status: StatusCode) -> bool {
        matches!(
            status,
            StatusCode::SERVICE_UNAVAILABLE
                | StatusCode::GATEWAY_TIMEOUT
                | StatusCode::BAD_GATEWAY
                | StatusCode::REQUEST_TIMEOUT
        )
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Platform-specific HTTP client with rate limiting and circuit breaker
pub struct PlatformHttpClient {
    client: Arc<ResilientHttpClient>,
    rate_limiter: RateLimiter<NotKeyed, governor::state::InMemoryState, DefaultClock, NoOpMiddleware>,
    circuit_breaker: Arc<CircuitBreaker>,
    platform_id: String,
}

impl PlatformHttpClient {
    pub fn new(
        client: Arc<ResilientHttpClient>,
        platform_id: &str,
        rate_limit_rpm: u32,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Self {
        let quota = Quota::per_minute(
            NonZeroU32::new(rate_limit_rpm).unwrap_or(NonZeroU32::new(60).unwrap()),
        );
        let rate_limiter = RateLimiter::direct(quota);

        Self {
            client,
            rate_limiter,
            circuit_breaker,
            platform_id: platform_id.to_string(),
        }
    }

    /// Executes a GET request with all protections
    pub async fn get(&self, url: &str) -> Result<Response> {
        self.execute_with_protection(|| self.client.inner().get(url))
            .await
    }

    /// Executes a GET request with query parameters
    pub async fn get_with_query<T: serde::Serialize + ?Sized>(
        &self,
        url: &str,
        query: &T,
    ) -> Result<Response> {
        self.execute_with_protection(|| self.client.inner().get(url).query(query))
            .await
    }

    /// Executes a bearer-authenticated GET request
    pub async fn get_with_bearer<T: serde::Serialize + ?Sized>(
        &self,
        url: &str,
        token: &str,
        query: &T,
    ) -> Result<Response> {
        self.execute_with_protection(|| {
            self.client.inner().get(url).bearer_auth(token).query(query)
        })
        .await
    }

    /// Executes a form POST (token exchange endpoints)
    pub async fn post_form<T: serde::Serialize + ?Sized>(
        &self,
        url: &str,
        form: &T,
        basic_auth: Option<(&str, &str)>,
    ) -> Result<Response> {
        self.execute_with_protection(|| {
            let mut builder = self.client.inner().post(url).form(form);
            if let Some((user, pass)) = basic_auth {
                builder = builder.basic_auth(user, Some(pass));
            }
            builder
        })
        .await
    }

    async fn execute_with_protection<F>(&self, build_request: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        if !self.circuit_breaker.allow_request() {
            warn!(platform = %self.platform_id, "Circuit breaker open, request blocked");
            return Err(IngestionError::CircuitBreakerOpen(self.platform_id.clone()));
        }

        self.rate_limiter.until_ready().await;

        let request = build_request().build().map_err(IngestionError::HttpError)?;

        match self.client.execute(request).await {
            Ok(response) => {
                self.circuit_breaker.record_success();
                Ok(response)
            }
            Err(e) => {
                // A 429 counts against the breaker; the adapter decides how long to back off
                self.circuit_breaker.record_failure();
                Err(e)
            }
        }
    }

    pub fn platform_id(&self) -> &str {
        &self.platform_id
    }

    pub fn is_available(&self) -> bool {
        self.circuit_breaker.allow_request()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = HttpClientConfig::default();
        assert_eq!(config.max_concurrent_requests, 10);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_semaphore_limiting() {
        let config = HttpClientConfig {
            max_concurrent_requests: 2,
            ..Default::default()
        };

        let client = ResilientHttpClient::new(config).unwrap();
        assert_eq!(client.available_permits(), 2);
    }

    #[tokio::test]
    async fn test_form_body_survives_retry() {
        use wiremock::matchers::{body_string, method as http_method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;

        // First attempt fails retryably; the retry must carry the same body
        Mock::given(http_method("POST"))
            .and(path("/oauth/token"))
            .and(body_string("grant_type=client_credentials"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(http_method("POST"))
            .and(path("/oauth/token"))
            .and(body_string("grant_type=client_credentials"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "tok",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let config = HttpClientConfig {
            initial_retry_delay: Duration::from_millis(10),
            ..Default::default()
        };
        let client = ResilientHttpClient::new(config).unwrap();
        let request = client
            .inner()
            .post(format!("{}/oauth/token", server.uri()))
            .form(&[("grant_type", "client_credentials")])
            .build()
            .unwrap();

        let response = client.execute(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_retryable_status() {
        assert!(ResilientHttpClient::is_retryable_status(
            StatusCode::SERVICE_UNAVAILABLE
        ));
        assert!(ResilientHttpClient::is_retryable_status(
            StatusCode::BAD_GATEWAY
        ));
        assert!(!ResilientHttpClient::is_retryable_status(
            StatusCode::NOT_FOUND
        ));
        assert!(!ResilientHttpClient::is_retryable_status(
            StatusCode::UNAUTHORIZED
        ));
    }
}
