//! Coinbase Exchange REST client
//!
//! Wraps every request with:
//! - Circuit breaker for fault tolerance
//! - Rate limiting
//! - Retry with exponential backoff for idempotent reads
//!
//! Placement and cancellation go out exactly once. A retried POST could
//! leave two orders resting, and the broker already reacts to a failed
//! attempt on the next book change.

use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;

use super::auth::Credentials;
use super::types::*;
use crate::common::{CircuitBreaker, CircuitBreakerConfig, RateLimiter, RateLimiterConfig};
use crate::config::ExchangeConfig;
use crate::gateway::{GatewayError, GatewayResult, PlaceAck, PlaceRequest};

/// Production REST endpoint
pub const API_BASE_URL: &str = "https://api.exchange.coinbase.com";

/// Public sandbox REST endpoint
pub const SANDBOX_BASE_URL: &str = "https://api-public.sandbox.exchange.coinbase.com";

const USER_AGENT: &str = concat!("price-chaser/", env!("CARGO_PKG_VERSION"));

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    /// Retry attempts for idempotent reads
    pub max_retries: u32,
    pub timeout: Duration,
    pub rate_limiter: RateLimiterConfig,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: SANDBOX_BASE_URL.to_string(),
            max_retries: 3,
            timeout: Duration::from_secs(30),
            rate_limiter: RateLimiterConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn from_exchange_config(config: &ExchangeConfig) -> Self {
        let base_url = if config.sandbox {
            SANDBOX_BASE_URL
        } else {
            API_BASE_URL
        };
        Self::default()
            .with_base_url(base_url)
            .with_max_retries(config.max_retries)
            .with_timeout(Duration::from_secs(config.timeout_secs))
            .with_rate_limit(config.rate_limit as usize)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set rate limit (requests per second)
    pub fn with_rate_limit(mut self, requests_per_second: usize) -> Self {
        self.rate_limiter = self.rate_limiter.with_rate(requests_per_second);
        self
    }

    pub fn with_circuit_breaker_threshold(mut self, threshold: u32) -> Self {
        self.circuit_breaker = self.circuit_breaker.with_failure_threshold(threshold);
        self
    }
}

/// Coinbase Exchange API client
///
/// The product catalogue works without credentials; orders require them.
#[derive(Clone)]
pub struct CoinbaseClient {
    base_url: String,
    credentials: Option<Credentials>,
    http_client: Client,
    circuit_breaker: Arc<Mutex<CircuitBreaker>>,
    rate_limiter: RateLimiter,
    max_retries: u32,
}

impl CoinbaseClient {
    pub fn new(credentials: Option<Credentials>, config: ClientConfig) -> GatewayResult<Self> {
        let http_client = Client::builder()
            .timeout(config.timeout)
            .user_agent(USER_AGENT)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            credentials,
            http_client,
            circuit_breaker: Arc::new(Mutex::new(CircuitBreaker::new(config.circuit_breaker))),
            rate_limiter: RateLimiter::new(config.rate_limiter),
            max_retries: config.max_retries,
        })
    }

    /// Build from the `exchange` config section
    pub fn from_config(config: &ExchangeConfig) -> GatewayResult<Self> {
        let credentials = Credentials::from_parts(
            config.api_key.as_deref(),
            config.api_secret.as_deref(),
            config.passphrase.as_deref(),
        );
        let credentials = match credentials {
            Ok(credentials) => Some(credentials),
            Err(e) => {
                tracing::warn!("Running without API credentials: {}", e);
                None
            }
        };
        Self::new(credentials, ClientConfig::from_exchange_config(config))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    /// Run `operation` behind the circuit breaker and rate limiter,
    /// retrying transient failures up to `retries` times
    async fn execute_with_retry<F, Fut, T>(&self, retries: u32, operation: F) -> GatewayResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = GatewayResult<T>>,
    {
        {
            let mut cb = self.circuit_breaker.lock().await;
            if !cb.allow() {
                return Err(GatewayError::CircuitOpen);
            }
        }

        let mut last_error = None;

        for attempt in 0..=retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s...
                let delay = Duration::from_secs(2u64.pow(attempt - 1));
                tracing::debug!("Retrying after {}ms", delay.as_millis());
                sleep(delay).await;
            }

            self.rate_limiter.acquire().await;

            match operation().await {
                Ok(result) => {
                    self.circuit_breaker.lock().await.record_success();
                    return Ok(result);
                }
                Err(e) if !is_transient(&e) => {
                    // The venue answered; it is healthy even if it said no
                    self.circuit_breaker.lock().await.record_success();
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(
                        "Request failed (attempt {}/{}): {}",
                        attempt + 1,
                        retries + 1,
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        self.circuit_breaker.lock().await.record_failure();

        Err(last_error
            .unwrap_or_else(|| GatewayError::Network("request failed after retries".into())))
    }

    /// Send one request and decode the JSON response
    async fn send<R>(
        &self,
        method: Method,
        request_path: &str,
        body: Option<String>,
        signed: bool,
    ) -> GatewayResult<R>
    where
        R: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, request_path);
        let body = body.unwrap_or_default();
        let mut request = self.http_client.request(method.clone(), &url);

        if signed {
            let credentials = self.credentials.as_ref().ok_or_else(|| {
                GatewayError::Auth("API credentials are required for this request".into())
            })?;
            let timestamp = chrono::Utc::now().timestamp().to_string();
            let signature = credentials.sign(&timestamp, method.as_str(), request_path, &body)?;
            request = request
                .header("CB-ACCESS-KEY", credentials.api_key())
                .header("CB-ACCESS-SIGN", signature)
                .header("CB-ACCESS-TIMESTAMP", timestamp)
                .header("CB-ACCESS-PASSPHRASE", credentials.passphrase());
        }
        if !body.is_empty() {
            request = request
                .header("Content-Type", "application/json")
                .body(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(classify_error(status, &text));
        }

        serde_json::from_str(&text).map_err(|e| GatewayError::Parse(format!("{}: {}", e, text)))
    }

    // ==================== PUBLIC ENDPOINTS ====================

    /// List every product with its trading limits
    pub async fn get_products(&self) -> GatewayResult<Vec<Product>> {
        self.execute_with_retry(self.max_retries, || {
            self.send(Method::GET, "/products", None, false)
        })
        .await
    }

    // ==================== AUTHENTICATED ENDPOINTS ====================

    /// Place a post-only GTC limit order. Never retried.
    pub async fn place_order(&self, request: &PlaceRequest) -> GatewayResult<PlaceAck> {
        let body = serde_json::to_string(&NewOrder::post_only_limit(request))
            .map_err(|e| GatewayError::Parse(e.to_string()))?;
        let response: OrderResponse = self
            .execute_with_retry(0, || {
                self.send(Method::POST, "/orders", Some(body.clone()), true)
            })
            .await?;
        Ok(response.into())
    }

    /// Cancel a resting order. Never retried.
    pub async fn cancel_order(&self, order_id: &str) -> GatewayResult<()> {
        let path = format!("/orders/{}", order_id);
        let _: serde_json::Value = self
            .execute_with_retry(0, || self.send(Method::DELETE, &path, None, true))
            .await?;
        Ok(())
    }
}

/// Network errors, throttling and 5xx are worth retrying
fn is_transient(err: &GatewayError) -> bool {
    match err {
        GatewayError::Network(_) => true,
        GatewayError::Api { status, .. } => *status == 429 || *status >= 500,
        _ => false,
    }
}

fn classify_error(status: StatusCode, body: &str) -> GatewayError {
    let message = serde_json::from_str::<ApiMessage>(body)
        .map(|m| m.message)
        .unwrap_or_else(|_| body.to_string());
    match status {
        StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND => GatewayError::BadRequest(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => GatewayError::Auth(message),
        _ => GatewayError::Api {
            status: status.as_u16(),
            message,
        },
    }
}
