//! Single boundary for outbound JSON calls. Retries and circuit breaking
//! live here, not at individual call sites.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
use crate::config::HttpClientConfig;
use crate::errors::ServiceError;
use crate::retry::{with_retry, RetryConfig, RetryPolicy};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// How a dependency authenticates requests.
#[derive(Debug, Clone)]
pub enum ApiAuth {
    /// `X-API-Key: <key>`
    ApiKey(String),
    /// `Authorization: Bearer <token>`
    Bearer(String),
}

#[derive(Debug, Error)]
pub enum HttpCallError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("response decode error: {0}")]
    Decode(String),
}

struct TransientHttpPolicy;

impl RetryPolicy<HttpCallError> for TransientHttpPolicy {
    fn is_retryable(&self, error: &HttpCallError) -> bool {
        match error {
            HttpCallError::Transport(_) => true,
            HttpCallError::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            HttpCallError::Decode(_) => false,
        }
    }
}

/// A named outbound dependency: reqwest client + retry policy + breaker.
#[derive(Debug, Clone)]
pub struct ApiClient {
    name: &'static str,
    client: reqwest::Client,
    base_uri: String,
    auth: ApiAuth,
    retry: RetryConfig,
    breaker: CircuitBreaker,
}

impl ApiClient {
    pub fn new(
        name: &'static str,
        base_uri: impl Into<String>,
        auth: ApiAuth,
        cfg: &HttpClientConfig,
    ) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|e| ServiceError::InternalError(format!("http client build: {e}")))?;

        Ok(Self {
            name,
            client,
            base_uri: base_uri.into(),
            auth,
            retry: RetryConfig {
                max_attempts: cfg.retry_max_attempts,
                initial_delay: Duration::from_millis(cfg.retry_initial_delay_ms),
                max_delay: Duration::from_millis(cfg.retry_max_delay_ms),
                backoff_factor: 2.0,
            },
            breaker: CircuitBreaker::new(CircuitBreakerConfig {
                failure_threshold: cfg.breaker_failure_threshold,
                cooldown: Duration::from_secs(cfg.breaker_cooldown_secs),
                success_threshold: cfg.breaker_success_threshold,
            }),
        })
    }

    /// POST a JSON body and decode a JSON response, with bounded retries for
    /// transient failures. Client errors (4xx) are surfaced immediately.
    pub async fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R, ServiceError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_uri, path);
        debug!(dependency = self.name, %url, "outbound POST");

        let result = self
            .breaker
            .call(|| with_retry(&self.retry, TransientHttpPolicy, || self.send(&url, body)))
            .await;

        match result {
            Ok(response) => Ok(response),
            Err(CircuitBreakerError::CircuitOpen) => {
                warn!(dependency = self.name, "circuit open; rejecting call");
                Err(ServiceError::CircuitBreakerOpen)
            }
            Err(CircuitBreakerError::ServiceFailure(err)) => Err(ServiceError::ExternalApiError(
                format!("{}: {}", self.name, err),
            )),
        }
    }

    async fn send<B, R>(&self, url: &str, body: &B) -> Result<R, HttpCallError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let mut request = self.client.post(url).json(body);
        request = match &self.auth {
            ApiAuth::ApiKey(key) => request.header("X-API-Key", key),
            ApiAuth::Bearer(token) => request.bearer_auth(token),
        };

        let response = request
            .send()
            .await
            .map_err(|e| HttpCallError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HttpCallError::Status { status, body });
        }

        response
            .json::<R>()
            .await
            .map_err(|e| HttpCallError::Decode(e.to_string()))
    }
}
