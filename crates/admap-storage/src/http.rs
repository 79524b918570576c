//! Rate-limited JSON transport for provider master-data endpoints.
//!
//! The fetcher caps in-flight requests with a global semaphore, optionally paces them through a
//! token bucket, and bounds each request with a timeout. It never retries: callers decide whether a
//! failure is worth another attempt using [`FetchError::disposition`] and [`BackoffPolicy`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// Bucket that allows short bursts of `per_second` requests and refills one token at a time.
    pub fn per_second(per_second: u32) -> Option<Self> {
        if per_second == 0 {
            return None;
        }
        Some(Self {
            capacity: per_second,
            refill_every: Duration::from_secs(1) / per_second,
        })
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: Some(format!("admap/{}", env!("CARGO_PKG_VERSION"))),
            global_concurrency: 4,
            token_bucket: None,
        }
    }
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity.max(1),
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("invalid json from {url}: {message}")]
    Decode { url: String, message: String },
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request { source, .. } => classify_reqwest_error(source),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            FetchError::Decode { .. } => RetryDisposition::NonRetryable,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Request { source, .. } if source.is_timeout())
    }
}

/// Shared across all provider calls of a run; clone the `Arc`, not the fetcher.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            token_bucket,
        })
    }

    pub async fn get_json(
        &self,
        url: &str,
        query: &[(&str, String)],
        headers: &[(&str, &str)],
    ) -> Result<JsonValue, FetchError> {
        let request = self.client.get(url).query(query);
        self.send(url, with_headers(request, headers)).await
    }

    pub async fn post_json(
        &self,
        url: &str,
        body: &JsonValue,
        headers: &[(&str, &str)],
    ) -> Result<JsonValue, FetchError> {
        let request = self.client.post(url).json(body);
        self.send(url, with_headers(request, headers)).await
    }

    async fn send(
        &self,
        url: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<JsonValue, FetchError> {
        // The semaphore lives as long as the fetcher and is never closed.
        let _permit = self
            .global_limit
            .acquire()
            .await
            .expect("fetcher semaphore is never closed");

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let started = Instant::now();
        let resp = request.send().await.map_err(|source| FetchError::Request {
            url: url.to_string(),
            source,
        })?;
        let status = resp.status();
        let bytes = resp.bytes().await.map_err(|source| FetchError::Request {
            url: url.to_string(),
            source,
        })?;
        debug!(
            url,
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "provider call"
        );

        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
                body: snippet(&bytes),
            });
        }

        serde_json::from_slice(&bytes).map_err(|err| FetchError::Decode {
            url: url.to_string(),
            message: format!("{err}; body starts with {:?}", snippet(&bytes)),
        })
    }
}

fn with_headers(
    mut request: reqwest::RequestBuilder,
    headers: &[(&str, &str)],
) -> reqwest::RequestBuilder {
    for (name, value) in headers {
        request = request.header(*name, *value);
    }
    request
}

fn snippet(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).chars().take(200).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), RetryDisposition::NonRetryable);

        let err = FetchError::HttpStatus {
            status: 503,
            url: "http://provider/ward".into(),
            body: String::new(),
        };
        assert_eq!(err.disposition(), RetryDisposition::Retryable);
        let err = FetchError::Decode {
            url: "http://provider/ward".into(),
            message: "eof".into(),
        };
        assert_eq!(err.disposition(), RetryDisposition::NonRetryable);
    }

    #[test]
    fn token_bucket_config_from_rate() {
        assert!(TokenBucketConfig::per_second(0).is_none());
        let cfg = TokenBucketConfig::per_second(4).unwrap();
        assert_eq!(cfg.capacity, 4);
        assert_eq!(cfg.refill_every, Duration::from_millis(250));
    }

    #[tokio::test]
    async fn token_bucket_paces_after_burst() {
        let bucket = SimpleTokenBucket::new(2, Duration::from_millis(40));
        let started = Instant::now();
        bucket.take().await;
        bucket.take().await;
        assert!(started.elapsed() < Duration::from_millis(40));
        bucket.take().await;
        assert!(started.elapsed() >= Duration::from_millis(40));
    }
}
