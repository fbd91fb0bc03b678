//! Persistence collaborators + HTTP fetch utilities for fundex.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use fundex_core::FetchError;
use reqwest::{StatusCode, Url};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

mod postgres;
mod store;

pub use postgres::{PgStore, SnapshotSummary, MIGRATOR};
pub use store::{MemoryStore, RecordStore};

pub const CRATE_NAME: &str = "fundex-storage";

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
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 4,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

/// Request budget shared by every caller of one [`HttpFetcher`].
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
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
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
pub enum HttpError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("http client is shut down")]
    Closed,
}

impl HttpError {
    /// Maps transport failures onto the per-identifier fetch taxonomy.
    pub fn to_fetch_error(&self, timeout: Duration) -> FetchError {
        match self {
            HttpError::Request(err) if err.is_timeout() => {
                FetchError::Timeout(timeout.as_millis() as u64)
            }
            HttpError::Request(err) if err.is_decode() => FetchError::Decode(err.to_string()),
            HttpError::Request(err) => FetchError::Network(err.to_string()),
            HttpError::HttpStatus { status, .. } => match *status {
                401 | 403 => FetchError::Unauthorized(*status),
                404 => FetchError::NotFound,
                429 => FetchError::RateLimited,
                other => FetchError::HttpStatus(other),
            },
            HttpError::Closed => FetchError::Network(self.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
    global_limit: Arc<Semaphore>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
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
            timeout: config.timeout,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            token_bucket,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, url: Url) -> Result<FetchedResponse, HttpError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| HttpError::Closed)?;

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = info_span!("http_fetch", url = %url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: Url) -> Result<FetchedResponse, HttpError> {
        let mut attempt = 0usize;
        loop {
            let retry_allowed = attempt < self.backoff.max_retries;
            match self.client.get(url.clone()).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse { final_url, body });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && retry_allowed {
                        debug!(status = status.as_u16(), attempt, "retrying after http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(HttpError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && retry_allowed {
                        debug!(error = %err, attempt, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(HttpError::Request(err));
                }
            }
        }
    }

    /// GET + JSON decode, with failures already expressed as [`FetchError`].
    pub async fn get_json(&self, url: Url) -> Result<JsonValue, FetchError> {
        let response = self
            .fetch_bytes(url)
            .await
            .map_err(|err| err.to_fetch_error(self.timeout))?;
        serde_json::from_slice(&response.body)
            .map_err(|err| FetchError::Decode(format!("{} ({})", err, response.final_url)))
    }
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
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn throttling_and_server_errors_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn http_status_maps_onto_fetch_taxonomy() {
        let timeout = Duration::from_secs(3);
        let status = |status: u16| HttpError::HttpStatus {
            status,
            url: "https://example.test/q".into(),
        };
        assert_eq!(status(401).to_fetch_error(timeout), FetchError::Unauthorized(401));
        assert_eq!(status(404).to_fetch_error(timeout), FetchError::NotFound);
        assert_eq!(status(429).to_fetch_error(timeout), FetchError::RateLimited);
        assert_eq!(status(502).to_fetch_error(timeout), FetchError::HttpStatus(502));
        assert!(HttpError::Closed.to_fetch_error(timeout).is_connectivity());
    }

    #[tokio::test(start_paused = true)]
    async fn token_bucket_waits_for_refill_once_drained() {
        let bucket = SimpleTokenBucket::new(2, Duration::from_millis(500));
        let started = tokio::time::Instant::now();
        bucket.take().await;
        bucket.take().await;
        assert_eq!(started.elapsed(), Duration::ZERO);
        bucket.take().await;
        assert!(started.elapsed() >= Duration::from_millis(500));
    }
}
