use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

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

/// Timeouts are final for the cycle; only connection-level failures are retried.
pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() {
        RetryDisposition::NonRetryable
    } else if err.is_connect() || err.is_request() {
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
    /// Minimum spacing between two requests to the same source.
    pub min_request_delay: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: None,
            global_concurrency: 8,
            min_request_delay: Duration::from_millis(1500),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("timed out after {timeout:?} fetching {url}")]
    Timeout { url: String, timeout: Duration },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Shared outbound client. Requests are capped globally and paced per source.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    min_request_delay: Duration,
    timeout: Duration,
    next_slot: Mutex<HashMap<String, Instant>>,
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

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            min_request_delay: config.min_request_delay,
            timeout: config.timeout,
            next_slot: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    /// Wait until `source` may issue its next request and reserve the slot after it.
    async fn pace(&self, source: &str) {
        let wait_until = {
            let mut slots = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = slots
                .get(source)
                .copied()
                .filter(|slot| *slot > now)
                .unwrap_or(now);
            slots.insert(source.to_string(), slot + self.min_request_delay);
            slot
        };
        tokio::time::sleep_until(wait_until).await;
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, source, url);
        self.fetch_inner(source, url).instrument(span).await
    }

    pub async fn fetch_text(
        &self,
        run_id: Uuid,
        source: &str,
        url: &str,
    ) -> Result<String, FetchError> {
        Ok(self.fetch_bytes(run_id, source, url).await?.text())
    }

    async fn fetch_inner(&self, source: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            self.pace(source).await;
            let result = {
                // A closed semaphore only happens at shutdown; fall through unthrottled.
                let _permit = self.global_limit.acquire().await.ok();
                self.send_once(url).await
            };

            let disposition = match &result {
                Ok(_) => return result,
                Err(FetchError::HttpStatus { status, .. }) => StatusCode::from_u16(*status)
                    .map(classify_status)
                    .unwrap_or(RetryDisposition::NonRetryable),
                Err(FetchError::Request(err)) => classify_reqwest_error(err),
                Err(FetchError::Timeout { .. }) => RetryDisposition::NonRetryable,
            };

            if disposition == RetryDisposition::NonRetryable || attempt >= self.backoff.max_retries {
                return result;
            }
            let delay = self.backoff.delay_for_attempt(attempt);
            debug!(attempt, ?delay, "retrying fetch");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn send_once(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let map_err = |err: reqwest::Error| {
            if err.is_timeout() {
                FetchError::Timeout {
                    url: url.to_string(),
                    timeout: self.timeout,
                }
            } else {
                FetchError::Request(err)
            }
        };

        let resp = self.client.get(url).send().await.map_err(map_err)?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.bytes().await.map_err(map_err)?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}
