//! Throttled page fetching: a permit gate, a fixed pause before each request,
//! and capped exponential backoff on transient failures.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};

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
    /// `base_delay * 2^retry`, never above `max_delay`.
    pub fn delay_before_retry(&self, retry: usize) -> Duration {
        let doubled = u32::try_from(retry)
            .ok()
            .and_then(|shift| 2u32.checked_pow(shift))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(doubled).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Requests allowed in flight at once.
    pub max_concurrent_requests: usize,
    /// Pause after taking a permit, before the request goes out.
    pub request_delay: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_concurrent_requests: 15,
            request_delay: Duration::from_millis(250),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: u16,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedPage {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
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
    HttpStatus { status: u16, url: String },
    #[error("request gate closed")]
    GateClosed,
}

impl FetchError {
    /// Throttling, server errors and transport hiccups are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::HttpStatus { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS.as_u16() || (500..600).contains(status)
            }
            FetchError::Request { source, .. } => source.is_timeout() || source.is_connect() || source.is_request(),
            FetchError::GateClosed => false,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    gate: Arc<Semaphore>,
    request_delay: Duration,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = config.user_agent {
            builder = builder.user_agent(user_agent);
        }

        Ok(Self {
            client: builder.build().context("building http client")?,
            gate: Arc::new(Semaphore::new(config.max_concurrent_requests.max(1))),
            request_delay: config.request_delay,
            backoff: config.backoff,
        })
    }

    pub fn available_permits(&self) -> usize {
        self.gate.available_permits()
    }

    pub async fn get(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let _permit = self.gate.acquire().await.map_err(|_| FetchError::GateClosed)?;
        if !self.request_delay.is_zero() {
            tokio::time::sleep(self.request_delay).await;
        }
        self.get_with_backoff(url).instrument(info_span!("http_get", url)).await
    }

    async fn get_with_backoff(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let mut retry = 0;
        loop {
            match self.attempt(url).await {
                Err(err) if err.is_retryable() && retry < self.backoff.max_retries => {
                    debug!(error = %err, retry, "transient fetch failure");
                    tokio::time::sleep(self.backoff.delay_before_retry(retry)).await;
                    retry += 1;
                }
                outcome => return outcome,
            }
        }
    }

    async fn attempt(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let request_failed = |source| FetchError::Request {
            url: url.to_string(),
            source,
        };
        let resp = self.client.get(url).send().await.map_err(request_failed)?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.bytes().await.map_err(request_failed)?.to_vec();
        Ok(FetchedPage {
            status: status.as_u16(),
            final_url,
            body,
        })
    }
}
