//! Shared HTTP client for provider adapters: bounded concurrency, optional
//! rate limiting, and exponential backoff on transient failures.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};

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
            max_retries: 3,
            base_delay: Duration::from_millis(250),
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
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 4,
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

#[derive(Debug)]
struct TokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(config: TokenBucketConfig) -> Self {
        Self {
            capacity: config.capacity.max(1),
            refill_every: config.refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: config.capacity.max(1),
                last_refill: Instant::now(),
            }),
        }
    }

    async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if self.refill_every.as_millis() > 0 && elapsed >= self.refill_every {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }
            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }
            drop(state);
            tokio::time::sleep(self.refill_every).await;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchMethod {
    Get,
    PostForm(Vec<(String, String)>),
}

/// One outbound request, rebuilt on every retry attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub method: FetchMethod,
    pub query: Vec<(String, String)>,
    pub bearer: Option<String>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: FetchMethod::Get,
            query: Vec::new(),
            bearer: None,
        }
    }

    pub fn post_form(url: impl Into<String>, form: Vec<(String, String)>) -> Self {
        Self {
            url: url.into(),
            method: FetchMethod::PostForm(form),
            query: Vec::new(),
            bearer: None,
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus {
        status: u16,
        url: String,
        retry_after_secs: Option<u64>,
    },
    #[error("http fetcher is shutting down")]
    Closed,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<TokenBucket>,
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
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            token_bucket: config.token_bucket.map(TokenBucket::new),
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    fn build(&self, request: &FetchRequest) -> reqwest::RequestBuilder {
        let mut builder = match &request.method {
            FetchMethod::Get => self.client.get(&request.url),
            FetchMethod::PostForm(form) => self.client.post(&request.url).form(form),
        };
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    pub async fn fetch(
        &self,
        source: &str,
        request: &FetchRequest,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source, url = %request.url);
        self.fetch_with_retries(source, request).instrument(span).await
    }

    async fn fetch_with_retries(
        &self,
        source: &str,
        request: &FetchRequest,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self.global_limit.acquire().await.map_err(|_| FetchError::Closed)?;
        let per_source = self.per_source_semaphore(source).await;
        let _source = per_source.acquire().await.map_err(|_| FetchError::Closed)?;

        let mut attempt = 0;
        loop {
            if let Some(bucket) = &self.token_bucket {
                bucket.take().await;
            }
            let can_retry = attempt < self.backoff.max_retries;

            match self.build(request).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && can_retry {
                        debug!(status = status.as_u16(), attempt, "retrying after http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    let retry_after_secs = resp
                        .headers()
                        .get(RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.trim().parse::<u64>().ok());
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                        retry_after_secs,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && can_retry {
                        debug!(error = %err, attempt, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}
