//! Rate-limited, retrying, caching HTTP fetch client
//!
//! Each request goes through, in order: cache lookup, the source's shared
//! rate limiter, the HTTP call, and on a retriable failure an exponential
//! backoff sleep before trying again. Successful JSON payloads are cached
//! under a hash of (endpoint, sorted params).

pub mod rate_limiter;

pub use rate_limiter::RateLimiterRegistry;

use governor::DefaultDirectRateLimiter;
use kgdb_common::Error;
use rand::Rng;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::{request_cache_key, CacheStore};
use crate::config::{HttpConfig, RetryPolicy};

/// Longest upstream error body kept in an error message
const ERROR_BODY_LIMIT: usize = 200;

/// Fetch failure classification
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Rate limited by upstream (HTTP 429)")]
    RateLimited,

    #[error("HTTP {0}: {1}")]
    Status(u16, String),

    #[error("Request timed out")]
    Timeout,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: Box<FetchError> },

    #[error("Cancelled")]
    Cancelled,
}

impl FetchError {
    /// Whether `policy` allows another attempt after this failure
    pub fn is_retriable(&self, policy: &RetryPolicy) -> bool {
        match self {
            FetchError::RateLimited => policy.is_retriable_status(429),
            FetchError::Status(status, _) => policy.is_retriable_status(*status),
            FetchError::Timeout | FetchError::Network(_) => true,
            FetchError::Malformed(_) | FetchError::Exhausted { .. } | FetchError::Cancelled => {
                false
            }
        }
    }

    /// True when the (final) failure was upstream rate limiting
    pub fn is_rate_limit(&self) -> bool {
        match self {
            FetchError::RateLimited => true,
            FetchError::Exhausted { last, .. } => last.is_rate_limit(),
            _ => false,
        }
    }
}

impl From<FetchError> for Error {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Cancelled => Error::Cancelled,
            other => Error::Upstream {
                rate_limited: other.is_rate_limit(),
                message: other.to_string(),
            },
        }
    }
}

/// Shared reqwest client honouring the configured timeout and user agent
pub fn build_http_client(config: &HttpConfig) -> kgdb_common::Result<reqwest::Client> {
    let mut headers = reqwest::header::HeaderMap::new();
    headers.insert(
        reqwest::header::ACCEPT,
        reqwest::header::HeaderValue::from_static("application/json"),
    );

    reqwest::Client::builder()
        .default_headers(headers)
        .timeout(config.timeout())
        .connect_timeout(Duration::from_secs(config.timeout_secs.clamp(1, 10)))
        .user_agent(config.user_agent.clone())
        .build()
        .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))
}

/// Fetch client bound to one source
#[derive(Clone)]
pub struct FetchClient {
    source: String,
    http: reqwest::Client,
    limiter: Arc<DefaultDirectRateLimiter>,
    retry: RetryPolicy,
    cache: CacheStore,
    cache_ttl: Duration,
}

impl FetchClient {
    pub fn new(
        source: impl Into<String>,
        http: reqwest::Client,
        limiter: Arc<DefaultDirectRateLimiter>,
        retry: RetryPolicy,
        cache: CacheStore,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            source: source.into(),
            http,
            limiter,
            retry,
            cache,
            cache_ttl,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// GET `url` with `params`, returning the JSON payload
    pub async fn request(&self, url: &str, params: &[(String, String)]) -> Result<Value, FetchError> {
        self.request_with_cancel(url, params, &CancellationToken::new())
            .await
    }

    /// Like `request`, but gives up with `FetchError::Cancelled` as soon as
    /// `cancel` fires (while waiting on the limiter, a backoff, or the call)
    pub async fn request_with_cancel(
        &self,
        url: &str,
        params: &[(String, String)],
        cancel: &CancellationToken,
    ) -> Result<Value, FetchError> {
        let use_cache = !self.cache_ttl.is_zero();
        let cache_key = request_cache_key(url, params);

        if use_cache {
            if let Some(cached) = self.cache.get(&self.source, &cache_key).await {
                debug!(source = %self.source, url, "Cache hit");
                return Ok(cached);
            }
        }

        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                _ = self.limiter.until_ready() => {}
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                outcome = self.send_once(url, params) => outcome,
            };

            match outcome {
                Ok(payload) => {
                    if use_cache {
                        self.cache
                            .set(&self.source, &cache_key, &payload, self.cache_ttl)
                            .await;
                    }
                    return Ok(payload);
                }
                Err(err) if err.is_retriable(&self.retry) => {
                    let attempts_made = attempt + 1;
                    if attempts_made >= self.retry.max_attempts {
                        warn!(
                            source = %self.source,
                            url,
                            attempts = attempts_made,
                            error = %err,
                            "Retries exhausted"
                        );
                        return Err(FetchError::Exhausted {
                            attempts: attempts_made,
                            last: Box::new(err),
                        });
                    }

                    let sample: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
                    let delay = self.retry.delay_for(attempt, sample);
                    warn!(
                        source = %self.source,
                        url,
                        attempt = attempts_made,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient fetch failure, backing off"
                    );

                    tokio::select! {
                        _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn send_once(&self, url: &str, params: &[(String, String)]) -> Result<Value, FetchError> {
        debug!(source = %self.source, url, ?params, "Sending request");

        let response = self
            .http
            .get(url)
            .query(params)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(FetchError::RateLimited);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(ERROR_BODY_LIMIT).collect();
            return Err(FetchError::Status(status.as_u16(), snippet));
        }

        let bytes = response.bytes().await.map_err(classify_reqwest_error)?;
        serde_json::from_slice(&bytes).map_err(|e| FetchError::Malformed(e.to_string()))
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else if err.is_decode() {
        FetchError::Malformed(err.to_string())
    } else {
        FetchError::Network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification_follows_policy() {
        let policy = RetryPolicy::default();
        assert!(FetchError::RateLimited.is_retriable(&policy));
        assert!(FetchError::Status(503, String::new()).is_retriable(&policy));
        assert!(FetchError::Timeout.is_retriable(&policy));
        assert!(!FetchError::Status(404, String::new()).is_retriable(&policy));
        assert!(!FetchError::Malformed("eof".to_string()).is_retriable(&policy));

        let strict = RetryPolicy {
            retriable_statuses: vec![503],
            ..RetryPolicy::default()
        };
        assert!(!FetchError::RateLimited.is_retriable(&strict));
    }

    #[test]
    fn test_exhausted_rate_limit_maps_to_rate_limited_upstream() {
        let err: Error = FetchError::Exhausted {
            attempts: 5,
            last: Box::new(FetchError::RateLimited),
        }
        .into();
        assert!(err.is_rate_limited());

        let err: Error = FetchError::Status(400, "bad query".to_string()).into();
        assert!(matches!(err, Error::Upstream { rate_limited: false, .. }));

        let err: Error = FetchError::Cancelled.into();
        assert!(matches!(err, Error::Cancelled));
    }
}
