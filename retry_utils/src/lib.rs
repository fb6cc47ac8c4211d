use resource_manager::{RateLimiter, ResourceProvider};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Classification of errors for retry strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryableError {
    /// 429 or a rate-limit body - rotate the resource and retry
    RateLimit,
    /// 5xx or network failure - rotate the resource and retry
    ServerError,
    /// Call exceeded its timeout - rotate the resource and retry
    Timeout,
    /// Anything else - don't retry
    Other,
}

/// Failure of a single outbound fetch
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchError {
    #[error("rate limited: {detail}")]
    RateLimited {
        retry_after: Option<Duration>,
        detail: String,
    },

    #[error("server error: {0}")]
    ServerError(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("{0}")]
    Terminal(String),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: Box<FetchError> },
}

impl FetchError {
    pub fn rate_limited(detail: impl Into<String>) -> Self {
        Self::RateLimited {
            retry_after: None,
            detail: detail.into(),
        }
    }

    pub fn classify(&self) -> RetryableError {
        match self {
            Self::RateLimited { .. } => RetryableError::RateLimit,
            Self::ServerError(_) | Self::Network(_) => RetryableError::ServerError,
            Self::Timeout(_) => RetryableError::Timeout,
            Self::Terminal(_) | Self::Exhausted { .. } => RetryableError::Other,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.classify() != RetryableError::Other
    }

    /// Provider hint for how long the failing resource should rest
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Flat delay between attempts
    pub base_delay: Duration,
    /// Upper bound for a single attempt
    pub call_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Seconds form of a `retry-after` header
pub fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Runs a fetch with bounded attempts, leasing a fresh resource for each one.
///
/// Retryable failures are reported to the provider so the resource cools
/// down; terminal failures return at once and leave resource health alone.
/// When a limiter is attached every attempt is admitted through it, outside
/// of the call timeout.
#[derive(Clone)]
pub struct RetryController {
    config: RetryConfig,
    limiter: Option<Arc<RateLimiter>>,
}

impl RetryController {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            limiter: None,
        }
    }

    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub async fn execute<P, F, Fut, T>(&self, provider: &P, label: &str, mut work: F) -> Result<T, FetchError>
    where
        P: ResourceProvider + ?Sized,
        F: FnMut(P::Lease) -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let lease = provider.acquire().await;

            let outcome = {
                let _permit = match &self.limiter {
                    Some(limiter) => Some(limiter.acquire().await),
                    None => None,
                };
                match tokio::time::timeout(self.config.call_timeout, work(lease.clone())).await {
                    Ok(result) => result,
                    Err(_) => Err(FetchError::Timeout(self.config.call_timeout)),
                }
            };

            let err = match outcome {
                Ok(value) => {
                    provider.report_success(&lease);
                    if attempt > 1 {
                        debug!("✅ {} succeeded after {} attempts", label, attempt);
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            let error_type = err.classify();
            if error_type == RetryableError::Other {
                debug!("{} failed with non-retryable error: {}", label, err);
                return Err(err);
            }

            provider.report_failure(&lease, err.retry_after());

            if attempt >= max_attempts {
                error!("❌ {} failed after {} attempts: {}", label, attempt, err);
                return Err(FetchError::Exhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            warn!(
                "⚠️  {} failed (attempt {}/{}) via {:?}: {} - retrying in {}ms ({:?})",
                label,
                attempt,
                max_attempts,
                lease,
                err,
                self.config.base_delay.as_millis(),
                error_type
            );
            tokio::time::sleep(self.config.base_delay).await;
        }
    }
}
