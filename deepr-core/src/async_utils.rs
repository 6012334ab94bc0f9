//! Async utilities and patterns
//!
//! Retry with backoff, deadlines, and a shared limiter for provider calls

use crate::error::{DeeprError, DeeprResult, ErrorContext};
use std::future::Future;
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, warn};

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: usize,
    /// Initial delay between retries in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum delay between retries in milliseconds
    pub max_delay_ms: u64,
    /// Backoff multiplier (exponential backoff)
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// No waiting between attempts
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }
}

/// Retry an async operation with exponential backoff.
///
/// Only recoverable errors (see [`DeeprError::is_recoverable`]) are retried;
/// anything else is returned immediately. A provider supplied retry-after
/// hint takes precedence over the computed delay.
pub async fn retry_async<F, Fut, T>(
    mut operation: F,
    config: &RetryConfig,
    operation_name: &str,
) -> DeeprResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DeeprResult<T>>,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay_ms;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(
                        operation = operation_name,
                        attempt = attempt,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(error) if !error.is_recoverable() => return Err(error),
            Err(error) => {
                if attempt >= config.max_attempts {
                    warn!(
                        operation = operation_name,
                        attempt = attempt,
                        error = %error,
                        "Operation failed after all retry attempts"
                    );
                    return Err(error);
                }

                let base = error.retry_delay_ms().unwrap_or(delay);
                let actual_delay = if config.jitter && base > 0 {
                    let jitter = (fastrand::f64() - 0.5) * 0.2;
                    ((base as f64) * (1.0 + jitter)) as u64
                } else {
                    base
                };

                warn!(
                    operation = operation_name,
                    attempt = attempt,
                    error = %error,
                    delay_ms = actual_delay,
                    "Operation failed, retrying"
                );

                if actual_delay > 0 {
                    sleep(Duration::from_millis(actual_delay)).await;
                }

                delay = ((delay as f64) * config.backoff_multiplier) as u64;
                delay = delay.min(config.max_delay_ms);
            }
        }
    }
}

/// Timeout wrapper for async operations
pub async fn with_timeout<F, T>(future: F, duration: Duration, operation_name: &str) -> DeeprResult<T>
where
    F: Future<Output = T>,
{
    match timeout(duration, future).await {
        Ok(result) => Ok(result),
        Err(_) => {
            let duration_ms = duration.as_millis() as u64;
            Err(DeeprError::Timeout {
                operation: operation_name.to_string(),
                duration_ms,
                context: ErrorContext::new("async_utils")
                    .with_operation("timeout")
                    .with_metadata("timeout_ms", &duration_ms.to_string())
                    .with_suggestion("Increase timeout duration")
                    .with_suggestion("Verify service availability"),
            })
        }
    }
}

/// Concurrency and pacing limiter shared by every caller of a provider
#[derive(Debug, Clone)]
pub struct RateLimiter {
    permits: Arc<tokio::sync::Semaphore>,
    min_interval: Duration,
    last_request: Arc<tokio::sync::Mutex<Option<tokio::time::Instant>>>,
}

impl RateLimiter {
    pub fn new(max_concurrent: usize, min_interval_ms: u64) -> Self {
        Self {
            permits: Arc::new(tokio::sync::Semaphore::new(max_concurrent.max(1))),
            min_interval: Duration::from_millis(min_interval_ms),
            last_request: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    /// Acquire a permit and enforce the minimum interval
    pub async fn acquire(&self) -> DeeprResult<RateLimitGuard> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| DeeprError::Internal {
                message: format!("Failed to acquire rate limit permit: {}", e),
                source: Some(Box::new(e)),
                context: ErrorContext::new("rate_limiter").with_operation("acquire"),
            })?;

        if !self.min_interval.is_zero() {
            let mut last_request = self.last_request.lock().await;
            if let Some(last) = *last_request {
                let elapsed = last.elapsed();
                if elapsed < self.min_interval {
                    let wait = self.min_interval - elapsed;
                    debug!(sleep_ms = wait.as_millis() as u64, "Rate limiting provider call");
                    sleep(wait).await;
                }
            }
            *last_request = Some(tokio::time::Instant::now());
        }

        Ok(RateLimitGuard { _permit: permit })
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

/// RAII guard for rate limiter permits
pub struct RateLimitGuard {
    _permit: tokio::sync::OwnedSemaphorePermit,
}
