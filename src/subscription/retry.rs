//! Timeout and retry for payment processor calls.

use std::future::Future;
use std::time::Duration;

use super::error::{Result, SubscriptionError};

// ============================================================================
// Configuration
// ============================================================================

/// Retry and timeout settings for processor calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts for transient failures.
    pub max_retries: u32,
    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    pub max_delay_ms: u64,
    /// Per-attempt timeout in seconds.
    pub timeout_seconds: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            timeout_seconds: 30,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self::default().max_retries(0)
    }

    /// Set maximum retry attempts.
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set base delay for exponential backoff.
    #[must_use]
    pub fn base_delay_ms(mut self, ms: u64) -> Self {
        self.base_delay_ms = ms;
        self
    }

    /// Set maximum delay between retries.
    #[must_use]
    pub fn max_delay_ms(mut self, ms: u64) -> Self {
        self.max_delay_ms = ms;
        self
    }

    /// Set per-attempt timeout.
    #[must_use]
    pub fn timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

// ============================================================================
// Retry Logic
// ============================================================================

/// Execute a processor call with a timeout and retry transient failures.
///
/// Retries on:
/// - transient processor errors (429, 5xx, connection failures)
/// - timeouts
///
/// Permanent errors are returned after the first attempt.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, operation_fn: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let timeout_duration = policy.timeout();
    let mut attempts = 0;

    loop {
        let error = match tokio::time::timeout(timeout_duration, operation_fn()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e,
            Err(_elapsed) => SubscriptionError::from_http_status(
                operation,
                408,
                format!("Request timed out after {} seconds", policy.timeout_seconds),
            ),
        };

        if !error.is_retryable() || attempts >= policy.max_retries {
            if attempts > 0 {
                tracing::warn!(
                    target: "subscription.processor",
                    operation = operation,
                    attempts = attempts + 1,
                    error = %error,
                    "Processor call failed after retries"
                );
            }
            return Err(error);
        }

        let delay = calculate_backoff_delay(attempts, policy.base_delay_ms, policy.max_delay_ms);
        tracing::warn!(
            target: "subscription.processor",
            operation = operation,
            attempt = attempts + 1,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Retrying processor call after transient error"
        );
        tokio::time::sleep(delay).await;
        attempts += 1;
    }
}

/// Calculate backoff delay with exponential backoff and jitter.
#[inline]
fn calculate_backoff_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    // base_ms * 2^attempt, capped
    let delay_ms = base_ms.saturating_mul(2_u64.saturating_pow(attempt));
    let delay_ms = delay_ms.min(max_ms);

    // 0-25% jitter
    let jitter = if delay_ms > 0 {
        fastrand::u64(0..=delay_ms / 4)
    } else {
        0
    };
    Duration::from_millis(delay_ms.saturating_add(jitter))
}
