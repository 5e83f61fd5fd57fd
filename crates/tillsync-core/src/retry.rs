//! Retry with exponential backoff for mirror calls.
//!
//! Only transient failures are retried: transport errors, HTTP 429 and 5xx.
//! Everything else (bad credentials, malformed responses, local errors) is
//! returned on the first attempt.
//!
//! ```rust,ignore
//! use tillsync_core::retry::{RetryPolicy, with_retry};
//!
//! let rows = with_retry(&RetryPolicy::sheets_api(), "read_rows", || {
//!     transport.read_rows("Sales")
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Backoff settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Multiplier applied per retry (>= 1.0).
    pub backoff_factor: f64,
    /// Jitter as a fraction of the delay (0.1 = ±10%).
    pub jitter_percent: f64,
    /// Total attempts including the first. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::sheets_api()
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(
        initial_delay: Duration,
        max_delay: Duration,
        backoff_factor: f64,
        jitter_percent: f64,
        max_attempts: Option<u32>,
    ) -> Self {
        Self {
            initial_delay,
            max_delay,
            backoff_factor: backoff_factor.max(1.0),
            jitter_percent: jitter_percent.clamp(0.0, 1.0),
            max_attempts,
        }
    }

    /// Spreadsheet API calls: 4 attempts starting at 500ms. Quota errors
    /// (429) clear within seconds.
    #[must_use]
    pub fn sheets_api() -> Self {
        Self::new(
            Duration::from_millis(500),
            Duration::from_secs(8),
            2.0,
            0.2,
            Some(4),
        )
    }

    /// Single attempt, no waiting.
    #[must_use]
    pub fn no_retry() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, 1.0, 0.0, Some(1))
    }

    /// Delay to apply after failed attempt `attempt` (0-indexed).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let initial_ms = u64::try_from(self.initial_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);

        let exp = attempt.min(31) as i32;
        let base_ms = ((initial_ms as f64) * self.backoff_factor.powi(exp)).min(max_ms as f64);

        let jitter = if self.jitter_percent > 0.0 && base_ms > 0.0 {
            let range = base_ms * self.jitter_percent;
            rand::rng().random_range(-range..=range)
        } else {
            0.0
        };
        Duration::from_millis((base_ms + jitter).max(0.0) as u64)
    }
}

/// Whether retrying the failed call may help.
#[must_use]
pub fn is_retryable(error: &Error) -> bool {
    match error {
        Error::Mirror(e) => e.is_transient(),
        Error::Runtime(_) => true,
        Error::Store(_) | Error::Config(_) | Error::Io(_) | Error::Json(_) => false,
    }
}

/// Run `operation` until it succeeds, fails permanently, or the policy's
/// attempt budget is spent. `label` names the call in logs.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let start = std::time::Instant::now();
    let mut attempt = 0u32;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(operation = label, retries = attempt, "mirror call recovered");
                }
                return Ok(value);
            }
            Err(e) => {
                attempt += 1;
                if !is_retryable(&e) {
                    debug!(operation = label, error = %e, "permanent failure, not retrying");
                    return Err(e);
                }
                if policy.max_attempts.is_some_and(|max| attempt >= max) {
                    warn!(
                        operation = label,
                        attempts = attempt,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        error = %e,
                        "mirror call failed after retries"
                    );
                    return Err(e);
                }
                let delay = policy.delay_for_attempt(attempt - 1);
                debug!(
                    operation = label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying mirror call"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
