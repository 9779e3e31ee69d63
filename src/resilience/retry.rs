//! Retry with exponential backoff and jitter

use crate::config::RetrySettings;
use crate::error::{ReviewError, ReviewResult};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const MIN_JITTERED_DELAY: Duration = Duration::from_millis(100);

/// Backoff schedule for transient failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            jitter: settings.jitter,
        }
    }

    /// Delay before the retry following attempt `attempt` (0-indexed):
    /// `min(initial * 2^attempt, max)`, optionally perturbed by a uniform
    /// factor in [-0.2, +0.2] and clamped to at least 100 ms.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
        let base = self
            .initial_delay
            .checked_mul(exp.min(u32::MAX as u64) as u32)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);
        if !self.jitter {
            return base;
        }
        let factor = 1.0 + (fastrand::f64() * 0.4 - 0.2);
        let jittered = base.mul_f64(factor);
        jittered.max(MIN_JITTERED_DELAY)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

/// Run `op` up to `max_attempts` times, sleeping between attempts per the
/// policy. Non-retryable errors fail immediately; cancellation is never
/// swallowed (cancelled sleeps surface as `Cancelled`). After the final
/// failed attempt, the last error is returned.
pub async fn retry<F, Fut, T, P>(
    cancel: &CancellationToken,
    policy: &RetryPolicy,
    retryable: P,
    mut op: F,
) -> ReviewResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ReviewResult<T>>,
    P: Fn(&ReviewError) -> bool,
{
    let mut last_error = None;
    for attempt in 0..policy.max_attempts {
        if cancel.is_cancelled() {
            return Err(ReviewError::Cancelled);
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(ReviewError::Cancelled) => return Err(ReviewError::Cancelled),
            Err(e) => {
                if !retryable(&e) {
                    return Err(e);
                }
                debug!(attempt = attempt + 1, error = %e, "retryable failure");
                last_error = Some(e);
                if attempt + 1 < policy.max_attempts {
                    let delay = policy.delay_for(attempt);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ReviewError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
    Err(last_error
        .unwrap_or_else(|| ReviewError::Internal("retry with zero attempts".to_string())))
}
