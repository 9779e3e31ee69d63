//! Circuit breaker for degraded external services
//!
//! Closed passes calls through; `failure_threshold` consecutive failures
//! open the circuit; after `timeout` the first call transitions to
//! half-open and probes the service; `success_threshold` consecutive probe
//! successes close it again.

use crate::error::{ReviewError, ReviewResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::BreakerSettings;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Failing; calls are rejected without invoking the operation
    Open,
    /// Testing recovery; limited calls pass through
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: u32,
    successes: u32,
    last_failure: Option<Instant>,
}

/// Mutex-guarded breaker. The lock is held only for state reads and
/// transitions, never across the wrapped operation.
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    success_threshold: u32,
    timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: &str, settings: &BreakerSettings) -> Self {
        Self {
            name: name.to_string(),
            failure_threshold: settings.failure_threshold,
            success_threshold: settings.success_threshold,
            timeout: Duration::from_secs(settings.timeout_secs),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                last_failure: None,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Admission check; transitions open -> half-open after the timeout.
    fn before_call(&self) -> ReviewResult<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Open => {
                let elapsed_timeout = inner
                    .last_failure
                    .map_or(true, |t| t.elapsed() >= self.timeout);
                if elapsed_timeout {
                    info!(breaker = %self.name, "circuit transitioning to half-open");
                    inner.state = CircuitState::HalfOpen;
                    inner.successes = 0;
                    Ok(())
                } else {
                    Err(ReviewError::CircuitOpen(self.name.clone()))
                }
            }
            CircuitState::HalfOpen | CircuitState::Closed => Ok(()),
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.successes += 1;
                if inner.successes >= self.success_threshold {
                    info!(breaker = %self.name, "circuit closed after recovery");
                    inner.state = CircuitState::Closed;
                    inner.failures = 0;
                    inner.successes = 0;
                }
            }
            CircuitState::Closed => {
                inner.failures = 0;
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failures += 1;
        inner.last_failure = Some(Instant::now());
        match inner.state {
            CircuitState::HalfOpen => {
                warn!(breaker = %self.name, "probe failed, circuit re-opened");
                inner.state = CircuitState::Open;
                inner.successes = 0;
            }
            CircuitState::Closed => {
                if inner.failures >= self.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = inner.failures,
                        "circuit opened"
                    );
                    inner.state = CircuitState::Open;
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Execute an operation under breaker protection. In the open state
    /// the operation is never invoked. Cancellation is passed through
    /// without being counted as a service failure.
    pub async fn call<F, Fut, T>(&self, op: F) -> ReviewResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = ReviewResult<T>>,
    {
        self.before_call()?;
        match op().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(ReviewError::Cancelled) => Err(ReviewError::Cancelled),
            Err(e) => {
                self.on_failure();
                Err(e)
            }
        }
    }
}

/// Named breakers sharing one settings block, one per external service.
pub struct BreakerSet {
    settings: BreakerSettings,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerSet {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, &self.settings)))
            .clone()
    }
}
