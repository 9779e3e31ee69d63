//! Per-run execution context
//!
//! One [`RunContext`] threads through every phase handler: configuration,
//! providers, the PRISMA counter, resilience primitives, and a single
//! cancellation token covering the whole run. Every blocking external call
//! goes through [`RunContext::with_timeout`] so cancellation and deadlines
//! are honored uniformly.

use crate::config::ReviewConfig;
use crate::error::{ReviewError, ReviewResult};
use crate::prisma::PrismaCounter;
use crate::providers::ProviderSet;
use crate::resilience::{BreakerSet, RateLimiter, RetryPolicy};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct RunContext {
    pub config: Arc<ReviewConfig>,
    pub providers: Arc<ProviderSet>,
    pub prisma: Arc<PrismaCounter>,
    pub limiter: Arc<RateLimiter>,
    pub breakers: Arc<BreakerSet>,
    /// Run directory where phases drop non-checkpoint artifacts
    /// (figures, manuscript, bibliography)
    pub artifacts_dir: PathBuf,
    cancel: CancellationToken,
}

impl RunContext {
    pub fn new(
        config: Arc<ReviewConfig>,
        providers: Arc<ProviderSet>,
        prisma: Arc<PrismaCounter>,
        artifacts_dir: PathBuf,
        cancel: CancellationToken,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(&config.model_tiers));
        let breakers = Arc::new(BreakerSet::new(config.breaker.clone()));
        Self {
            config,
            providers,
            prisma,
            limiter,
            breakers,
            artifacts_dir,
            cancel,
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail fast when the run has been cancelled.
    pub fn ensure_active(&self) -> ReviewResult<()> {
        if self.cancel.is_cancelled() {
            Err(ReviewError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Retry policy derived from configuration.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_settings(&self.config.retry)
    }

    /// Run a fallible future under the run's cancellation token and a
    /// per-call deadline.
    pub async fn with_timeout<T, Fut>(&self, timeout: Duration, fut: Fut) -> ReviewResult<T>
    where
        Fut: std::future::Future<Output = ReviewResult<T>>,
    {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ReviewError::Cancelled),
            result = tokio::time::timeout(timeout, fut) => match result {
                Ok(inner) => inner,
                Err(_) => Err(ReviewError::Timeout),
            },
        }
    }

    /// Wait for the rate limiter to admit a request on a model tier.
    pub async fn throttle(&self, tier: &str) -> ReviewResult<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ReviewError::Cancelled),
            _ = self.limiter.acquire(tier) => Ok(()),
        }
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeouts.llm_secs)
    }

    pub fn pdf_timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeouts.pdf_secs)
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeouts.search_secs)
    }
}
