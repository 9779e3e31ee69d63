//! Sliding-window rate limiter keyed by model tier
//!
//! Each tier keeps a deque of recent request timestamps; a request is
//! admitted when fewer than the tier's RPM fall inside the last 60 s.
//! Unknown tiers pass through unthrottled.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

const WINDOW: Duration = Duration::from_secs(60);
const POLL: Duration = Duration::from_millis(50);

struct TierWindow {
    rpm: u32,
    calls: Mutex<VecDeque<Instant>>,
}

/// Multi-producer safe; one mutex per tier so tiers never contend with
/// each other.
pub struct RateLimiter {
    tiers: HashMap<String, TierWindow>,
}

impl RateLimiter {
    /// Build from a tier -> requests-per-minute table. The tier set is
    /// fixed at construction.
    pub fn new(limits: &BTreeMap<String, u32>) -> Self {
        let tiers = limits
            .iter()
            .map(|(name, rpm)| {
                (
                    name.to_lowercase(),
                    TierWindow {
                        rpm: *rpm,
                        calls: Mutex::new(VecDeque::new()),
                    },
                )
            })
            .collect();
        Self { tiers }
    }

    /// Try to admit a request right now without waiting.
    pub fn try_acquire(&self, tier: &str) -> bool {
        let Some(window) = self.tiers.get(&tier.to_lowercase()) else {
            return true;
        };
        let now = Instant::now();
        let mut calls = window.calls.lock();
        while let Some(front) = calls.front() {
            if now.duration_since(*front) > WINDOW {
                calls.pop_front();
            } else {
                break;
            }
        }
        if (calls.len() as u32) < window.rpm {
            calls.push_back(now);
            true
        } else {
            false
        }
    }

    /// Block until the tier admits a request. May sleep up to one window.
    pub async fn acquire(&self, tier: &str) {
        loop {
            if self.try_acquire(tier) {
                return;
            }
            trace!(tier = %tier, "rate limit reached, waiting");
            tokio::time::sleep(POLL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(tier: &str, rpm: u32) -> RateLimiter {
        let limits = [(tier.to_string(), rpm)].into_iter().collect();
        RateLimiter::new(&limits)
    }

    #[tokio::test(start_paused = true)]
    async fn admits_exactly_rpm_within_window() {
        let limiter = limiter("flash", 3);
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire("flash").await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);

        // The fourth request has to wait out the window.
        limiter.acquire("flash").await;
        assert!(start.elapsed() >= WINDOW);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_tier_passes_through() {
        let limiter = limiter("flash", 1);
        let start = Instant::now();
        for _ in 0..100 {
            limiter.acquire("mystery").await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn window_frees_up_after_expiry() {
        let limiter = limiter("pro", 2);
        assert!(limiter.try_acquire("pro"));
        assert!(limiter.try_acquire("pro"));
        assert!(!limiter.try_acquire("pro"));

        tokio::time::advance(WINDOW + Duration::from_millis(1)).await;
        assert!(limiter.try_acquire("pro"));
    }

    #[tokio::test(start_paused = true)]
    async fn tier_names_are_case_insensitive() {
        let limiter = limiter("Flash", 1);
        assert!(limiter.try_acquire("FLASH"));
        assert!(!limiter.try_acquire("flash"));
    }
}
