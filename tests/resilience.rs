//! Resilience scenarios: transient retry, circuit isolation, rate limits

mod common;

use common::paper;
use revflow::config::BreakerSettings;
use revflow::error::{ReviewError, ReviewResult};
use revflow::resilience::{retry, BreakerSet, CircuitBreaker, CircuitState, RateLimiter, RetryPolicy};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn no_jitter_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(60),
        jitter: false,
    }
}

/// Scenario D: a screening call answers 429 twice, then 200. Total
/// backoff is 1 s + 2 s, the call succeeds, and the breaker stays closed.
#[tokio::test(start_paused = true)]
async fn transient_rate_limit_is_retried_through_the_breaker() {
    let cancel = CancellationToken::new();
    let breaker = CircuitBreaker::new("llm", &BreakerSettings::default());
    let attempts = AtomicU32::new(0);
    let start = Instant::now();

    let result = retry(
        &cancel,
        &no_jitter_policy(3),
        ReviewError::is_transient,
        || {
            let breaker = &breaker;
            let attempts = &attempts;
            async move {
                breaker
                    .call(|| async {
                        if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(ReviewError::ExternalTransient("429".to_string()))
                        } else {
                            Ok("included".to_string())
                        }
                    })
                    .await
            }
        },
    )
    .await;

    assert_eq!(result.unwrap(), "included");
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(start.elapsed(), Duration::from_secs(3));
    assert_eq!(breaker.state(), CircuitState::Closed);
}

/// Scenario E: five straight failures on provider "a" open its circuit;
/// later calls are rejected without reaching the provider, provider "b"
/// stays available, and after the timeout one probe is admitted.
#[tokio::test(start_paused = true)]
async fn search_outage_opens_only_that_providers_circuit() {
    let breakers = BreakerSet::new(BreakerSettings {
        failure_threshold: 5,
        success_threshold: 2,
        timeout_secs: 60,
    });
    let provider_hits = AtomicU32::new(0);

    let failing_search = || async {
        provider_hits.fetch_add(1, Ordering::SeqCst);
        Err::<Vec<revflow::PaperRef>, _>(ReviewError::ExternalTransient("outage".to_string()))
    };

    for _ in 0..5 {
        let _ = breakers.get("a").call(failing_search).await;
    }
    assert_eq!(breakers.get("a").state(), CircuitState::Open);
    assert_eq!(provider_hits.load(Ordering::SeqCst), 5);

    // Rejected fast, provider untouched.
    let err = breakers.get("a").call(failing_search).await.unwrap_err();
    assert!(matches!(err, ReviewError::CircuitOpen(_)));
    assert_eq!(provider_hits.load(Ordering::SeqCst), 5);

    // Other providers are unaffected.
    let ok: ReviewResult<Vec<revflow::PaperRef>> = breakers
        .get("b")
        .call(|| async { Ok(vec![paper("P1", "10.1/p1", "b")]) })
        .await;
    assert_eq!(ok.unwrap().len(), 1);

    // After the timeout the breaker admits a probe.
    tokio::time::advance(Duration::from_secs(61)).await;
    let _ = breakers.get("a").call(failing_search).await;
    assert_eq!(provider_hits.load(Ordering::SeqCst), 6);
}

/// Retry with a single attempt performs no sleeps at all.
#[tokio::test(start_paused = true)]
async fn one_shot_retry_never_sleeps() {
    let cancel = CancellationToken::new();
    let start = Instant::now();
    let result: ReviewResult<()> = retry(
        &cancel,
        &no_jitter_policy(1),
        ReviewError::is_transient,
        || async { Err(ReviewError::ExternalTransient("x".to_string())) },
    )
    .await;
    assert!(result.is_err());
    assert_eq!(start.elapsed(), Duration::ZERO);
}

/// A tier with RPM=N admits exactly N requests inside one window; the
/// next request waits for the window to roll.
#[tokio::test(start_paused = true)]
async fn rate_limiter_window_boundary() {
    let limits = [("flash".to_string(), 5u32)].into_iter().collect();
    let limiter = RateLimiter::new(&limits);

    let start = Instant::now();
    for _ in 0..5 {
        limiter.acquire("flash").await;
    }
    assert_eq!(start.elapsed(), Duration::ZERO);

    limiter.acquire("flash").await;
    assert!(start.elapsed() >= Duration::from_secs(60));
    assert!(start.elapsed() < Duration::from_secs(61));
}
