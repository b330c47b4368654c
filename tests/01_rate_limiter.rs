use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use objgate::config::RateLimitConfig;
use objgate::gateway::{RateLimitError, RateLimiter};

#[tokio::test(start_paused = true)]
async fn full_bucket_allows_burst_then_waits_for_refill() {
    // Capacity 5, 10 tokens per second.
    let limiter = RateLimiter::new(5.0, 10.0);

    let started = Instant::now();
    for _ in 0..5 {
        limiter.acquire().await;
    }
    assert_eq!(started.elapsed(), Duration::ZERO);

    limiter.acquire().await;
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(100), "waited {waited:?}");
    assert!(waited < Duration::from_millis(150), "waited {waited:?}");
}

#[tokio::test(start_paused = true)]
async fn concurrent_acquirers_are_paced_by_refill_rate() {
    let limiter = Arc::new(RateLimiter::new(1.0, 10.0));
    let started = Instant::now();

    let mut tasks = Vec::new();
    for _ in 0..5 {
        let limiter = limiter.clone();
        tasks.push(tokio::spawn(async move { limiter.acquire().await }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    // One token up front, four more at 100ms apiece.
    assert!(started.elapsed() >= Duration::from_millis(400));
}

#[tokio::test(start_paused = true)]
async fn tokens_never_exceed_capacity_after_idle() {
    let limiter = RateLimiter::new(3.0, 100.0);
    limiter.try_acquire().unwrap();

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(limiter.available_tokens(), Some(3.0));
}

#[tokio::test(start_paused = true)]
async fn deadline_bound_acquire_reports_timeout() {
    let limiter = RateLimiter::from_config(&RateLimitConfig {
        requests_per_minute: 60,
        burst: Some(1),
        block: true,
    });

    let deadline = Instant::now() + Duration::from_millis(500);
    limiter.acquire_until(deadline).await.unwrap();

    // Next token is a full second away.
    let err = limiter.acquire_until(deadline).await.unwrap_err();
    assert!(matches!(err, RateLimitError::Timeout { .. }));

    // A deadline that covers the refill succeeds.
    limiter
        .acquire_until(Instant::now() + Duration::from_secs(2))
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn try_acquire_reports_retry_hint() {
    let limiter = RateLimiter::new(1.0, 2.0);
    limiter.try_acquire().unwrap();

    match limiter.try_acquire() {
        Err(RateLimitError::Exceeded { retry_after }) => {
            assert_eq!(retry_after, Duration::from_millis(500));
        }
        other => panic!("expected Exceeded, got {other:?}"),
    }
}
