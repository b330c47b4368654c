//! Token-bucket rate limiter.
//!
//! Refill and consume happen as one step under the bucket lock. Callers that
//! have to wait sleep with the lock released, then retry, since concurrent
//! acquirers may take the token that was just refilled.

use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::{Instant, sleep, sleep_until};
use tracing::trace;

use crate::config::RateLimitConfig;

// -----------------------------------------------------------------------------
// ----- RateLimiter -----------------------------------------------------------

#[derive(Debug)]
pub struct RateLimiter {
    /// `None` when limiting is disabled.
    bucket: Option<Mutex<Bucket>>,
}

// -----------------------------------------------------------------------------
// ----- RateLimiter: Static ---------------------------------------------------

impl RateLimiter {
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        if capacity <= 0.0 || refill_rate <= 0.0 {
            return Self::disabled();
        }

        Self {
            bucket: Some(Mutex::new(Bucket::full(capacity, refill_rate))),
        }
    }

    pub fn disabled() -> Self {
        Self { bucket: None }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        if config.requests_per_minute <= 0 {
            return Self::disabled();
        }

        let per_minute = config.requests_per_minute as f64;
        let capacity = config
            .burst
            .map(f64::from)
            .unwrap_or(per_minute)
            .max(1.0);
        Self::new(capacity, per_minute / 60.0)
    }
}

// -----------------------------------------------------------------------------
// ----- RateLimiter: Public ---------------------------------------------------

impl RateLimiter {
    pub fn is_enabled(&self) -> bool {
        self.bucket.is_some()
    }

    /// Waits as long as needed for a token.
    pub async fn acquire(&self) {
        let Some(bucket) = &self.bucket else {
            return;
        };

        loop {
            let taken = bucket.lock().try_take(Instant::now());
            match taken {
                Ok(()) => return,
                Err(wait) => sleep(wait).await,
            }
        }
    }

    /// Waits for a token until `deadline`. Fails straight away when the
    /// required wait already overshoots the deadline.
    pub async fn acquire_until(&self, deadline: Instant) -> Result<(), RateLimitError> {
        let Some(bucket) = &self.bucket else {
            return Ok(());
        };

        let started = Instant::now();
        loop {
            let now = Instant::now();
            let wait = match bucket.lock().try_take(now) {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };

            if now + wait > deadline {
                return Err(RateLimitError::Timeout {
                    waited: now.saturating_duration_since(started),
                });
            }

            trace!(wait_ms = wait.as_millis() as u64, "rate limited, waiting for refill");
            sleep_until(now + wait).await;
        }
    }

    /// Non-blocking variant.
    pub fn try_acquire(&self) -> Result<(), RateLimitError> {
        let Some(bucket) = &self.bucket else {
            return Ok(());
        };

        bucket
            .lock()
            .try_take(Instant::now())
            .map_err(|retry_after| RateLimitError::Exceeded { retry_after })
    }

    /// Tokens currently in the bucket, after refill. `None` when disabled.
    pub fn available_tokens(&self) -> Option<f64> {
        let bucket = self.bucket.as_ref()?;
        let mut bucket = bucket.lock();
        bucket.refill(Instant::now());
        Some(bucket.tokens)
    }
}

// -----------------------------------------------------------------------------
// ----- Bucket ----------------------------------------------------------------

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl Bucket {
    fn full(capacity: f64, refill_rate: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Takes one token, or returns how long until one is available.
    fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }

        let missing = 1.0 - self.tokens;
        Err(Duration::from_secs_f64(missing / self.refill_rate))
    }
}

// -----------------------------------------------------------------------------
// ----- Errors ----------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("rate limit exceeded; retry after {retry_after:?}")]
    Exceeded { retry_after: Duration },

    #[error("timed out after {waited:?} waiting for rate limit token")]
    Timeout { waited: Duration },
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
