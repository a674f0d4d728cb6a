//! Per-pool admission rate limiting
//!
//! A continuously-refilling token bucket gates how many connections a pool
//! admits per window. Each listener task owns exactly one bucket, so the
//! type is deliberately not thread-safe; callers needing sharing must wrap
//! it themselves.

use std::time::{Duration, Instant};

use crate::config::RateQuota;

/// Token bucket admission throttle
///
/// The bucket starts full. Every call refills `elapsed * times / window`
/// tokens (capped at capacity) before attempting to take one token, so a
/// caller that waited long enough is always admitted.
#[derive(Debug)]
pub struct TokenBucket {
    /// Bucket capacity in tokens
    capacity: u32,
    /// Refill rate in tokens per second
    rate_per_sec: f64,
    /// Current token count
    tokens: f64,
    /// Instant of the last refill
    updated: Instant,
}

impl TokenBucket {
    /// Create a full bucket holding `capacity` tokens over `window`
    #[must_use]
    pub fn new(capacity: u32, window: Duration) -> Self {
        let window_secs = window.as_secs_f64();
        // A degenerate window refills near-instantly rather than dividing by zero
        let rate_per_sec = if window_secs > 0.0 {
            f64::from(capacity) / window_secs
        } else {
            f64::from(capacity) * 1e9
        };
        Self {
            capacity,
            rate_per_sec,
            tokens: f64::from(capacity),
            updated: Instant::now(),
        }
    }

    /// Create a bucket from a pool rate quota
    #[must_use]
    pub fn from_quota(quota: RateQuota) -> Self {
        Self::new(quota.times, quota.per)
    }

    /// Decide whether the current call is within the rate limit
    ///
    /// Refills first, then takes one token if at least one is available.
    pub fn within_rate_limit(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.updated);
        self.updated = now;

        self.tokens += elapsed.as_secs_f64() * self.rate_per_sec;
        if self.tokens > f64::from(self.capacity) {
            self.tokens = f64::from(self.capacity);
        }

        if self.tokens < 1.0 {
            return false;
        }
        self.tokens -= 1.0;
        true
    }

    /// Bucket capacity
    #[must_use]
    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Tokens currently available (rounded down)
    #[must_use]
    pub fn available(&self) -> u32 {
        self.tokens as u32
    }
}
