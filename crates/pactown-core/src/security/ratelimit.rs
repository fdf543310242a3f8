//! Token bucket rate limiting.
//!
//! The bucket is lazy: on each call the token count is refilled from the
//! monotonic time elapsed since the last update, so no background timer is
//! needed.

use std::time::{Duration, Instant};

/// A lazily refilled token bucket.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    updated: Instant,
}

impl TokenBucket {
    /// Create a full bucket with `per_minute` capacity refilled at
    /// capacity per 60 seconds.
    #[must_use]
    pub fn per_minute(per_minute: u32) -> Self {
        let capacity = f64::from(per_minute);
        Self {
            capacity,
            refill_per_sec: capacity / 60.0,
            tokens: capacity,
            updated: Instant::now(),
        }
    }

    /// The bucket's capacity (requests per minute it was built with).
    #[must_use]
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.updated).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.updated = now;
    }

    /// Try to consume one token at an explicit instant.
    pub fn try_consume_at(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Try to consume one token now.
    pub fn try_consume(&mut self) -> bool {
        self.try_consume_at(Instant::now())
    }

    /// Time until one token will be available, as of `now`.
    #[must_use]
    pub fn refill_eta_at(&self, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.updated).as_secs_f64();
        let tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        if tokens >= 1.0 || self.refill_per_sec <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64((1.0 - tokens) / self.refill_per_sec)
    }

    /// Time until one token will be available.
    #[must_use]
    pub fn refill_eta(&self) -> Duration {
        self.refill_eta_at(Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_bucket_allows_capacity_calls() {
        let mut bucket = TokenBucket::per_minute(20);
        let now = Instant::now();
        for _ in 0..20 {
            assert!(bucket.try_consume_at(now));
        }
        assert!(!bucket.try_consume_at(now));
    }

    #[test]
    fn test_refill_restores_tokens() {
        let mut bucket = TokenBucket::per_minute(60);
        let start = Instant::now();
        for _ in 0..60 {
            assert!(bucket.try_consume_at(start));
        }
        assert!(!bucket.try_consume_at(start));

        // One token refills per second at 60/min.
        assert!(bucket.try_consume_at(start + Duration::from_millis(1100)));
    }

    #[test]
    fn test_refill_never_exceeds_capacity() {
        let mut bucket = TokenBucket::per_minute(2);
        let start = Instant::now();
        // A long quiet period must not bank more than capacity.
        let later = start + Duration::from_secs(3600);
        assert!(bucket.try_consume_at(later));
        assert!(bucket.try_consume_at(later));
        assert!(!bucket.try_consume_at(later));
    }

    #[test]
    fn test_eta_positive_when_empty() {
        let mut bucket = TokenBucket::per_minute(20);
        let now = Instant::now();
        for _ in 0..20 {
            bucket.try_consume_at(now);
        }
        let eta = bucket.refill_eta_at(now);
        assert!(eta > Duration::ZERO);
        // 20/min refills a token in 3 seconds.
        assert!(eta <= Duration::from_secs(3));

        // After the eta has passed, a call succeeds again.
        assert!(bucket.try_consume_at(now + eta + Duration::from_millis(10)));
    }

    #[test]
    fn test_eta_zero_when_tokens_available() {
        let bucket = TokenBucket::per_minute(20);
        assert_eq!(bucket.refill_eta(), Duration::ZERO);
    }
}
