//! Per-source token bucket (§4.7 step 1, §8 invariant 4).

use std::time::{Duration, Instant};

/// Tokens never exceed `capacity` (§3.3 invariant).
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_second: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_per_second: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_per_second,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        self.tokens = (self.tokens + elapsed * self.refill_per_second).min(self.capacity);
        self.last_refill = now;
    }

    /// Attempts to consume one token. Returns `true` if admitted.
    pub fn try_consume(&mut self) -> bool {
        self.try_consume_at(Instant::now())
    }

    pub fn try_consume_at(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Bounded exponential backoff with full jitter, for adapter restarts
/// (§4.1: base 1s, cap 60s).
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap, attempt: 0 }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Returns the next delay to wait before retrying, advancing the
    /// attempt counter. Full-jitter: uniform in `[0, min(cap, base*2^n)]`.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.base.as_secs_f64() * 2f64.powi(self.attempt as i32);
        let capped = exp.min(self.cap.as_secs_f64());
        self.attempt = self.attempt.saturating_add(1);
        let jittered = rand::random::<f64>() * capped;
        Duration::from_secs_f64(jittered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_admits_up_to_capacity_then_blocks() {
        let mut bucket = TokenBucket::new(3.0, 0.0);
        assert!(bucket.try_consume());
        assert!(bucket.try_consume());
        assert!(bucket.try_consume());
        assert!(!bucket.try_consume());
    }

    #[test]
    fn bucket_refills_over_time() {
        let mut bucket = TokenBucket::new(1.0, 10.0);
        assert!(bucket.try_consume());
        assert!(!bucket.try_consume());
        let later = Instant::now() + Duration::from_millis(200);
        assert!(bucket.try_consume_at(later));
    }

    #[test]
    fn bucket_never_exceeds_capacity() {
        let mut bucket = TokenBucket::new(5.0, 1000.0);
        let later = Instant::now() + Duration::from_secs(1000);
        bucket.refill(later);
        assert!(bucket.tokens <= 5.0);
    }

    #[test]
    fn backoff_never_exceeds_cap() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        for _ in 0..20 {
            let d = b.next_delay();
            assert!(d <= Duration::from_secs(60));
        }
    }
}
