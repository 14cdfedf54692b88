//! Token bucket rate limiter shared by every worker talking to one provider.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Global token bucket. `acquire` blocks the calling thread until a token is free.
pub struct RateLimiter {
    /// Tokens added per second; `None` disables limiting.
    rate: Option<f64>,
    capacity: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// A limiter allowing `rate_per_sec` calls per second, with a burst of `floor(rate)`.
    pub fn new(rate_per_sec: f64) -> Self {
        let rate = if rate_per_sec.is_finite() { rate_per_sec.max(0.1) } else { 0.1 };
        let capacity = rate.floor().max(1.0);
        Self {
            rate: Some(rate),
            capacity,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn unlimited() -> Self {
        Self {
            rate: None,
            capacity: f64::INFINITY,
            bucket: Mutex::new(Bucket {
                tokens: f64::INFINITY,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn rate(&self) -> Option<f64> {
        self.rate
    }

    /// Take one token, sleeping outside the lock until one is available.
    pub fn acquire(&self) {
        let rate = match self.rate {
            Some(r) => r,
            None => return,
        };
        loop {
            let wait = {
                let mut bucket = self.bucket.lock();
                self.refill(&mut bucket, rate);
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                (1.0 - bucket.tokens) / rate
            };
            std::thread::sleep(Duration::from_secs_f64(wait.max(0.001)));
        }
    }

    /// Take one token if one is available right now.
    pub fn try_acquire(&self) -> bool {
        let rate = match self.rate {
            Some(r) => r,
            None => return true,
        };
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, rate);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&self, bucket: &mut Bucket, rate: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.last_refill = now;
        bucket.tokens = (bucket.tokens + elapsed * rate).min(self.capacity);
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_burst_then_limited() {
        let limiter = RateLimiter::new(5.0);
        for _ in 0..5 {
            assert!(limiter.try_acquire());
        }
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn test_capacity_at_least_one() {
        let limiter = RateLimiter::new(0.5);
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn test_acquire_waits_for_refill() {
        let limiter = RateLimiter::new(20.0);
        for _ in 0..20 {
            limiter.acquire();
        }
        let start = Instant::now();
        limiter.acquire();
        limiter.acquire();
        // Two extra tokens at 20/s take roughly 100ms.
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn test_shared_across_threads() {
        let limiter = Arc::new(RateLimiter::new(10.0));
        let start = Instant::now();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    for _ in 0..4 {
                        limiter.acquire();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        // 16 calls against a bucket of 10 at 10/s: at least ~600ms in total.
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[test]
    fn test_unlimited_never_blocks() {
        let limiter = RateLimiter::unlimited();
        for _ in 0..10_000 {
            assert!(limiter.try_acquire());
        }
        assert_eq!(limiter.rate(), None);
    }
}
