//! Per-client token-bucket rate limiter, layered in front of the engine,
//! which has no notion of request rate at all.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::time::{Duration, Instant};

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// A `rate`-per-second, `burst`-capacity token bucket keyed by client IP.
pub struct RateLimiter {
    rate_per_sec: f64,
    burst: f64,
    buckets: DashMap<IpAddr, Mutex<Bucket>>,
}

impl RateLimiter {
    pub fn new(rate_per_sec: u32, burst: u32) -> Self {
        Self {
            rate_per_sec: rate_per_sec.max(1) as f64,
            burst: burst.max(1) as f64,
            buckets: DashMap::new(),
        }
    }

    /// Attempts to take one token for `addr`. Returns `true` if allowed.
    pub fn check(&self, addr: IpAddr) -> bool {
        let entry = self
            .buckets
            .entry(addr)
            .or_insert_with(|| {
                Mutex::new(Bucket {
                    tokens: self.burst,
                    last_refill: Instant::now(),
                })
            });
        let mut bucket = entry.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.last_refill = now;
        bucket.tokens = (bucket.tokens + elapsed * self.rate_per_sec).min(self.burst);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drops bucket entries idle for longer than `idle_for`, bounding
    /// memory use across many distinct clients over time.
    pub fn sweep_idle(&self, idle_for: Duration) {
        self.buckets
            .retain(|_, bucket| bucket.lock().last_refill.elapsed() <= idle_for);
    }
}
