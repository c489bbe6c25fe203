//! Handshake initiation rate limiting.
//!
//! While the device is under load, initiations carrying a valid cookie are
//! still admitted only if the source address has tokens left. Each address
//! gets a small burst and then a steady rate.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Initiations per second per source address.
pub const DEFAULT_PACKETS_PER_SECOND: u32 = 20;

/// Initiations allowed back to back.
pub const DEFAULT_PACKETS_BURSTABLE: u32 = 5;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Per-address token bucket.
#[derive(Debug)]
pub struct HandshakeRateLimiter {
    buckets: HashMap<IpAddr, Bucket>,
    /// Tokens added per second.
    rate: f64,
    /// Bucket depth.
    burst: f64,
    /// Buckets idle longer than this are dropped.
    max_age: Duration,
    last_cleanup: Instant,
}

impl HandshakeRateLimiter {
    pub fn new() -> Self {
        Self::with_rate(DEFAULT_PACKETS_PER_SECOND, DEFAULT_PACKETS_BURSTABLE)
    }

    pub fn with_rate(per_second: u32, burst: u32) -> Self {
        Self {
            buckets: HashMap::new(),
            rate: per_second.max(1) as f64,
            burst: burst.max(1) as f64,
            max_age: Duration::from_secs(1),
            last_cleanup: Instant::now(),
        }
    }

    /// Check if an initiation from `ip` may be processed.
    ///
    /// Takes one token when returning true.
    pub fn allow(&mut self, ip: IpAddr) -> bool {
        self.allow_at(ip, Instant::now())
    }

    fn allow_at(&mut self, ip: IpAddr, now: Instant) -> bool {
        if now.saturating_duration_since(self.last_cleanup) >= self.max_age {
            self.cleanup(now);
        }

        let bucket = self.buckets.entry(ip).or_insert(Bucket {
            tokens: self.burst,
            last: now,
        });
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
        bucket.last = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Remove buckets that would be full again.
    fn cleanup(&mut self, now: Instant) {
        let max_age = self.max_age;
        self.buckets
            .retain(|_, b| now.saturating_duration_since(b.last) < max_age);
        self.last_cleanup = now;
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

impl Default for HandshakeRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
