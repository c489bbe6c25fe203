//! Cache entry with a fixed expiry.

use std::time::{Duration, Instant};

/// A cached value that expires `ttl` after it was last written.
#[derive(Clone, Debug)]
pub struct CacheEntry<V> {
    value: V,
    /// When this entry was first created.
    created_at: Instant,
    /// When this entry expires.
    expires_at: Instant,
}

impl<V> CacheEntry<V> {
    pub fn new(value: V, now: Instant, ttl: Duration) -> Self {
        Self {
            value,
            created_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Check if this entry has expired.
    pub fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }

    /// Push the expiry out to `now + ttl`.
    pub fn refresh(&mut self, now: Instant, ttl: Duration) {
        self.expires_at = now + ttl;
    }

    /// Replace the value and refresh the expiry.
    pub fn update(&mut self, value: V, now: Instant, ttl: Duration) {
        self.value = value;
        self.expires_at = now + ttl;
    }

    /// Age of the entry.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    /// Time until expiry (zero if already expired).
    pub fn time_to_expiry(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_millis(500);

    #[test]
    fn test_cache_entry_expiry() {
        let t0 = Instant::now();
        let entry = CacheEntry::new(7u16, t0, TTL);

        assert!(!entry.is_expired(t0));
        assert!(!entry.is_expired(t0 + TTL)); // at exactly expiry, not expired
        assert!(entry.is_expired(t0 + TTL + Duration::from_millis(1)));
    }

    #[test]
    fn test_cache_entry_refresh() {
        let t0 = Instant::now();
        let mut entry = CacheEntry::new(7u16, t0, TTL);
        let later = t0 + Duration::from_millis(400);

        entry.refresh(later, TTL);

        assert!(!entry.is_expired(t0 + Duration::from_millis(600)));
        assert!(entry.is_expired(later + TTL + Duration::from_millis(1)));
        // created_at is unchanged
        assert_eq!(entry.created_at(), t0);
    }

    #[test]
    fn test_cache_entry_update() {
        let t0 = Instant::now();
        let mut entry = CacheEntry::new(1u16, t0, TTL);
        let later = t0 + Duration::from_secs(1);

        entry.update(2, later, TTL);

        assert_eq!(*entry.value(), 2);
        assert_eq!(entry.expires_at(), later + TTL);
        assert_eq!(entry.age(later), Duration::from_secs(1));
    }

    #[test]
    fn test_cache_entry_times() {
        let t0 = Instant::now();
        let entry = CacheEntry::new((), t0, TTL);

        assert_eq!(entry.time_to_expiry(t0 + Duration::from_millis(200)), Duration::from_millis(300));
        assert_eq!(entry.time_to_expiry(t0 + Duration::from_secs(2)), Duration::ZERO);
        assert_eq!(entry.age(t0), Duration::ZERO);
    }
}
