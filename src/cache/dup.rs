//! Duplicate suppression for controlled floods.
//!
//! A flooded control message reaches a node once per path. The first copy
//! is processed and re-flooded; copies with the same inner packet arriving
//! within the timeout are dropped.

use super::CacheStats;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Default cap on remembered fingerprints.
pub const DEFAULT_DUP_CACHE_SIZE: usize = 65_536;

/// Fingerprint cache keyed by CRC32-C of the inner packet.
#[derive(Debug)]
pub struct DupCache {
    /// Fingerprint -> expiry.
    seen: HashMap<u32, Instant>,
    ttl: Duration,
    max_entries: usize,
}

impl DupCache {
    pub fn new(ttl: Duration) -> Self {
        Self::with_capacity(ttl, DEFAULT_DUP_CACHE_SIZE)
    }

    pub fn with_capacity(ttl: Duration, max_entries: usize) -> Self {
        Self {
            seen: HashMap::new(),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    pub fn fingerprint(packet: &[u8]) -> u32 {
        crc32c::crc32c(packet)
    }

    /// Record `packet`; returns true if it was already seen and is still
    /// inside the window.
    pub fn check_and_insert(&mut self, packet: &[u8], now: Instant) -> bool {
        let fp = Self::fingerprint(packet);
        if self.seen.get(&fp).is_some_and(|&expires| now <= expires) {
            return true;
        }

        if self.seen.len() >= self.max_entries {
            self.purge_expired(now);
            if self.seen.len() >= self.max_entries {
                self.evict_oldest();
            }
        }
        self.seen.insert(fp, now + self.ttl);
        false
    }

    /// Whether `packet` is currently marked.
    pub fn contains(&self, packet: &[u8], now: Instant) -> bool {
        self.seen
            .get(&Self::fingerprint(packet))
            .is_some_and(|&expires| now <= expires)
    }

    /// Remove expired fingerprints; returns how many were removed.
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.seen.len();
        self.seen.retain(|_, &mut expires| now <= expires);
        before - self.seen.len()
    }

    fn evict_oldest(&mut self) {
        if let Some((&fp, _)) = self.seen.iter().min_by_key(|(_, &expires)| expires) {
            self.seen.remove(&fp);
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn stats(&self, now: Instant) -> CacheStats {
        CacheStats {
            entries: self.seen.len(),
            max_entries: self.max_entries,
            expired: self.seen.values().filter(|&&e| now > e).count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(40);

    #[test]
    fn test_second_copy_is_duplicate() {
        let mut cache = DupCache::new(TTL);
        let now = Instant::now();
        assert!(!cache.check_and_insert(b"ping 1", now));
        assert!(cache.check_and_insert(b"ping 1", now));
        assert!(!cache.check_and_insert(b"ping 2", now));
        assert!(cache.contains(b"ping 2", now));
    }

    #[test]
    fn test_entry_expires_after_timeout() {
        let mut cache = DupCache::new(TTL);
        let now = Instant::now();
        assert!(!cache.check_and_insert(b"pong", now));
        let later = now + TTL + Duration::from_millis(1);
        assert!(!cache.contains(b"pong", later));
        assert!(!cache.check_and_insert(b"pong", later));
        assert!(cache.check_and_insert(b"pong", later));
    }

    #[test]
    fn test_capacity_bound() {
        let mut cache = DupCache::with_capacity(TTL, 4);
        let now = Instant::now();
        for i in 0u8..10 {
            cache.check_and_insert(&[i], now + Duration::from_millis(i as u64));
        }
        assert_eq!(cache.len(), 4);
        // Most recent survive
        assert!(cache.contains(&[9], now));
        assert!(!cache.contains(&[0], now));
    }

    #[test]
    fn test_purge_and_stats() {
        let mut cache = DupCache::with_capacity(TTL, 100);
        let now = Instant::now();
        cache.check_and_insert(b"a", now);
        cache.check_and_insert(b"b", now + TTL);
        let later = now + TTL + Duration::from_millis(1);
        let stats = cache.stats(later);
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.expired, 1);
        assert_eq!(cache.purge_expired(later), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_fingerprint_is_crc32c() {
        // Castagnoli check value
        assert_eq!(DupCache::fingerprint(b"123456789"), 0xe306_9283);
    }
}
