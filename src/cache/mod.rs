//! Caching Entities
//!
//! Short-lived state the forwarding path consults per packet: the
//! duplicate-suppression cache for controlled floods, the layer-2
//! forwarding table learned from authenticated frames, and the per-source
//! rate limiter for handshake initiations under load.

mod dup;
mod entry;
mod l2fib;
mod rate_limit;

pub use dup::{DupCache, DEFAULT_DUP_CACHE_SIZE};
pub use entry::CacheEntry;
pub use l2fib::L2Fib;
pub use rate_limit::{
    HandshakeRateLimiter, DEFAULT_PACKETS_BURSTABLE, DEFAULT_PACKETS_PER_SECOND,
};

/// Cache statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Current number of entries.
    pub entries: usize,
    /// Maximum capacity; 0 when unbounded.
    pub max_entries: usize,
    /// Number of expired entries not yet purged.
    pub expired: usize,
}

impl CacheStats {
    /// Fill ratio (entries / max_entries).
    pub fn fill_ratio(&self) -> f64 {
        if self.max_entries == 0 {
            0.0
        } else {
            self.entries as f64 / self.max_entries as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_stats_fill_ratio() {
        let stats = CacheStats {
            entries: 50,
            max_entries: 100,
            expired: 0,
        };
        assert!((stats.fill_ratio() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_cache_stats_fill_ratio_unbounded() {
        let stats = CacheStats {
            entries: 10,
            max_entries: 0,
            expired: 0,
        };
        assert!((stats.fill_ratio() - 0.0).abs() < f64::EPSILON);
    }
}
