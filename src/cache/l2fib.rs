//! Layer-2 forwarding table.
//!
//! Maps the source MAC of every authenticated unicast frame to the node it
//! came from, so frames read from the interface can be sent to one node
//! instead of flooded.

use super::{CacheEntry, CacheStats};
use crate::protocol::NodeId;
use crate::tap::MacAddr;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct L2Fib {
    entries: HashMap<MacAddr, CacheEntry<NodeId>>,
    ttl: Duration,
}

impl L2Fib {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    /// Record that `mac` lives behind `node`. Group addresses are ignored.
    pub fn learn(&mut self, mac: MacAddr, node: NodeId, now: Instant) {
        if !mac.is_unicast() || node.is_special() {
            return;
        }
        match self.entries.get_mut(&mac) {
            Some(entry) => entry.update(node, now, self.ttl),
            None => {
                self.entries.insert(mac, CacheEntry::new(node, now, self.ttl));
            }
        }
    }

    /// Node that owns `mac`, if learned and not expired.
    pub fn lookup(&self, mac: &MacAddr, now: Instant) -> Option<NodeId> {
        self.entries
            .get(mac)
            .filter(|e| !e.is_expired(now))
            .map(|e| *e.value())
    }

    /// Drop expired entries; returns how many were removed.
    pub fn clear_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        before - self.entries.len()
    }

    /// Forget every MAC learned from `node`.
    pub fn forget_node(&mut self, node: NodeId) {
        self.entries.retain(|_, e| *e.value() != node);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self, now: Instant) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            max_entries: 0,
            expired: self.entries.values().filter(|e| e.is_expired(now)).count(),
        }
    }
}
