//! Session Index Table
//!
//! Every handshake and every transport keypair is addressed by a 32-bit
//! index chosen by the receiver; incoming datagrams carry it so the
//! receive path finds the peer and keypair in O(1).
//!
//! ## Design
//!
//! - Indices are random (OS RNG) so they cannot be guessed or correlated
//! - An index first names an in-flight handshake and is then bound to the
//!   keypair the handshake derived
//! - Entries hold the peer weakly; the peer table owns peers
//!
//! ## Wire Format
//!
//! ```text
//! [usage][receiver_idx:4 LE][counter:8 LE][ciphertext+tag]
//! ```

use crate::noise::Keypair;
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use thiserror::Error;

/// Errors related to index allocation.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("no available indices (too many active sessions)")]
    Exhausted,

    #[error("index {0:08x} not found")]
    NotFound(u32),

    #[error("index {0:08x} already in use")]
    AlreadyInUse(u32),
}

struct IndexEntry<P> {
    peer: Weak<P>,
    keypair: Option<Arc<Keypair>>,
}

/// Receiver index -> (peer, keypair).
pub struct IndexTable<P> {
    entries: RwLock<HashMap<u32, IndexEntry<P>>>,
    /// Maximum allocation attempts before giving up.
    max_attempts: usize,
}

impl<P> IndexTable<P> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_attempts: 100,
        }
    }

    /// Allocate a fresh index for a handshake with `peer`.
    pub fn new_index(&self, peer: &Arc<P>) -> Result<u32, IndexError> {
        let mut entries = self.entries.write().map_err(|_| IndexError::Exhausted)?;
        for _ in 0..self.max_attempts {
            let candidate = OsRng.next_u32();
            if candidate == 0 || entries.contains_key(&candidate) {
                continue;
            }
            entries.insert(
                candidate,
                IndexEntry {
                    peer: Arc::downgrade(peer),
                    keypair: None,
                },
            );
            return Ok(candidate);
        }
        Err(IndexError::Exhausted)
    }

    /// Bind an allocated index to the keypair its handshake produced.
    pub fn set_keypair(&self, index: u32, keypair: Arc<Keypair>) -> Result<(), IndexError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| IndexError::NotFound(index))?;
        let entry = entries.get_mut(&index).ok_or(IndexError::NotFound(index))?;
        entry.keypair = Some(keypair);
        Ok(())
    }

    /// Peer and keypair for `index`. `None` if unknown or the peer is gone.
    pub fn lookup(&self, index: u32) -> Option<(Arc<P>, Option<Arc<Keypair>>)> {
        let entries = self.entries.read().ok()?;
        let entry = entries.get(&index)?;
        Some((entry.peer.upgrade()?, entry.keypair.clone()))
    }

    pub fn delete(&self, index: u32) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(&index);
        }
    }

    pub fn contains(&self, index: u32) -> bool {
        self.entries
            .read()
            .map(|e| e.contains_key(&index))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<P> Default for IndexTable<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::noise::{Handshake, InitiationScan};
    use crate::identity::{PresharedKey, StaticIdentity};

    fn keypair() -> Arc<Keypair> {
        let alice = StaticIdentity::generate();
        let bob = StaticIdentity::generate();
        let mut a = Handshake::new(&alice, *bob.public_key(), PresharedKey::default());
        let mut b = Handshake::new(&bob, *alice.public_key(), PresharedKey::default());
        let init = a.create_initiation(&alice, 1).unwrap();
        let scan = InitiationScan::scan(&init, &bob).unwrap();
        b.consume_initiation(scan, &init).unwrap();
        let resp = b.create_response(2).unwrap();
        a.consume_response(&resp, &alice).unwrap();
        Arc::new(a.derive_keypair().unwrap())
    }

    #[test]
    fn test_allocate_and_lookup() {
        let table = IndexTable::new();
        let peer = Arc::new("peer-a");
        let idx = table.new_index(&peer).unwrap();
        assert_ne!(idx, 0);
        let (found, kp) = table.lookup(idx).unwrap();
        assert_eq!(*found, "peer-a");
        assert!(kp.is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_bind_keypair() {
        let table = IndexTable::new();
        let peer = Arc::new(1u16);
        let idx = table.new_index(&peer).unwrap();
        let kp = keypair();
        table.set_keypair(idx, kp.clone()).unwrap();
        let (_, found) = table.lookup(idx).unwrap();
        assert!(Arc::ptr_eq(&found.unwrap(), &kp));

        assert!(matches!(
            table.set_keypair(idx.wrapping_add(1), kp),
            Err(IndexError::NotFound(_))
        ));
    }

    #[test]
    fn test_delete() {
        let table = IndexTable::new();
        let peer = Arc::new(());
        let idx = table.new_index(&peer).unwrap();
        table.delete(idx);
        assert!(table.lookup(idx).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_dropped_peer_not_returned() {
        let table = IndexTable::new();
        let peer = Arc::new(5u32);
        let idx = table.new_index(&peer).unwrap();
        drop(peer);
        assert!(table.contains(idx));
        assert!(table.lookup(idx).is_none());
    }

    #[test]
    fn test_uniqueness() {
        let table = IndexTable::new();
        let peer = Arc::new(());
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(table.new_index(&peer).unwrap()));
        }
        assert_eq!(table.len(), 1000);
    }
}
