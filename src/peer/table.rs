//! Peer table: lookups by public key and by node ID.
//!
//! Edge peers are indexed both ways. Super peers all share the reserved
//! super node ID, so they live in a separate map keyed by public key.

use super::{Peer, PeerError};
use crate::identity::PublicKey;
use crate::protocol::NodeId;
use std::collections::HashMap;
use std::sync::Arc;

/// Upper bound on peers per device.
pub const MAX_PEERS: usize = 1 << 16;

#[derive(Debug, Default)]
pub struct PeerTable {
    by_key: HashMap<PublicKey, Arc<Peer>>,
    by_id: HashMap<NodeId, Arc<Peer>>,
    supers: HashMap<PublicKey, Arc<Peer>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer, enforcing ID rules and uniqueness.
    pub fn insert(&mut self, peer: Arc<Peer>) -> Result<(), PeerError> {
        let id = peer.node_id();
        if peer.is_super() {
            if id != NodeId::SUPER_NODE_MESSAGE {
                return Err(PeerError::BadSuperId {
                    expected: NodeId::SUPER_NODE_MESSAGE,
                    got: id,
                });
            }
        } else if id.is_special() {
            return Err(PeerError::ReservedId(id));
        }
        if self.by_key.len() >= MAX_PEERS {
            return Err(PeerError::MaxPeersExceeded { max: MAX_PEERS });
        }
        if self.by_key.contains_key(peer.public_key()) {
            return Err(PeerError::AlreadyExists(*peer.public_key()));
        }
        if !peer.is_super() && self.by_id.contains_key(&id) {
            return Err(PeerError::IdInUse(id));
        }

        let key = *peer.public_key();
        if peer.is_super() {
            self.supers.insert(key, peer.clone());
        } else {
            self.by_id.insert(id, peer.clone());
        }
        self.by_key.insert(key, peer);
        Ok(())
    }

    pub fn remove(&mut self, key: &PublicKey) -> Option<Arc<Peer>> {
        let peer = self.by_key.remove(key)?;
        if peer.is_super() {
            self.supers.remove(key);
        } else {
            self.by_id.remove(&peer.node_id());
        }
        Some(peer)
    }

    pub fn remove_id(&mut self, id: NodeId) -> Option<Arc<Peer>> {
        let key = *self.by_id.get(&id)?.public_key();
        self.remove(&key)
    }

    pub fn by_key(&self, key: &PublicKey) -> Option<&Arc<Peer>> {
        self.by_key.get(key)
    }

    pub fn by_id(&self, id: NodeId) -> Option<&Arc<Peer>> {
        self.by_id.get(&id)
    }

    /// Edge peers, by node ID.
    pub fn edges(&self) -> impl Iterator<Item = &Arc<Peer>> {
        self.by_id.values()
    }

    pub fn supers(&self) -> impl Iterator<Item = &Arc<Peer>> {
        self.supers.values()
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<Peer>> {
        self.by_key.values()
    }

    pub fn clear(&mut self) -> Vec<Arc<Peer>> {
        self.by_id.clear();
        self.supers.clear();
        self.by_key.drain().map(|(_, p)| p).collect()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}
