//! Routing Engine
//!
//! A directed latency graph keyed by node ID, all-pairs shortest paths
//! over it, and the next-hop table derived from them. The next-hop table
//! also defines the broadcast tree: originating broadcasts go to every
//! distinct next hop, transiting broadcasts go to the next hops whose
//! shortest path from the originator runs through this node.

mod graph;
mod ntp;
mod solve;

use crate::protocol::NodeId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use thiserror::Error;

pub use graph::{Graph, GraphSettings, PongSample};
pub use ntp::{query_offset, sync_offset, NtpSettings};
pub use solve::{parse_matrix, solve, SolveOutput};

/// Weight of a missing or expired edge, in seconds.
pub const INFINITY: f64 = 99999.0;

/// Errors from the routing engine.
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("negative cycle detected")]
    NegativeCycle,

    #[error("invalid latency matrix: {0}")]
    InvalidMatrix(String),

    #[error("ntp query failed: {0}")]
    Ntp(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(String),
}

/// `src -> dst -> distance` in seconds.
pub type DistTable = BTreeMap<NodeId, BTreeMap<NodeId, f64>>;

/// `src -> dst -> next hop`. Missing entries mean no route.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NextHopTable(BTreeMap<NodeId, BTreeMap<NodeId, NodeId>>);

impl NextHopTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: BTreeMap<NodeId, BTreeMap<NodeId, NodeId>>) -> Self {
        Self(map)
    }

    pub fn as_map(&self) -> &BTreeMap<NodeId, BTreeMap<NodeId, NodeId>> {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|m| m.is_empty())
    }

    pub fn set(&mut self, src: NodeId, dst: NodeId, next: NodeId) {
        self.0.entry(src).or_default().insert(dst, next);
    }

    pub fn next(&self, src: NodeId, dst: NodeId) -> Option<NodeId> {
        self.0.get(&src)?.get(&dst).copied()
    }

    /// Canonical JSON form; this is also the blob the super serves.
    pub fn to_json(&self) -> Result<Vec<u8>, RoutingError> {
        serde_json::to_vec(&self.0).map_err(|e| RoutingError::Serialize(e.to_string()))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, RoutingError> {
        serde_json::from_slice(bytes).map_err(|e| RoutingError::Serialize(e.to_string()))
    }

    /// SHA-256 of the canonical JSON form. The empty table hashes to zero.
    pub fn hash(&self) -> [u8; 32] {
        if self.0.is_empty() {
            return [0u8; 32];
        }
        match self.to_json() {
            Ok(bytes) => Sha256::digest(&bytes).into(),
            Err(_) => [0u8; 32],
        }
    }

    /// Hop-by-hop path `src ..= dst`, empty when unreachable.
    pub fn path(&self, src: NodeId, dst: NodeId) -> Vec<NodeId> {
        if self.next(src, dst).is_none() {
            return Vec::new();
        }
        let mut path = vec![src];
        let mut at = src;
        while at != dst {
            match self.next(at, dst) {
                // Bounded by the table size so a corrupt table cannot loop.
                Some(n) if path.len() <= self.0.len() + 1 => {
                    path.push(n);
                    at = n;
                }
                _ => return Vec::new(),
            }
        }
        path
    }

    /// Neighbors `id` sends to when originating a broadcast.
    pub fn broadcast_list(&self, id: NodeId) -> BTreeSet<NodeId> {
        self.0
            .get(&id)
            .map(|m| m.values().copied().filter(|n| *n != id).collect())
            .unwrap_or_default()
    }

    /// Neighbors `self_id` forwards a broadcast from `src` to when it came
    /// in from `in_id`.
    pub fn broadcast_through_list(
        &self,
        self_id: NodeId,
        in_id: NodeId,
        src: NodeId,
    ) -> BTreeSet<NodeId> {
        self.broadcast_list(self_id)
            .into_iter()
            .filter(|check| *check != in_id && self.path(src, *check).contains(&self_id))
            .collect()
    }
}

/// Published next-hop table. Readers clone the `Arc` and never wait on
/// the graph.
#[derive(Debug, Default)]
pub struct SharedNhTable(RwLock<Arc<NextHopTable>>);

impl SharedNhTable {
    pub fn new(table: NextHopTable) -> Self {
        Self(RwLock::new(Arc::new(table)))
    }

    pub fn load(&self) -> Arc<NextHopTable> {
        match self.0.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn store(&self, table: Arc<NextHopTable>) {
        match self.0.write() {
            Ok(mut guard) => *guard = table,
            Err(poisoned) => *poisoned.into_inner() = table,
        }
    }
}
