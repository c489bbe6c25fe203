//! Super-node bookkeeping.
//!
//! One [`SuperState`] is shared by the super's devices (one per address
//! family) and its HTTP API. It owns the configured edge list, what each
//! edge last reported, the authoritative latency graph and the blobs edges
//! download.
//!
//! The peer-info blob is tailored per edge (pairwise PSKs, local address
//! filtering), so each edge has its own blob hash. The next-hop blob is the
//! same for everyone.

use super::{blob_hash, ApiPeerInfo, ApiPeers, ConnUrl};
use crate::identity::{PresharedKey, PublicKey};
use crate::protocol::{NodeId, PongMsg, RegisterMsg, ServerAction, ServerUpdateMsg};
use crate::routing::{Graph, NextHopTable, PongSample};
use crate::transport::Endpoint;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// `EPERM`: register for a node ID the session does not belong to.
pub const ERR_NODE_ID_MISMATCH: i32 = 1;
/// `ENOENT`: the edge was removed from the super's configuration.
pub const ERR_REMOVED: i32 = 2;
/// `ENOSYS`: incompatible software version.
pub const ERR_VERSION: i32 = 38;

/// An edge the super is configured to serve.
#[derive(Clone, Debug)]
pub struct SuperPeer {
    pub node_id: NodeId,
    pub name: String,
    pub public_key: PublicKey,
    /// PSK of the edge <-> super session.
    pub psk: PresharedKey,
    /// Milliseconds added to every edge this node measures.
    pub additional_cost: f64,
    pub skip_local_ip: bool,
}

#[derive(Clone, Debug)]
pub struct SuperSettings {
    pub api_prefix: String,
    pub use_psk_for_inter_edge: bool,
    pub peer_alive_timeout: Duration,
    pub repush_interval: Duration,
    pub version: String,
}

impl Default for SuperSettings {
    fn default() -> Self {
        Self {
            api_prefix: "/api".to_string(),
            use_psk_for_inter_edge: true,
            peer_alive_timeout: Duration::from_secs(70),
            repush_interval: Duration::from_secs(30),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// What the super knows about one edge's reporting.
#[derive(Clone, Debug, Default)]
pub struct EdgeStatus {
    pub last_seen: Option<Instant>,
    pub reported_peer_hash: [u8; 32],
    pub reported_nh_hash: [u8; 32],
    pub endpoint_v4: Option<String>,
    pub endpoint_v6: Option<String>,
    pub last_push: Option<Instant>,
}

impl EdgeStatus {
    fn is_alive(&self, now: Instant, timeout: Duration) -> bool {
        self.last_seen.is_some_and(|t| t + timeout > now)
    }
}

/// Pairwise edge-to-edge PSKs, generated on first use.
#[derive(Debug, Default)]
pub struct PskDb {
    keys: HashMap<(NodeId, NodeId), PresharedKey>,
}

impl PskDb {
    /// Same key for `(a, b)` and `(b, a)`.
    pub fn get(&mut self, a: NodeId, b: NodeId) -> PresharedKey {
        let pair = if a <= b { (a, b) } else { (b, a) };
        self.keys
            .entry(pair)
            .or_insert_with(|| PresharedKey::from_bytes(crate::identity::random_bytes()))
            .clone()
    }

    pub fn forget(&mut self, id: NodeId) {
        self.keys.retain(|(a, b), _| *a != id && *b != id);
    }
}

/// Why the edge API refused a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApiReject {
    BadRequest(String),
    NotFound(String),
}

#[derive(Default)]
struct Blobs {
    peers: HashMap<NodeId, (Arc<Vec<u8>>, [u8; 32])>,
    nh: (Arc<Vec<u8>>, [u8; 32]),
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Shared super-node state.
pub struct SuperState {
    settings: SuperSettings,
    peers: RwLock<BTreeMap<NodeId, SuperPeer>>,
    status: Mutex<HashMap<NodeId, EdgeStatus>>,
    psk_db: Mutex<PskDb>,
    graph: Mutex<Graph>,
    blobs: RwLock<Blobs>,
}

impl SuperState {
    pub fn new(settings: SuperSettings, graph: Graph) -> Self {
        let state = Self {
            settings,
            peers: RwLock::new(BTreeMap::new()),
            status: Mutex::new(HashMap::new()),
            psk_db: Mutex::new(PskDb::default()),
            graph: Mutex::new(graph),
            blobs: RwLock::new(Blobs::default()),
        };
        state.rebuild_nh();
        state.rebuild_peer_blobs(Instant::now());
        state
    }

    pub fn settings(&self) -> &SuperSettings {
        &self.settings
    }

    pub fn graph(&self) -> MutexGuard<'_, Graph> {
        lock(&self.graph)
    }

    // === Configured edges ===

    /// Add an edge. Returns false if its ID or key is taken.
    pub fn add_peer(&self, peer: SuperPeer) -> bool {
        {
            let Ok(mut peers) = self.peers.write() else {
                return false;
            };
            if peers.contains_key(&peer.node_id)
                || peers.values().any(|p| p.public_key == peer.public_key)
            {
                return false;
            }
            info!(node = %peer.node_id, name = %peer.name, "Super peer added");
            peers.insert(peer.node_id, peer);
        }
        self.rebuild_peer_blobs(Instant::now());
        true
    }

    /// Remove an edge and everything known about it.
    pub fn remove_peer(&self, id: NodeId) -> Option<SuperPeer> {
        let removed = self.peers.write().ok()?.remove(&id)?;
        lock(&self.status).remove(&id);
        lock(&self.psk_db).forget(id);
        lock(&self.graph).remove_vertex(id, true, true);
        self.rebuild_nh();
        self.rebuild_peer_blobs(Instant::now());
        info!(node = %id, "Super peer removed");
        Some(removed)
    }

    pub fn peer(&self, id: NodeId) -> Option<SuperPeer> {
        self.peers.read().ok()?.get(&id).cloned()
    }

    pub fn peer_by_key(&self, key: &PublicKey) -> Option<SuperPeer> {
        self.peers
            .read()
            .ok()?
            .values()
            .find(|p| &p.public_key == key)
            .cloned()
    }

    pub fn peers(&self) -> Vec<SuperPeer> {
        self.peers
            .read()
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn status(&self, id: NodeId) -> Option<EdgeStatus> {
        lock(&self.status).get(&id).cloned()
    }

    pub fn is_alive(&self, id: NodeId, now: Instant) -> bool {
        lock(&self.status)
            .get(&id)
            .is_some_and(|s| s.is_alive(now, self.settings.peer_alive_timeout))
    }

    // === Edge reports ===

    /// Validate a register from the session belonging to `session_id`.
    ///
    /// On rejection returns the error code and message to send back.
    pub fn check_register(&self, session_id: NodeId, msg: &RegisterMsg) -> Result<(), (i32, String)> {
        if session_id != msg.node_id {
            return Err((
                ERR_NODE_ID_MISMATCH,
                format!(
                    "register as node {} from the session of node {}",
                    msg.node_id, session_id
                ),
            ));
        }
        if !version_compatible(&self.settings.version, &msg.version) {
            return Err((
                ERR_VERSION,
                format!(
                    "version {} is not compatible with super version {}",
                    msg.version, self.settings.version
                ),
            ));
        }
        Ok(())
    }

    /// Record a register. Returns true if any edge's peer blob changed.
    pub fn record_register(&self, msg: &RegisterMsg, endpoint: &Endpoint, now: Instant) -> bool {
        {
            let mut status = lock(&self.status);
            let entry = status.entry(msg.node_id).or_default();
            entry.last_seen = Some(now);
            entry.reported_peer_hash = msg.peer_state_hash;
            entry.reported_nh_hash = msg.nh_state_hash;
            let url = endpoint.dst_to_string();
            if endpoint.dst_ip().is_ipv4() {
                entry.endpoint_v4 = Some(url);
            } else {
                entry.endpoint_v6 = Some(url);
            }
        }
        self.rebuild_peer_blobs(now)
    }

    /// Feed a pong into the graph. Returns true if the next-hop blob
    /// changed.
    pub fn record_pong(&self, pong: &PongMsg) -> bool {
        if pong.src_node_id.is_special() || pong.dst_node_id.is_special() {
            return false;
        }
        let additional_cost = self
            .peer(pong.dst_node_id)
            .map(|p| p.additional_cost)
            .unwrap_or(pong.additional_cost);
        let sample = PongSample {
            src: pong.src_node_id,
            dst: pong.dst_node_id,
            timediff: pong.timediff,
            time_to_alive: pong.time_to_alive,
            additional_cost,
        };
        let changed = lock(&self.graph).update_latency(&[sample], true, true);
        changed && self.rebuild_nh()
    }

    /// Periodic recomputation. Returns true if the next-hop blob changed.
    pub fn recalculate(&self) -> bool {
        let changed = lock(&self.graph).recalculate(true);
        changed && self.rebuild_nh()
    }

    /// Refresh liveness-dependent blobs. Returns true if any changed.
    pub fn refresh(&self, now: Instant) -> bool {
        self.rebuild_peer_blobs(now)
    }

    /// `ServerUpdate`s for alive edges whose reported hashes are stale, or
    /// for every alive edge when `force`.
    pub fn pending_updates(&self, now: Instant, force: bool) -> Vec<ServerUpdateMsg> {
        let (nh_hash, peer_hashes) = match self.blobs.read() {
            Ok(b) => (
                b.nh.1,
                b.peers
                    .iter()
                    .map(|(id, (_, h))| (*id, *h))
                    .collect::<HashMap<_, _>>(),
            ),
            Err(_) => return Vec::new(),
        };
        let mut out = Vec::new();
        let mut status = lock(&self.status);
        for (id, st) in status.iter_mut() {
            if !st.is_alive(now, self.settings.peer_alive_timeout) {
                continue;
            }
            let mut pushed = false;
            if let Some(hash) = peer_hashes.get(id) {
                if force || st.reported_peer_hash != *hash {
                    out.push(ServerUpdateMsg::update_hash(*id, ServerAction::UpdatePeer, hash));
                    pushed = true;
                }
            }
            if force || st.reported_nh_hash != nh_hash {
                out.push(ServerUpdateMsg::update_hash(
                    *id,
                    ServerAction::UpdateNhTable,
                    &nh_hash,
                ));
                pushed = true;
            }
            if pushed {
                st.last_push = Some(now);
            }
        }
        out
    }

    /// Edges registered and alive right now.
    pub fn alive_edges(&self, now: Instant) -> Vec<NodeId> {
        lock(&self.status)
            .iter()
            .filter(|(_, s)| s.is_alive(now, self.settings.peer_alive_timeout))
            .map(|(id, _)| *id)
            .collect()
    }

    // === Blobs ===

    pub fn peer_blob(&self, id: NodeId) -> Option<(Arc<Vec<u8>>, [u8; 32])> {
        self.blobs.read().ok()?.peers.get(&id).cloned()
    }

    pub fn nh_blob(&self) -> (Arc<Vec<u8>>, [u8; 32]) {
        self.blobs
            .read()
            .map(|b| b.nh.clone())
            .unwrap_or_default()
    }

    /// Authorise an edge API request and return the blob.
    pub fn serve(
        &self,
        kind: super::BlobKind,
        params: &HashMap<String, String>,
    ) -> Result<Arc<Vec<u8>>, ApiReject> {
        let param = |name: &str| {
            params
                .get(name)
                .ok_or_else(|| ApiReject::BadRequest(format!("missing parameter {}", name)))
        };
        let node_id = param("NodeID")?
            .parse::<u16>()
            .map(NodeId)
            .map_err(|_| ApiReject::BadRequest("NodeID: not a node id".into()))?;
        if node_id.is_special() {
            return Err(ApiReject::BadRequest("NodeID: reserved node id".into()));
        }
        let pubkey = param("PubKey")?;
        let state = param("State")?;

        let peer = self
            .peer(node_id)
            .filter(|p| &p.public_key.to_base64() == pubkey)
            .ok_or_else(|| ApiReject::NotFound("NodeID and PubKey do not match".into()))?;

        let (blob, hash) = match kind {
            super::BlobKind::PeerInfo => self
                .peer_blob(peer.node_id)
                .ok_or_else(|| ApiReject::NotFound("no peer info".into()))?,
            super::BlobKind::NhTable => self.nh_blob(),
        };
        if &hex::encode(hash) != state {
            return Err(ApiReject::NotFound("State not correct".into()));
        }
        Ok(blob)
    }

    fn rebuild_nh(&self) -> bool {
        let nh: Arc<NextHopTable> = lock(&self.graph).nh_table(false);
        let blob = match nh.to_json() {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "Next-hop table encode failed");
                return false;
            }
        };
        let hash = blob_hash(&blob);
        let Ok(mut blobs) = self.blobs.write() else {
            return false;
        };
        if blobs.nh.1 == hash && !blobs.nh.0.is_empty() {
            return false;
        }
        debug!(target: "meshguard::control", hash = %hex::encode(hash), "Next-hop blob updated");
        blobs.nh = (Arc::new(blob), hash);
        true
    }

    fn rebuild_peer_blobs(&self, now: Instant) -> bool {
        let peers = self.peers();
        let timeout = self.settings.peer_alive_timeout;

        // Shared part: which edges can be reached where
        let mut reachable: Vec<(&SuperPeer, ConnUrl)> = Vec::new();
        {
            let status = lock(&self.status);
            for peer in &peers {
                let Some(st) = status.get(&peer.node_id) else {
                    continue;
                };
                if st.endpoint_v4.is_none() && st.endpoint_v6.is_none() {
                    continue;
                }
                let mut conn = ConnUrl::default();
                if st.is_alive(now, timeout) {
                    if let Some(v4) = &st.endpoint_v4 {
                        conn.external_v4.insert(v4.clone(), 4.0);
                    }
                    if let Some(v6) = &st.endpoint_v6 {
                        conn.external_v6.insert(v6.clone(), 6.0);
                    }
                }
                reachable.push((peer, conn));
            }
        }

        let mut next = HashMap::new();
        {
            let mut psk_db = lock(&self.psk_db);
            for requester in &peers {
                let mut blob = ApiPeers::new();
                for (peer, conn) in &reachable {
                    if peer.node_id == requester.node_id {
                        continue;
                    }
                    let psk = if self.settings.use_psk_for_inter_edge {
                        psk_db.get(requester.node_id, peer.node_id).to_base64()
                    } else {
                        String::new()
                    };
                    let mut conn = conn.clone();
                    if requester.skip_local_ip {
                        conn.local_v4.clear();
                        conn.local_v6.clear();
                    }
                    blob.insert(
                        peer.public_key.to_base64(),
                        ApiPeerInfo {
                            node_id: peer.node_id,
                            psk,
                            conn_url: conn,
                        },
                    );
                }
                match serde_json::to_vec(&blob) {
                    Ok(bytes) => {
                        let hash = blob_hash(&bytes);
                        next.insert(requester.node_id, (Arc::new(bytes), hash));
                    }
                    Err(e) => warn!(error = %e, "Peer blob encode failed"),
                }
            }
        }

        let Ok(mut blobs) = self.blobs.write() else {
            return false;
        };
        let changed = next.len() != blobs.peers.len()
            || next
                .iter()
                .any(|(id, (_, h))| blobs.peers.get(id).map(|(_, old)| old) != Some(h));
        blobs.peers = next;
        changed
    }
}

/// Versions match on everything before the first `-`.
fn version_compatible(ours: &str, theirs: &str) -> bool {
    let base = |v: &str| v.split('-').next().unwrap_or("").to_string();
    base(ours) == base(theirs)
}
