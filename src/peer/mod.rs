//! Peer Management
//!
//! A peer is another node we hold a Noise session with: an edge, or the
//! super node. Each peer carries its handshake state, the keypair
//! rotation, the endpoint it was last heard from, its session timers, the
//! staged packets waiting for a session and the producer halves of its two
//! sequential queues.
//!
//! Peers are shared as `Arc<Peer>` between the peer table, the index
//! table (weakly) and the worker tasks, so every mutable field sits behind
//! its own short-lived lock or atomic.

mod queue;
mod table;
mod timers;
mod try_list;

pub use queue::{
    InboundSlot, Opened, OutboundSlot, PeerQueueReceivers, PeerQueues, QueueElement, Sealed,
    StagedPacket, StagedQueue, QUEUE_INBOUND_SIZE, QUEUE_OUTBOUND_SIZE, QUEUE_STAGED_SIZE,
};
pub use table::{PeerTable, MAX_PEERS};
pub use timers::{PeerTimers, TimerEvent};
pub use try_list::TryList;

use crate::identity::{PresharedKey, PublicKey, StaticIdentity};
use crate::noise::{CookieGenerator, Handshake, HandshakeProgress, Keypairs};
use crate::protocol::NodeId;
use crate::routing::INFINITY;
use crate::transport::Endpoint;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;
use tokio::task::JoinHandle;

// ============================================================================
// Errors
// ============================================================================

/// Errors related to peer operations.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer already exists: {0}")]
    AlreadyExists(PublicKey),

    #[error("node id {0} already in use")]
    IdInUse(NodeId),

    #[error("node id {0} is reserved")]
    ReservedId(NodeId),

    #[error("super peer must use node id {expected}, got {got}")]
    BadSuperId { expected: NodeId, got: NodeId },

    #[error("peer not found: {0}")]
    NotFound(PublicKey),

    #[error("max peers exceeded: {max}")]
    MaxPeersExceeded { max: usize },

    #[error("device closed")]
    DeviceClosed,
}

// ============================================================================
// Session state
// ============================================================================

/// Where a peer's session stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// No keys and no handshake in flight.
    Idle,
    /// Initiation sent, no usable keypair yet.
    AwaitingResponse,
    /// A current keypair is usable.
    Established,
    /// Established and a new handshake is in flight.
    Rekeying,
    /// Keys were zeroed or the peer was stopped.
    Dead,
}

impl SessionState {
    pub fn can_send(&self) -> bool {
        matches!(self, SessionState::Established | SessionState::Rekeying)
    }

    pub fn is_handshaking(&self) -> bool {
        matches!(
            self,
            SessionState::AwaitingResponse | SessionState::Rekeying
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::AwaitingResponse => "awaiting-response",
            SessionState::Established => "established",
            SessionState::Rekeying => "rekeying",
            SessionState::Dead => "dead",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Byte and handshake counters.
#[derive(Debug, Default)]
pub struct PeerStats {
    tx_bytes: AtomicU64,
    rx_bytes: AtomicU64,
    last_handshake: Mutex<Option<SystemTime>>,
}

impl PeerStats {
    pub fn add_tx(&self, bytes: usize) {
        self.tx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn add_rx(&self, bytes: usize) {
        self.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn tx_bytes(&self) -> u64 {
        self.tx_bytes.load(Ordering::Relaxed)
    }

    pub fn rx_bytes(&self) -> u64 {
        self.rx_bytes.load(Ordering::Relaxed)
    }

    pub fn last_handshake(&self) -> Option<SystemTime> {
        self.last_handshake.lock().ok().and_then(|g| *g)
    }

    pub fn mark_handshake(&self) {
        if let Ok(mut g) = self.last_handshake.lock() {
            *g = Some(SystemTime::now());
        }
    }
}

// ============================================================================
// Peer
// ============================================================================

/// Static settings a peer is created with.
#[derive(Clone, Debug)]
pub struct PeerConfig {
    pub node_id: NodeId,
    pub public_key: PublicKey,
    pub preshared_key: PresharedKey,
    pub is_super: bool,
    /// Endpoint pinned by configuration; re-resolved periodically.
    pub static_conn: bool,
    pub conn_url: Option<String>,
    /// Never adopt the source address of incoming packets.
    pub disable_roaming: bool,
    pub persistent_keepalive: Duration,
    /// Liveness window after the last packet.
    pub alive_timeout: Duration,
}

impl PeerConfig {
    pub fn new(node_id: NodeId, public_key: PublicKey) -> Self {
        Self {
            node_id,
            public_key,
            preshared_key: PresharedKey::default(),
            is_super: false,
            static_conn: false,
            conn_url: None,
            disable_roaming: false,
            persistent_keepalive: Duration::ZERO,
            alive_timeout: Duration::from_secs(70),
        }
    }
}

/// A remote node we hold a session with.
pub struct Peer {
    // === Identity ===
    node_id: NodeId,
    public_key: PublicKey,
    is_super: bool,
    static_conn: bool,
    conn_url: Option<String>,
    disable_roaming: bool,
    alive_timeout: Duration,

    // === Session ===
    handshake: Mutex<Handshake>,
    keypairs: Mutex<Keypairs>,
    cookie_generator: Mutex<CookieGenerator>,
    timers: Mutex<PeerTimers>,
    staged: Mutex<StagedQueue>,
    dead: AtomicBool,

    // === Reachability ===
    endpoint: RwLock<Option<Endpoint>>,
    try_list: Mutex<TryList>,
    last_packet_received: Mutex<Option<Instant>>,
    asked_for_neighbor: AtomicBool,
    /// Smoothed one-way latency in seconds, `INFINITY` until measured.
    single_way_latency: Mutex<f64>,

    // === Pipeline ===
    running: AtomicBool,
    queues: RwLock<Option<PeerQueues>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,

    stats: PeerStats,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Peer {
    pub fn new(config: PeerConfig, local: &StaticIdentity) -> Self {
        Self {
            node_id: config.node_id,
            public_key: config.public_key,
            is_super: config.is_super,
            static_conn: config.static_conn,
            conn_url: config.conn_url,
            disable_roaming: config.disable_roaming,
            alive_timeout: config.alive_timeout,
            handshake: Mutex::new(Handshake::new(
                local,
                config.public_key,
                config.preshared_key,
            )),
            keypairs: Mutex::new(Keypairs::default()),
            cookie_generator: Mutex::new(CookieGenerator::new(&config.public_key)),
            timers: Mutex::new(PeerTimers::new(config.persistent_keepalive)),
            staged: Mutex::new(StagedQueue::default()),
            dead: AtomicBool::new(false),
            endpoint: RwLock::new(None),
            try_list: Mutex::new(TryList::new(config.alive_timeout)),
            last_packet_received: Mutex::new(None),
            asked_for_neighbor: AtomicBool::new(false),
            single_way_latency: Mutex::new(INFINITY),
            running: AtomicBool::new(false),
            queues: RwLock::new(None),
            tasks: Mutex::new(Vec::new()),
            stats: PeerStats::default(),
        }
    }

    // === Identity ===

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn is_super(&self) -> bool {
        self.is_super
    }

    pub fn is_static(&self) -> bool {
        self.static_conn
    }

    pub fn conn_url(&self) -> Option<&str> {
        self.conn_url.as_deref()
    }

    pub fn stats(&self) -> &PeerStats {
        &self.stats
    }

    // === Locked state ===

    pub fn handshake(&self) -> MutexGuard<'_, Handshake> {
        lock(&self.handshake)
    }

    pub fn keypairs(&self) -> MutexGuard<'_, Keypairs> {
        lock(&self.keypairs)
    }

    pub fn cookie_generator(&self) -> MutexGuard<'_, CookieGenerator> {
        lock(&self.cookie_generator)
    }

    pub fn timers(&self) -> MutexGuard<'_, PeerTimers> {
        lock(&self.timers)
    }

    pub fn staged(&self) -> MutexGuard<'_, StagedQueue> {
        lock(&self.staged)
    }

    pub fn try_list(&self) -> MutexGuard<'_, TryList> {
        lock(&self.try_list)
    }

    /// Current session state, derived from keys and handshake progress.
    pub fn session_state(&self) -> SessionState {
        if !self.is_running() || self.dead.load(Ordering::Acquire) {
            return SessionState::Dead;
        }
        let handshaking = self.handshake().progress() == HandshakeProgress::InitiationCreated;
        let usable = self
            .keypairs()
            .current()
            .is_some_and(|kp| !kp.is_expired());
        match (usable, handshaking) {
            (true, true) => SessionState::Rekeying,
            (true, false) => SessionState::Established,
            (false, true) => SessionState::AwaitingResponse,
            (false, false) => SessionState::Idle,
        }
    }

    /// Record that keys were wiped. Cleared by the next handshake.
    pub fn mark_dead(&self, dead: bool) {
        self.dead.store(dead, Ordering::Release);
    }

    // === Endpoint ===

    pub fn endpoint(&self) -> Option<Endpoint> {
        self.endpoint.read().ok().and_then(|g| *g)
    }

    pub fn set_endpoint(&self, endpoint: Endpoint) {
        if let Ok(mut g) = self.endpoint.write() {
            *g = Some(endpoint);
        }
    }

    /// Adopt the source of an authenticated packet.
    ///
    /// Returns true if the destination address changed.
    pub fn roam_to(&self, endpoint: Endpoint) -> bool {
        if self.disable_roaming || self.static_conn {
            return false;
        }
        match self.endpoint.write() {
            Ok(mut g) => {
                let changed = g.map(|e| e.dst()) != Some(endpoint.dst());
                *g = Some(endpoint);
                changed
            }
            Err(_) => false,
        }
    }

    /// Forget the pinned source address, e.g. before a retransmit.
    pub fn clear_endpoint_src(&self) {
        if let Ok(mut g) = self.endpoint.write() {
            if let Some(e) = g.as_mut() {
                e.clear_src();
            }
        }
    }

    // === Liveness ===

    pub fn touch(&self, now: Instant) {
        *lock(&self.last_packet_received) = Some(now);
    }

    pub fn last_packet_received(&self) -> Option<Instant> {
        *lock(&self.last_packet_received)
    }

    /// Alive while an endpoint is known and a packet arrived within the
    /// liveness window (plus one second of grace).
    pub fn is_alive(&self, now: Instant) -> bool {
        if self.endpoint().is_none() {
            return false;
        }
        self.last_packet_received()
            .is_some_and(|last| last + Duration::from_secs(1) + self.alive_timeout > now)
    }

    pub fn asked_for_neighbor(&self) -> bool {
        self.asked_for_neighbor.load(Ordering::Relaxed)
    }

    pub fn set_asked_for_neighbor(&self, asked: bool) {
        self.asked_for_neighbor.store(asked, Ordering::Relaxed);
    }

    pub fn single_way_latency(&self) -> f64 {
        *lock(&self.single_way_latency)
    }

    /// Fold a one-way latency sample in, weighting the old value by
    /// `damping` (0 adopts the sample outright).
    pub fn smooth_latency(&self, sample: f64, damping: f64) -> f64 {
        let mut latency = lock(&self.single_way_latency);
        *latency = if *latency >= INFINITY {
            sample
        } else {
            *latency * damping + sample * (1.0 - damping)
        };
        *latency
    }

    // === Pipeline ===

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Install fresh queues. Returns the consumer halves, or `None` if the
    /// peer was already running.
    pub fn start(&self) -> Option<PeerQueueReceivers> {
        if self.running.swap(true, Ordering::AcqRel) {
            return None;
        }
        let (queues, receivers) = PeerQueues::new();
        if let Ok(mut g) = self.queues.write() {
            *g = Some(queues);
        }
        self.mark_dead(false);
        Some(receivers)
    }

    pub fn add_task(&self, task: JoinHandle<()>) {
        lock(&self.tasks).push(task);
    }

    pub fn queues(&self) -> Option<PeerQueues> {
        self.queues.read().ok().and_then(|g| g.clone())
    }

    /// Stop the sequential tasks, drop staged packets and wipe keys.
    ///
    /// Returns the local indices that should be freed.
    pub async fn stop(&self) -> Vec<u32> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Vec::new();
        }
        let queues = self.queues.write().ok().and_then(|mut g| g.take());
        if let Some(queues) = queues {
            queues.stop();
        }
        let tasks: Vec<_> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.timers().stop_all();
        self.staged().clear();
        self.zero_keys()
    }

    /// Drop every keypair and the handshake. Returns freed local indices.
    pub fn zero_keys(&self) -> Vec<u32> {
        let mut freed: Vec<u32> = self
            .keypairs()
            .clear()
            .iter()
            .map(|kp| kp.local_index())
            .collect();
        let mut hs = self.handshake();
        if hs.local_index() != 0 {
            freed.push(hs.local_index());
        }
        hs.clear();
        drop(hs);
        self.mark_dead(true);
        freed
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("node_id", &self.node_id)
            .field("public_key", &self.public_key)
            .field("is_super", &self.is_super)
            .field("endpoint", &self.endpoint())
            .field("running", &self.is_running())
            .finish()
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_super {
            write!(f, "super({})", self.public_key)
        } else {
            write!(f, "peer({})", self.node_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn peer(id: u16) -> Peer {
        let local = StaticIdentity::generate();
        let remote = StaticIdentity::generate();
        Peer::new(PeerConfig::new(NodeId(id), *remote.public_key()), &local)
    }

    fn ep(s: &str) -> Endpoint {
        Endpoint::new(s.parse::<SocketAddr>().unwrap())
    }

    #[test]
    fn test_new_peer_is_dead_until_started() {
        let p = peer(1);
        assert_eq!(p.session_state(), SessionState::Dead);
        assert!(p.start().is_some());
        assert_eq!(p.session_state(), SessionState::Idle);
        assert!(p.start().is_none());
    }

    #[test]
    fn test_alive_requires_endpoint_and_recent_packet() {
        let p = peer(1);
        let now = Instant::now();
        p.touch(now);
        assert!(!p.is_alive(now));
        p.set_endpoint(ep("192.0.2.1:3000"));
        assert!(p.is_alive(now));
        assert!(!p.is_alive(now + Duration::from_secs(72)));
    }

    #[test]
    fn test_roaming() {
        let p = peer(1);
        assert!(p.roam_to(ep("192.0.2.1:3000")));
        assert!(!p.roam_to(ep("192.0.2.1:3000")));
        assert!(p.roam_to(ep("192.0.2.2:3000")));
        assert_eq!(p.endpoint().unwrap().dst_to_string(), "192.0.2.2:3000");
    }

    #[test]
    fn test_roaming_disabled_for_static() {
        let local = StaticIdentity::generate();
        let remote = StaticIdentity::generate();
        let mut config = PeerConfig::new(NodeId(2), *remote.public_key());
        config.static_conn = true;
        let p = Peer::new(config, &local);
        p.set_endpoint(ep("192.0.2.1:3000"));
        assert!(!p.roam_to(ep("192.0.2.9:3000")));
        assert_eq!(p.endpoint().unwrap().dst_to_string(), "192.0.2.1:3000");
    }

    #[test]
    fn test_latency_smoothing() {
        let p = peer(1);
        assert!(p.single_way_latency() >= INFINITY);
        assert!((p.smooth_latency(0.1, 0.9) - 0.1).abs() < 1e-9);
        let next = p.smooth_latency(0.2, 0.5);
        assert!((next - 0.15).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_stop_frees_handshake_index() {
        let local = StaticIdentity::generate();
        let remote = StaticIdentity::generate();
        let p = Peer::new(PeerConfig::new(NodeId(3), *remote.public_key()), &local);
        p.start();
        p.handshake().create_initiation(&local, 77).unwrap();
        assert_eq!(p.session_state(), SessionState::AwaitingResponse);

        let freed = p.stop().await;
        assert_eq!(freed, vec![77]);
        assert_eq!(p.session_state(), SessionState::Dead);
        assert!(p.queues().is_none());
    }
}
