//! Overlay Device
//!
//! A device owns one UDP bind, one TAP interface, the peer and index
//! tables, the routing graph and the forwarding caches, and runs the
//! datagram pipeline between them:
//!
//! ```text
//! UDP bind ─► rx loop ─┬─► handshake workers
//!                      └─► decryption workers ─► per-peer sequential receiver ─► TAP / control / transit
//! TAP reader ─► staged queue ─► encryption workers ─► per-peer sequential sender ─► UDP bind
//! ```
//!
//! Edges carry Ethernet frames between their TAP and the mesh. A super
//! device has no TAP traffic; it exchanges control messages with the
//! edges it serves and shares a [`SuperState`] with its sibling devices
//! and the edge API.
//!
//! The device is shared as `Arc<Device>`. Every mutable field sits behind
//! its own lock; no std guard is held across an `.await`. Lock order is
//! identity before any per-peer handshake lock.

mod handlers;
mod lifecycle;
mod routines;
mod send;
mod timers;

#[cfg(test)]
mod tests;

use crate::cache::{DupCache, HandshakeRateLimiter, L2Fib};
use crate::config::ConfigError;
use crate::control::{BlobFetcher, ControlError, SuperState};
use crate::identity::{PublicKey, StaticIdentity};
use crate::noise::{CookieChecker, NoiseError};
use crate::peer::{Peer, PeerError, PeerTable};
use crate::protocol::{NodeId, ProtocolError};
use crate::routing::{Graph, NextHopTable, NtpSettings, RoutingError, SharedNhTable};
use crate::tap::{Tap, TapError};
use crate::transport::{ReceivedPacket, TransportError, UdpBind};
use crate::utils::{IndexError, IndexTable};
use handlers::{DecryptJob, EncryptJob};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;

/// How long the device counts as under load after the handshake queue
/// filled past an eighth of its capacity.
pub const UNDER_LOAD_AFTER_TIME: Duration = Duration::from_secs(1);

/// Default capacity of the shared handshake, encryption and decryption
/// queues.
pub const QUEUE_HANDSHAKE_SIZE: usize = 1024;

const EVENT_QUEUE_SIZE: usize = 16;

// ============================================================================
// Errors
// ============================================================================

/// Errors related to device operations.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device not started")]
    NotStarted,

    #[error("device already started")]
    AlreadyStarted,

    #[error("device closed")]
    Closed,

    #[error("no endpoint for peer {0}")]
    NoEndpoint(NodeId),

    #[error("peer not found: {0}")]
    PeerNotFound(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("peer error: {0}")]
    Peer(#[from] PeerError),

    #[error("index error: {0}")]
    Index(#[from] IndexError),

    #[error("tap error: {0}")]
    Tap(#[from] TapError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("noise error: {0}")]
    Noise(#[from] NoiseError),

    #[error("control error: {0}")]
    Control(#[from] ControlError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("routing error: {0}")]
    Routing(#[from] RoutingError),
}

// ============================================================================
// Settings
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeRole {
    Edge,
    Super,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Edge => write!(f, "edge"),
            NodeRole::Super => write!(f, "super"),
        }
    }
}

/// Shared work queue capacities and crypto worker count.
#[derive(Clone, Debug)]
pub struct QueueSettings {
    pub handshake: usize,
    pub encryption: usize,
    pub decryption: usize,
    /// Workers per crypto pool.
    pub workers: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            handshake: QUEUE_HANDSHAKE_SIZE,
            encryption: QUEUE_HANDSHAKE_SIZE,
            decryption: QUEUE_HANDSHAKE_SIZE,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

/// Runtime settings of one device, built from an edge or super config.
#[derive(Clone, Debug)]
pub struct DeviceSettings {
    // === Identity ===
    pub role: NodeRole,
    pub node_id: NodeId,
    pub node_name: String,
    pub version: String,

    // === Network ===
    /// 0 picks a free port.
    pub listen_port: u16,
    pub bind_ip: IpAddr,
    pub default_ttl: u8,

    // === Timeouts ===
    pub l2fib_timeout: Duration,
    pub dup_check_timeout: Duration,
    pub send_ping_interval: Duration,
    pub peer_alive_timeout: Duration,
    /// How long a candidate endpoint is probed before moving on.
    pub conn_timeout: Duration,
    pub conn_next_try: Duration,

    // === Routing ===
    /// Milliseconds added to every edge this node reports.
    pub additional_cost: f64,
    pub damping_resistance: f64,
    pub ntp: NtpSettings,

    // === Behaviour ===
    pub save_new_peers: bool,
    pub use_super_node: bool,
    pub skip_local_ip: bool,
    pub use_p2p: bool,

    // === Intervals ===
    pub send_peer_interval: Duration,
    /// Zero disables re-resolving static peers.
    pub reset_conn_interval: Duration,
    pub timeout_check_interval: Duration,
    /// Super only: forced re-push of both hashes.
    pub repush_interval: Duration,

    pub queues: QueueSettings,
    /// Edge config file rewritten when `save_new_peers` is set.
    pub config_path: Option<PathBuf>,
}

impl DeviceSettings {
    /// Defaults for an edge with the given ID.
    pub fn edge(node_id: NodeId) -> Self {
        Self {
            role: NodeRole::Edge,
            node_id,
            node_name: String::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            listen_port: 0,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            default_ttl: 200,
            l2fib_timeout: Duration::from_secs(3600),
            dup_check_timeout: Duration::from_secs(40),
            send_ping_interval: Duration::from_secs(16),
            peer_alive_timeout: Duration::from_secs(70),
            conn_timeout: Duration::from_secs(20),
            conn_next_try: Duration::from_secs(5),
            additional_cost: 0.0,
            damping_resistance: 0.9,
            ntp: NtpSettings::default(),
            save_new_peers: false,
            use_super_node: false,
            skip_local_ip: false,
            use_p2p: false,
            send_peer_interval: Duration::from_secs(20),
            reset_conn_interval: Duration::ZERO,
            timeout_check_interval: Duration::from_secs(5),
            repush_interval: Duration::from_secs(30),
            queues: QueueSettings::default(),
            config_path: None,
        }
    }

    /// Defaults for a super device.
    pub fn super_node() -> Self {
        Self {
            role: NodeRole::Super,
            send_ping_interval: Duration::from_secs(15),
            ..Self::edge(NodeId::SUPER_NODE_MESSAGE)
        }
    }
}

// ============================================================================
// State, drops and events
// ============================================================================

/// Device lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceState {
    Down,
    Up,
    Closed,
}

impl DeviceState {
    pub fn is_up(&self) -> bool {
        matches!(self, DeviceState::Up)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceState::Down => "down",
            DeviceState::Up => "up",
            DeviceState::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

/// Why a datagram or packet was dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    MalformedPacket,
    AuthFailed,
    ReplayRejected,
    NoRoute,
    PeerUnknown,
    /// Queue full or rate limited.
    ResourceExhausted,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DropReason::MalformedPacket => "malformed packet",
            DropReason::AuthFailed => "authentication failed",
            DropReason::ReplayRejected => "replay rejected",
            DropReason::NoRoute => "no route",
            DropReason::PeerUnknown => "peer unknown",
            DropReason::ResourceExhausted => "resource exhausted",
        };
        write!(f, "{}", s)
    }
}

/// Device-wide counters.
#[derive(Debug, Default)]
pub struct DeviceStats {
    malformed: AtomicU64,
    auth_failed: AtomicU64,
    replay_rejected: AtomicU64,
    no_route: AtomicU64,
    peer_unknown: AtomicU64,
    resource_exhausted: AtomicU64,
    /// Packets forwarded on behalf of other nodes.
    transit: AtomicU64,
    /// Frames written to the TAP.
    delivered: AtomicU64,
    cookie_replies: AtomicU64,
}

impl DeviceStats {
    fn counter(&self, reason: DropReason) -> &AtomicU64 {
        match reason {
            DropReason::MalformedPacket => &self.malformed,
            DropReason::AuthFailed => &self.auth_failed,
            DropReason::ReplayRejected => &self.replay_rejected,
            DropReason::NoRoute => &self.no_route,
            DropReason::PeerUnknown => &self.peer_unknown,
            DropReason::ResourceExhausted => &self.resource_exhausted,
        }
    }

    pub(crate) fn record_drop(&self, reason: DropReason) {
        self.counter(reason).fetch_add(1, Ordering::Relaxed);
    }

    pub fn drops(&self, reason: DropReason) -> u64 {
        self.counter(reason).load(Ordering::Relaxed)
    }

    pub(crate) fn add_transit(&self) {
        self.transit.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transit(&self) -> u64 {
        self.transit.load(Ordering::Relaxed)
    }

    pub(crate) fn add_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub(crate) fn add_cookie_reply(&self) {
        self.cookie_replies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cookie_replies(&self) -> u64 {
        self.cookie_replies.load(Ordering::Relaxed)
    }
}

/// Instructions from the super that the embedding process must act on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceEvent {
    Shutdown { reason: String },
    /// Exit with `code`.
    ThrowError { code: i32, reason: String },
    Panic { reason: String },
}

impl fmt::Display for DeviceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceEvent::Shutdown { reason } => write!(f, "shutdown: {}", reason),
            DeviceEvent::ThrowError { code, reason } => write!(f, "error {}: {}", code, reason),
            DeviceEvent::Panic { reason } => write!(f, "panic: {}", reason),
        }
    }
}

/// Hashes of the last peer list and next-hop table installed from the
/// super. Reported in every register.
#[derive(Clone, Copy, Debug, Default)]
struct StateHashes {
    peer: [u8; 32],
    nh: [u8; 32],
}

/// Producer halves of the shared work queues, present while up.
#[derive(Clone)]
struct WorkQueues {
    handshake: mpsc::Sender<ReceivedPacket>,
    encryption: mpsc::Sender<EncryptJob>,
    decryption: mpsc::Sender<DecryptJob>,
}

// ============================================================================
// Device
// ============================================================================

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One overlay node: an edge, or one address family of a super.
pub struct Device {
    // === Identity ===
    settings: DeviceSettings,
    identity: RwLock<StaticIdentity>,
    cookie_checker: Mutex<CookieChecker>,

    // === Peers ===
    peers: RwLock<PeerTable>,
    index_table: IndexTable<Peer>,

    // === Routing ===
    graph: Mutex<Graph>,
    /// Published next-hop table, swapped by the graph.
    nh: Arc<SharedNhTable>,
    l2fib: Mutex<L2Fib>,
    dup: Mutex<DupCache>,

    // === Load ===
    rate_limiter: Mutex<HandshakeRateLimiter>,
    under_load_until: Mutex<Option<Instant>>,

    // === I/O ===
    bind: UdpBind,
    tap: Tap,

    // === Lifecycle ===
    state: Mutex<DeviceState>,
    queues: Mutex<Option<WorkQueues>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,

    // === Control plane ===
    hashes: Mutex<StateHashes>,
    fetcher: Option<Arc<dyn BlobFetcher>>,
    super_state: Option<Arc<SuperState>>,
    events_tx: mpsc::Sender<DeviceEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<DeviceEvent>>>,
    try_endpoint: Notify,
    register_now: Notify,
    ping_now: Notify,

    stats: DeviceStats,
}

impl Device {
    /// Create a device in the `Down` state.
    ///
    /// The graph's published table becomes the forwarding table, so a
    /// static table installed on the graph before this call is used as-is.
    pub fn new(settings: DeviceSettings, identity: StaticIdentity, tap: Tap, graph: Graph) -> Self {
        let cookie_checker = CookieChecker::new(identity.public_key());
        let nh = graph.shared();
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        let (shutdown, _) = watch::channel(false);
        Self {
            bind: UdpBind::new(settings.bind_ip),
            l2fib: Mutex::new(L2Fib::new(settings.l2fib_timeout)),
            dup: Mutex::new(DupCache::new(settings.dup_check_timeout)),
            settings,
            identity: RwLock::new(identity),
            cookie_checker: Mutex::new(cookie_checker),
            peers: RwLock::new(PeerTable::new()),
            index_table: IndexTable::new(),
            graph: Mutex::new(graph),
            nh,
            rate_limiter: Mutex::new(HandshakeRateLimiter::new()),
            under_load_until: Mutex::new(None),
            tap,
            state: Mutex::new(DeviceState::Down),
            queues: Mutex::new(None),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            hashes: Mutex::new(StateHashes::default()),
            fetcher: None,
            super_state: None,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            try_endpoint: Notify::new(),
            register_now: Notify::new(),
            ping_now: Notify::new(),
            stats: DeviceStats::default(),
        }
    }

    /// Where `UpdatePeer`/`UpdateNhTable` blobs are downloaded from.
    pub fn with_fetcher(mut self, fetcher: Arc<dyn BlobFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Attach the bookkeeping a super device reports into.
    pub fn with_super_state(mut self, state: Arc<SuperState>) -> Self {
        self.super_state = Some(state);
        self
    }

    // === Accessors ===

    pub fn settings(&self) -> &DeviceSettings {
        &self.settings
    }

    pub fn node_id(&self) -> NodeId {
        self.settings.node_id
    }

    pub fn role(&self) -> NodeRole {
        self.settings.role
    }

    pub fn public_key(&self) -> PublicKey {
        *read(&self.identity).public_key()
    }

    pub(crate) fn identity(&self) -> RwLockReadGuard<'_, StaticIdentity> {
        read(&self.identity)
    }

    pub fn state(&self) -> DeviceState {
        *lock(&self.state)
    }

    pub fn stats(&self) -> &DeviceStats {
        &self.stats
    }

    pub fn tap(&self) -> &Tap {
        &self.tap
    }

    /// Port the bind is listening on, while up.
    pub fn local_port(&self) -> Option<u16> {
        self.bind.local_addr().map(|a| a.port())
    }

    pub fn peer_by_id(&self, id: NodeId) -> Option<Arc<Peer>> {
        read(&self.peers).by_id(id).cloned()
    }

    pub fn peer_by_key(&self, key: &PublicKey) -> Option<Arc<Peer>> {
        read(&self.peers).by_key(key).cloned()
    }

    /// Snapshot of every peer, edges and supers.
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        read(&self.peers).all().cloned().collect()
    }

    pub(crate) fn edge_peers(&self) -> Vec<Arc<Peer>> {
        read(&self.peers).edges().cloned().collect()
    }

    pub(crate) fn super_peers(&self) -> Vec<Arc<Peer>> {
        read(&self.peers).supers().cloned().collect()
    }

    /// The installed next-hop table.
    pub fn nh_table(&self) -> Arc<NextHopTable> {
        self.nh.load()
    }

    /// Install a next-hop table, e.g. the static one from config.
    pub fn set_nh_table(&self, table: NextHopTable) {
        lock(&self.graph).set_nh_table(table);
    }

    /// Lock the routing graph.
    pub fn graph(&self) -> MutexGuard<'_, Graph> {
        lock(&self.graph)
    }

    pub fn l2fib(&self) -> MutexGuard<'_, L2Fib> {
        lock(&self.l2fib)
    }

    pub fn super_state(&self) -> Option<&Arc<SuperState>> {
        self.super_state.as_ref()
    }

    /// Take the event stream. Only the first caller gets it.
    pub fn events(&self) -> Option<mpsc::Receiver<DeviceEvent>> {
        lock(&self.events_rx).take()
    }

    pub fn peer_state_hash(&self) -> [u8; 32] {
        lock(&self.hashes).peer
    }

    pub fn nh_state_hash(&self) -> [u8; 32] {
        lock(&self.hashes).nh
    }

    fn set_peer_state_hash(&self, hash: [u8; 32]) {
        lock(&self.hashes).peer = hash;
    }

    fn set_nh_state_hash(&self, hash: [u8; 32]) {
        lock(&self.hashes).nh = hash;
    }

    // === Internal helpers ===

    fn work_queues(&self) -> Option<WorkQueues> {
        lock(&self.queues).clone()
    }

    fn is_under_load(&self, now: Instant) -> bool {
        lock(&self.under_load_until).is_some_and(|until| until > now)
    }

    fn mark_under_load(&self, now: Instant) {
        *lock(&self.under_load_until) = Some(now + UNDER_LOAD_AFTER_TIME);
    }

    fn drop_packet(&self, reason: DropReason) {
        self.stats.record_drop(reason);
    }

    fn emit(&self, event: DeviceEvent) {
        if self.events_tx.try_send(event).is_err() {
            tracing::warn!("Device event queue full, event dropped");
        }
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Run a short-lived task that stops on shutdown and is joined by
    /// `down` or `close`.
    fn spawn_background<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return;
        }
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => {}
                _ = task => {}
            }
        });
        let mut tasks = lock(&self.tasks);
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("role", &self.settings.role)
            .field("node_id", &self.settings.node_id)
            .field("state", &self.state())
            .field("peers", &read(&self.peers).len())
            .finish()
    }
}
