//! meshguard: full-mesh layer-2 overlay VPN
//!
//! Edges exchange Ethernet frames over Noise IKpsk2 sessions on UDP and
//! forward them hop by hop along latency-derived next-hop tables. An
//! optional super node collects latency reports, computes the tables and
//! distributes peer lists to its edges.

pub mod cache;
pub mod config;
pub mod control;
pub mod device;
pub mod identity;
pub mod noise;
pub mod peer;
pub mod protocol;
pub mod routing;
pub mod tap;
pub mod transport;
pub mod utils;

// Re-export identity types
pub use identity::{IdentityError, PresharedKey, PrivateKey, PublicKey, StaticIdentity};

// Re-export config types
pub use config::{ConfigError, EdgeConfig, LogConfig, PeerEntry, SuperConfig};

// Re-export protocol types
pub use protocol::{
    ControlMessage, NodeId, OverlayHeader, ProtocolError, ServerAction, ServerUpdateMsg, Usage,
};

// Re-export transport types
pub use transport::{parse_endpoint, Endpoint, ReceivedPacket, TransportError, UdpBind};

// Re-export TAP types
pub use tap::{MacAddr, Tap, TapError, TapEvent};

// Re-export routing types
pub use routing::{Graph, GraphSettings, NextHopTable, PongSample, RoutingError};

// Re-export cache types
pub use cache::{CacheEntry, CacheStats, DupCache, L2Fib};

// Re-export peer types
pub use peer::{Peer, PeerConfig, PeerError, PeerStats};

// Re-export control-plane types
pub use control::{
    serve_edge_api, BlobFetcher, ControlError, HttpFetcher, StaticFetcher, SuperPeer, SuperState,
};

// Re-export device types
pub use device::{
    Device, DeviceError, DeviceEvent, DeviceSettings, DeviceState, DeviceStats, DropReason,
    NodeRole,
};
