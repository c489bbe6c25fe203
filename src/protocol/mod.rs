//! Overlay Protocol
//!
//! Wire definitions shared by every node in the overlay:
//!
//! ## Datagram framing
//!
//! Byte 0 of every UDP datagram is a usage tag. Tags 1-3 are handshake
//! messages with fixed layouts (see `noise`). Tags 4 and above are
//! transport datagrams:
//!
//! ```text
//! [usage:1][receiver_index:4 LE][counter:8 LE][ciphertext..]
//! ```
//!
//! The first 13 bytes are bound to the AEAD tag as associated data, so the
//! usage of a transport datagram cannot be altered in flight.
//!
//! ## Overlay header
//!
//! The decrypted payload starts with a 7-byte big-endian overlay header
//! `dst:u16 src:u16 ttl:u8 length:u16` followed by the inner packet: an
//! Ethernet frame for `NormalPacket`, or a control message body.

mod control;
mod error;
mod header;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use control::{
    BroadcastPeerMsg, ControlMessage, PingMsg, PongMsg, QueryPeerMsg, RegisterMsg, ServerAction,
    ServerUpdateMsg, CODEC_VERSION,
};
pub use error::ProtocolError;
pub use header::{
    OverlayHeader, TransportHeader, OVERLAY_HEADER_SIZE, TRANSPORT_HEADER_SIZE,
    TRANSPORT_MIN_SIZE,
};

/// 16-bit overlay node identifier.
///
/// The top four values are reserved sentinels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u16);

impl NodeId {
    /// Forward along the broadcast tree.
    pub const BROADCAST: NodeId = NodeId(u16::MAX);
    /// Controlled flood to every known peer, with duplicate suppression.
    pub const CONTROL_MESSAGE: NodeId = NodeId(u16::MAX - 1);
    /// Edge <-> super traffic.
    pub const SUPER_NODE_MESSAGE: NodeId = NodeId(u16::MAX - 2);
    /// Invalid / no next hop.
    pub const BROKEN: NodeId = NodeId(u16::MAX - 3);

    /// Whether this is one of the reserved sentinels.
    pub fn is_special(self) -> bool {
        self >= Self::BROKEN
    }

    pub fn as_u16(self) -> u16 {
        self.0
    }
}

impl From<u16> for NodeId {
    fn from(v: u16) -> Self {
        NodeId(v)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            NodeId::BROADCAST => write!(f, "Broadcast"),
            NodeId::CONTROL_MESSAGE => write!(f, "Control"),
            NodeId::SUPER_NODE_MESSAGE => write!(f, "Super"),
            NodeId::BROKEN => write!(f, "Broken"),
            NodeId(n) => write!(f, "{}", n),
        }
    }
}

/// Usage tag carried in byte 0 of every datagram.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Usage {
    Initiation = 1,
    Response = 2,
    CookieReply = 3,
    /// Transport keepalive; empty payload.
    Transport = 4,
    NormalPacket = 5,
    /// Edge to super.
    Register = 6,
    /// Super to edge.
    ServerUpdate = 7,
    Ping = 8,
    /// Edge to everyone, including super.
    Pong = 9,
    QueryPeer = 10,
    BroadcastPeer = 11,
}

impl Usage {
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            1 => Usage::Initiation,
            2 => Usage::Response,
            3 => Usage::CookieReply,
            4 => Usage::Transport,
            5 => Usage::NormalPacket,
            6 => Usage::Register,
            7 => Usage::ServerUpdate,
            8 => Usage::Ping,
            9 => Usage::Pong,
            10 => Usage::QueryPeer,
            11 => Usage::BroadcastPeer,
            _ => return None,
        })
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Tags that use the transport datagram layout.
    pub fn is_transport(self) -> bool {
        self.to_byte() >= Usage::Transport.to_byte()
    }

    pub fn is_normal(self) -> bool {
        self == Usage::NormalPacket
    }

    pub fn is_control(self) -> bool {
        matches!(
            self,
            Usage::Register
                | Usage::ServerUpdate
                | Usage::Ping
                | Usage::Pong
                | Usage::QueryPeer
                | Usage::BroadcastPeer
        )
    }

    pub fn is_super_to_edge(self) -> bool {
        self == Usage::ServerUpdate
    }

    pub fn is_edge_to_super(self) -> bool {
        matches!(self, Usage::Register | Usage::Pong)
    }

    pub fn is_edge_to_edge(self) -> bool {
        matches!(
            self,
            Usage::Ping | Usage::Pong | Usage::QueryPeer | Usage::BroadcastPeer
        )
    }
}

impl fmt::Display for Usage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Usage::Initiation => "Initiation",
            Usage::Response => "Response",
            Usage::CookieReply => "CookieReply",
            Usage::Transport => "Transport",
            Usage::NormalPacket => "NormalPacket",
            Usage::Register => "Register",
            Usage::ServerUpdate => "ServerUpdate",
            Usage::Ping => "Ping",
            Usage::Pong => "Pong",
            Usage::QueryPeer => "QueryPeer",
            Usage::BroadcastPeer => "BroadcastPeer",
        };
        write!(f, "{}", name)
    }
}
