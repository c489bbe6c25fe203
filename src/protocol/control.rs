//! Control messages carried after the overlay header.
//!
//! ## Encoding
//!
//! ```text
//! [version:1][fields...]
//! ```
//!
//! Fields are written in declaration order. Integers are big-endian, `f64`
//! is its IEEE-754 bit pattern big-endian, strings are `[len:2][utf-8]`,
//! 32-byte keys and hashes are raw. Trailing bytes are rejected.

use super::{NodeId, ProtocolError, Usage};
use crate::identity::{PresharedKey, PublicKey, KEY_SIZE};
use std::fmt;

/// Version byte leading every control body.
pub const CODEC_VERSION: u8 = 1;

// ============================================================================
// Field codec
// ============================================================================

struct Writer(Vec<u8>);

impl Writer {
    fn new() -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.push(CODEC_VERSION);
        Self(buf)
    }

    fn u8(&mut self, v: u8) -> &mut Self {
        self.0.push(v);
        self
    }

    fn u16(&mut self, v: u16) -> &mut Self {
        self.0.extend_from_slice(&v.to_be_bytes());
        self
    }

    fn u32(&mut self, v: u32) -> &mut Self {
        self.0.extend_from_slice(&v.to_be_bytes());
        self
    }

    fn i32(&mut self, v: i32) -> &mut Self {
        self.0.extend_from_slice(&v.to_be_bytes());
        self
    }

    fn i64(&mut self, v: i64) -> &mut Self {
        self.0.extend_from_slice(&v.to_be_bytes());
        self
    }

    fn f64(&mut self, v: f64) -> &mut Self {
        self.0.extend_from_slice(&v.to_bits().to_be_bytes());
        self
    }

    fn raw32(&mut self, v: &[u8; 32]) -> &mut Self {
        self.0.extend_from_slice(v);
        self
    }

    /// Strings longer than `u16::MAX` are cut at a character boundary.
    fn str(&mut self, s: &str) -> &mut Self {
        let mut end = s.len().min(u16::MAX as usize);
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        self.u16(end as u16);
        self.0.extend_from_slice(&s.as_bytes()[..end]);
        self
    }

    fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.0)
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Result<Self, ProtocolError> {
        let mut r = Self { buf, pos: 0 };
        let version = r.u8()?;
        if version != CODEC_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        Ok(r)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(ProtocolError::MessageTooShort {
                expected: end,
                got: self.buf.len(),
            });
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(i32::from_be_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64, ProtocolError> {
        Ok(i64::from_be_bytes(self.array()?))
    }

    fn f64(&mut self) -> Result<f64, ProtocolError> {
        Ok(f64::from_bits(u64::from_be_bytes(self.array()?)))
    }

    fn node(&mut self) -> Result<NodeId, ProtocolError> {
        Ok(NodeId(self.u16()?))
    }

    fn str(&mut self) -> Result<String, ProtocolError> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidString)
    }

    fn finish(self) -> Result<(), ProtocolError> {
        let rest = self.buf.len() - self.pos;
        if rest != 0 {
            return Err(ProtocolError::TrailingBytes(rest));
        }
        Ok(())
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Periodic edge -> super liveness report.
#[derive(Clone, Debug, PartialEq)]
pub struct RegisterMsg {
    pub node_id: NodeId,
    pub version: String,
    pub peer_state_hash: [u8; 32],
    pub nh_state_hash: [u8; 32],
}

impl RegisterMsg {
    pub fn encode(&self) -> Vec<u8> {
        Writer::new()
            .u16(self.node_id.0)
            .str(&self.version)
            .raw32(&self.peer_state_hash)
            .raw32(&self.nh_state_hash)
            .finish()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(payload)?;
        let msg = Self {
            node_id: r.node()?,
            version: r.str()?,
            peer_state_hash: r.array()?,
            nh_state_hash: r.array()?,
        };
        r.finish()?;
        Ok(msg)
    }
}

/// What a `ServerUpdate` asks the edge to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerAction {
    NoAction = 0,
    Shutdown = 1,
    /// Terminate with the carried exit code.
    ThrowError = 2,
    Panic = 3,
    /// Peer list changed; params carry the new hash.
    UpdatePeer = 4,
    /// Next-hop table changed; params carry the new hash.
    UpdateNhTable = 5,
}

impl ServerAction {
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0 => ServerAction::NoAction,
            1 => ServerAction::Shutdown,
            2 => ServerAction::ThrowError,
            3 => ServerAction::Panic,
            4 => ServerAction::UpdatePeer,
            5 => ServerAction::UpdateNhTable,
            _ => return None,
        })
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ServerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerAction::NoAction => "NoAction",
            ServerAction::Shutdown => "Shutdown",
            ServerAction::ThrowError => "ThrowError",
            ServerAction::Panic => "Panic",
            ServerAction::UpdatePeer => "UpdatePeer",
            ServerAction::UpdateNhTable => "UpdateNhTable",
        };
        write!(f, "{}", name)
    }
}

/// Super -> edge instruction.
#[derive(Clone, Debug, PartialEq)]
pub struct ServerUpdateMsg {
    pub node_id: NodeId,
    pub action: ServerAction,
    pub code: i32,
    pub params: String,
}

impl ServerUpdateMsg {
    pub fn update_hash(node_id: NodeId, action: ServerAction, hash: &[u8; 32]) -> Self {
        Self {
            node_id,
            action,
            code: 0,
            params: hex::encode(hash),
        }
    }

    /// The hash carried by `UpdatePeer`/`UpdateNhTable`.
    pub fn params_hash(&self) -> Option<[u8; 32]> {
        let bytes = hex::decode(&self.params).ok()?;
        bytes.try_into().ok()
    }

    pub fn encode(&self) -> Vec<u8> {
        Writer::new()
            .u16(self.node_id.0)
            .u8(self.action.to_byte())
            .i32(self.code)
            .str(&self.params)
            .finish()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(payload)?;
        let node_id = r.node()?;
        let action_byte = r.u8()?;
        let action =
            ServerAction::from_byte(action_byte).ok_or(ProtocolError::InvalidAction(action_byte))?;
        let msg = Self {
            node_id,
            action,
            code: r.i32()?,
            params: r.str()?,
        };
        r.finish()?;
        Ok(msg)
    }
}

/// Latency probe, flooded or sent to a single peer.
#[derive(Clone, Debug, PartialEq)]
pub struct PingMsg {
    pub request_id: u32,
    pub src_node_id: NodeId,
    /// Sender's clock in Unix milliseconds (NTP-corrected).
    pub time_ms: i64,
    /// How many pings the receiver should send back.
    pub request_reply: u8,
}

impl PingMsg {
    pub fn encode(&self) -> Vec<u8> {
        Writer::new()
            .u32(self.request_id)
            .u16(self.src_node_id.0)
            .i64(self.time_ms)
            .u8(self.request_reply)
            .finish()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(payload)?;
        let msg = Self {
            request_id: r.u32()?,
            src_node_id: r.node()?,
            time_ms: r.i64()?,
            request_reply: r.u8()?,
        };
        r.finish()?;
        Ok(msg)
    }
}

/// One-way latency sample `src -> dst`, reported by `dst`.
#[derive(Clone, Debug, PartialEq)]
pub struct PongMsg {
    pub request_id: u32,
    pub src_node_id: NodeId,
    pub dst_node_id: NodeId,
    /// Seconds.
    pub timediff: f64,
    /// Seconds the sample stays valid.
    pub time_to_alive: f64,
    /// Milliseconds added to the measured weight.
    pub additional_cost: f64,
}

impl PongMsg {
    pub fn encode(&self) -> Vec<u8> {
        Writer::new()
            .u32(self.request_id)
            .u16(self.src_node_id.0)
            .u16(self.dst_node_id.0)
            .f64(self.timediff)
            .f64(self.time_to_alive)
            .f64(self.additional_cost)
            .finish()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(payload)?;
        let msg = Self {
            request_id: r.u32()?,
            src_node_id: r.node()?,
            dst_node_id: r.node()?,
            timediff: r.f64()?,
            time_to_alive: r.f64()?,
            additional_cost: r.f64()?,
        };
        r.finish()?;
        Ok(msg)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct QueryPeerMsg {
    /// Node ID of the asker.
    pub request_id: u32,
}

impl QueryPeerMsg {
    pub fn encode(&self) -> Vec<u8> {
        Writer::new().u32(self.request_id).finish()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(payload)?;
        let msg = Self {
            request_id: r.u32()?,
        };
        r.finish()?;
        Ok(msg)
    }
}

/// Announcement of one known peer and how to reach it.
#[derive(Clone, Debug, PartialEq)]
pub struct BroadcastPeerMsg {
    pub request_id: u32,
    pub node_id: NodeId,
    pub pubkey: PublicKey,
    pub psk: PresharedKey,
    pub conn_url: String,
}

impl BroadcastPeerMsg {
    pub fn encode(&self) -> Vec<u8> {
        Writer::new()
            .u32(self.request_id)
            .u16(self.node_id.0)
            .raw32(self.pubkey.as_bytes())
            .raw32(self.psk.as_bytes())
            .str(&self.conn_url)
            .finish()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(payload)?;
        let request_id = r.u32()?;
        let node_id = r.node()?;
        let pubkey = PublicKey::from_bytes(r.array::<KEY_SIZE>()?);
        let psk = PresharedKey::from_bytes(r.array::<KEY_SIZE>()?);
        let conn_url = r.str()?;
        r.finish()?;
        Ok(Self {
            request_id,
            node_id,
            pubkey,
            psk,
            conn_url,
        })
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// Any decoded control body, tagged by its datagram usage.
#[derive(Clone, Debug, PartialEq)]
pub enum ControlMessage {
    Register(RegisterMsg),
    ServerUpdate(ServerUpdateMsg),
    Ping(PingMsg),
    Pong(PongMsg),
    QueryPeer(QueryPeerMsg),
    BroadcastPeer(BroadcastPeerMsg),
}

impl ControlMessage {
    pub fn usage(&self) -> Usage {
        match self {
            ControlMessage::Register(_) => Usage::Register,
            ControlMessage::ServerUpdate(_) => Usage::ServerUpdate,
            ControlMessage::Ping(_) => Usage::Ping,
            ControlMessage::Pong(_) => Usage::Pong,
            ControlMessage::QueryPeer(_) => Usage::QueryPeer,
            ControlMessage::BroadcastPeer(_) => Usage::BroadcastPeer,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            ControlMessage::Register(m) => m.encode(),
            ControlMessage::ServerUpdate(m) => m.encode(),
            ControlMessage::Ping(m) => m.encode(),
            ControlMessage::Pong(m) => m.encode(),
            ControlMessage::QueryPeer(m) => m.encode(),
            ControlMessage::BroadcastPeer(m) => m.encode(),
        }
    }

    pub fn decode(usage: Usage, payload: &[u8]) -> Result<Self, ProtocolError> {
        Ok(match usage {
            Usage::Register => ControlMessage::Register(RegisterMsg::decode(payload)?),
            Usage::ServerUpdate => ControlMessage::ServerUpdate(ServerUpdateMsg::decode(payload)?),
            Usage::Ping => ControlMessage::Ping(PingMsg::decode(payload)?),
            Usage::Pong => ControlMessage::Pong(PongMsg::decode(payload)?),
            Usage::QueryPeer => ControlMessage::QueryPeer(QueryPeerMsg::decode(payload)?),
            Usage::BroadcastPeer => {
                ControlMessage::BroadcastPeer(BroadcastPeerMsg::decode(payload)?)
            }
            other => return Err(ProtocolError::InvalidUsage(other.to_byte())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_layout() {
        let ping = PingMsg {
            request_id: 1,
            src_node_id: NodeId(0x0203),
            time_ms: -1,
            request_reply: 4,
        };
        let bytes = ping.encode();
        assert_eq!(
            bytes,
            [1, 0, 0, 0, 1, 2, 3, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 4]
        );
        assert_eq!(PingMsg::decode(&bytes).unwrap(), ping);
    }

    #[test]
    fn test_pong_preserves_floats() {
        let pong = PongMsg {
            request_id: 9,
            src_node_id: NodeId(1),
            dst_node_id: NodeId(2),
            timediff: 0.0123,
            time_to_alive: 70.0,
            additional_cost: 0.5,
        };
        let msg = ControlMessage::Pong(pong.clone());
        let back = ControlMessage::decode(Usage::Pong, &msg.encode()).unwrap();
        assert_eq!(back, ControlMessage::Pong(pong));
    }

    #[test]
    fn test_broadcast_peer_with_utf8_url() {
        let msg = BroadcastPeerMsg {
            request_id: 65535,
            node_id: NodeId(12),
            pubkey: PublicKey::from_bytes([7u8; 32]),
            psk: PresharedKey::default(),
            conn_url: "höst.example:3456".into(),
        };
        assert_eq!(BroadcastPeerMsg::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_server_update_hash_params() {
        let hash = [0xabu8; 32];
        let msg = ServerUpdateMsg::update_hash(NodeId(3), ServerAction::UpdateNhTable, &hash);
        let back = ServerUpdateMsg::decode(&msg.encode()).unwrap();
        assert_eq!(back.params_hash(), Some(hash));
        assert_eq!(back.action, ServerAction::UpdateNhTable);
    }

    #[test]
    fn test_register_roundtrip() {
        let msg = RegisterMsg {
            node_id: NodeId(5),
            version: "0.1.0".into(),
            peer_state_hash: [1u8; 32],
            nh_state_hash: [2u8; 32],
        };
        assert_eq!(RegisterMsg::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_rejects_trailing_bytes() {
        let mut bytes = QueryPeerMsg { request_id: 2 }.encode();
        bytes.push(0);
        assert!(matches!(
            QueryPeerMsg::decode(&bytes),
            Err(ProtocolError::TrailingBytes(1))
        ));
    }

    #[test]
    fn test_rejects_unknown_version() {
        let mut bytes = QueryPeerMsg { request_id: 2 }.encode();
        bytes[0] = 9;
        assert!(matches!(
            QueryPeerMsg::decode(&bytes),
            Err(ProtocolError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn test_rejects_truncated() {
        let bytes = PingMsg {
            request_id: 1,
            src_node_id: NodeId(1),
            time_ms: 0,
            request_reply: 0,
        }
        .encode();
        assert!(PingMsg::decode(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_rejects_bad_action() {
        let mut bytes = ServerUpdateMsg {
            node_id: NodeId(1),
            action: ServerAction::Shutdown,
            code: 0,
            params: String::new(),
        }
        .encode();
        bytes[3] = 42;
        assert!(matches!(
            ServerUpdateMsg::decode(&bytes),
            Err(ProtocolError::InvalidAction(42))
        ));
    }

    #[test]
    fn test_normal_packet_is_not_control() {
        assert!(ControlMessage::decode(Usage::NormalPacket, &[1]).is_err());
    }
}
