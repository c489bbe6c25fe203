//! Transport Layer
//!
//! The UDP bind every node sends and receives datagrams through, and the
//! `Endpoint` type peers are addressed by.

pub mod udp;

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;
use thiserror::Error;

pub use udp::{UdpBind, UdpReceiver};

// ============================================================================
// Received datagrams
// ============================================================================

/// A datagram read from the bind.
#[derive(Clone, Debug)]
pub struct ReceivedPacket {
    /// Where it came from.
    pub endpoint: Endpoint,
    pub data: Vec<u8>,
    pub received_at: Instant,
}

impl ReceivedPacket {
    pub fn new(endpoint: Endpoint, data: Vec<u8>) -> Self {
        Self {
            endpoint,
            data,
            received_at: Instant::now(),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors related to transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("bind not open")]
    NotStarted,

    #[error("bind already open")]
    AlreadyStarted,

    #[error("bind closed")]
    Closed,

    #[error("bind failed: {0}")]
    StartFailed(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("invalid endpoint: {0}")]
    InvalidAddress(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Whether a receive loop should back off and retry rather than exit.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::OutOfMemory
            ),
            TransportError::SendFailed(_) => true,
            _ => false,
        }
    }
}

// ============================================================================
// Endpoint
// ============================================================================

/// A resolved UDP address for a peer, plus the local source address the
/// last datagram from it arrived on (when known).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    dst: SocketAddr,
    src: Option<IpAddr>,
}

impl Endpoint {
    pub fn new(dst: SocketAddr) -> Self {
        Self { dst, src: None }
    }

    pub fn with_src(dst: SocketAddr, src: IpAddr) -> Self {
        Self {
            dst,
            src: Some(src),
        }
    }

    pub fn dst(&self) -> SocketAddr {
        self.dst
    }

    pub fn dst_ip(&self) -> IpAddr {
        self.dst.ip()
    }

    pub fn dst_to_string(&self) -> String {
        self.dst.to_string()
    }

    /// Empty when no source address is pinned.
    pub fn src_to_string(&self) -> String {
        self.src.map(|ip| ip.to_string()).unwrap_or_default()
    }

    pub fn clear_src(&mut self) {
        self.src = None;
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Endpoint::new(addr)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dst)
    }
}

/// Resolve `host:port` (a literal address or a DNS name) to an endpoint.
///
/// When a name resolves to several addresses the first one wins.
pub async fn parse_endpoint(s: &str) -> Result<Endpoint, TransportError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(TransportError::InvalidAddress("empty endpoint".into()));
    }
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(Endpoint::new(addr));
    }
    let mut addrs = tokio::net::lookup_host(s)
        .await
        .map_err(|e| TransportError::InvalidAddress(format!("{}: {}", s, e)))?;
    addrs
        .next()
        .map(Endpoint::new)
        .ok_or_else(|| TransportError::InvalidAddress(format!("{}: no addresses", s)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_parse_literal_endpoint() {
        let ep = parse_endpoint("192.0.2.1:3001").await.unwrap();
        assert_eq!(ep.dst_to_string(), "192.0.2.1:3001");
        assert_eq!(ep.dst_ip().to_string(), "192.0.2.1");
        assert_eq!(ep.src_to_string(), "");

        let v6 = parse_endpoint("[::1]:3001").await.unwrap();
        assert!(v6.dst_ip().is_ipv6());
    }

    #[tokio::test]
    async fn test_parse_hostname_endpoint() {
        let ep = parse_endpoint("localhost:3001").await.unwrap();
        assert!(ep.dst_ip().is_loopback());
        assert_eq!(ep.dst().port(), 3001);
    }

    #[tokio::test]
    async fn test_parse_invalid_endpoint() {
        assert!(parse_endpoint("").await.is_err());
        assert!(parse_endpoint("no-port").await.is_err());
    }

    #[test]
    fn test_clear_src() {
        let mut ep = Endpoint::with_src("10.0.0.1:1".parse().unwrap(), "10.0.0.2".parse().unwrap());
        assert_eq!(ep.src_to_string(), "10.0.0.2");
        ep.clear_src();
        assert_eq!(ep.src_to_string(), "");
    }

    #[test]
    fn test_transient_classification() {
        let e = TransportError::Io(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert!(e.is_transient());
        assert!(!TransportError::Closed.is_transient());
        assert!(!TransportError::Io(io::Error::from(io::ErrorKind::PermissionDenied)).is_transient());
    }
}
