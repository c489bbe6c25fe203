//! Virtual Ethernet Interface
//!
//! The device reads Ethernet frames from and writes them to a `Tap`. The
//! variants share one surface: `read`, `write`, `flush`, `mtu`, `name`,
//! `events` and `close`. Offsets let the caller keep headroom in front of
//! the frame inside the same buffer.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Mutex as StdMutex;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info};

/// Default MTU for interfaces that do not report one.
pub const DEFAULT_MTU: u16 = 1500;

/// Minimum length of an Ethernet header (dst + src MAC).
pub const ETHERNET_ADDRS_LEN: usize = 12;

const EVENT_QUEUE_SIZE: usize = 32;

/// Errors that can occur with TAP operations.
#[derive(Debug, Error)]
pub enum TapError {
    #[error("interface closed")]
    Closed,

    #[error("invalid interface configuration: {0}")]
    Configure(String),

    #[error("buffer offset {offset} beyond buffer of {len} bytes")]
    BadOffset { offset: usize, len: usize },

    #[error("invalid MAC address prefix: {0}")]
    InvalidMacPrefix(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Interface state change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TapEvent {
    Up,
    Down,
    MtuUpdate(u16),
}

// ============================================================================
// MAC helpers
// ============================================================================

/// 48-bit Ethernet address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

    /// Destination address of a frame (bytes 0..6).
    pub fn dst_of(frame: &[u8]) -> Option<Self> {
        frame.get(0..6).map(|b| {
            let mut mac = [0u8; 6];
            mac.copy_from_slice(b);
            MacAddr(mac)
        })
    }

    /// Source address of a frame (bytes 6..12).
    pub fn src_of(frame: &[u8]) -> Option<Self> {
        frame.get(6..12).map(|b| {
            let mut mac = [0u8; 6];
            mac.copy_from_slice(b);
            MacAddr(mac)
        })
    }

    /// Broadcast and IPv6 multicast (33:33:..) addresses are flooded.
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST || self.0[0..2] == [0x33, 0x33]
    }

    pub fn is_unicast(&self) -> bool {
        !self.is_broadcast() && self.0[0] & 0x01 == 0
    }

    /// Interface address from a colon separated prefix of up to four bytes
    /// followed by the node ID in the last two bytes.
    pub fn for_node(prefix: &str, node_id: u16) -> Result<Self, TapError> {
        let mut mac = [0u8; 6];
        if !prefix.trim().is_empty() {
            let parts: Vec<&str> = prefix.trim().split(':').collect();
            if parts.len() > 4 {
                return Err(TapError::InvalidMacPrefix(prefix.to_string()));
            }
            for (i, part) in parts.iter().enumerate() {
                mac[i] = u8::from_str_radix(part, 16)
                    .map_err(|_| TapError::InvalidMacPrefix(prefix.to_string()))?;
            }
        }
        mac[4..6].copy_from_slice(&node_id.to_be_bytes());
        Ok(MacAddr(mac))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddr({})", self)
    }
}

// ============================================================================
// Shared plumbing
// ============================================================================

struct Common {
    name: String,
    mtu: AtomicU16,
    events_tx: StdMutex<Option<mpsc::Sender<TapEvent>>>,
    events_rx: StdMutex<Option<mpsc::Receiver<TapEvent>>>,
    closed_tx: watch::Sender<bool>,
    closed: AtomicBool,
}

impl Common {
    fn new(name: &str, mtu: u16) -> Self {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        let _ = tx.try_send(TapEvent::Up);
        let (closed_tx, _) = watch::channel(false);
        Self {
            name: name.to_string(),
            mtu: AtomicU16::new(mtu),
            events_tx: StdMutex::new(Some(tx)),
            events_rx: StdMutex::new(Some(rx)),
            closed_tx,
            closed: AtomicBool::new(false),
        }
    }

    fn emit(&self, event: TapEvent) {
        if let Ok(guard) = self.events_tx.lock() {
            if let Some(tx) = guard.as_ref() {
                let _ = tx.try_send(event);
            }
        }
    }

    fn check_open(&self) -> Result<(), TapError> {
        if self.closed.load(Ordering::Acquire) {
            Err(TapError::Closed)
        } else {
            Ok(())
        }
    }

    async fn wait_closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.emit(TapEvent::Down);
        if let Ok(mut guard) = self.events_tx.lock() {
            guard.take();
        }
        let _ = self.closed_tx.send(true);
    }
}

fn check_offset(buf: &[u8], offset: usize) -> Result<(), TapError> {
    if offset > buf.len() {
        return Err(TapError::BadOffset {
            offset,
            len: buf.len(),
        });
    }
    Ok(())
}

// ============================================================================
// Channel TAP
// ============================================================================

/// In-process interface: frames are exchanged with a `ChannelTapHandle`.
pub struct ChannelTap {
    common: Common,
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
    outbound: mpsc::Sender<Vec<u8>>,
}

/// The far side of a `ChannelTap`.
pub struct ChannelTapHandle {
    /// Frames pushed here are read by the device.
    pub inject: mpsc::Sender<Vec<u8>>,
    /// Frames the device wrote to the interface.
    pub written: mpsc::Receiver<Vec<u8>>,
}

// ============================================================================
// Dummy TAP
// ============================================================================

/// Discards writes; reads block until closed.
pub struct DummyTap {
    common: Common,
}

// ============================================================================
// UDP socket TAP
// ============================================================================

/// Frames carried one per datagram over a local UDP socket.
///
/// Without a configured send address, replies go to whoever sent the
/// last frame.
pub struct UdpSockTap {
    common: Common,
    socket: UdpSocket,
    send_addr: StdMutex<Option<SocketAddr>>,
    fixed_send: bool,
}

/// A virtual Ethernet interface.
pub enum Tap {
    Channel(ChannelTap),
    Dummy(DummyTap),
    UdpSock(UdpSockTap),
}

impl Tap {
    /// In-process interface with queues of `capacity` frames.
    pub fn channel(name: &str, mtu: u16, capacity: usize) -> (Self, ChannelTapHandle) {
        let (inject, inbound) = mpsc::channel(capacity);
        let (outbound, written) = mpsc::channel(capacity);
        (
            Tap::Channel(ChannelTap {
                common: Common::new(name, mtu),
                inbound: Mutex::new(inbound),
                outbound,
            }),
            ChannelTapHandle { inject, written },
        )
    }

    pub fn dummy(name: &str, mtu: u16) -> Self {
        Tap::Dummy(DummyTap {
            common: Common::new(name, mtu),
        })
    }

    /// Bind `recv_addr` (default `127.0.0.1:0`) and send to `send_addr`.
    pub async fn udp_sock(
        name: &str,
        mtu: u16,
        recv_addr: Option<&str>,
        send_addr: Option<&str>,
    ) -> Result<Self, TapError> {
        if recv_addr.is_none() && send_addr.is_none() {
            return Err(TapError::Configure(
                "at least one of RecvAddr or SendAddr required".into(),
            ));
        }
        let socket = UdpSocket::bind(recv_addr.unwrap_or("127.0.0.1:0")).await?;
        let send = match send_addr {
            Some(s) => Some(
                tokio::net::lookup_host(s)
                    .await?
                    .next()
                    .ok_or_else(|| TapError::Configure(format!("cannot resolve {}", s)))?,
            ),
            None => None,
        };
        info!(name, local = ?socket.local_addr().ok(), send = ?send, "UDP socket TAP ready");
        Ok(Tap::UdpSock(UdpSockTap {
            common: Common::new(name, mtu),
            socket,
            fixed_send: send.is_some(),
            send_addr: StdMutex::new(send),
        }))
    }

    fn common(&self) -> &Common {
        match self {
            Tap::Channel(t) => &t.common,
            Tap::Dummy(t) => &t.common,
            Tap::UdpSock(t) => &t.common,
        }
    }

    /// Read one frame into `buf[offset..]`, returning its length.
    pub async fn read(&self, buf: &mut [u8], offset: usize) -> Result<usize, TapError> {
        check_offset(buf, offset)?;
        let common = self.common();
        common.check_open()?;
        match self {
            Tap::Channel(t) => {
                let mut rx = t.inbound.lock().await;
                let frame = tokio::select! {
                    frame = rx.recv() => frame,
                    _ = common.wait_closed() => None,
                };
                let frame = frame.ok_or(TapError::Closed)?;
                let n = frame.len().min(buf.len() - offset);
                buf[offset..offset + n].copy_from_slice(&frame[..n]);
                Ok(n)
            }
            Tap::Dummy(_) => {
                common.wait_closed().await;
                Err(TapError::Closed)
            }
            Tap::UdpSock(t) => {
                let res = tokio::select! {
                    res = t.socket.recv_from(&mut buf[offset..]) => Some(res),
                    _ = common.wait_closed() => None,
                };
                let (n, from) = res.ok_or(TapError::Closed)??;
                if !t.fixed_send {
                    if let Ok(mut send) = t.send_addr.lock() {
                        *send = Some(from);
                    }
                }
                Ok(n)
            }
        }
    }

    /// Write the frame in `buf[offset..]`.
    pub async fn write(&self, buf: &[u8], offset: usize) -> Result<usize, TapError> {
        check_offset(buf, offset)?;
        self.common().check_open()?;
        let frame = &buf[offset..];
        match self {
            Tap::Channel(t) => {
                t.outbound
                    .send(frame.to_vec())
                    .await
                    .map_err(|_| TapError::Closed)?;
                Ok(frame.len())
            }
            Tap::Dummy(_) => Ok(frame.len()),
            Tap::UdpSock(t) => {
                let dest = t.send_addr.lock().ok().and_then(|g| *g);
                match dest {
                    Some(addr) => Ok(t.socket.send_to(frame, addr).await?),
                    None => {
                        debug!(name = %t.common.name, "no UDP TAP peer yet, frame dropped");
                        Ok(frame.len())
                    }
                }
            }
        }
    }

    pub async fn flush(&self) -> Result<(), TapError> {
        self.common().check_open()
    }

    pub fn mtu(&self) -> u16 {
        self.common().mtu.load(Ordering::Relaxed)
    }

    /// Change the MTU and emit `MtuUpdate`.
    pub fn set_mtu(&self, mtu: u16) {
        let common = self.common();
        if common.mtu.swap(mtu, Ordering::Relaxed) != mtu {
            common.emit(TapEvent::MtuUpdate(mtu));
        }
    }

    pub fn name(&self) -> &str {
        &self.common().name
    }

    /// Take the event stream. Only the first caller gets it.
    pub fn events(&self) -> Option<mpsc::Receiver<TapEvent>> {
        self.common().events_rx.lock().ok()?.take()
    }

    /// Emit `Down`, close the event stream and wake blocked readers.
    pub fn close(&self) {
        self.common().close();
    }

    pub fn is_closed(&self) -> bool {
        self.common().closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Tap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Tap::Channel(_) => "channel",
            Tap::Dummy(_) => "dummy",
            Tap::UdpSock(_) => "udpsock",
        };
        f.debug_struct("Tap")
            .field("kind", &kind)
            .field("name", &self.name())
            .field("mtu", &self.mtu())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    fn frame(dst: [u8; 6], src: [u8; 6]) -> Vec<u8> {
        let mut f = Vec::new();
        f.extend_from_slice(&dst);
        f.extend_from_slice(&src);
        f.extend_from_slice(&[0x08, 0x00, 1, 2, 3]);
        f
    }

    #[test]
    fn test_mac_extraction() {
        let f = frame([1, 2, 3, 4, 5, 6], [0xa, 0xb, 0xc, 0xd, 0xe, 0xf]);
        assert_eq!(MacAddr::dst_of(&f).unwrap().0, [1, 2, 3, 4, 5, 6]);
        assert_eq!(MacAddr::src_of(&f).unwrap().to_string(), "0a:0b:0c:0d:0e:0f");
        assert!(MacAddr::src_of(&f[..8]).is_none());
    }

    #[test]
    fn test_broadcast_classes() {
        assert!(MacAddr::BROADCAST.is_broadcast());
        assert!(MacAddr([0x33, 0x33, 0, 0, 0, 1]).is_broadcast());
        assert!(!MacAddr([0x01, 0, 0x5e, 0, 0, 1]).is_unicast());
        assert!(MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0, 1]).is_unicast());
    }

    #[test]
    fn test_mac_for_node() {
        let mac = MacAddr::for_node("AA:BB:CC:DD", 0x0102).unwrap();
        assert_eq!(mac.0, [0xaa, 0xbb, 0xcc, 0xdd, 0x01, 0x02]);
        assert!(MacAddr::for_node("AA:BB:CC:DD:EE", 1).is_err());
        assert!(MacAddr::for_node("ZZ", 1).is_err());
    }

    #[tokio::test]
    async fn test_channel_tap_roundtrip() {
        let (tap, mut handle) = Tap::channel("tap0", 1400, 8);
        let mut events = tap.events().unwrap();
        assert_eq!(events.recv().await, Some(TapEvent::Up));
        assert!(tap.events().is_none());

        handle.inject.send(b"frame-in".to_vec()).await.unwrap();
        let mut buf = vec![0u8; 64];
        let n = tap.read(&mut buf, 10).await.unwrap();
        assert_eq!(&buf[10..10 + n], b"frame-in");

        let mut out = vec![0u8; 4];
        out.extend_from_slice(b"frame-out");
        tap.write(&out, 4).await.unwrap();
        assert_eq!(handle.written.recv().await.unwrap(), b"frame-out");
    }

    #[tokio::test]
    async fn test_close_wakes_reader_and_emits_down() {
        let (tap, _handle) = Tap::channel("tap0", 1500, 8);
        let tap = std::sync::Arc::new(tap);
        let mut events = tap.events().unwrap();
        let reader = {
            let tap = tap.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 32];
                tap.read(&mut buf, 0).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        tap.close();

        let res = timeout(Duration::from_secs(1), reader).await.unwrap().unwrap();
        assert!(matches!(res, Err(TapError::Closed)));
        assert_eq!(events.recv().await, Some(TapEvent::Up));
        assert_eq!(events.recv().await, Some(TapEvent::Down));
        assert_eq!(events.recv().await, None);
        assert!(matches!(tap.write(b"x", 0).await, Err(TapError::Closed)));
    }

    #[tokio::test]
    async fn test_mtu_update_event() {
        let tap = Tap::dummy("dummy0", 1500);
        let mut events = tap.events().unwrap();
        tap.set_mtu(1400);
        tap.set_mtu(1400);
        assert_eq!(tap.mtu(), 1400);
        assert_eq!(events.recv().await, Some(TapEvent::Up));
        assert_eq!(events.recv().await, Some(TapEvent::MtuUpdate(1400)));
        assert!(events.try_recv().is_err());
        assert_eq!(tap.write(b"abc", 0).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_udp_sock_tap() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap().to_string();
        let tap = Tap::udp_sock("sock0", 1500, None, Some(&peer_addr)).await.unwrap();

        tap.write(b"to-peer", 0).await.unwrap();
        let mut buf = [0u8; 32];
        let (n, from) = timeout(Duration::from_secs(1), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"to-peer");

        peer.send_to(b"to-tap", from).await.unwrap();
        let mut rbuf = [0u8; 32];
        let n = timeout(Duration::from_secs(1), tap.read(&mut rbuf, 0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&rbuf[..n], b"to-tap");
    }

    #[tokio::test]
    async fn test_udp_sock_requires_an_address() {
        assert!(Tap::udp_sock("x", 1500, None, None).await.is_err());
    }
}
