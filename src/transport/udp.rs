//! UDP Bind
//!
//! One socket serves every peer. The bind can be reopened on a new port
//! (the device does this on `up` and on listen-port changes); receivers
//! created from an earlier socket exit once it is closed.

use super::{Endpoint, ReceivedPacket, TransportError};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, trace};

/// Largest datagram we try to read.
const RECV_BUFFER_SIZE: usize = 65535;

struct Open {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    closed_tx: watch::Sender<bool>,
}

/// UDP bind shared by the receive task and the senders.
pub struct UdpBind {
    /// Address to bind on; port comes from `open`.
    bind_ip: IpAddr,
    open: RwLock<Option<Open>>,
    /// Firewall mark. Recorded for reopen; applying it needs platform
    /// socket options this bind does not set.
    mark: AtomicU32,
}

impl Default for UdpBind {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }
}

impl UdpBind {
    pub fn new(bind_ip: IpAddr) -> Self {
        Self {
            bind_ip,
            open: RwLock::new(None),
            mark: AtomicU32::new(0),
        }
    }

    /// Bind the socket on `port` (0 picks a free port).
    ///
    /// Returns a receiver for the new socket and the port actually bound.
    pub async fn open(&self, port: u16) -> Result<(UdpReceiver, u16), TransportError> {
        if self.is_open() {
            return Err(TransportError::AlreadyStarted);
        }

        let socket = UdpSocket::bind(SocketAddr::new(self.bind_ip, port))
            .await
            .map_err(|e| TransportError::StartFailed(format!("bind failed: {}", e)))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| TransportError::StartFailed(format!("get local addr: {}", e)))?;
        let socket = Arc::new(socket);
        let (closed_tx, closed_rx) = watch::channel(false);

        let mut guard = self.open.write().map_err(|_| TransportError::NotStarted)?;
        if guard.is_some() {
            return Err(TransportError::AlreadyStarted);
        }
        *guard = Some(Open {
            socket: socket.clone(),
            local_addr,
            closed_tx,
        });

        info!(local_addr = %local_addr, "UDP bind open");
        Ok((
            UdpReceiver {
                socket,
                closed: closed_rx,
                buf: vec![0u8; RECV_BUFFER_SIZE],
            },
            local_addr.port(),
        ))
    }

    pub fn is_open(&self) -> bool {
        self.open.read().map(|g| g.is_some()).unwrap_or(false)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.open.read().ok()?.as_ref().map(|o| o.local_addr)
    }

    fn socket(&self) -> Result<Arc<UdpSocket>, TransportError> {
        self.open
            .read()
            .map_err(|_| TransportError::NotStarted)?
            .as_ref()
            .map(|o| o.socket.clone())
            .ok_or(TransportError::NotStarted)
    }

    /// Send one datagram to `endpoint`.
    pub async fn send(&self, buf: &[u8], endpoint: &Endpoint) -> Result<(), TransportError> {
        let socket = self.socket()?;
        let sent = socket
            .send_to(buf, endpoint.dst())
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        trace!(endpoint = %endpoint, bytes = sent, "UDP datagram sent");
        Ok(())
    }

    /// Close the socket; receivers wake with `TransportError::Closed`.
    pub fn close(&self) {
        let taken = match self.open.write() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(open) = taken {
            let _ = open.closed_tx.send(true);
            debug!(local_addr = %open.local_addr, "UDP bind closed");
        }
    }

    pub fn set_mark(&self, mark: u32) {
        self.mark.store(mark, Ordering::Relaxed);
    }

    pub fn mark(&self) -> u32 {
        self.mark.load(Ordering::Relaxed)
    }
}

/// Receive half of one opened socket.
pub struct UdpReceiver {
    socket: Arc<UdpSocket>,
    closed: watch::Receiver<bool>,
    buf: Vec<u8>,
}

impl UdpReceiver {
    /// Wait for the next datagram.
    pub async fn recv(&mut self) -> Result<ReceivedPacket, TransportError> {
        if *self.closed.borrow() {
            return Err(TransportError::Closed);
        }
        let res = tokio::select! {
            res = self.socket.recv_from(&mut self.buf) => Some(res),
            _ = self.closed.changed() => None,
        };
        let (len, from) = res.ok_or(TransportError::Closed)??;

        let local = self.socket.local_addr().ok().map(|a| a.ip());
        let endpoint = match local {
            Some(ip) if !ip.is_unspecified() => Endpoint::with_src(from, ip),
            _ => Endpoint::new(from),
        };
        Ok(ReceivedPacket::new(endpoint, self.buf[..len].to_vec()))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    fn loopback() -> UdpBind {
        UdpBind::new("127.0.0.1".parse().unwrap())
    }

    #[tokio::test]
    async fn test_open_close() {
        let bind = loopback();
        assert!(!bind.is_open());

        let (_rx, port) = bind.open(0).await.unwrap();
        assert_ne!(port, 0);
        assert_eq!(bind.local_addr().unwrap().port(), port);

        bind.close();
        assert!(!bind.is_open());
    }

    #[tokio::test]
    async fn test_double_open_fails() {
        let bind = loopback();
        let _open = bind.open(0).await.unwrap();
        assert!(matches!(
            bind.open(0).await,
            Err(TransportError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn test_send_not_open() {
        let bind = loopback();
        let ep = Endpoint::new("127.0.0.1:9".parse().unwrap());
        assert!(matches!(
            bind.send(b"x", &ep).await,
            Err(TransportError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn test_send_recv() {
        let a = loopback();
        let b = loopback();
        let (_rx_a, port_a) = a.open(0).await.unwrap();
        let (mut rx_b, port_b) = b.open(0).await.unwrap();

        let to_b = Endpoint::new(SocketAddr::new("127.0.0.1".parse().unwrap(), port_b));
        a.send(b"hello world", &to_b).await.unwrap();

        let packet = timeout(Duration::from_secs(1), rx_b.recv())
            .await
            .expect("timeout")
            .unwrap();
        assert_eq!(packet.data, b"hello world");
        assert_eq!(packet.endpoint.dst().port(), port_a);
        assert_eq!(packet.endpoint.src_to_string(), "127.0.0.1");
    }

    #[tokio::test]
    async fn test_close_wakes_receiver() {
        let bind = loopback();
        let (mut rx, _) = bind.open(0).await.unwrap();
        let waiter = tokio::spawn(async move { rx.recv().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        bind.close();
        let res = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(matches!(res, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_reopen_after_close() {
        let bind = loopback();
        let (_rx, _) = bind.open(0).await.unwrap();
        bind.close();
        let (_rx, port) = bind.open(0).await.unwrap();
        assert!(port > 0);
        bind.set_mark(51820);
        assert_eq!(bind.mark(), 51820);
    }
}
