//! Device tests over loopback UDP with in-process TAPs.

mod forwarding;
mod handshake;
mod lifecycle;

use super::*;
use crate::peer::PeerConfig;
use crate::routing::GraphSettings;
use crate::tap::ChannelTapHandle;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

pub(super) struct TestNode {
    pub device: Arc<Device>,
    pub tap: ChannelTapHandle,
    pub port: u16,
}

impl TestNode {
    pub fn id(&self) -> NodeId {
        self.device.node_id()
    }

    pub fn addr(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }
}

pub(super) fn test_settings(id: u16) -> DeviceSettings {
    let mut settings = DeviceSettings::edge(NodeId(id));
    settings.bind_ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
    settings.queues = QueueSettings {
        handshake: 64,
        encryption: 64,
        decryption: 64,
        workers: 2,
    };
    settings
}

/// Graph that never computes and serves `nh` as-is.
pub(super) fn static_graph(nh: &NextHopTable) -> Graph {
    let mut graph = Graph::new(GraphSettings {
        static_mode: true,
        ..Default::default()
    });
    graph.set_nh_table(nh.clone());
    graph
}

/// Next-hop table from `(src, dst, next)` triples.
pub(super) fn nh_table(routes: &[(u16, u16, u16)]) -> NextHopTable {
    let mut nh = NextHopTable::new();
    for &(src, dst, next) in routes {
        nh.set(NodeId(src), NodeId(dst), NodeId(next));
    }
    nh
}

pub(super) fn make_device(settings: DeviceSettings, nh: &NextHopTable) -> (Arc<Device>, ChannelTapHandle) {
    let name = format!("tap{}", settings.node_id);
    let (tap, handle) = Tap::channel(&name, 1500, 64);
    let device = Device::new(settings, StaticIdentity::generate(), tap, static_graph(nh));
    (Arc::new(device), handle)
}

pub(super) async fn start_node(id: u16, nh: &NextHopTable) -> TestNode {
    let (device, tap) = make_device(test_settings(id), nh);
    let port = device.up().await.unwrap();
    TestNode { device, tap, port }
}

/// Make `a` and `b` peers of each other. Only `a` knows `b`'s address;
/// `b` learns `a`'s from the handshake.
pub(super) async fn connect(a: &TestNode, b: &TestNode) {
    let mut config = PeerConfig::new(b.id(), b.device.public_key());
    config.conn_url = Some(b.addr());
    a.device.add_peer(config).await.unwrap();
    let config = PeerConfig::new(a.id(), a.device.public_key());
    b.device.add_peer(config).await.unwrap();
}

/// Ethernet frame from `src` to `dst` MAC.
pub(super) fn frame(dst: [u8; 6], src: [u8; 6], payload: &[u8]) -> Vec<u8> {
    let mut f = Vec::with_capacity(14 + payload.len());
    f.extend_from_slice(&dst);
    f.extend_from_slice(&src);
    f.extend_from_slice(&[0x08, 0x00]);
    f.extend_from_slice(payload);
    f
}

pub(super) fn mac(id: u8) -> [u8; 6] {
    [0x02, 0x00, 0x00, 0x00, 0x00, id]
}

pub(super) const BROADCAST_MAC: [u8; 6] = [0xff; 6];

pub(super) async fn recv_frame(tap: &mut ChannelTapHandle) -> Vec<u8> {
    tokio::time::timeout(WAIT, tap.written.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("tap closed")
}

/// Poll `cond` until it holds or `WAIT` elapses.
pub(super) async fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

pub(super) async fn shutdown(nodes: Vec<TestNode>) {
    for node in nodes {
        node.device.close().await;
    }
}
