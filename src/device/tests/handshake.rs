//! Handshake admission, cookies and replay protection.

use super::*;
use crate::identity::PresharedKey;
use crate::cache::DEFAULT_PACKETS_BURSTABLE;
use crate::noise::{CookieGenerator, Handshake};
use crate::protocol::Usage;
use crate::transport::Endpoint;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

#[tokio::test]
async fn test_session_established_on_first_packet() {
    let nh = nh_table(&[(1, 2, 2), (2, 1, 1)]);
    let mut n1 = start_node(1, &nh).await;
    let n2 = start_node(2, &nh).await;
    connect(&n1, &n2).await;

    // Unknown unicast MAC floods
    let f = frame(mac(2), mac(1), b"first");
    let peer = n1.device.peer_by_id(NodeId(2)).unwrap();
    assert!(peer.keypairs().current().is_none());
    n1.tap.inject.send(f).await.unwrap();

    assert!(wait_until(|| peer.keypairs().current().is_some()).await);
    let back = n2.device.peer_by_id(NodeId(1)).unwrap();
    assert!(wait_until(|| back.keypairs().current().is_some()).await);
    assert!(back.stats().last_handshake().is_some());
    assert_eq!(back.endpoint().map(|e| e.dst().port()), Some(n1.port));

    // The responder can send once the initiator's data confirmed the session
    let f = frame(mac(1), mac(2), b"back");
    n2.tap.inject.send(f.clone()).await.unwrap();
    assert_eq!(recv_frame(&mut n1.tap).await, f);

    shutdown(vec![n1, n2]).await;
}

/// Valid initiations from a key the device knows, with mac1 but no mac2.
fn forged_initiations(device: &Device, sender: &StaticIdentity, count: usize) -> Vec<Vec<u8>> {
    let device_key = device.public_key();
    (0..count)
        .map(|i| {
            let mut hs = Handshake::new(sender, device_key, PresharedKey::default());
            let msg = hs.create_initiation(sender, 1000 + i as u32).unwrap();
            let mut bytes = msg.to_bytes().to_vec();
            CookieGenerator::new(&device_key).add_macs(&mut bytes);
            bytes
        })
        .collect()
}

#[tokio::test]
async fn test_flood_under_load_gets_cookie_replies() {
    let nh = NextHopTable::new();
    let mut settings = test_settings(1);
    settings.queues.handshake = 8;
    let (device, _tap) = make_device(settings, &nh);
    let port = device.up().await.unwrap();

    let sender = StaticIdentity::generate();
    device
        .add_peer(PeerConfig::new(NodeId(2), *sender.public_key()))
        .await
        .unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target = format!("127.0.0.1:{}", port);
    for bytes in forged_initiations(&device, &sender, 64) {
        socket.send_to(&bytes, &target).await.unwrap();
    }

    // Some answer must be a cookie reply
    let mut buf = [0u8; 256];
    let got_cookie = tokio::time::timeout(WAIT, async {
        loop {
            let (n, _) = socket.recv_from(&mut buf).await.unwrap();
            if n > 0 && buf[0] == Usage::CookieReply.to_byte() {
                return true;
            }
        }
    })
    .await
    .unwrap_or(false);

    assert!(got_cookie);
    assert!(device.stats().cookie_replies() > 0);
    device.close().await;
}

#[tokio::test]
async fn test_bad_mac1_is_rejected() {
    let nh = NextHopTable::new();
    let (device, _tap) = make_device(test_settings(1), &nh);
    let port = device.up().await.unwrap();
    let sender = StaticIdentity::generate();

    let mut bytes = forged_initiations(&device, &sender, 1).remove(0);
    let last = bytes.len() - 20;
    bytes[last] ^= 0xff;

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket
        .send_to(&bytes, format!("127.0.0.1:{}", port))
        .await
        .unwrap();
    assert!(wait_until(|| device.stats().drops(DropReason::AuthFailed) == 1).await);
    device.close().await;
}

/// UDP relay between `a` (which dials the relay) and `b`, reporting every
/// datagram in each direction.
struct Relay {
    port: u16,
    socket: Arc<UdpSocket>,
    from_a: mpsc::UnboundedReceiver<Vec<u8>>,
    from_b: mpsc::UnboundedReceiver<Vec<u8>>,
}

async fn spawn_relay(a_port: u16, b_port: u16) -> Relay {
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let port = socket.local_addr().unwrap().port();
    let (a_tx, from_a) = mpsc::unbounded_channel();
    let (b_tx, from_b) = mpsc::unbounded_channel();
    let relay = socket.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65536];
        loop {
            let Ok((n, from)) = relay.recv_from(&mut buf).await else {
                break;
            };
            let data = buf[..n].to_vec();
            let to = if from.port() == a_port {
                let _ = a_tx.send(data.clone());
                b_port
            } else {
                let _ = b_tx.send(data.clone());
                a_port
            };
            let _ = relay.send_to(&data, ("127.0.0.1", to)).await;
        }
    });
    Relay {
        port,
        socket,
        from_a,
        from_b,
    }
}

/// Wait for the next normal packet in `seen`.
async fn next_normal_packet(seen: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<u8> {
    loop {
        let d = tokio::time::timeout(WAIT, seen.recv())
            .await
            .unwrap()
            .unwrap();
        if d[0] == Usage::NormalPacket.to_byte() {
            return d;
        }
    }
}

#[tokio::test]
async fn test_replayed_transport_datagram_is_rejected() {
    let nh = nh_table(&[(1, 2, 2), (2, 1, 1)]);
    let n1 = start_node(1, &nh).await;
    let mut n2 = start_node(2, &nh).await;
    let mut relay = spawn_relay(n1.port, n2.port).await;

    let mut config = PeerConfig::new(NodeId(2), n2.device.public_key());
    config.conn_url = Some(format!("127.0.0.1:{}", relay.port));
    n1.device.add_peer(config).await.unwrap();
    n2.device
        .add_peer(PeerConfig::new(NodeId(1), n1.device.public_key()))
        .await
        .unwrap();

    let f = frame(BROADCAST_MAC, mac(1), b"once only");
    n1.tap.inject.send(f.clone()).await.unwrap();
    assert_eq!(recv_frame(&mut n2.tap).await, f);

    // Find the datagram that carried the frame
    let data = next_normal_packet(&mut relay.from_a).await;

    let peer = n2.device.peer_by_id(NodeId(1)).unwrap();
    let rx_before = peer.stats().rx_bytes();
    relay
        .socket
        .send_to(&data, ("127.0.0.1", n2.port))
        .await
        .unwrap();

    assert!(wait_until(|| n2.device.stats().drops(DropReason::ReplayRejected) == 1).await);
    assert_eq!(peer.stats().rx_bytes(), rx_before);
    assert!(n2.tap.written.try_recv().is_err());

    shutdown(vec![n1, n2]).await;
}

#[tokio::test]
async fn test_peer_roams_to_new_source_address() {
    let nh = nh_table(&[(1, 2, 2), (2, 1, 1)]);
    let mut n1 = start_node(1, &nh).await;
    let mut n2 = start_node(2, &nh).await;
    connect(&n1, &n2).await;

    let f = frame(BROADCAST_MAC, mac(1), b"direct");
    n1.tap.inject.send(f.clone()).await.unwrap();
    assert_eq!(recv_frame(&mut n2.tap).await, f);
    let back = n2.device.peer_by_id(NodeId(1)).unwrap();
    assert_eq!(back.endpoint().map(|e| e.dst().port()), Some(n1.port));

    // Node 1 now reaches node 2 from the relay's address
    let mut relay = spawn_relay(n1.port, n2.port).await;
    let via: SocketAddr = format!("127.0.0.1:{}", relay.port).parse().unwrap();
    n1.device
        .peer_by_id(NodeId(2))
        .unwrap()
        .set_endpoint(Endpoint::new(via));
    let f = frame(BROADCAST_MAC, mac(1), b"moved");
    n1.tap.inject.send(f.clone()).await.unwrap();
    assert_eq!(recv_frame(&mut n2.tap).await, f);
    assert!(wait_until(|| back.endpoint().map(|e| e.dst().port()) == Some(relay.port)).await);

    // Traffic back to node 1 goes to the new address
    let reply = frame(mac(1), mac(2), b"reply");
    n2.tap.inject.send(reply.clone()).await.unwrap();
    assert_eq!(recv_frame(&mut n1.tap).await, reply);
    next_normal_packet(&mut relay.from_b).await;

    shutdown(vec![n1, n2]).await;
}

/// Initiations carrying a valid mac2 for `src`, as a sender holding a
/// fresh cookie would build them.
fn cookie_initiations(
    device: &Device,
    sender: &StaticIdentity,
    src: SocketAddr,
    count: usize,
) -> Vec<Vec<u8>> {
    let device_key = device.public_key();
    let mut generator = CookieGenerator::new(&device_key);
    let mut first = forged_initiations(device, sender, 1).remove(0);
    generator.add_macs(&mut first);
    let reply = lock(&device.cookie_checker)
        .create_reply(&first, 999, &src)
        .unwrap();
    generator.consume_reply(&reply).unwrap();

    (0..count)
        .map(|i| {
            let mut hs = Handshake::new(sender, device_key, PresharedKey::default());
            let msg = hs.create_initiation(sender, 2000 + i as u32).unwrap();
            let mut bytes = msg.to_bytes().to_vec();
            generator.add_macs(&mut bytes);
            bytes
        })
        .collect()
}

#[tokio::test]
async fn test_rate_limiter_caps_each_source_under_load() {
    let nh = NextHopTable::new();
    let (device, _tap) = make_device(test_settings(1), &nh);
    let sender = StaticIdentity::generate();
    device
        .add_peer(PeerConfig::new(NodeId(2), *sender.public_key()))
        .await
        .unwrap();
    device.mark_under_load(Instant::now());

    let first: SocketAddr = "127.0.0.1:4000".parse().unwrap();
    for bytes in cookie_initiations(&device, &sender, first, 20) {
        device
            .handle_handshake(ReceivedPacket::new(Endpoint::new(first), bytes))
            .await;
    }
    let limited = device.stats().drops(DropReason::ResourceExhausted);
    assert!(limited >= 20 - u64::from(DEFAULT_PACKETS_BURSTABLE) - 2);
    assert!(limited < 20);
    // Valid mac2 means no cookie challenge
    assert_eq!(device.stats().cookie_replies(), 0);

    // Another source has its own budget
    let second: SocketAddr = "127.0.0.2:4000".parse().unwrap();
    for bytes in cookie_initiations(&device, &sender, second, 2) {
        device
            .handle_handshake(ReceivedPacket::new(Endpoint::new(second), bytes))
            .await;
    }
    assert_eq!(device.stats().drops(DropReason::ResourceExhausted), limited);
}

#[tokio::test]
async fn test_known_peer_connects_after_flood() {
    let nh = nh_table(&[(1, 2, 2), (2, 1, 1)]);
    let mut settings = test_settings(1);
    settings.queues.handshake = 8;
    let (device, tap) = make_device(settings, &nh);
    let port = device.up().await.unwrap();
    let mut n1 = TestNode { device, tap, port };
    let n2 = start_node(2, &nh).await;
    connect(&n2, &n1).await;

    let attacker = StaticIdentity::generate();
    n1.device
        .add_peer(PeerConfig::new(NodeId(3), *attacker.public_key()))
        .await
        .unwrap();
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    for bytes in forged_initiations(&n1.device, &attacker, 64) {
        socket.send_to(&bytes, n1.addr()).await.unwrap();
    }

    // Node 2 may be challenged first but still gets through
    let f = frame(BROADCAST_MAC, mac(2), b"through the flood");
    n2.tap.inject.send(f.clone()).await.unwrap();
    assert_eq!(recv_frame(&mut n1.tap).await, f);
    assert!(n1.device.stats().cookie_replies() > 0);

    shutdown(vec![n1, n2]).await;
}
