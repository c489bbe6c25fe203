//! Overlay forwarding across real sessions.

use super::*;
use crate::protocol::{OverlayHeader, Usage};
use crate::routing::PongSample;
use crate::tap::{MacAddr, ETHERNET_ADDRS_LEN};

/// Chain 1 - 2 - 3: node 2 is the only path between 1 and 3.
fn chain_table() -> NextHopTable {
    nh_table(&[
        (1, 2, 2),
        (1, 3, 2),
        (2, 1, 1),
        (2, 3, 3),
        (3, 1, 2),
        (3, 2, 2),
    ])
}

#[tokio::test]
async fn test_broadcast_and_unicast_transit_through_chain() {
    let nh = chain_table();
    let mut n1 = start_node(1, &nh).await;
    let mut n2 = start_node(2, &nh).await;
    let mut n3 = start_node(3, &nh).await;
    connect(&n1, &n2).await;
    connect(&n2, &n3).await;

    // Broadcast from 1 reaches 2 and, through 2, reaches 3
    let hello = frame(BROADCAST_MAC, mac(1), b"hello");
    n1.tap.inject.send(hello.clone()).await.unwrap();
    assert_eq!(recv_frame(&mut n2.tap).await, hello);
    assert_eq!(recv_frame(&mut n3.tap).await, hello);
    assert!(wait_until(|| n2.device.stats().transit() >= 1).await);

    // 3 learned mac(1) behind node 1 and answers with a unicast
    assert_eq!(
        n3.device.l2fib().lookup(&MacAddr(mac(1)), Instant::now()),
        Some(NodeId(1))
    );
    let reply = frame(mac(1), mac(3), b"reply");
    n3.tap.inject.send(reply.clone()).await.unwrap();
    assert_eq!(recv_frame(&mut n1.tap).await, reply);
    assert!(wait_until(|| n2.device.stats().transit() >= 2).await);

    // The unicast was not delivered on the transit node
    assert!(n2.tap.written.try_recv().is_err());

    shutdown(vec![n1, n2, n3]).await;
}

#[tokio::test]
async fn test_ttl_decrements_once_per_hop() {
    let nh = chain_table();
    let n1 = start_node(1, &nh).await;
    let n2 = start_node(2, &nh).await;
    let mut n3 = start_node(3, &nh).await;
    connect(&n1, &n2).await;
    connect(&n2, &n3).await;

    // TTL 0 reaches node 2 and stops there
    let expired = frame(mac(3), mac(1), b"ttl zero");
    let packet = OverlayHeader::wrap(NodeId(1), NodeId(3), 0, &expired).unwrap();
    assert_eq!(n1.device.send_packet(Usage::NormalPacket, packet).await, 1);

    // TTL 1 is spent on the hop through node 2 and still arrives
    let last = frame(mac(3), mac(1), b"ttl one");
    let packet = OverlayHeader::wrap(NodeId(1), NodeId(3), 1, &last).unwrap();
    assert_eq!(n1.device.send_packet(Usage::NormalPacket, packet).await, 1);

    assert_eq!(recv_frame(&mut n3.tap).await, last);
    assert_eq!(n2.device.stats().transit(), 1);
    assert!(n3.tap.written.try_recv().is_err());

    shutdown(vec![n1, n2, n3]).await;
}

#[tokio::test]
async fn test_frames_arrive_in_order() {
    let nh = nh_table(&[(1, 2, 2), (2, 1, 1)]);
    let n1 = start_node(1, &nh).await;
    let mut n2 = start_node(2, &nh).await;
    connect(&n1, &n2).await;

    let frames: Vec<_> = (0..48u8)
        .map(|i| frame(BROADCAST_MAC, mac(1), &[i; 32]))
        .collect();
    for f in &frames {
        n1.tap.inject.send(f.clone()).await.unwrap();
    }
    for f in &frames {
        assert_eq!(&recv_frame(&mut n2.tap).await, f);
    }

    shutdown(vec![n1, n2]).await;
}

#[tokio::test]
async fn test_broadcast_delivered_once_in_triangle() {
    // Full mesh: everyone is a direct neighbor
    let nh = nh_table(&[
        (1, 2, 2),
        (1, 3, 3),
        (2, 1, 1),
        (2, 3, 3),
        (3, 1, 1),
        (3, 2, 2),
    ]);
    let mut n1 = start_node(1, &nh).await;
    let mut n2 = start_node(2, &nh).await;
    let mut n3 = start_node(3, &nh).await;
    connect(&n1, &n2).await;
    connect(&n1, &n3).await;
    connect(&n2, &n3).await;

    let f = frame(BROADCAST_MAC, mac(1), b"once");
    n1.tap.inject.send(f.clone()).await.unwrap();
    assert_eq!(recv_frame(&mut n2.tap).await, f);
    assert_eq!(recv_frame(&mut n3.tap).await, f);

    // Neither neighbor re-floods to the other
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(n2.tap.written.try_recv().is_err());
    assert!(n3.tap.written.try_recv().is_err());
    assert_eq!(n2.device.stats().transit(), 0);
    assert_eq!(n3.device.stats().transit(), 0);
    // The originator never hears its own frame
    assert!(n1.tap.written.try_recv().is_err());

    shutdown(vec![n1, n2, n3]).await;
}

#[tokio::test]
async fn test_unknown_destination_without_route_is_dropped() {
    let nh = nh_table(&[(1, 2, 2)]);
    let (device, _tap) = make_device(test_settings(1), &nh);

    let packet = OverlayHeader::wrap(NodeId(1), NodeId(9), 10, b"frame").unwrap();
    assert_eq!(device.send_packet(Usage::NormalPacket, packet).await, 0);
    assert_eq!(device.stats().drops(DropReason::NoRoute), 1);
}

#[tokio::test]
async fn test_short_tap_frame_is_malformed() {
    let nh = NextHopTable::new();
    let (device, _tap) = make_device(test_settings(1), &nh);

    device.handle_tap_frame(&[0u8; ETHERNET_ADDRS_LEN]).await;
    assert_eq!(device.stats().drops(DropReason::MalformedPacket), 1);
}

#[test]
fn test_latency_samples_move_route_in_diamond() {
    //   2
    //  / \
    // 1   4
    //  \ /
    //   3
    let mut settings = test_settings(1);
    settings.use_p2p = true;
    let (tap, _handle) = Tap::channel("tap1", 1500, 4);
    let device = Device::new(
        settings,
        StaticIdentity::generate(),
        tap,
        Graph::new(GraphSettings::default()),
    );

    let sample = |src: u16, dst: u16, secs: f64| PongSample {
        src: NodeId(src),
        dst: NodeId(dst),
        timediff: secs,
        time_to_alive: 60.0,
        additional_cost: 0.0,
    };
    let mut samples = Vec::new();
    for (a, b, w) in [(1, 2, 0.01), (2, 4, 0.01), (1, 3, 0.05), (3, 4, 0.05)] {
        samples.push(sample(a, b, w));
        samples.push(sample(b, a, w));
    }
    device.graph().update_latency(&samples, true, false);
    assert_eq!(device.nh_table().next(NodeId(1), NodeId(4)), Some(NodeId(2)));

    // The upper path degrades; traffic moves to node 3
    let worse = [sample(1, 2, 0.5), sample(2, 1, 0.5)];
    device.graph().update_latency(&worse, true, false);
    assert_eq!(device.nh_table().next(NodeId(1), NodeId(4)), Some(NodeId(3)));
}
