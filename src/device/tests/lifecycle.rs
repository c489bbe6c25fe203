//! Up, down, close and peer management.

use super::*;
use crate::identity::PrivateKey;
use crate::peer::PeerError;
use crate::tap::MacAddr;

#[tokio::test]
async fn test_up_down_up() {
    let nh = NextHopTable::new();
    let (device, _tap) = make_device(test_settings(1), &nh);
    assert_eq!(device.state(), DeviceState::Down);

    let port = device.up().await.unwrap();
    assert_ne!(port, 0);
    assert_eq!(device.local_port(), Some(port));
    assert!(matches!(device.up().await, Err(DeviceError::AlreadyStarted)));

    device.down().await;
    assert_eq!(device.state(), DeviceState::Down);
    // Down twice is harmless
    device.down().await;

    device.up().await.unwrap();
    assert!(device.state().is_up());
    device.close().await;
}

#[tokio::test]
async fn test_closed_device_refuses_everything() {
    let nh = NextHopTable::new();
    let (device, _tap) = make_device(test_settings(1), &nh);
    device.up().await.unwrap();
    device.close().await;

    assert_eq!(device.state(), DeviceState::Closed);
    assert!(matches!(device.up().await, Err(DeviceError::Closed)));
    let key = *StaticIdentity::generate().public_key();
    assert!(matches!(
        device.add_peer(PeerConfig::new(NodeId(2), key)).await,
        Err(DeviceError::Closed)
    ));
}

#[tokio::test]
async fn test_peer_table_rules() {
    let nh = NextHopTable::new();
    let (device, _tap) = make_device(test_settings(1), &nh);
    let key = *StaticIdentity::generate().public_key();
    device.add_peer(PeerConfig::new(NodeId(2), key)).await.unwrap();

    assert!(matches!(
        device.add_peer(PeerConfig::new(NodeId(3), key)).await,
        Err(DeviceError::Peer(PeerError::AlreadyExists(_)))
    ));
    let other = *StaticIdentity::generate().public_key();
    assert!(matches!(
        device.add_peer(PeerConfig::new(NodeId(2), other)).await,
        Err(DeviceError::Peer(PeerError::IdInUse(_)))
    ));
    assert!(matches!(
        device.add_peer(PeerConfig::new(NodeId::BROADCAST, other)).await,
        Err(DeviceError::Peer(PeerError::ReservedId(_)))
    ));

    device.remove_peer(&key).await.unwrap();
    assert!(device.peer_by_id(NodeId(2)).is_none());
    assert!(matches!(
        device.remove_peer(&key).await,
        Err(DeviceError::PeerNotFound(_))
    ));
}

#[tokio::test]
async fn test_unresolvable_endpoint_goes_to_try_list() {
    let nh = NextHopTable::new();
    let (device, _tap) = make_device(test_settings(1), &nh);
    let mut config = PeerConfig::new(NodeId(2), *StaticIdentity::generate().public_key());
    config.conn_url = Some("not an endpoint".into());

    let peer = device.add_peer(config).await.unwrap();
    assert!(peer.endpoint().is_none());
    let next = peer.try_list().next_try(Instant::now());
    assert_eq!(next.map(|(_, url)| url), Some("not an endpoint".to_string()));
}

#[tokio::test]
async fn test_peers_added_while_up_are_started() {
    let nh = NextHopTable::new();
    let (device, _tap) = make_device(test_settings(1), &nh);
    let before = device
        .add_peer(PeerConfig::new(NodeId(2), *StaticIdentity::generate().public_key()))
        .await
        .unwrap();
    assert!(!before.is_running());

    device.up().await.unwrap();
    assert!(before.is_running());
    let after = device
        .add_peer(PeerConfig::new(NodeId(3), *StaticIdentity::generate().public_key()))
        .await
        .unwrap();
    assert!(after.is_running());

    device.down().await;
    assert!(!before.is_running());
    assert!(!after.is_running());
    device.close().await;
}

#[tokio::test]
async fn test_set_private_key() {
    let nh = nh_table(&[(1, 2, 2), (2, 1, 1)]);
    let mut n1 = start_node(1, &nh).await;
    let n2 = start_node(2, &nh).await;
    connect(&n1, &n2).await;

    let f = frame(BROADCAST_MAC, mac(2), b"before");
    n2.tap.inject.send(f.clone()).await.unwrap();
    assert_eq!(recv_frame(&mut n1.tap).await, f);

    let old = n1.device.public_key();
    let key = PrivateKey::generate();
    n1.device.set_private_key(key).await;
    assert_ne!(n1.device.public_key(), old);
    let peer = n1.device.peer_by_id(NodeId(2)).unwrap();
    assert!(peer.keypairs().current().is_none());

    shutdown(vec![n1, n2]).await;
}

#[tokio::test]
async fn test_own_key_is_removed_as_peer() {
    let nh = NextHopTable::new();
    let (device, _tap) = make_device(test_settings(1), &nh);
    let key = PrivateKey::generate();
    let public = *StaticIdentity::new(key.clone()).public_key();
    device.add_peer(PeerConfig::new(NodeId(2), public)).await.unwrap();

    device.set_private_key(key).await;
    assert!(device.peer_by_key(&public).is_none());
}

#[tokio::test]
async fn test_new_peers_are_saved() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("edge.yaml");
    std::fs::write(&path, "peers: []\n").unwrap();

    let nh = NextHopTable::new();
    let mut settings = test_settings(1);
    settings.save_new_peers = true;
    settings.config_path = Some(path.clone());
    let (device, _tap) = make_device(settings, &nh);

    let mut config = PeerConfig::new(NodeId(2), *StaticIdentity::generate().public_key());
    config.static_conn = true;
    config.conn_url = Some("127.0.0.1:3456".into());
    device.add_peer(config).await.unwrap();
    device.persist_peers();

    let saved = std::fs::read_to_string(&path).unwrap();
    assert!(saved.contains("127.0.0.1:3456"));
}

#[tokio::test]
async fn test_expire_caches_reports_what_is_left() {
    let nh = NextHopTable::new();
    let (device, _tap) = make_device(test_settings(1), &nh);
    let now = Instant::now();
    device.l2fib().learn(MacAddr(mac(2)), NodeId(2), now);
    lock(&device.dup).check_and_insert(b"flood", now);

    let (fib, dup) = device.expire_caches(now);
    assert_eq!(fib.entries, 1);
    assert_eq!(dup.entries, 1);
    assert!(dup.fill_ratio() > 0.0);

    let later = now + Duration::from_secs(24 * 3600);
    let (fib, dup) = device.expire_caches(later);
    assert_eq!(fib.entries, 0);
    assert_eq!(dup.entries, 0);
    assert_eq!(dup.expired, 0);
}
