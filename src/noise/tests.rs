use super::*;
use crate::identity::{PresharedKey, StaticIdentity};

struct Pair {
    alice: StaticIdentity,
    bob: StaticIdentity,
    alice_hs: Handshake,
    bob_hs: Handshake,
}

fn pair(psk: PresharedKey) -> Pair {
    let alice = StaticIdentity::generate();
    let bob = StaticIdentity::generate();
    let alice_hs = Handshake::new(&alice, *bob.public_key(), psk.clone());
    let bob_hs = Handshake::new(&bob, *alice.public_key(), psk);
    Pair {
        alice,
        bob,
        alice_hs,
        bob_hs,
    }
}

fn complete(p: &mut Pair) -> (Keypair, Keypair) {
    let init = p.alice_hs.create_initiation(&p.alice, 11).unwrap();
    let scan = InitiationScan::scan(&init, &p.bob).unwrap();
    assert_eq!(&scan.remote_static, p.alice.public_key());
    p.bob_hs.consume_initiation(scan, &init).unwrap();

    let resp = p.bob_hs.create_response(22).unwrap();
    assert_eq!(resp.receiver, 11);
    p.alice_hs.consume_response(&resp, &p.alice).unwrap();

    let a = p.alice_hs.derive_keypair().unwrap();
    let b = p.bob_hs.derive_keypair().unwrap();
    (a, b)
}

#[test]
fn test_full_handshake_derives_matching_keys() {
    let mut p = pair(PresharedKey::default());
    let (a, b) = complete(&mut p);

    assert!(a.is_initiator());
    assert!(!b.is_initiator());
    assert_eq!(a.local_index(), 11);
    assert_eq!(a.remote_index(), 22);
    assert_eq!(b.local_index(), 22);
    assert_eq!(b.remote_index(), 11);

    let ct = a.seal(0, b"aad", b"hello").unwrap();
    assert_eq!(b.open(0, b"aad", &ct).unwrap(), b"hello");
    let ct = b.seal(0, b"aad", b"world").unwrap();
    assert_eq!(a.open(0, b"aad", &ct).unwrap(), b"world");

    assert_eq!(p.alice_hs.progress(), HandshakeProgress::Zeroed);
    assert_eq!(p.bob_hs.progress(), HandshakeProgress::Zeroed);
}

#[test]
fn test_handshake_with_preshared_key() {
    let mut p = pair(PresharedKey::from_bytes([9u8; 32]));
    let (a, b) = complete(&mut p);
    let ct = a.seal(3, &[], b"psk").unwrap();
    assert_eq!(b.open(3, &[], &ct).unwrap(), b"psk");
}

#[test]
fn test_mismatched_psk_fails_response() {
    let alice = StaticIdentity::generate();
    let bob = StaticIdentity::generate();
    let mut alice_hs = Handshake::new(&alice, *bob.public_key(), PresharedKey::from_bytes([1u8; 32]));
    let mut bob_hs = Handshake::new(&bob, *alice.public_key(), PresharedKey::from_bytes([2u8; 32]));

    let init = alice_hs.create_initiation(&alice, 1).unwrap();
    let scan = InitiationScan::scan(&init, &bob).unwrap();
    bob_hs.consume_initiation(scan, &init).unwrap();
    let resp = bob_hs.create_response(2).unwrap();
    assert!(matches!(
        alice_hs.consume_response(&resp, &alice),
        Err(NoiseError::DecryptionFailed)
    ));
}

#[test]
fn test_initiation_to_wrong_responder_fails() {
    let mut p = pair(PresharedKey::default());
    let eve = StaticIdentity::generate();
    let init = p.alice_hs.create_initiation(&p.alice, 1).unwrap();
    assert!(InitiationScan::scan(&init, &eve).is_err());
}

#[test]
fn test_replayed_initiation_rejected() {
    let mut p = pair(PresharedKey::default());
    let init = p.alice_hs.create_initiation(&p.alice, 1).unwrap();

    let scan = InitiationScan::scan(&init, &p.bob).unwrap();
    p.bob_hs.consume_initiation(scan, &init).unwrap();

    let scan = InitiationScan::scan(&init, &p.bob).unwrap();
    assert!(matches!(
        p.bob_hs.consume_initiation(scan, &init),
        Err(NoiseError::StaleTimestamp)
    ));
}

#[test]
fn test_response_requires_consumed_initiation() {
    let mut p = pair(PresharedKey::default());
    assert!(matches!(
        p.bob_hs.create_response(5),
        Err(NoiseError::WrongState { .. })
    ));
    assert!(p.alice_hs.derive_keypair().is_err());
}

#[test]
fn test_tampered_initiation_fails() {
    let mut p = pair(PresharedKey::default());
    let mut init = p.alice_hs.create_initiation(&p.alice, 1).unwrap();
    init.encrypted_timestamp[0] ^= 0x80;
    let scan = InitiationScan::scan(&init, &p.bob).unwrap();
    assert!(p.bob_hs.consume_initiation(scan, &init).is_err());
}

#[test]
fn test_cipher_state_internal_nonce_advances() {
    let mut enc = CipherState::new([5u8; 32]);
    let mut dec = CipherState::new([5u8; 32]);
    let first = enc.encrypt_with_aad(b"one", &[]).unwrap();
    let second = enc.encrypt_with_aad(b"one", &[]).unwrap();
    assert_ne!(first, second);
    assert_eq!(dec.decrypt_with_aad(&first, &[]).unwrap(), b"one");
    assert_eq!(dec.decrypt_with_aad(&second, &[]).unwrap(), b"one");
}

#[test]
fn test_cipher_state_debug_redacts_key() {
    let cs = CipherState::new([5u8; 32]);
    assert!(format!("{:?}", cs).contains("[redacted]"));
}

#[test]
fn test_empty_cipher_refuses() {
    let cs = CipherState::empty();
    assert!(!cs.has_key());
    assert!(cs.encrypt_with_counter_and_aad(b"x", 0, &[]).is_err());
}
