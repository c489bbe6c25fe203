//! mac1/mac2 and the cookie challenge used while under load.

use super::{
    MessageCookieReply, NoiseError, COOKIE_REFRESH_TIME, LABEL_COOKIE, LABEL_MAC1, MAC_SIZE,
    TAG_SIZE,
};
use super::messages::COOKIE_NONCE_SIZE;
use crate::identity::{random_bytes, PublicKey};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;
use zeroize::Zeroize;

type HmacSha256 = Hmac<Sha256>;

fn labelled_key(label: &[u8], key: &PublicKey) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(label);
    hasher.update(key.as_bytes());
    hasher.finalize().into()
}

fn mac(key: &[u8], data: &[u8]) -> [u8; MAC_SIZE] {
    let mut out = [0u8; MAC_SIZE];
    // HMAC accepts keys of any length
    if let Ok(mut m) = <HmacSha256 as Mac>::new_from_slice(key) {
        m.update(data);
        out.copy_from_slice(&m.finalize().into_bytes()[..MAC_SIZE]);
    }
    out
}

fn verify_mac(key: &[u8], data: &[u8], tag: &[u8]) -> bool {
    match <HmacSha256 as Mac>::new_from_slice(key) {
        Ok(mut m) => {
            m.update(data);
            m.verify_truncated_left(tag).is_ok()
        }
        Err(_) => false,
    }
}

fn source_bytes(src: &SocketAddr) -> Vec<u8> {
    let mut out = match src.ip() {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    };
    out.extend_from_slice(&src.port().to_be_bytes());
    out
}

/// mac1 covers everything before the two trailing MACs.
fn mac1_range(msg: &[u8]) -> Option<(usize, usize)> {
    let len = msg.len();
    if len < 2 * MAC_SIZE + 1 {
        return None;
    }
    Some((len - 2 * MAC_SIZE, len - MAC_SIZE))
}

/// Responder-side MAC verification and cookie issuing.
pub struct CookieChecker {
    mac1_key: [u8; 32],
    cookie_key: [u8; 32],
    secret: [u8; 32],
    secret_set: Instant,
}

impl CookieChecker {
    pub fn new(local: &PublicKey) -> Self {
        Self {
            mac1_key: labelled_key(LABEL_MAC1, local),
            cookie_key: labelled_key(LABEL_COOKIE, local),
            secret: random_bytes(),
            secret_set: Instant::now(),
        }
    }

    /// Verify mac1 of a handshake message addressed to us.
    pub fn check_mac1(&self, msg: &[u8]) -> bool {
        let Some((mac1_at, mac2_at)) = mac1_range(msg) else {
            return false;
        };
        verify_mac(&self.mac1_key, &msg[..mac1_at], &msg[mac1_at..mac2_at])
    }

    /// Verify mac2 against the cookie we would issue to `src`.
    pub fn check_mac2(&mut self, msg: &[u8], src: &SocketAddr) -> bool {
        let Some((_, mac2_at)) = mac1_range(msg) else {
            return false;
        };
        let cookie = self.cookie_for(src);
        verify_mac(&cookie, &msg[..mac2_at], &msg[mac2_at..])
    }

    /// Build a cookie reply to `msg` (an initiation or response from `src`).
    pub fn create_reply(
        &mut self,
        msg: &[u8],
        receiver: u32,
        src: &SocketAddr,
    ) -> Result<MessageCookieReply, NoiseError> {
        let (mac1_at, mac2_at) = mac1_range(msg).ok_or(NoiseError::MessageTooShort {
            expected: 2 * MAC_SIZE + 1,
            got: msg.len(),
        })?;
        let cookie = self.cookie_for(src);
        let nonce: [u8; COOKIE_NONCE_SIZE] = random_bytes();

        let cipher = <XChaCha20Poly1305 as KeyInit>::new_from_slice(&self.cookie_key)
            .map_err(|_| NoiseError::EncryptionFailed)?;
        let sealed = cipher
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: &cookie,
                    aad: &msg[mac1_at..mac2_at],
                },
            )
            .map_err(|_| NoiseError::EncryptionFailed)?;

        let mut encrypted_cookie = [0u8; MAC_SIZE + TAG_SIZE];
        encrypted_cookie.copy_from_slice(&sealed);
        Ok(MessageCookieReply {
            receiver,
            nonce,
            encrypted_cookie,
        })
    }

    fn cookie_for(&mut self, src: &SocketAddr) -> [u8; MAC_SIZE] {
        if self.secret_set.elapsed() >= COOKIE_REFRESH_TIME {
            self.secret = random_bytes();
            self.secret_set = Instant::now();
        }
        mac(&self.secret, &source_bytes(src))
    }
}

impl Drop for CookieChecker {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

/// Initiator-side MAC generation for one remote peer.
pub struct CookieGenerator {
    mac1_key: [u8; 32],
    cookie_key: [u8; 32],
    cookie: [u8; MAC_SIZE],
    cookie_set: Option<Instant>,
    last_mac1: Option<[u8; MAC_SIZE]>,
}

impl CookieGenerator {
    pub fn new(remote: &PublicKey) -> Self {
        Self {
            mac1_key: labelled_key(LABEL_MAC1, remote),
            cookie_key: labelled_key(LABEL_COOKIE, remote),
            cookie: [0u8; MAC_SIZE],
            cookie_set: None,
            last_mac1: None,
        }
    }

    /// Fill in mac1 and, if a fresh cookie is held, mac2.
    pub fn add_macs(&mut self, msg: &mut [u8]) {
        let Some((mac1_at, mac2_at)) = mac1_range(msg) else {
            return;
        };
        let mac1 = mac(&self.mac1_key, &msg[..mac1_at]);
        msg[mac1_at..mac2_at].copy_from_slice(&mac1);
        self.last_mac1 = Some(mac1);

        let fresh = self
            .cookie_set
            .is_some_and(|set| set.elapsed() < COOKIE_REFRESH_TIME);
        let mac2 = if fresh {
            mac(&self.cookie, &msg[..mac2_at])
        } else {
            [0u8; MAC_SIZE]
        };
        msg[mac2_at..].copy_from_slice(&mac2);
    }

    /// Store the cookie from a reply to our last message.
    pub fn consume_reply(&mut self, reply: &MessageCookieReply) -> Result<(), NoiseError> {
        let last_mac1 = self.last_mac1.ok_or(NoiseError::DecryptionFailed)?;
        let cipher = <XChaCha20Poly1305 as KeyInit>::new_from_slice(&self.cookie_key)
            .map_err(|_| NoiseError::DecryptionFailed)?;
        let cookie = cipher
            .decrypt(
                XNonce::from_slice(&reply.nonce),
                Payload {
                    msg: &reply.encrypted_cookie,
                    aad: &last_mac1,
                },
            )
            .map_err(|_| NoiseError::DecryptionFailed)?;
        self.cookie.copy_from_slice(&cookie);
        self.cookie_set = Some(Instant::now());
        self.last_mac1 = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::StaticIdentity;

    fn src() -> SocketAddr {
        "192.0.2.7:51820".parse().unwrap()
    }

    #[test]
    fn test_mac1_roundtrip() {
        let responder = StaticIdentity::generate();
        let checker = CookieChecker::new(responder.public_key());
        let mut generator = CookieGenerator::new(responder.public_key());

        let mut msg = vec![0x42u8; 145];
        generator.add_macs(&mut msg);
        assert!(checker.check_mac1(&msg));

        msg[3] ^= 1;
        assert!(!checker.check_mac1(&msg));
    }

    #[test]
    fn test_mac1_wrong_key_rejected() {
        let responder = StaticIdentity::generate();
        let other = StaticIdentity::generate();
        let checker = CookieChecker::new(responder.public_key());
        let mut generator = CookieGenerator::new(other.public_key());

        let mut msg = vec![1u8; 89];
        generator.add_macs(&mut msg);
        assert!(!checker.check_mac1(&msg));
    }

    #[test]
    fn test_cookie_reply_enables_mac2() {
        let responder = StaticIdentity::generate();
        let mut checker = CookieChecker::new(responder.public_key());
        let mut generator = CookieGenerator::new(responder.public_key());

        let mut msg = vec![7u8; 145];
        generator.add_macs(&mut msg);
        assert!(!checker.check_mac2(&msg, &src()));

        let reply = checker.create_reply(&msg, 99, &src()).unwrap();
        assert_eq!(reply.receiver, 99);
        generator.consume_reply(&reply).unwrap();

        let mut retry = vec![7u8; 145];
        generator.add_macs(&mut retry);
        assert!(checker.check_mac1(&retry));
        assert!(checker.check_mac2(&retry, &src()));

        let other_src: SocketAddr = "192.0.2.8:51820".parse().unwrap();
        assert!(!checker.check_mac2(&retry, &other_src));
    }

    #[test]
    fn test_cookie_reply_without_mac1_fails() {
        let responder = StaticIdentity::generate();
        let mut checker = CookieChecker::new(responder.public_key());
        let mut generator = CookieGenerator::new(responder.public_key());
        let reply = checker.create_reply(&[0u8; 145], 1, &src()).unwrap();
        assert!(generator.consume_reply(&reply).is_err());
    }
}
