//! Static Identity and Key Material
//!
//! Each device owns one long-term X25519 keypair. Peers are identified by
//! their 32-byte public key; an optional 32-byte preshared key is mixed into
//! the handshake. All keys travel through configuration as standard base64.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use thiserror::Error;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size in bytes of every key type in this module.
pub const KEY_SIZE: usize = 32;

/// Errors that can occur in identity operations.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid base64 key: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    #[error("invalid key length: expected 32, got {0}")]
    InvalidKeyLength(usize),

    #[error("public key is all zero")]
    ZeroPublicKey,
}

fn decode_key(s: &str) -> Result<[u8; KEY_SIZE], IdentityError> {
    let bytes = BASE64.decode(s.trim())?;
    if bytes.len() != KEY_SIZE {
        return Err(IdentityError::InvalidKeyLength(bytes.len()));
    }
    let mut out = [0u8; KEY_SIZE];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// A peer's long-term X25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PublicKey([u8; KEY_SIZE]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse a base64 encoded public key.
    pub fn from_base64(s: &str) -> Result<Self, IdentityError> {
        let bytes = decode_key(s)?;
        if bytes == [0u8; KEY_SIZE] {
            return Err(IdentityError::ZeroPublicKey);
        }
        Ok(Self(bytes))
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(&self.0[..6]))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

/// Optional symmetric key shared out of band between two peers.
///
/// The all-zero key means "no preshared key" and is what the handshake
/// mixes in when none is configured.
#[derive(Clone, PartialEq, Eq, Default, Zeroize, ZeroizeOnDrop)]
pub struct PresharedKey([u8; KEY_SIZE]);

impl PresharedKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse a base64 key; an empty string yields the zero key.
    pub fn from_base64(s: &str) -> Result<Self, IdentityError> {
        if s.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(Self(decode_key(s)?))
    }

    /// Base64 form, or an empty string for the zero key.
    pub fn to_base64(&self) -> String {
        if self.is_zero() {
            return String::new();
        }
        BASE64.encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; KEY_SIZE]
    }
}

impl fmt::Debug for PresharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            write!(f, "PresharedKey(none)")
        } else {
            write!(f, "PresharedKey([redacted])")
        }
    }
}

/// A long-term X25519 private key.
#[derive(Clone)]
pub struct PrivateKey(StaticSecret);

impl PrivateKey {
    /// Generate a new random key.
    pub fn generate() -> Self {
        Self(StaticSecret::random_from_rng(OsRng))
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    pub fn from_base64(s: &str) -> Result<Self, IdentityError> {
        let mut bytes = decode_key(s)?;
        let key = Self::from_bytes(bytes);
        bytes.zeroize();
        Ok(key)
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0.to_bytes())
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(X25519Public::from(&self.0).to_bytes())
    }

    /// X25519 Diffie-Hellman.
    ///
    /// Returns `None` for a low-order peer key, which yields an all-zero
    /// shared secret.
    pub fn diffie_hellman(&self, their: &PublicKey) -> Option<[u8; KEY_SIZE]> {
        let shared = self.0.diffie_hellman(&X25519Public::from(their.0));
        if !shared.was_contributory() {
            return None;
        }
        Some(shared.to_bytes())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey([redacted])")
    }
}

/// The device's static identity: private key plus its derived public key.
#[derive(Clone, Debug)]
pub struct StaticIdentity {
    private_key: PrivateKey,
    public_key: PublicKey,
}

impl StaticIdentity {
    pub fn new(private_key: PrivateKey) -> Self {
        let public_key = private_key.public_key();
        Self {
            private_key,
            public_key,
        }
    }

    /// Create a random identity.
    pub fn generate() -> Self {
        Self::new(PrivateKey::generate())
    }

    pub fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }
}

/// Fill a buffer with bytes from the OS random source.
pub(crate) fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_key_base64_roundtrip() {
        let id = StaticIdentity::generate();
        let encoded = id.public_key().to_base64();
        assert_eq!(encoded.len(), 44);
        let decoded = PublicKey::from_base64(&encoded).unwrap();
        assert_eq!(&decoded, id.public_key());
    }

    #[test]
    fn test_private_key_base64_keeps_public() {
        let key = PrivateKey::generate();
        let restored = PrivateKey::from_base64(&key.to_base64()).unwrap();
        assert_eq!(key.public_key(), restored.public_key());
    }

    #[test]
    fn test_invalid_key_length() {
        let err = PublicKey::from_base64("AAAA").unwrap_err();
        assert!(matches!(err, IdentityError::InvalidKeyLength(3)));
    }

    #[test]
    fn test_zero_public_key_rejected() {
        let zero = BASE64.encode([0u8; 32]);
        assert!(matches!(
            PublicKey::from_base64(&zero),
            Err(IdentityError::ZeroPublicKey)
        ));
    }

    #[test]
    fn test_empty_psk_is_zero() {
        let psk = PresharedKey::from_base64("").unwrap();
        assert!(psk.is_zero());
        assert_eq!(psk.to_base64(), "");
    }

    #[test]
    fn test_dh_agrees() {
        let a = PrivateKey::generate();
        let b = PrivateKey::generate();
        let ab = a.diffie_hellman(&b.public_key()).unwrap();
        let ba = b.diffie_hellman(&a.public_key()).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_dh_low_order_point_rejected() {
        let a = PrivateKey::generate();
        assert!(a.diffie_hellman(&PublicKey::from_bytes([0u8; 32])).is_none());
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let key = PrivateKey::generate();
        assert_eq!(format!("{:?}", key), "PrivateKey([redacted])");
    }
}
