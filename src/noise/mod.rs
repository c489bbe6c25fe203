//! Noise IKpsk2 Session Protocol
//!
//! Implements the per-peer handshake (initiation, response, cookie reply),
//! the symmetric transport keys derived from it, the replay window and the
//! timing constants that drive rekeying.
//!
//! The IK pattern assumes the initiator knows the responder's static
//! public key before the handshake. The responder learns the initiator's
//! identity from the encrypted static key in the initiation.
//!
//! ## Handshake Pattern
//!
//! Pre-message (key known before handshake):
//! ```text
//!   <- s  (responder's static known to initiator)
//! ```
//!
//! Messages:
//! ```text
//!   -> e, es, s, ss, {timestamp}   (initiation)
//!   <- e, ee, se, psk, {}          (response)
//! ```
//!
//! Both handshake messages carry mac1 (keyed by the receiver's static
//! public key) and mac2 (keyed by a cookie the receiver handed out while
//! under load). A receiver under load answers a missing/invalid mac2 with a
//! cookie reply instead of doing any Diffie-Hellman work.

mod cookie;
mod handshake;
mod keypair;
mod messages;
mod replay;

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use zeroize::Zeroize;

pub use cookie::{CookieChecker, CookieGenerator};
pub use handshake::{Handshake, HandshakeProgress, InitiationScan};
pub use keypair::{Keypair, Keypairs};
pub use messages::{
    MessageCookieReply, MessageInitiation, MessageResponse, COOKIE_REPLY_SIZE, INITIATION_SIZE,
    RESPONSE_SIZE,
};
pub use replay::ReplayWindow;

/// Noise protocol name.
pub(crate) const CONSTRUCTION: &[u8] = b"Noise_IKpsk2_25519_ChaChaPoly_SHA256";

/// Prologue identifier mixed into the initial handshake hash.
pub(crate) const IDENTIFIER: &[u8] = b"meshguard v1 overlay";

pub(crate) const LABEL_MAC1: &[u8] = b"mac1----";
pub(crate) const LABEL_COOKIE: &[u8] = b"cookie--";

/// Maximum message size for noise transport messages.
pub const MAX_MESSAGE_SIZE: usize = 65535;

/// Size of the AEAD tag.
pub const TAG_SIZE: usize = 16;

/// Size of an X25519 public key.
pub const PUBKEY_SIZE: usize = 32;

/// Size of a TAI64N timestamp.
pub const TIMESTAMP_SIZE: usize = 12;

/// Size of mac1 and mac2.
pub const MAC_SIZE: usize = 16;

/// Replay window size in packets (matching WireGuard).
pub const REPLAY_WINDOW_SIZE: usize = 2048;

// ============================================================================
// Timing constants
// ============================================================================

pub const REKEY_AFTER_MESSAGES: u64 = 1 << 60;
pub const REJECT_AFTER_MESSAGES: u64 = u64::MAX - (1 << 13);
pub const REKEY_AFTER_TIME: Duration = Duration::from_secs(120);
pub const REJECT_AFTER_TIME: Duration = Duration::from_secs(180);
pub const REKEY_ATTEMPT_TIME: Duration = Duration::from_secs(90);
pub const REKEY_TIMEOUT: Duration = Duration::from_secs(5);
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);
pub const COOKIE_REFRESH_TIME: Duration = Duration::from_secs(120);
pub const HANDSHAKE_INITIATION_RATE: Duration = Duration::from_millis(50);
pub const MAX_TIMER_HANDSHAKES: u32 =
    (REKEY_ATTEMPT_TIME.as_secs() / REKEY_TIMEOUT.as_secs()) as u32;

/// Errors from Noise protocol operations.
#[derive(Debug, Error)]
pub enum NoiseError {
    #[error("wrong handshake state: expected {expected}, got {got}")]
    WrongState {
        expected: HandshakeProgress,
        got: HandshakeProgress,
    },

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("message too large: {size} > {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("message too short: expected at least {expected}, got {got}")]
    MessageTooShort { expected: usize, got: usize },

    #[error("invalid message type: {0}")]
    InvalidMessageType(u8),

    #[error("nonce overflow")]
    NonceOverflow,

    #[error("handshake timestamp not newer than last accepted")]
    StaleTimestamp,

    #[error("initiation flood from peer")]
    InitiationFlood,
}

/// Role in the handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeRole {
    /// We initiated the connection.
    Initiator,
    /// They initiated the connection.
    Responder,
}

impl fmt::Display for HandshakeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeRole::Initiator => write!(f, "initiator"),
            HandshakeRole::Responder => write!(f, "responder"),
        }
    }
}

/// ChaCha20-Poly1305 keyed cipher.
///
/// During the handshake the internal nonce is used (reset on every new key);
/// transport traffic always supplies the counter from the wire.
#[derive(Clone)]
pub struct CipherState {
    /// Encryption key (32 bytes).
    key: [u8; 32],
    /// Nonce counter (8 bytes used, 4 bytes zero prefix).
    nonce: u64,
    /// Whether this cipher has a valid key.
    has_key: bool,
}

impl CipherState {
    /// Create a new cipher state with the given key.
    pub(crate) fn new(key: [u8; 32]) -> Self {
        Self {
            key,
            nonce: 0,
            has_key: true,
        }
    }

    /// Create an empty cipher state (no key yet).
    pub fn empty() -> Self {
        Self {
            key: [0u8; 32],
            nonce: 0,
            has_key: false,
        }
    }

    /// Encrypt with the internal nonce, binding `aad`.
    pub fn encrypt_with_aad(
        &mut self,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, NoiseError> {
        let counter = self.next_nonce()?;
        self.encrypt_with_counter_and_aad(plaintext, counter, aad)
    }

    /// Decrypt with the internal nonce, verifying `aad`.
    pub fn decrypt_with_aad(
        &mut self,
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, NoiseError> {
        let counter = self.next_nonce()?;
        self.decrypt_with_counter_and_aad(ciphertext, counter, aad)
    }

    /// Encrypt with an explicit counter (transport phase).
    pub fn encrypt_with_counter_and_aad(
        &self,
        plaintext: &[u8],
        counter: u64,
        aad: &[u8],
    ) -> Result<Vec<u8>, NoiseError> {
        if !self.has_key {
            return Err(NoiseError::EncryptionFailed);
        }

        if plaintext.len() > MAX_MESSAGE_SIZE - TAG_SIZE {
            return Err(NoiseError::MessageTooLarge {
                size: plaintext.len(),
                max: MAX_MESSAGE_SIZE - TAG_SIZE,
            });
        }

        let cipher = ChaCha20Poly1305::new_from_slice(&self.key)
            .map_err(|_| NoiseError::EncryptionFailed)?;

        let nonce = Self::counter_to_nonce(counter);
        cipher
            .encrypt(&nonce, Payload { msg: plaintext, aad })
            .map_err(|_| NoiseError::EncryptionFailed)
    }

    /// Decrypt with an explicit counter (transport phase).
    ///
    /// The counter must be checked against the replay window by the caller
    /// once the packet has authenticated.
    pub fn decrypt_with_counter_and_aad(
        &self,
        ciphertext: &[u8],
        counter: u64,
        aad: &[u8],
    ) -> Result<Vec<u8>, NoiseError> {
        if !self.has_key {
            return Err(NoiseError::DecryptionFailed);
        }

        if ciphertext.len() < TAG_SIZE {
            return Err(NoiseError::MessageTooShort {
                expected: TAG_SIZE,
                got: ciphertext.len(),
            });
        }

        let cipher = ChaCha20Poly1305::new_from_slice(&self.key)
            .map_err(|_| NoiseError::DecryptionFailed)?;

        let nonce = Self::counter_to_nonce(counter);
        cipher
            .decrypt(&nonce, Payload { msg: ciphertext, aad })
            .map_err(|_| NoiseError::DecryptionFailed)
    }

    /// Noise uses 8-byte counter with 4-byte zero prefix.
    fn counter_to_nonce(counter: u64) -> Nonce {
        let mut nonce_bytes = [0u8; 12];
        nonce_bytes[4..12].copy_from_slice(&counter.to_le_bytes());
        *Nonce::from_slice(&nonce_bytes)
    }

    fn next_nonce(&mut self) -> Result<u64, NoiseError> {
        if self.nonce == u64::MAX {
            return Err(NoiseError::NonceOverflow);
        }
        let n = self.nonce;
        self.nonce += 1;
        Ok(n)
    }

    /// Check if cipher has a key.
    pub fn has_key(&self) -> bool {
        self.has_key
    }
}

impl Drop for CipherState {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl fmt::Debug for CipherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherState")
            .field("nonce", &self.nonce)
            .field("has_key", &self.has_key)
            .field("key", &"[redacted]")
            .finish()
    }
}

#[cfg(test)]
mod tests;
