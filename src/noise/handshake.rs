use super::{
    CipherState, HandshakeRole, Keypair, MessageInitiation, MessageResponse, NoiseError,
    CONSTRUCTION, HANDSHAKE_INITIATION_RATE, IDENTIFIER, PUBKEY_SIZE, TAG_SIZE, TIMESTAMP_SIZE,
};
use crate::identity::{PresharedKey, PrivateKey, PublicKey, StaticIdentity};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use zeroize::Zeroize;

/// Handshake state machine states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeProgress {
    /// No handshake in flight.
    Zeroed,
    /// We sent an initiation and wait for the response.
    InitiationCreated,
    /// We accepted an initiation and owe a response.
    InitiationConsumed,
    /// We sent a response; keys are derived.
    ResponseCreated,
    /// We accepted a response; keys are derived.
    ResponseConsumed,
}

impl fmt::Display for HandshakeProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HandshakeProgress::Zeroed => "zeroed",
            HandshakeProgress::InitiationCreated => "initiation_created",
            HandshakeProgress::InitiationConsumed => "initiation_consumed",
            HandshakeProgress::ResponseCreated => "response_created",
            HandshakeProgress::ResponseConsumed => "response_consumed",
        };
        write!(f, "{}", s)
    }
}

fn hash(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn mix_hash(h: &mut [u8; 32], data: &[u8]) {
    *h = hash(&[h.as_slice(), data]);
}

/// HKDF-SHA256 with the chaining key as salt, producing `N` 32-byte outputs.
fn kdf<const N: usize>(ck: &[u8; 32], input: &[u8]) -> [[u8; 32]; N] {
    let hk = Hkdf::<Sha256>::new(Some(ck), input);
    let mut okm = [0u8; 96];
    // 96 bytes is well below the 255 * 32 HKDF-SHA256 limit
    let _ = hk.expand(&[], &mut okm[..N * 32]);
    let mut out = [[0u8; 32]; N];
    for (i, chunk) in out.iter_mut().enumerate() {
        chunk.copy_from_slice(&okm[i * 32..(i + 1) * 32]);
    }
    okm.zeroize();
    out
}

fn initial_chain_key() -> [u8; 32] {
    hash(&[CONSTRUCTION])
}

fn initial_hash() -> [u8; 32] {
    let ck = initial_chain_key();
    hash(&[&ck, IDENTIFIER])
}

/// One-shot AEAD with zero nonce, as used by every handshake payload.
fn seal(key: [u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, NoiseError> {
    let mut cipher = CipherState::new(key);
    cipher.encrypt_with_aad(plaintext, aad)
}

fn open(key: [u8; 32], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, NoiseError> {
    let mut cipher = CipherState::new(key);
    cipher.decrypt_with_aad(ciphertext, aad)
}

/// TAI64N label for the current wall-clock time.
fn tai64n_now() -> [u8; TIMESTAMP_SIZE] {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let mut out = [0u8; TIMESTAMP_SIZE];
    out[..8].copy_from_slice(&(0x4000_0000_0000_000a_u64 + now.as_secs()).to_be_bytes());
    // Coarsen to ~16 ms so the timestamp is not a timing oracle
    let nanos = now.subsec_nanos() & !0x00ff_ffff;
    out[8..].copy_from_slice(&nanos.to_be_bytes());
    out
}

/// Result of the key-independent half of consuming an initiation.
///
/// The initiator's static key is only known after decrypting with our own
/// static key; the caller then looks up the matching peer and finishes with
/// [`Handshake::consume_initiation`].
pub struct InitiationScan {
    pub remote_static: PublicKey,
    chain_key: [u8; 32],
    hash: [u8; 32],
    remote_ephemeral: [u8; PUBKEY_SIZE],
    sender: u32,
}

impl InitiationScan {
    /// Decrypt the static key of an initiation addressed to `local`.
    pub fn scan(msg: &MessageInitiation, local: &StaticIdentity) -> Result<Self, NoiseError> {
        let mut h = initial_hash();
        mix_hash(&mut h, local.public_key().as_bytes());
        let [mut ck] = kdf::<1>(&initial_chain_key(), &msg.ephemeral);
        mix_hash(&mut h, &msg.ephemeral);

        let es = local
            .private_key()
            .diffie_hellman(&PublicKey::from_bytes(msg.ephemeral))
            .ok_or(NoiseError::InvalidPublicKey)?;
        let [next_ck, key] = kdf::<2>(&ck, &es);
        ck = next_ck;
        let static_bytes = open(key, &msg.encrypted_static, &h)?;
        mix_hash(&mut h, &msg.encrypted_static);

        let mut remote = [0u8; PUBKEY_SIZE];
        remote.copy_from_slice(&static_bytes);
        Ok(Self {
            remote_static: PublicKey::from_bytes(remote),
            chain_key: ck,
            hash: h,
            remote_ephemeral: msg.ephemeral,
            sender: msg.sender,
        })
    }
}

impl Drop for InitiationScan {
    fn drop(&mut self) {
        self.chain_key.zeroize();
        self.hash.zeroize();
    }
}

/// Per-peer handshake state.
pub struct Handshake {
    progress: HandshakeProgress,
    remote_static: PublicKey,
    preshared_key: PresharedKey,
    /// DH(our static, their static); `None` for a low-order remote key.
    precomputed_static_static: Option<[u8; 32]>,
    chain_key: [u8; 32],
    hash: [u8; 32],
    local_ephemeral: Option<PrivateKey>,
    remote_ephemeral: [u8; PUBKEY_SIZE],
    local_index: u32,
    remote_index: u32,
    last_timestamp: [u8; TIMESTAMP_SIZE],
    last_initiation_consumption: Option<Instant>,
    last_sent_handshake: Option<Instant>,
}

impl Handshake {
    pub fn new(local: &StaticIdentity, remote_static: PublicKey, preshared_key: PresharedKey) -> Self {
        Self {
            progress: HandshakeProgress::Zeroed,
            remote_static,
            preshared_key,
            precomputed_static_static: local.private_key().diffie_hellman(&remote_static),
            chain_key: [0u8; 32],
            hash: [0u8; 32],
            local_ephemeral: None,
            remote_ephemeral: [0u8; PUBKEY_SIZE],
            local_index: 0,
            remote_index: 0,
            last_timestamp: [0u8; TIMESTAMP_SIZE],
            last_initiation_consumption: None,
            last_sent_handshake: None,
        }
    }

    pub fn progress(&self) -> HandshakeProgress {
        self.progress
    }

    pub fn remote_static(&self) -> &PublicKey {
        &self.remote_static
    }

    pub fn local_index(&self) -> u32 {
        self.local_index
    }

    pub fn preshared_key(&self) -> &PresharedKey {
        &self.preshared_key
    }

    pub fn set_preshared_key(&mut self, psk: PresharedKey) {
        self.preshared_key = psk;
    }

    /// Recompute the static-static secret after our identity changed.
    pub fn set_local_identity(&mut self, local: &StaticIdentity) {
        self.precomputed_static_static = local.private_key().diffie_hellman(&self.remote_static);
        self.clear();
    }

    pub fn last_sent_handshake(&self) -> Option<Instant> {
        self.last_sent_handshake
    }

    pub fn set_last_sent_handshake(&mut self, at: Option<Instant>) {
        self.last_sent_handshake = at;
    }

    /// Drop all in-flight handshake material.
    pub fn clear(&mut self) {
        self.chain_key.zeroize();
        self.hash.zeroize();
        self.local_ephemeral = None;
        self.remote_ephemeral = [0u8; PUBKEY_SIZE];
        self.local_index = 0;
        self.progress = HandshakeProgress::Zeroed;
    }

    /// Build an initiation. `local_index` must already be registered in
    /// the index table for this peer.
    pub fn create_initiation(
        &mut self,
        local: &StaticIdentity,
        local_index: u32,
    ) -> Result<MessageInitiation, NoiseError> {
        let ss = self
            .precomputed_static_static
            .ok_or(NoiseError::InvalidPublicKey)?;

        let mut h = initial_hash();
        mix_hash(&mut h, self.remote_static.as_bytes());

        let ephemeral = PrivateKey::generate();
        let ephemeral_pub = ephemeral.public_key();
        let [mut ck] = kdf::<1>(&initial_chain_key(), ephemeral_pub.as_bytes());
        mix_hash(&mut h, ephemeral_pub.as_bytes());

        let es = ephemeral
            .diffie_hellman(&self.remote_static)
            .ok_or(NoiseError::InvalidPublicKey)?;
        let [next_ck, key] = kdf::<2>(&ck, &es);
        ck = next_ck;
        let encrypted_static = seal(key, local.public_key().as_bytes(), &h)?;
        mix_hash(&mut h, &encrypted_static);

        let [next_ck, key] = kdf::<2>(&ck, &ss);
        ck = next_ck;
        let encrypted_timestamp = seal(key, &tai64n_now(), &h)?;
        mix_hash(&mut h, &encrypted_timestamp);

        self.chain_key = ck;
        self.hash = h;
        self.local_ephemeral = Some(ephemeral);
        self.local_index = local_index;
        self.progress = HandshakeProgress::InitiationCreated;

        let mut msg = MessageInitiation {
            sender: local_index,
            ephemeral: *ephemeral_pub.as_bytes(),
            encrypted_static: [0u8; PUBKEY_SIZE + TAG_SIZE],
            encrypted_timestamp: [0u8; TIMESTAMP_SIZE + TAG_SIZE],
            mac1: [0u8; 16],
            mac2: [0u8; 16],
        };
        msg.encrypted_static.copy_from_slice(&encrypted_static);
        msg.encrypted_timestamp.copy_from_slice(&encrypted_timestamp);
        Ok(msg)
    }

    /// Finish consuming an initiation from this peer.
    pub fn consume_initiation(
        &mut self,
        scan: InitiationScan,
        msg: &MessageInitiation,
    ) -> Result<(), NoiseError> {
        if scan.remote_static != self.remote_static {
            return Err(NoiseError::InvalidPublicKey);
        }
        let ss = self
            .precomputed_static_static
            .ok_or(NoiseError::InvalidPublicKey)?;

        let mut h = scan.hash;
        let [ck, key] = kdf::<2>(&scan.chain_key, &ss);
        let timestamp = open(key, &msg.encrypted_timestamp, &h)?;
        mix_hash(&mut h, &msg.encrypted_timestamp);

        let mut ts = [0u8; TIMESTAMP_SIZE];
        ts.copy_from_slice(&timestamp);
        if ts <= self.last_timestamp {
            return Err(NoiseError::StaleTimestamp);
        }
        if let Some(last) = self.last_initiation_consumption {
            if last.elapsed() <= HANDSHAKE_INITIATION_RATE {
                return Err(NoiseError::InitiationFlood);
            }
        }

        self.chain_key = ck;
        self.hash = h;
        self.remote_ephemeral = scan.remote_ephemeral;
        self.remote_index = scan.sender;
        self.last_timestamp = ts;
        self.last_initiation_consumption = Some(Instant::now());
        self.progress = HandshakeProgress::InitiationConsumed;
        Ok(())
    }

    /// Build the response to a consumed initiation.
    pub fn create_response(&mut self, local_index: u32) -> Result<MessageResponse, NoiseError> {
        if self.progress != HandshakeProgress::InitiationConsumed {
            return Err(NoiseError::WrongState {
                expected: HandshakeProgress::InitiationConsumed,
                got: self.progress,
            });
        }

        let mut h = self.hash;
        let ephemeral = PrivateKey::generate();
        let ephemeral_pub = ephemeral.public_key();
        let [mut ck] = kdf::<1>(&self.chain_key, ephemeral_pub.as_bytes());
        mix_hash(&mut h, ephemeral_pub.as_bytes());

        let remote_ephemeral = PublicKey::from_bytes(self.remote_ephemeral);
        let ee = ephemeral
            .diffie_hellman(&remote_ephemeral)
            .ok_or(NoiseError::InvalidPublicKey)?;
        [ck] = kdf::<1>(&ck, &ee);
        let se = ephemeral
            .diffie_hellman(&self.remote_static)
            .ok_or(NoiseError::InvalidPublicKey)?;
        [ck] = kdf::<1>(&ck, &se);

        let [next_ck, tau, key] = kdf::<3>(&ck, self.preshared_key.as_bytes());
        ck = next_ck;
        mix_hash(&mut h, &tau);
        let empty = seal(key, &[], &h)?;
        mix_hash(&mut h, &empty);

        self.chain_key = ck;
        self.hash = h;
        self.local_ephemeral = Some(ephemeral);
        self.local_index = local_index;
        self.progress = HandshakeProgress::ResponseCreated;

        let mut msg = MessageResponse {
            sender: local_index,
            receiver: self.remote_index,
            ephemeral: *ephemeral_pub.as_bytes(),
            encrypted_nothing: [0u8; TAG_SIZE],
            mac1: [0u8; 16],
            mac2: [0u8; 16],
        };
        msg.encrypted_nothing.copy_from_slice(&empty);
        Ok(msg)
    }

    /// Consume a response to our initiation.
    pub fn consume_response(
        &mut self,
        msg: &MessageResponse,
        local: &StaticIdentity,
    ) -> Result<(), NoiseError> {
        if self.progress != HandshakeProgress::InitiationCreated {
            return Err(NoiseError::WrongState {
                expected: HandshakeProgress::InitiationCreated,
                got: self.progress,
            });
        }
        let ephemeral = self
            .local_ephemeral
            .as_ref()
            .ok_or(NoiseError::InvalidPublicKey)?;

        let mut h = self.hash;
        let [mut ck] = kdf::<1>(&self.chain_key, &msg.ephemeral);
        mix_hash(&mut h, &msg.ephemeral);

        let remote_ephemeral = PublicKey::from_bytes(msg.ephemeral);
        let ee = ephemeral
            .diffie_hellman(&remote_ephemeral)
            .ok_or(NoiseError::InvalidPublicKey)?;
        [ck] = kdf::<1>(&ck, &ee);
        let se = local
            .private_key()
            .diffie_hellman(&remote_ephemeral)
            .ok_or(NoiseError::InvalidPublicKey)?;
        [ck] = kdf::<1>(&ck, &se);

        let [next_ck, tau, key] = kdf::<3>(&ck, self.preshared_key.as_bytes());
        ck = next_ck;
        mix_hash(&mut h, &tau);
        open(key, &msg.encrypted_nothing, &h)?;
        mix_hash(&mut h, &msg.encrypted_nothing);

        self.chain_key = ck;
        self.hash = h;
        self.remote_index = msg.sender;
        self.progress = HandshakeProgress::ResponseConsumed;
        Ok(())
    }

    /// Derive the transport keypair and reset the handshake.
    pub fn derive_keypair(&mut self) -> Result<Keypair, NoiseError> {
        let role = match self.progress {
            HandshakeProgress::ResponseConsumed => HandshakeRole::Initiator,
            HandshakeProgress::ResponseCreated => HandshakeRole::Responder,
            got => {
                return Err(NoiseError::WrongState {
                    expected: HandshakeProgress::ResponseConsumed,
                    got,
                })
            }
        };
        let [first, second] = kdf::<2>(&self.chain_key, &[]);
        let (send, receive) = match role {
            HandshakeRole::Initiator => (first, second),
            HandshakeRole::Responder => (second, first),
        };
        let keypair = Keypair::new(
            CipherState::new(send),
            CipherState::new(receive),
            role == HandshakeRole::Initiator,
            self.local_index,
            self.remote_index,
        );

        self.chain_key.zeroize();
        self.hash.zeroize();
        self.local_ephemeral = None;
        self.remote_ephemeral = [0u8; PUBKEY_SIZE];
        self.progress = HandshakeProgress::Zeroed;
        Ok(keypair)
    }
}

impl Drop for Handshake {
    fn drop(&mut self) {
        self.chain_key.zeroize();
        self.hash.zeroize();
    }
}

impl fmt::Debug for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handshake")
            .field("progress", &self.progress)
            .field("remote_static", &self.remote_static)
            .field("local_index", &self.local_index)
            .field("remote_index", &self.remote_index)
            .finish()
    }
}
