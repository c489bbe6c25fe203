//! Transport keypairs and the previous/current/next rotation.

use super::{CipherState, NoiseError, ReplayWindow, REJECT_AFTER_MESSAGES, REJECT_AFTER_TIME};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Symmetric keys derived from one completed handshake.
///
/// Not `Clone`: duplicating a keypair would duplicate the send counter and
/// reuse nonces.
#[derive(Debug)]
pub struct Keypair {
    send: CipherState,
    receive: CipherState,
    send_nonce: AtomicU64,
    replay: Mutex<ReplayWindow>,
    created: Instant,
    is_initiator: bool,
    local_index: u32,
    remote_index: u32,
}

impl Keypair {
    pub(crate) fn new(
        send: CipherState,
        receive: CipherState,
        is_initiator: bool,
        local_index: u32,
        remote_index: u32,
    ) -> Self {
        Self {
            send,
            receive,
            send_nonce: AtomicU64::new(0),
            replay: Mutex::new(ReplayWindow::new()),
            created: Instant::now(),
            is_initiator,
            local_index,
            remote_index,
        }
    }

    pub fn local_index(&self) -> u32 {
        self.local_index
    }

    pub fn remote_index(&self) -> u32 {
        self.remote_index
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Whether the keypair is past `RejectAfterTime`.
    pub fn is_expired(&self) -> bool {
        self.age() >= REJECT_AFTER_TIME
    }

    /// Reserve the next send counter, or `None` once the keypair is spent.
    pub fn next_send_counter(&self) -> Option<u64> {
        let counter = self.send_nonce.fetch_add(1, Ordering::Relaxed);
        if counter >= REJECT_AFTER_MESSAGES {
            self.send_nonce.store(REJECT_AFTER_MESSAGES, Ordering::Relaxed);
            return None;
        }
        Some(counter)
    }

    /// Counter that will be handed out next.
    pub fn send_counter(&self) -> u64 {
        self.send_nonce.load(Ordering::Relaxed)
    }

    /// Mark the keypair as unusable for sending.
    pub fn exhaust(&self) {
        self.send_nonce.store(REJECT_AFTER_MESSAGES, Ordering::Relaxed);
    }

    pub fn seal(&self, counter: u64, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        self.send.encrypt_with_counter_and_aad(plaintext, counter, aad)
    }

    pub fn open(&self, counter: u64, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        self.receive
            .decrypt_with_counter_and_aad(ciphertext, counter, aad)
    }

    /// Record an authenticated counter; `false` for a replay.
    pub fn validate_counter(&self, counter: u64) -> bool {
        match self.replay.lock() {
            Ok(mut window) => window.check_and_update(counter, REJECT_AFTER_MESSAGES),
            Err(_) => false,
        }
    }
}

/// A peer's three keypair slots.
///
/// `current` sends and receives, `previous` still receives, `next` receives
/// only and is promoted on its first authenticated packet.
#[derive(Debug, Default)]
pub struct Keypairs {
    previous: Option<Arc<Keypair>>,
    current: Option<Arc<Keypair>>,
    next: Option<Arc<Keypair>>,
}

impl Keypairs {
    pub fn current(&self) -> Option<&Arc<Keypair>> {
        self.current.as_ref()
    }

    pub fn previous(&self) -> Option<&Arc<Keypair>> {
        self.previous.as_ref()
    }

    pub fn next(&self) -> Option<&Arc<Keypair>> {
        self.next.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.previous.is_none() && self.current.is_none() && self.next.is_none()
    }

    /// Install a freshly derived keypair. Returns the keypairs that fell out
    /// of the rotation so the caller can drop their index entries.
    pub fn install(&mut self, keypair: Arc<Keypair>) -> Vec<Arc<Keypair>> {
        let mut evicted = Vec::new();
        if keypair.is_initiator() {
            // Initiator may send immediately on the new keypair
            if let Some(next) = self.next.take() {
                evicted.extend(self.previous.replace(next));
            } else {
                evicted.extend(self.previous.take());
                self.previous = self.current.take();
            }
            if let Some(old) = self.current.replace(keypair) {
                evicted.push(old);
            }
        } else {
            // Responder waits for the first packet on it before sending
            evicted.extend(self.next.replace(keypair));
            evicted.extend(self.previous.take());
        }
        evicted
    }

    /// Promote `next` when a packet authenticates under it.
    ///
    /// Returns `Some(evicted)` if a promotion happened.
    pub fn received_with(&mut self, keypair: &Arc<Keypair>) -> Option<Vec<Arc<Keypair>>> {
        match &self.next {
            Some(next) if Arc::ptr_eq(next, keypair) => {}
            _ => return None,
        }
        let mut evicted = Vec::new();
        evicted.extend(self.previous.take());
        self.previous = self.current.take();
        self.current = self.next.take();
        Some(evicted)
    }

    /// Remove every keypair.
    pub fn clear(&mut self) -> Vec<Arc<Keypair>> {
        [self.previous.take(), self.current.take(), self.next.take()]
            .into_iter()
            .flatten()
            .collect()
    }

    /// Drop `previous` once it is past `RejectAfterTime`.
    pub fn expire_previous(&mut self) -> Option<Arc<Keypair>> {
        if self.previous.as_ref().is_some_and(|kp| kp.is_expired()) {
            return self.previous.take();
        }
        None
    }
}
