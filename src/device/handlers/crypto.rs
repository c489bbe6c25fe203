//! Jobs for the shared encryption and decryption pools.
//!
//! A job carries everything needed to seal or open one datagram plus the
//! oneshot sender of the slot its peer's sequential task is waiting on.

use crate::noise::Keypair;
use crate::peer::{Opened, Sealed, StagedPacket};
use crate::protocol::{TransportHeader, TRANSPORT_HEADER_SIZE};
use crate::transport::Endpoint;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::trace;

pub(crate) struct EncryptJob {
    pub keypair: Arc<Keypair>,
    pub counter: u64,
    pub packet: StagedPacket,
    pub slot: oneshot::Sender<Option<Sealed>>,
}

impl EncryptJob {
    /// Seal the packet. The clear transport header is the AAD.
    pub fn run(self) {
        let header = TransportHeader {
            usage: self.packet.usage,
            receiver: self.keypair.remote_index(),
            counter: self.counter,
        }
        .encode();
        let sealed = match self.keypair.seal(self.counter, &header, &self.packet.payload) {
            Ok(ciphertext) => {
                let mut datagram = Vec::with_capacity(TRANSPORT_HEADER_SIZE + ciphertext.len());
                datagram.extend_from_slice(&header);
                datagram.extend_from_slice(&ciphertext);
                Some(Sealed {
                    datagram,
                    keepalive: self.packet.is_keepalive(),
                })
            }
            Err(e) => {
                trace!(error = %e, counter = self.counter, "Seal failed");
                None
            }
        };
        let _ = self.slot.send(sealed);
    }
}

pub(crate) struct DecryptJob {
    pub keypair: Arc<Keypair>,
    pub header: TransportHeader,
    pub datagram: Vec<u8>,
    pub endpoint: Endpoint,
    pub received_at: Instant,
    pub slot: oneshot::Sender<Opened>,
}

impl DecryptJob {
    /// Open the datagram. Authentication failures are reported through
    /// `Opened::plaintext` so the receiver can count them in order.
    pub fn run(self) {
        let (aad, ciphertext) = self.datagram.split_at(TRANSPORT_HEADER_SIZE);
        let plaintext = self.keypair.open(self.header.counter, aad, ciphertext).ok();
        let opened = Opened {
            counter: self.header.counter,
            usage: self.header.usage,
            endpoint: self.endpoint,
            plaintext,
            wire_len: self.datagram.len(),
            received_at: self.received_at,
            keypair: self.keypair,
        };
        let _ = self.slot.send(opened);
    }
}
