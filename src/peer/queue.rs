//! Per-peer packet queues.
//!
//! Encryption and decryption run on shared worker pools, so elements for
//! one peer finish out of order. Each peer therefore owns two FIFO queues
//! of *slots*: the producer pushes a oneshot receiver into the peer queue
//! and hands the matching sender to a worker. The peer's sequential task
//! awaits slots in push order, which restores per-peer ordering without
//! holding up the pool.
//!
//! The staged queue holds packets that are waiting for a usable session.

use crate::noise::Keypair;
use crate::protocol::Usage;
use crate::transport::Endpoint;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};

/// Packets held while no session is up.
pub const QUEUE_STAGED_SIZE: usize = 128;

/// Outstanding slots per peer in each direction.
pub const QUEUE_INBOUND_SIZE: usize = 1024;
pub const QUEUE_OUTBOUND_SIZE: usize = 1024;

/// A plaintext packet waiting to be encrypted for a peer.
#[derive(Clone, Debug)]
pub struct StagedPacket {
    pub usage: Usage,
    /// Overlay header plus body. Empty for a keepalive.
    pub payload: Vec<u8>,
}

impl StagedPacket {
    pub fn new(usage: Usage, payload: Vec<u8>) -> Self {
        Self { usage, payload }
    }

    pub fn keepalive() -> Self {
        Self::new(Usage::Transport, Vec::new())
    }

    pub fn is_keepalive(&self) -> bool {
        self.payload.is_empty()
    }
}

/// An encrypted datagram ready for the bind.
#[derive(Debug)]
pub struct Sealed {
    pub datagram: Vec<u8>,
    pub keepalive: bool,
}

/// Outcome of decrypting one transport datagram.
#[derive(Debug)]
pub struct Opened {
    pub keypair: Arc<Keypair>,
    pub counter: u64,
    pub usage: Usage,
    pub endpoint: Endpoint,
    /// `None` when authentication failed.
    pub plaintext: Option<Vec<u8>>,
    /// Datagram size on the wire.
    pub wire_len: usize,
    pub received_at: Instant,
}

/// Slot the sequential sender waits on. `None` means sealing failed.
pub type OutboundSlot = oneshot::Receiver<Option<Sealed>>;

/// Slot the sequential receiver waits on.
pub type InboundSlot = oneshot::Receiver<Opened>;

/// Element of a per-peer queue. `None` is the stop sentinel.
pub type QueueElement<T> = Option<T>;

/// Producer halves of a running peer's sequential queues.
#[derive(Clone, Debug)]
pub struct PeerQueues {
    pub inbound: mpsc::Sender<QueueElement<InboundSlot>>,
    pub outbound: mpsc::Sender<QueueElement<OutboundSlot>>,
}

/// Consumer halves, handed to the sequential tasks on start.
#[derive(Debug)]
pub struct PeerQueueReceivers {
    pub inbound: mpsc::Receiver<QueueElement<InboundSlot>>,
    pub outbound: mpsc::Receiver<QueueElement<OutboundSlot>>,
}

impl PeerQueues {
    pub fn new() -> (Self, PeerQueueReceivers) {
        let (inbound_tx, inbound_rx) = mpsc::channel(QUEUE_INBOUND_SIZE);
        let (outbound_tx, outbound_rx) = mpsc::channel(QUEUE_OUTBOUND_SIZE);
        (
            Self {
                inbound: inbound_tx,
                outbound: outbound_tx,
            },
            PeerQueueReceivers {
                inbound: inbound_rx,
                outbound: outbound_rx,
            },
        )
    }

    /// Ask both sequential tasks to exit once they drain.
    pub fn stop(&self) {
        let _ = self.inbound.try_send(None);
        let _ = self.outbound.try_send(None);
    }
}

/// Bounded FIFO that sheds its oldest packet when full.
#[derive(Debug)]
pub struct StagedQueue {
    packets: VecDeque<StagedPacket>,
    capacity: usize,
}

impl StagedQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            packets: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append a packet; returns true if an older one was dropped to fit.
    pub fn push(&mut self, packet: StagedPacket) -> bool {
        let dropped = if self.packets.len() >= self.capacity {
            self.packets.pop_front();
            true
        } else {
            false
        };
        self.packets.push_back(packet);
        dropped
    }

    pub fn drain(&mut self) -> Vec<StagedPacket> {
        self.packets.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.packets.clear();
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }
}

impl Default for StagedQueue {
    fn default() -> Self {
        Self::new(QUEUE_STAGED_SIZE)
    }
}
