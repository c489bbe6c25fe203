//! RX event loop and datagram dispatch.

use super::DecryptJob;
use crate::device::{Device, DropReason, WorkQueues};
use crate::noise::{COOKIE_REPLY_SIZE, INITIATION_SIZE, RESPONSE_SIZE};
use crate::protocol::{TransportHeader, Usage};
use crate::transport::{ReceivedPacket, TransportError, UdpReceiver};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, trace, warn};

/// Consecutive transient receive errors tolerated before giving up.
const MAX_RECV_FAILURES: u32 = 10;
const RECV_RETRY_DELAY: Duration = Duration::from_millis(333);

impl Device {
    /// Run the receive event loop for the UDP bind.
    ///
    /// Every datagram is classified by its usage byte:
    /// - Initiation, Response and CookieReply go to the shared handshake
    ///   queue. A backlog of more than an eighth of that queue puts the
    ///   device under load for a second, which makes the handshake workers
    ///   demand cookies.
    /// - Transport usages are matched to a keypair by receiver index. A
    ///   slot is pushed onto the owning peer's inbound queue and the
    ///   datagram goes to the decryption pool.
    ///
    /// Nothing is decrypted on this task. The loop exits when the bind is
    /// closed or the device shuts down.
    pub(crate) async fn run_rx_loop(
        self: Arc<Self>,
        mut receiver: UdpReceiver,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(node = %self.node_id(), "RX event loop started");
        let mut failures = 0u32;

        loop {
            let result = tokio::select! {
                _ = shutdown.changed() => break,
                result = receiver.recv() => result,
            };
            match result {
                Ok(packet) => {
                    failures = 0;
                    self.dispatch_datagram(packet);
                }
                Err(TransportError::Closed) => break,
                Err(e) if e.is_transient() && failures < MAX_RECV_FAILURES => {
                    failures += 1;
                    warn!(error = %e, failures, "UDP receive failed, retrying");
                    tokio::time::sleep(RECV_RETRY_DELAY).await;
                }
                Err(e) => {
                    warn!(error = %e, "UDP receive failed, stopping RX loop");
                    break;
                }
            }
        }

        info!(node = %self.node_id(), "RX event loop stopped");
    }

    /// Classify one datagram and queue it for the right worker pool.
    pub(crate) fn dispatch_datagram(&self, packet: ReceivedPacket) {
        let Some(queues) = self.work_queues() else {
            return;
        };
        let Some(usage) = packet.data.first().and_then(|b| Usage::from_byte(*b)) else {
            trace!(from = %packet.endpoint, "Dropping datagram with unknown usage");
            self.drop_packet(DropReason::MalformedPacket);
            return;
        };

        match usage {
            Usage::Initiation | Usage::Response | Usage::CookieReply => {
                self.queue_handshake(&queues, usage, packet)
            }
            _ => self.queue_transport(&queues, packet),
        }
    }

    fn queue_handshake(&self, queues: &WorkQueues, usage: Usage, packet: ReceivedPacket) {
        let expected = match usage {
            Usage::Initiation => INITIATION_SIZE,
            Usage::Response => RESPONSE_SIZE,
            _ => COOKIE_REPLY_SIZE,
        };
        if packet.data.len() != expected {
            debug!(%usage, len = packet.data.len(), expected, "Handshake message has wrong size");
            self.drop_packet(DropReason::MalformedPacket);
            return;
        }

        let queue = &queues.handshake;
        let queued = queue.max_capacity() - queue.capacity();
        if queued >= queue.max_capacity() / 8 {
            self.mark_under_load(Instant::now());
        }
        if queue.try_send(packet).is_err() {
            trace!("Handshake queue full, dropping message");
            self.drop_packet(DropReason::ResourceExhausted);
        }
    }

    fn queue_transport(&self, queues: &WorkQueues, packet: ReceivedPacket) {
        let header = match TransportHeader::parse(&packet.data) {
            Ok((header, _)) => header,
            Err(e) => {
                trace!(error = %e, "Malformed transport datagram");
                self.drop_packet(DropReason::MalformedPacket);
                return;
            }
        };

        let Some((peer, Some(keypair))) = self.index_table.lookup(header.receiver) else {
            trace!(receiver = header.receiver, "No keypair for receiver index");
            self.drop_packet(DropReason::PeerUnknown);
            return;
        };
        if keypair.is_expired() {
            self.drop_packet(DropReason::PeerUnknown);
            return;
        }
        let Some(peer_queues) = peer.queues() else {
            self.drop_packet(DropReason::PeerUnknown);
            return;
        };

        let (slot_tx, slot_rx) = oneshot::channel();
        if peer_queues.inbound.try_send(Some(slot_rx)).is_err() {
            trace!(%peer, "Inbound queue full, dropping datagram");
            self.drop_packet(DropReason::ResourceExhausted);
            return;
        }
        let job = DecryptJob {
            keypair,
            header,
            endpoint: packet.endpoint,
            received_at: packet.received_at,
            datagram: packet.data,
            slot: slot_tx,
        };
        if queues.decryption.try_send(job).is_err() {
            // The dropped slot sender wakes the receiver, which skips it.
            self.drop_packet(DropReason::ResourceExhausted);
        }
    }
}
