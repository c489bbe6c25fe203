//! Per-peer sequential tasks.
//!
//! The crypto pools finish jobs in any order; these tasks await each
//! peer's slots in the order they were queued.

use crate::device::{Device, DropReason};
use crate::noise::{KEEPALIVE_TIMEOUT, REJECT_AFTER_TIME, REKEY_TIMEOUT};
use crate::peer::{InboundSlot, Opened, OutboundSlot, Peer, QueueElement};
use crate::protocol::Usage;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, trace};

impl Device {
    /// Write sealed datagrams for `peer` to the bind in queue order.
    pub(crate) async fn run_sequential_sender(
        self: Arc<Self>,
        peer: Arc<Peer>,
        mut queue: mpsc::Receiver<QueueElement<OutboundSlot>>,
    ) {
        trace!(%peer, "Sequential sender started");
        while let Some(Some(slot)) = queue.recv().await {
            let Ok(Some(sealed)) = slot.await else {
                continue;
            };
            let Some(endpoint) = peer.endpoint() else {
                trace!(%peer, "No endpoint, dropping sealed datagram");
                continue;
            };
            match self.bind.send(&sealed.datagram, &endpoint).await {
                Ok(()) => {
                    let now = Instant::now();
                    peer.stats().add_tx(sealed.datagram.len());
                    let mut timers = peer.timers();
                    timers.any_authenticated_packet_traversal(now);
                    timers.any_authenticated_packet_sent();
                    if !sealed.keepalive {
                        timers.data_sent(now);
                    }
                }
                Err(e) => debug!(%peer, error = %e, "Failed to send datagram"),
            }
        }
        trace!(%peer, "Sequential sender stopped");
    }

    /// Handle opened datagrams for `peer` in arrival order.
    pub(crate) async fn run_sequential_receiver(
        self: Arc<Self>,
        peer: Arc<Peer>,
        mut queue: mpsc::Receiver<QueueElement<InboundSlot>>,
    ) {
        trace!(%peer, "Sequential receiver started");
        while let Some(Some(slot)) = queue.recv().await {
            let Ok(opened) = slot.await else {
                continue;
            };
            self.process_opened(&peer, opened).await;
        }
        trace!(%peer, "Sequential receiver stopped");
    }

    async fn process_opened(self: &Arc<Self>, peer: &Arc<Peer>, opened: Opened) {
        let Some(plaintext) = opened.plaintext else {
            trace!(%peer, counter = opened.counter, "Transport datagram failed authentication");
            self.drop_packet(DropReason::AuthFailed);
            return;
        };
        if !opened.keypair.validate_counter(opened.counter) {
            trace!(%peer, counter = opened.counter, "Replayed transport counter");
            self.drop_packet(DropReason::ReplayRejected);
            return;
        }

        self.update_endpoint_from(peer, opened.endpoint);

        let promoted = peer.keypairs().received_with(&opened.keypair);
        if let Some(evicted) = promoted {
            for old in evicted {
                self.index_table.delete(old.local_index());
            }
            peer.timers().handshake_complete();
            debug!(%peer, "Next keypair confirmed");
            self.send_staged(peer).await;
        }

        // Rekey before the initiator's keypair ages out
        let aging = peer.keypairs().current().is_some_and(|kp| {
            kp.is_initiator() && kp.age() > REJECT_AFTER_TIME - KEEPALIVE_TIMEOUT - REKEY_TIMEOUT
        });
        if aging {
            self.send_handshake_initiation(peer, false).await;
        }

        let now = opened.received_at.max(Instant::now());
        {
            let mut timers = peer.timers();
            timers.any_authenticated_packet_traversal(now);
            timers.any_authenticated_packet_received();
        }
        peer.stats().add_rx(opened.wire_len);
        peer.touch(now);

        if plaintext.is_empty() {
            trace!(%peer, "Keepalive received");
            return;
        }
        if opened.usage == Usage::Transport {
            self.drop_packet(DropReason::MalformedPacket);
            return;
        }
        peer.timers().data_received(now);
        self.handle_overlay_packet(peer, opened.usage, &plaintext).await;
    }
}
