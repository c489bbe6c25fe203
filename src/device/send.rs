//! Outbound path: staging, encryption jobs, handshake initiation and
//! overlay routing decisions.

use crate::device::handlers::EncryptJob;
use crate::device::{Device, DropReason};
use crate::noise::{
    HandshakeProgress, MAX_MESSAGE_SIZE, REKEY_AFTER_MESSAGES, REKEY_AFTER_TIME, REKEY_TIMEOUT,
};
use crate::peer::{Peer, StagedPacket};
use crate::protocol::{NodeId, OverlayHeader, PingMsg, Usage};
use crate::tap::{MacAddr, TapError, ETHERNET_ADDRS_LEN};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, trace, warn};

/// Consecutive TAP read errors tolerated before the reader gives up.
const MAX_TAP_READ_FAILURES: u32 = 10;
const TAP_RETRY_DELAY: Duration = Duration::from_millis(100);

impl Device {
    // === Per-peer send ===

    /// Stage a packet for `peer` and flush what can be sent.
    pub(crate) async fn send_to_peer(&self, peer: &Arc<Peer>, usage: Usage, packet: Vec<u8>) -> bool {
        if peer.staged().push(StagedPacket::new(usage, packet)) {
            debug!(%peer, "Staged queue full, dropped oldest packet");
        }
        self.send_staged(peer).await
    }

    pub(crate) async fn send_keepalive(&self, peer: &Arc<Peer>) {
        {
            let mut staged = peer.staged();
            if staged.is_empty() {
                staged.push(StagedPacket::keepalive());
            }
        }
        self.send_staged(peer).await;
    }

    /// Hand every staged packet to the encryption pool.
    ///
    /// Without a usable keypair this starts a handshake and leaves the
    /// packets staged. Returns whether anything was queued.
    pub(crate) async fn send_staged(&self, peer: &Arc<Peer>) -> bool {
        if !peer.is_running() {
            return false;
        }
        let keypair = peer
            .keypairs()
            .current()
            .filter(|kp| !kp.is_expired())
            .cloned();
        let Some(keypair) = keypair else {
            self.send_handshake_initiation(peer, false).await;
            return false;
        };
        if peer.endpoint().is_none() {
            return false;
        }
        let (Some(queues), Some(peer_queues)) = (self.work_queues(), peer.queues()) else {
            return false;
        };

        let packets = peer.staged().drain();
        let mut iter = packets.into_iter();
        let mut exhausted = false;
        let mut queued = false;
        while let Some(packet) = iter.next() {
            let Some(counter) = keypair.next_send_counter() else {
                let mut staged = peer.staged();
                staged.push(packet);
                for rest in iter.by_ref() {
                    staged.push(rest);
                }
                exhausted = true;
                break;
            };
            let (slot_tx, slot_rx) = oneshot::channel();
            if peer_queues.outbound.try_send(Some(slot_rx)).is_err() {
                trace!(%peer, "Outbound queue full, dropping packet");
                self.drop_packet(DropReason::ResourceExhausted);
                continue;
            }
            let job = EncryptJob {
                keypair: keypair.clone(),
                counter,
                packet,
                slot: slot_tx,
            };
            if queues.encryption.try_send(job).is_err() {
                self.drop_packet(DropReason::ResourceExhausted);
                continue;
            }
            queued = true;
        }

        let rekey = exhausted
            || (keypair.is_initiator()
                && (keypair.send_counter() > REKEY_AFTER_MESSAGES
                    || keypair.age() > REKEY_AFTER_TIME));
        if rekey {
            self.send_handshake_initiation(peer, false).await;
        }
        queued
    }

    /// Start a handshake with `peer`.
    ///
    /// Unless `is_retry`, nothing is sent if an initiation went out within
    /// the last `REKEY_TIMEOUT`.
    pub(crate) async fn send_handshake_initiation(&self, peer: &Arc<Peer>, is_retry: bool) {
        if !peer.is_running() {
            return;
        }
        let Some(endpoint) = peer.endpoint() else {
            trace!(%peer, "No endpoint for handshake");
            return;
        };
        let now = Instant::now();

        let msg = {
            let identity = self.identity();
            let mut hs = peer.handshake();
            if !is_retry
                && hs
                    .last_sent_handshake()
                    .is_some_and(|at| now.duration_since(at) < REKEY_TIMEOUT)
            {
                return;
            }
            hs.set_last_sent_handshake(Some(now));
            if hs.progress() != HandshakeProgress::Zeroed {
                self.index_table.delete(hs.local_index());
            }
            let index = match self.index_table.new_index(peer) {
                Ok(index) => index,
                Err(e) => {
                    warn!(%peer, error = %e, "Cannot allocate session index");
                    return;
                }
            };
            match hs.create_initiation(&identity, index) {
                Ok(msg) => msg,
                Err(e) => {
                    self.index_table.delete(index);
                    debug!(%peer, error = %e, "Cannot create initiation");
                    return;
                }
            }
        };

        let mut bytes = msg.to_bytes();
        peer.cookie_generator().add_macs(&mut bytes);
        {
            let mut timers = peer.timers();
            timers.any_authenticated_packet_traversal(now);
            timers.any_authenticated_packet_sent();
            timers.handshake_initiated(now);
        }
        debug!(%peer, to = %endpoint, retry = is_retry, "Handshake initiation sent");
        if let Err(e) = self.bind.send(&bytes, &endpoint).await {
            debug!(%peer, error = %e, "Failed to send initiation");
        }
    }

    // === Overlay routing ===

    /// Send an overlay packet we originate, routed by its destination.
    /// Returns the number of peers it was handed to.
    pub(crate) async fn send_packet(&self, usage: Usage, packet: Vec<u8>) -> usize {
        let Ok((header, _)) = OverlayHeader::split(&packet) else {
            self.drop_packet(DropReason::MalformedPacket);
            return 0;
        };
        match header.dst {
            NodeId::BROADCAST => self.broadcast_packet(usage, &packet).await,
            NodeId::CONTROL_MESSAGE => self.spread_packet(usage, &packet, &[]).await,
            NodeId::SUPER_NODE_MESSAGE => self.send_to_super(usage, &packet).await,
            dst => self.send_unicast(usage, &packet, dst).await,
        }
    }

    async fn send_to_ids<I>(&self, usage: Usage, packet: &[u8], ids: I) -> usize
    where
        I: IntoIterator<Item = NodeId>,
    {
        let mut sent = 0;
        for id in ids {
            if let Some(peer) = self.peer_by_id(id) {
                self.send_to_peer(&peer, usage, packet.to_vec()).await;
                sent += 1;
            }
        }
        sent
    }

    /// Originate a broadcast along our tree.
    async fn broadcast_packet(&self, usage: Usage, packet: &[u8]) -> usize {
        let targets = self.nh.load().broadcast_list(self.node_id());
        self.send_to_ids(usage, packet, targets).await
    }

    /// Continue a broadcast from `src` that arrived via `from`.
    pub(crate) async fn transit_broadcast(
        &self,
        usage: Usage,
        packet: &[u8],
        src: NodeId,
        from: NodeId,
    ) -> usize {
        let targets = self
            .nh
            .load()
            .broadcast_through_list(self.node_id(), from, src);
        self.send_to_ids(usage, packet, targets).await
    }

    /// Flood to every edge peer with an endpoint, except those in `skip`.
    pub(crate) async fn spread_packet(&self, usage: Usage, packet: &[u8], skip: &[NodeId]) -> usize {
        let mut sent = 0;
        for peer in self.edge_peers() {
            if skip.contains(&peer.node_id()) || peer.endpoint().is_none() {
                continue;
            }
            self.send_to_peer(&peer, usage, packet.to_vec()).await;
            sent += 1;
        }
        sent
    }

    /// Send to the next hop towards `dst`.
    pub(crate) async fn send_unicast(&self, usage: Usage, packet: &[u8], dst: NodeId) -> usize {
        let me = self.node_id();
        let Some(next) = self.nh.load().next(me, dst) else {
            trace!(%dst, "No next hop");
            self.drop_packet(DropReason::NoRoute);
            return 0;
        };
        let Some(peer) = self.peer_by_id(next) else {
            trace!(%dst, %next, "Next hop is not a peer");
            self.drop_packet(DropReason::NoRoute);
            return 0;
        };
        self.send_to_peer(&peer, usage, packet.to_vec()).await;
        1
    }

    pub(crate) async fn send_to_super(&self, usage: Usage, packet: &[u8]) -> usize {
        let mut sent = 0;
        for peer in self.super_peers() {
            self.send_to_peer(&peer, usage, packet.to_vec()).await;
            sent += 1;
        }
        sent
    }

    /// Probe the one-way latency to a direct neighbor.
    pub(crate) async fn send_ping(&self, peer: &Arc<Peer>, request_reply: u8) {
        let me = self.node_id();
        let ping = PingMsg {
            request_id: rand::random(),
            src_node_id: me,
            time_ms: self.graph().current_time_ms(),
            request_reply,
        };
        match OverlayHeader::wrap(me, NodeId::CONTROL_MESSAGE, 0, &ping.encode()) {
            Ok(packet) => {
                self.send_to_peer(peer, Usage::Ping, packet).await;
            }
            Err(e) => debug!(error = %e, "Cannot wrap ping"),
        }
    }

    // === TAP ===

    /// Read frames from the TAP and send them into the mesh.
    pub(crate) async fn run_tap_reader(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(tap = %self.tap.name(), "TAP reader started");
        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
        let mut failures = 0u32;
        loop {
            let result = tokio::select! {
                _ = shutdown.changed() => break,
                result = self.tap.read(&mut buf, 0) => result,
            };
            match result {
                Ok(n) => {
                    failures = 0;
                    self.handle_tap_frame(&buf[..n]).await;
                }
                Err(TapError::Closed) => break,
                Err(e) if failures < MAX_TAP_READ_FAILURES => {
                    failures += 1;
                    warn!(error = %e, failures, "TAP read failed, retrying");
                    tokio::time::sleep(TAP_RETRY_DELAY).await;
                }
                Err(e) => {
                    warn!(error = %e, "TAP read failed, stopping reader");
                    break;
                }
            }
        }
        info!(tap = %self.tap.name(), "TAP reader stopped");
    }

    /// Wrap one Ethernet frame and route it by destination MAC.
    pub(crate) async fn handle_tap_frame(&self, frame: &[u8]) {
        if frame.len() <= ETHERNET_ADDRS_LEN {
            self.drop_packet(DropReason::MalformedPacket);
            return;
        }
        let dst = MacAddr::dst_of(frame)
            .filter(|mac| mac.is_unicast())
            .and_then(|mac| self.l2fib().lookup(&mac, Instant::now()))
            .unwrap_or(NodeId::BROADCAST);
        match OverlayHeader::wrap(self.node_id(), dst, self.settings.default_ttl, frame) {
            Ok(packet) => {
                self.send_packet(Usage::NormalPacket, packet).await;
            }
            Err(e) => {
                trace!(error = %e, "Frame too large for overlay");
                self.drop_packet(DropReason::MalformedPacket);
            }
        }
    }
}
