//! Control messages processed by edges.

use crate::control::{decode_peers, verify_blob, BlobKind, ControlError, FetchParams};
use crate::device::{Device, DeviceError, DeviceEvent, DropReason};
use crate::identity::{PresharedKey, PublicKey};
use crate::peer::{Peer, PeerConfig};
use crate::protocol::{
    BroadcastPeerMsg, ControlMessage, NodeId, OverlayHeader, PingMsg, PongMsg, QueryPeerMsg,
    ServerAction, ServerUpdateMsg, Usage,
};
use crate::routing::{NextHopTable, PongSample, INFINITY};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Spacing of pings sent back when a ping asks for replies.
const PING_REPLY_INTERVAL: Duration = Duration::from_secs(3);
/// Upper bound on the pings sent back for one request.
const MAX_PING_REPLIES: u8 = 16;
/// Clock differences beyond this come from a broken clock.
const MAX_PING_AGE_SECS: f64 = 3600.0;

impl Device {
    pub(crate) async fn handle_control(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        usage: Usage,
        header: OverlayHeader,
        body: &[u8],
    ) {
        let msg = match ControlMessage::decode(usage, body) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(%peer, %usage, src = %header.src, error = %e, "Bad control message");
                self.drop_packet(DropReason::MalformedPacket);
                return;
            }
        };
        trace!(%peer, %usage, src = %header.src, "Control message");

        match msg {
            ControlMessage::Ping(ping) => self.handle_ping(peer, ping).await,
            ControlMessage::Pong(pong) => self.handle_pong(peer, pong).await,
            ControlMessage::QueryPeer(query) => {
                if self.settings.use_p2p {
                    self.handle_query_peer(query).await;
                }
            }
            ControlMessage::BroadcastPeer(announce) => {
                if self.settings.use_p2p {
                    self.handle_broadcast_peer(peer, announce).await;
                }
            }
            ControlMessage::ServerUpdate(update) => self.handle_server_update(update).await,
            ControlMessage::Register(_) => self.drop_packet(DropReason::MalformedPacket),
        }
    }

    // === Latency ===

    /// Answer a ping from a direct neighbor with a pong carrying the
    /// smoothed one-way latency.
    async fn handle_ping(self: &Arc<Self>, peer: &Arc<Peer>, ping: PingMsg) {
        let me = self.node_id();
        let now_ms = self.graph().current_time_ms();
        let sample = now_ms.saturating_sub(ping.time_ms) as f64 / 1000.0;
        if sample.abs() > MAX_PING_AGE_SECS {
            debug!(%peer, time_ms = ping.time_ms, "Ping with implausible timestamp");
            self.drop_packet(DropReason::MalformedPacket);
            return;
        }
        let timediff = peer.smooth_latency(sample, self.settings.damping_resistance);

        let pong = PongMsg {
            request_id: ping.request_id,
            src_node_id: ping.src_node_id,
            dst_node_id: me,
            timediff,
            time_to_alive: self.settings.peer_alive_timeout.as_secs_f64(),
            additional_cost: self.settings.additional_cost,
        };
        if self.settings.use_p2p {
            self.record_pong_locally(&pong);
        }

        let body = pong.encode();
        let ttl = self.settings.default_ttl;
        if self.settings.use_super_node {
            if let Ok(packet) = OverlayHeader::wrap(me, NodeId::SUPER_NODE_MESSAGE, ttl, &body) {
                self.send_to_super(Usage::Pong, &packet).await;
            }
        }
        if self.settings.use_p2p {
            if let Ok(packet) = OverlayHeader::wrap(me, NodeId::CONTROL_MESSAGE, ttl, &body) {
                self.spread_packet(Usage::Pong, &packet, &[]).await;
            }
        }

        if ping.request_reply > 0 {
            let device = Arc::clone(self);
            let peer = Arc::clone(peer);
            let count = ping.request_reply.min(MAX_PING_REPLIES);
            self.spawn_background(async move {
                for i in 0..count {
                    if i > 0 {
                        tokio::time::sleep(PING_REPLY_INTERVAL).await;
                    }
                    device.send_ping(&peer, 0).await;
                }
            });
        }
    }

    async fn handle_pong(self: &Arc<Self>, peer: &Arc<Peer>, pong: PongMsg) {
        if !self.settings.use_p2p {
            return;
        }
        self.record_pong_locally(&pong);

        if !peer.asked_for_neighbor() {
            let me = self.node_id();
            let query = QueryPeerMsg {
                request_id: u32::from(me.0),
            };
            if let Ok(packet) =
                OverlayHeader::wrap(me, peer.node_id(), self.settings.default_ttl, &query.encode())
            {
                self.send_to_peer(peer, Usage::QueryPeer, packet).await;
            }
        }
    }

    /// Feed a pong into the local graph while no super-provided table is
    /// in force.
    fn record_pong_locally(&self, pong: &PongMsg) {
        let sample = PongSample {
            src: pong.src_node_id,
            dst: pong.dst_node_id,
            timediff: pong.timediff,
            time_to_alive: pong.time_to_alive,
            additional_cost: pong.additional_cost,
        };
        let mut graph = self.graph();
        if graph.nh_table_expired() {
            graph.update_latency(&[sample], true, false);
        }
    }

    // === Peer discovery ===

    /// Announce every live neighbor and how we reach it.
    pub(crate) async fn handle_query_peer(&self, query: QueryPeerMsg) {
        let me = self.node_id();
        let now = Instant::now();
        for p in self.edge_peers() {
            if !p.is_alive(now) {
                continue;
            }
            let Some(endpoint) = p.endpoint() else {
                continue;
            };
            let psk = p.handshake().preshared_key().clone();
            let announce = BroadcastPeerMsg {
                request_id: query.request_id,
                node_id: p.node_id(),
                pubkey: *p.public_key(),
                psk,
                conn_url: endpoint.dst_to_string(),
            };
            match OverlayHeader::wrap(
                me,
                NodeId::CONTROL_MESSAGE,
                self.settings.default_ttl,
                &announce.encode(),
            ) {
                Ok(packet) => {
                    self.spread_packet(Usage::BroadcastPeer, &packet, &[]).await;
                }
                Err(e) => debug!(error = %e, "Cannot wrap peer announcement"),
            }
        }
    }

    async fn handle_broadcast_peer(self: &Arc<Self>, from: &Arc<Peer>, announce: BroadcastPeerMsg) {
        let me = self.node_id();
        if announce.request_id == u32::from(me.0) {
            from.set_asked_for_neighbor(true);
        }
        if announce.pubkey == self.public_key() || announce.node_id == me {
            return;
        }

        let now = Instant::now();
        let peer = match self.peer_by_key(&announce.pubkey) {
            Some(peer) => peer,
            None => {
                self.add_unreachable_edges(announce.node_id);
                let mut config = PeerConfig::new(announce.node_id, announce.pubkey);
                config.preshared_key = announce.psk.clone();
                config.alive_timeout = self.settings.peer_alive_timeout;
                match self.add_peer(config).await {
                    Ok(peer) => {
                        info!(%peer, via = %from, "Discovered peer");
                        if self.settings.save_new_peers {
                            self.persist_peers();
                        }
                        peer
                    }
                    Err(e) => {
                        debug!(node = %announce.node_id, error = %e, "Cannot add announced peer");
                        return;
                    }
                }
            }
        };

        if !peer.is_alive(now) {
            peer.try_list().update_p2p(&announce.conn_url, now);
            self.try_endpoint.notify_one();
        }
    }

    /// Make a new node known to the graph before any latency is measured.
    fn add_unreachable_edges(&self, id: NodeId) {
        let me = self.node_id();
        let mut graph = self.graph();
        if graph.weight(me, id, false) < INFINITY {
            return;
        }
        let time_to_alive = self.settings.peer_alive_timeout.as_secs_f64();
        let samples = [(me, id), (id, me)].map(|(src, dst)| PongSample {
            src,
            dst,
            timediff: INFINITY,
            time_to_alive,
            additional_cost: self.settings.additional_cost,
        });
        graph.update_latency(&samples, true, false);
    }

    // === Super instructions ===

    pub(crate) async fn handle_server_update(self: &Arc<Self>, update: ServerUpdateMsg) {
        let me = self.node_id();
        if update.node_id != me && update.node_id != NodeId::SUPER_NODE_MESSAGE {
            debug!(target = %update.node_id, "Server update for another node");
            return;
        }
        match update.action {
            ServerAction::NoAction => {}
            ServerAction::Shutdown => {
                warn!(reason = %update.params, "Shutdown requested by super");
                self.emit(DeviceEvent::Shutdown {
                    reason: update.params,
                });
            }
            ServerAction::ThrowError => {
                error!(code = update.code, reason = %update.params, "Error from super");
                self.emit(DeviceEvent::ThrowError {
                    code: update.code,
                    reason: update.params,
                });
            }
            ServerAction::Panic => {
                error!(reason = %update.params, "Panic requested by super");
                self.emit(DeviceEvent::Panic {
                    reason: update.params,
                });
            }
            ServerAction::UpdatePeer => {
                if let Err(e) = self.apply_peer_update(&update).await {
                    warn!(error = %e, "Peer update failed");
                }
            }
            ServerAction::UpdateNhTable => {
                if let Err(e) = self.apply_nh_update(&update).await {
                    warn!(error = %e, "Next-hop table update failed");
                }
            }
        }
    }

    async fn fetch_blob(&self, kind: BlobKind, hash: [u8; 32]) -> Result<Vec<u8>, DeviceError> {
        let fetcher = self
            .fetcher
            .clone()
            .ok_or_else(|| ControlError::NotAvailable("no edge API configured".into()))?;
        let params = FetchParams {
            node_id: self.node_id(),
            public_key: self.public_key(),
            state: hash,
        };
        let blob = fetcher.fetch(kind, &params).await?;
        verify_blob(&blob, &hash)?;
        Ok(blob)
    }

    /// Reconcile edge peers with the peer-info blob the super announced.
    async fn apply_peer_update(self: &Arc<Self>, update: &ServerUpdateMsg) -> Result<(), DeviceError> {
        let hash = update
            .params_hash()
            .ok_or_else(|| ControlError::Decode(format!("bad state hash {:?}", update.params)))?;
        if hash == self.peer_state_hash() {
            return Ok(());
        }
        let blob = self.fetch_blob(BlobKind::PeerInfo, hash).await?;
        let infos = decode_peers(&blob)?;

        let mut wanted = HashMap::new();
        for (key, info) in infos {
            let Ok(public_key) = PublicKey::from_base64(&key) else {
                warn!(key = %key, "Peer info has a bad public key");
                continue;
            };
            let psk = if info.psk.is_empty() {
                PresharedKey::default()
            } else {
                match PresharedKey::from_base64(&info.psk) {
                    Ok(psk) => psk,
                    Err(_) => {
                        warn!(node = %info.node_id, "Peer info has a bad preshared key");
                        continue;
                    }
                }
            };
            wanted.insert(public_key, (info, psk));
        }

        for peer in self.edge_peers() {
            let keep = wanted.get(peer.public_key()).is_some_and(|(info, psk)| {
                info.node_id == peer.node_id()
                    && peer.handshake().preshared_key().as_bytes() == psk.as_bytes()
            });
            if !keep {
                info!(%peer, "Peer removed by super");
                if let Err(e) = self.remove_peer(peer.public_key()).await {
                    debug!(%peer, error = %e, "Cannot remove peer");
                }
            }
        }

        let my_key = self.public_key();
        let use_local = !self.settings.skip_local_ip;
        let now = Instant::now();
        for (public_key, (info, psk)) in wanted {
            if public_key == my_key {
                continue;
            }
            let peer = match self.peer_by_key(&public_key) {
                Some(peer) => peer,
                None => {
                    if info.conn_url.is_empty() {
                        continue;
                    }
                    self.add_unreachable_edges(info.node_id);
                    let mut config = PeerConfig::new(info.node_id, public_key);
                    config.preshared_key = psk;
                    config.alive_timeout = self.settings.peer_alive_timeout;
                    match self.add_peer(config).await {
                        Ok(peer) => peer,
                        Err(e) => {
                            warn!(node = %info.node_id, error = %e, "Cannot add peer from super");
                            continue;
                        }
                    }
                }
            };
            peer.try_list().update_super(info.conn_url.candidates(use_local));
            if !peer.is_alive(now) {
                self.try_endpoint.notify_one();
            }
        }

        self.set_peer_state_hash(hash);
        info!(hash = %hex::encode(&hash[..8]), "Peer list updated");
        self.try_endpoint.notify_one();
        Ok(())
    }

    /// Install the next-hop table the super announced.
    async fn apply_nh_update(&self, update: &ServerUpdateMsg) -> Result<(), DeviceError> {
        let hash = update
            .params_hash()
            .ok_or_else(|| ControlError::Decode(format!("bad state hash {:?}", update.params)))?;
        if hash == self.nh_state_hash() {
            self.graph().refresh_nh_expire();
            return Ok(());
        }
        let blob = self.fetch_blob(BlobKind::NhTable, hash).await?;
        let table = NextHopTable::from_json(&blob)?;
        self.graph().set_nh_table(table);
        self.set_nh_state_hash(hash);
        info!(hash = %hex::encode(&hash[..8]), "Next-hop table updated");
        Ok(())
    }
}
