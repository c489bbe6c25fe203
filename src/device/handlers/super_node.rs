//! Edge reports processed by a super device.

use crate::control::ERR_REMOVED;
use crate::device::{Device, DeviceError, DropReason};
use crate::peer::Peer;
use crate::protocol::{
    ControlMessage, NodeId, OverlayHeader, ServerAction, ServerUpdateMsg, Usage,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

impl Device {
    pub(crate) async fn handle_super_packet(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        usage: Usage,
        header: OverlayHeader,
        body: &[u8],
    ) {
        if !usage.is_edge_to_super()
            || (header.dst != NodeId::SUPER_NODE_MESSAGE && header.dst != NodeId::CONTROL_MESSAGE)
        {
            trace!(%peer, %usage, dst = %header.dst, "Unexpected packet on super");
            self.drop_packet(DropReason::MalformedPacket);
            return;
        }
        let Some(state) = self.super_state.clone() else {
            return;
        };

        match ControlMessage::decode(usage, body) {
            Ok(ControlMessage::Register(reg)) => {
                if let Err((code, reason)) = state.check_register(peer.node_id(), &reg) {
                    warn!(%peer, code, reason = %reason, "Register rejected");
                    let update = ServerUpdateMsg {
                        node_id: peer.node_id(),
                        action: ServerAction::ThrowError,
                        code,
                        params: reason,
                    };
                    self.send_server_update(peer, &update).await;
                    return;
                }
                let Some(endpoint) = peer.endpoint() else {
                    return;
                };
                let changed = state.record_register(&reg, &endpoint, Instant::now());
                trace!(%peer, changed, "Register");
                self.push_updates(false).await;
            }
            Ok(ControlMessage::Pong(pong)) => {
                if state.record_pong(&pong) {
                    debug!(src = %pong.src_node_id, dst = %pong.dst_node_id, "Next-hop table changed");
                    self.push_updates(false).await;
                }
            }
            Ok(_) => self.drop_packet(DropReason::MalformedPacket),
            Err(e) => {
                debug!(%peer, %usage, error = %e, "Bad edge report");
                self.drop_packet(DropReason::MalformedPacket);
            }
        }
    }

    /// Send every pending `ServerUpdate` to the edges this device holds
    /// sessions with. With `force`, every alive edge gets both hashes.
    pub(crate) async fn push_updates(&self, force: bool) {
        let Some(state) = self.super_state.as_ref() else {
            return;
        };
        for update in state.pending_updates(Instant::now(), force) {
            match self.peer_by_id(update.node_id) {
                Some(peer) => self.send_server_update(&peer, &update).await,
                None => trace!(node = %update.node_id, "No session for update"),
            }
        }
    }

    async fn send_server_update(&self, peer: &Arc<Peer>, update: &ServerUpdateMsg) {
        match OverlayHeader::wrap(
            NodeId::SUPER_NODE_MESSAGE,
            NodeId::SUPER_NODE_MESSAGE,
            0,
            &update.encode(),
        ) {
            Ok(packet) => {
                trace!(%peer, action = %update.action, "Server update");
                self.send_to_peer(peer, Usage::ServerUpdate, packet).await;
            }
            Err(e) => debug!(error = %e, "Cannot wrap server update"),
        }
    }

    /// Tell an edge it was removed, then forget it.
    pub async fn remove_edge(&self, id: NodeId) -> Result<(), DeviceError> {
        let peer = self
            .peer_by_id(id)
            .ok_or_else(|| DeviceError::PeerNotFound(id.to_string()))?;
        let update = ServerUpdateMsg {
            node_id: id,
            action: ServerAction::Shutdown,
            code: ERR_REMOVED,
            params: "removed by super".to_string(),
        };
        self.send_server_update(&peer, &update).await;
        if let Some(state) = self.super_state.as_ref() {
            state.remove_peer(id);
        }
        self.remove_peer(peer.public_key()).await?;
        info!(node = %id, "Edge removed");
        Ok(())
    }
}
