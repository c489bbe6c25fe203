//! Overlay packet forwarding on edges.
//!
//! A decrypted payload is an overlay header plus an inner packet. Each
//! packet is independently considered for three actions, in this order:
//! transfer to other nodes, delivery to the TAP, and local processing as
//! a control message.

use crate::device::{lock, Device, DropReason, NodeRole};
use crate::peer::Peer;
use crate::protocol::{NodeId, OverlayHeader, Usage, OVERLAY_HEADER_SIZE};
use crate::tap::{MacAddr, ETHERNET_ADDRS_LEN};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

/// Fingerprint input for flood duplicate suppression: origin, usage and
/// inner packet. The TTL changes per hop and is left out.
fn flood_key(header: &OverlayHeader, usage: Usage, body: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(3 + body.len());
    key.extend_from_slice(&header.src.0.to_be_bytes());
    key.push(usage.to_byte());
    key.extend_from_slice(body);
    key
}

impl Device {
    /// Entry point for a decrypted, authenticated payload from `peer`.
    pub(crate) async fn handle_overlay_packet(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        usage: Usage,
        payload: &[u8],
    ) {
        if payload.len() <= OVERLAY_HEADER_SIZE {
            self.drop_packet(DropReason::MalformedPacket);
            return;
        }
        let (header, body) = match OverlayHeader::split(payload) {
            Ok(split) => split,
            Err(e) => {
                trace!(%peer, error = %e, "Bad overlay header");
                self.drop_packet(DropReason::MalformedPacket);
                return;
            }
        };
        match self.role() {
            NodeRole::Edge => self.handle_edge_packet(peer, usage, header, body).await,
            NodeRole::Super => self.handle_super_packet(peer, usage, header, body).await,
        }
    }

    async fn handle_edge_packet(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        usage: Usage,
        header: OverlayHeader,
        body: &[u8],
    ) {
        let me = self.node_id();
        let for_us = header.dst == me
            || header.dst == NodeId::BROADCAST
            || header.dst == NodeId::CONTROL_MESSAGE;

        let (deliver, process) = if usage.is_normal() {
            (for_us, false)
        } else if usage.is_edge_to_edge() {
            (false, for_us)
        } else if usage.is_super_to_edge() {
            if !peer.is_super() {
                debug!(%peer, %usage, "Server message from an edge");
                self.drop_packet(DropReason::MalformedPacket);
                return;
            }
            (false, header.dst == me || header.dst == NodeId::SUPER_NODE_MESSAGE)
        } else {
            debug!(%peer, %usage, "Unexpected usage on an edge");
            self.drop_packet(DropReason::MalformedPacket);
            return;
        };

        let transfer = match header.dst {
            NodeId::BROADCAST => true,
            NodeId::CONTROL_MESSAGE => {
                let key = flood_key(&header, usage, body);
                if lock(&self.dup).check_and_insert(&key, Instant::now()) {
                    trace!(src = %header.src, %usage, "Duplicate flood dropped");
                    return;
                }
                true
            }
            dst if dst == me || dst.is_special() => false,
            dst => {
                if self.nh.load().next(me, dst).is_some() {
                    true
                } else {
                    trace!(src = %header.src, %dst, "No route for transit packet");
                    self.drop_packet(DropReason::NoRoute);
                    false
                }
            }
        };

        if transfer {
            self.transfer_packet(peer, usage, header, body).await;
        }
        if deliver {
            self.deliver_frame(header.src, body).await;
        }
        if process {
            self.handle_control(peer, usage, header, body).await;
        }
    }

    /// Forward a packet that is not (only) for us with its TTL reduced.
    async fn transfer_packet(
        &self,
        from: &Arc<Peer>,
        usage: Usage,
        header: OverlayHeader,
        body: &[u8],
    ) {
        if header.ttl == 0 {
            debug!(
                target: "meshguard::transit",
                src = %header.src,
                dst = %header.dst,
                "TTL expired"
            );
            return;
        }
        let packet = match OverlayHeader::wrap(header.src, header.dst, header.ttl - 1, body) {
            Ok(packet) => packet,
            Err(_) => {
                self.drop_packet(DropReason::MalformedPacket);
                return;
            }
        };

        let sent = match header.dst {
            NodeId::BROADCAST => {
                self.transit_broadcast(usage, &packet, header.src, from.node_id())
                    .await
            }
            NodeId::CONTROL_MESSAGE => {
                self.spread_packet(usage, &packet, &[header.src, from.node_id()])
                    .await
            }
            dst => self.send_unicast(usage, &packet, dst).await,
        };
        if sent > 0 {
            trace!(
                target: "meshguard::transit",
                src = %header.src,
                dst = %header.dst,
                via = %from.node_id(),
                fanout = sent,
                "Transit"
            );
            self.stats.add_transit();
        }
    }

    /// Write an Ethernet frame to the TAP, learning its source MAC.
    async fn deliver_frame(&self, src: NodeId, frame: &[u8]) {
        if frame.len() <= ETHERNET_ADDRS_LEN {
            self.drop_packet(DropReason::MalformedPacket);
            return;
        }
        if let Some(mac) = MacAddr::src_of(frame).filter(|m| m.is_unicast()) {
            self.l2fib().learn(mac, src, Instant::now());
        }
        match self.tap.write(frame, 0).await {
            Ok(_) => self.stats.add_delivered(),
            Err(e) => debug!(error = %e, "TAP write failed"),
        }
    }
}
