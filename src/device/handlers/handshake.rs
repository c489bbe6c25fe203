//! Handshake worker: initiations, responses and cookie replies.

use crate::device::{lock, Device, DropReason};
use crate::noise::{
    HandshakeProgress, InitiationScan, MessageCookieReply, MessageInitiation, MessageResponse,
    NoiseError,
};
use crate::peer::Peer;
use crate::protocol::Usage;
use crate::transport::ReceivedPacket;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

impl Device {
    /// Process one message from the handshake queue.
    pub(crate) async fn handle_handshake(self: &Arc<Self>, packet: ReceivedPacket) {
        let Some(usage) = packet.data.first().and_then(|b| Usage::from_byte(*b)) else {
            self.drop_packet(DropReason::MalformedPacket);
            return;
        };
        if usage == Usage::CookieReply {
            self.handle_cookie_reply(&packet);
            return;
        }

        let now = Instant::now();
        if !lock(&self.cookie_checker).check_mac1(&packet.data) {
            trace!(from = %packet.endpoint, %usage, "Handshake mac1 invalid");
            self.drop_packet(DropReason::AuthFailed);
            return;
        }
        if self.is_under_load(now) && !self.admit_under_load(&packet).await {
            return;
        }

        match usage {
            Usage::Initiation => self.handle_initiation(&packet, now).await,
            Usage::Response => self.handle_response(&packet, now).await,
            _ => self.drop_packet(DropReason::MalformedPacket),
        }
    }

    /// Under load, a message needs a valid mac2 and must fit the source's
    /// rate budget. Without mac2 the sender gets a cookie reply instead.
    async fn admit_under_load(&self, packet: &ReceivedPacket) -> bool {
        let src = packet.endpoint.dst();
        let mut sender = [0u8; 4];
        sender.copy_from_slice(&packet.data[1..5]);
        let sender = u32::from_le_bytes(sender);

        let reply = {
            let mut checker = lock(&self.cookie_checker);
            if checker.check_mac2(&packet.data, &src) {
                None
            } else {
                Some(checker.create_reply(&packet.data, sender, &src))
            }
        };
        match reply {
            Some(Ok(reply)) => {
                match self.bind.send(&reply.to_bytes(), &packet.endpoint).await {
                    Ok(()) => self.stats.add_cookie_reply(),
                    Err(e) => debug!(error = %e, "Failed to send cookie reply"),
                }
                return false;
            }
            Some(Err(e)) => {
                debug!(error = %e, "Failed to create cookie reply");
                self.drop_packet(DropReason::MalformedPacket);
                return false;
            }
            None => {}
        }

        if !lock(&self.rate_limiter).allow(src.ip()) {
            trace!(from = %src, "Handshake rate limited");
            self.drop_packet(DropReason::ResourceExhausted);
            return false;
        }
        true
    }

    fn handle_cookie_reply(&self, packet: &ReceivedPacket) {
        let reply = match MessageCookieReply::from_bytes(&packet.data) {
            Ok(reply) => reply,
            Err(_) => {
                self.drop_packet(DropReason::MalformedPacket);
                return;
            }
        };
        let Some((peer, _)) = self.index_table.lookup(reply.receiver) else {
            self.drop_packet(DropReason::PeerUnknown);
            return;
        };
        if let Err(e) = peer.cookie_generator().consume_reply(&reply) {
            debug!(%peer, error = %e, "Cookie reply rejected");
            self.drop_packet(DropReason::AuthFailed);
            return;
        }
        debug!(%peer, "Cookie stored");
    }

    async fn handle_initiation(self: &Arc<Self>, packet: &ReceivedPacket, now: Instant) {
        let msg = match MessageInitiation::from_bytes(&packet.data) {
            Ok(msg) => msg,
            Err(_) => {
                self.drop_packet(DropReason::MalformedPacket);
                return;
            }
        };
        let scan = {
            let identity = self.identity();
            InitiationScan::scan(&msg, &identity)
        };
        let scan = match scan {
            Ok(scan) => scan,
            Err(e) => {
                debug!(from = %packet.endpoint, error = %e, "Initiation not for us");
                self.drop_packet(DropReason::AuthFailed);
                return;
            }
        };
        let Some(peer) = self.peer_by_key(&scan.remote_static) else {
            debug!(from = %packet.endpoint, key = %scan.remote_static, "Initiation from unknown key");
            self.drop_packet(DropReason::PeerUnknown);
            return;
        };
        if !peer.is_running() {
            return;
        }

        let index = match self.index_table.new_index(&peer) {
            Ok(index) => index,
            Err(e) => {
                warn!(%peer, error = %e, "Cannot allocate session index");
                self.drop_packet(DropReason::ResourceExhausted);
                return;
            }
        };

        let result = {
            let mut hs = peer.handshake();
            let stale = (hs.progress() != HandshakeProgress::Zeroed).then(|| hs.local_index());
            hs.consume_initiation(scan, &msg)
                .and_then(|()| hs.create_response(index))
                .and_then(|response| {
                    let keypair = hs.derive_keypair()?;
                    hs.set_last_sent_handshake(Some(now));
                    Ok((response, keypair, stale))
                })
        };
        let (response, keypair, stale) = match result {
            Ok(v) => v,
            Err(e) => {
                self.index_table.delete(index);
                match e {
                    NoiseError::StaleTimestamp | NoiseError::InitiationFlood => {
                        debug!(%peer, error = %e, "Initiation ignored");
                    }
                    _ => {
                        debug!(%peer, error = %e, "Initiation rejected");
                        self.drop_packet(DropReason::AuthFailed);
                    }
                }
                return;
            }
        };
        if let Some(stale) = stale.filter(|s| *s != index) {
            self.index_table.delete(stale);
        }

        let keypair = Arc::new(keypair);
        if let Err(e) = self.index_table.set_keypair(index, keypair.clone()) {
            warn!(%peer, error = %e, "Session index vanished");
            return;
        }
        let evicted = peer.keypairs().install(keypair);
        for old in evicted {
            self.index_table.delete(old.local_index());
        }
        self.update_endpoint_from(&peer, packet.endpoint);

        let mut bytes = response.to_bytes();
        peer.cookie_generator().add_macs(&mut bytes);
        self.mark_session_up(&peer, now, false);
        {
            let mut timers = peer.timers();
            timers.any_authenticated_packet_traversal(now);
            timers.any_authenticated_packet_sent();
        }

        debug!(%peer, from = %packet.endpoint, "Handshake response sent");
        if let Err(e) = self.bind.send(&bytes, &packet.endpoint).await {
            debug!(%peer, error = %e, "Failed to send handshake response");
        }
    }

    async fn handle_response(self: &Arc<Self>, packet: &ReceivedPacket, now: Instant) {
        let msg = match MessageResponse::from_bytes(&packet.data) {
            Ok(msg) => msg,
            Err(_) => {
                self.drop_packet(DropReason::MalformedPacket);
                return;
            }
        };
        let Some((peer, _)) = self.index_table.lookup(msg.receiver) else {
            self.drop_packet(DropReason::PeerUnknown);
            return;
        };

        let result = {
            let identity = self.identity();
            let mut hs = peer.handshake();
            if hs.local_index() != msg.receiver {
                Err(NoiseError::WrongState {
                    expected: HandshakeProgress::InitiationCreated,
                    got: hs.progress(),
                })
            } else {
                hs.consume_response(&msg, &identity)
                    .and_then(|()| hs.derive_keypair())
            }
        };
        let keypair = match result {
            Ok(keypair) => Arc::new(keypair),
            Err(e) => {
                debug!(%peer, error = %e, "Handshake response rejected");
                self.drop_packet(DropReason::AuthFailed);
                return;
            }
        };

        if let Err(e) = self.index_table.set_keypair(msg.receiver, keypair.clone()) {
            warn!(%peer, error = %e, "Session index vanished");
            return;
        }
        let evicted = peer.keypairs().install(keypair);
        for old in evicted {
            self.index_table.delete(old.local_index());
        }
        self.update_endpoint_from(&peer, packet.endpoint);
        self.mark_session_up(&peer, now, true);
        {
            let mut timers = peer.timers();
            timers.any_authenticated_packet_received();
            timers.any_authenticated_packet_traversal(now);
        }
        debug!(%peer, from = %packet.endpoint, "Handshake complete");

        // The responder cannot send until it hears from us
        self.send_keepalive(&peer).await;
        if peer.is_super() {
            self.register_now.notify_one();
        }
    }

    fn mark_session_up(&self, peer: &Peer, now: Instant, initiator: bool) {
        {
            let mut timers = peer.timers();
            if initiator {
                timers.handshake_complete();
            }
            timers.session_derived(now);
        }
        peer.stats().mark_handshake();
        peer.mark_dead(false);
        peer.touch(now);
    }
}
