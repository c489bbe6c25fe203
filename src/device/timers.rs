//! Session timer tick.

use crate::device::Device;
use crate::peer::{Peer, TimerEvent};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

const TIMER_TICK: Duration = Duration::from_millis(100);

impl Device {
    /// Poll every running peer's timers until shutdown.
    pub(crate) async fn run_timers(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(TIMER_TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tick.tick() => {}
            }
            let now = Instant::now();
            for peer in self.peers() {
                if peer.is_running() {
                    self.poll_peer_timers(&peer, now).await;
                }
            }
        }
        trace!("Timer loop stopped");
    }

    async fn poll_peer_timers(&self, peer: &Arc<Peer>, now: Instant) {
        let expired = peer.keypairs().expire_previous();
        if let Some(old) = expired {
            self.index_table.delete(old.local_index());
        }

        let events = peer.timers().poll(now);
        for event in events {
            match event {
                TimerEvent::RetransmitHandshake => {
                    let attempt = peer.timers().next_attempt(now);
                    match attempt {
                        Some(attempt) => {
                            debug!(%peer, attempt, "Handshake did not complete, retrying");
                            peer.clear_endpoint_src();
                            self.send_handshake_initiation(peer, true).await;
                        }
                        None => {
                            debug!(%peer, "Handshake did not complete, giving up");
                            peer.staged().clear();
                        }
                    }
                }
                TimerEvent::SendKeepalive => {
                    self.send_keepalive(peer).await;
                    peer.timers().keepalive_sent(now);
                }
                TimerEvent::PersistentKeepalive => {
                    trace!(%peer, "Persistent keepalive");
                    self.send_keepalive(peer).await;
                }
                TimerEvent::NewHandshake => {
                    debug!(%peer, "No reply to data, starting new handshake");
                    peer.clear_endpoint_src();
                    self.send_handshake_initiation(peer, false).await;
                }
                TimerEvent::ZeroKeyMaterial => {
                    debug!(%peer, "Zeroing key material");
                    for index in peer.zero_keys() {
                        self.index_table.delete(index);
                    }
                }
            }
        }
    }
}
