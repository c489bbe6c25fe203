//! Periodic background routines.
//!
//! Edges ping their neighbors, register with the super, recompute routes
//! while no super table is in force, spread neighbor lists, re-resolve
//! static peers and probe candidate endpoints for peers that went quiet.
//! A super re-pushes state hashes and expires silent edges.

use crate::cache::CacheStats;
use crate::device::{lock, Device, NodeRole};
use crate::protocol::{NodeId, OverlayHeader, QueryPeerMsg, RegisterMsg, Usage};
use crate::routing::sync_offset;
use crate::transport::parse_endpoint;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Below this, re-resolving static peers is disabled.
const MIN_RESET_CONN_INTERVAL: Duration = Duration::from_millis(10);
/// Flood cache fill ratio worth a warning.
const DUP_CACHE_HIGH_WATER: f64 = 0.9;
/// Spacing of probe pings sent to a freshly tried endpoint.
const PROBE_PING_INTERVAL: Duration = Duration::from_secs(1);

/// Sleep for `period`, or until `kick` fires. Returns false on shutdown.
async fn wait_or_kick(
    shutdown: &mut watch::Receiver<bool>,
    period: Duration,
    kick: Option<&Notify>,
) -> bool {
    let kicked = async {
        match kick {
            Some(notify) => notify.notified().await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        _ = shutdown.changed() => false,
        _ = tokio::time::sleep(period) => true,
        _ = kicked => true,
    }
}

/// Run `body` now and then every `period` until shutdown.
fn every<F, Fut>(
    shutdown: &watch::Receiver<bool>,
    period: Duration,
    body: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut shutdown = shutdown.clone();
    tokio::spawn(async move {
        loop {
            body().await;
            if !wait_or_kick(&mut shutdown, period, None).await {
                break;
            }
        }
    })
}

impl Device {
    pub(crate) fn spawn_routines(self: &Arc<Self>, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        match self.role() {
            NodeRole::Edge => self.spawn_edge_routines(shutdown),
            NodeRole::Super => self.spawn_super_routines(shutdown),
        }
    }

    fn spawn_edge_routines(self: &Arc<Self>, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let s = &self.settings;
        let dynamic = s.use_p2p || s.use_super_node;
        let mut tasks = Vec::new();

        if dynamic && !s.send_ping_interval.is_zero() {
            let device = Arc::clone(self);
            let mut shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    device.ping_neighbors().await;
                    let period = device.settings.send_ping_interval;
                    if !wait_or_kick(&mut shutdown, period, Some(&device.ping_now)).await {
                        break;
                    }
                }
            }));
        }

        if s.use_super_node && !s.send_ping_interval.is_zero() {
            let device = Arc::clone(self);
            let mut shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    device.send_register().await;
                    let period = device.settings.send_ping_interval;
                    if !wait_or_kick(&mut shutdown, period, Some(&device.register_now)).await {
                        break;
                    }
                }
            }));
        }

        if s.use_p2p && !s.timeout_check_interval.is_zero() {
            let device = Arc::clone(self);
            tasks.push(every(shutdown, s.timeout_check_interval, move || {
                let device = device.clone();
                async move {
                    let mut graph = device.graph();
                    if graph.nh_table_expired() {
                        graph.recalculate(false);
                    }
                }
            }));
        }

        if s.use_p2p && !s.send_peer_interval.is_zero() {
            let device = Arc::clone(self);
            tasks.push(every(shutdown, s.send_peer_interval, move || {
                let device = device.clone();
                async move {
                    let query = QueryPeerMsg {
                        request_id: u32::from(NodeId::BROADCAST.0),
                    };
                    device.handle_query_peer(query).await;
                }
            }));
        }

        if s.reset_conn_interval > MIN_RESET_CONN_INTERVAL {
            let device = Arc::clone(self);
            tasks.push(every(shutdown, s.reset_conn_interval, move || {
                let device = device.clone();
                async move { device.reset_static_endpoints().await }
            }));
        }

        if !s.l2fib_timeout.is_zero() {
            let device = Arc::clone(self);
            tasks.push(every(shutdown, s.l2fib_timeout, move || {
                let device = device.clone();
                async move {
                    device.expire_caches(Instant::now());
                }
            }));
        }

        if !s.conn_timeout.is_zero() {
            let device = Arc::clone(self);
            tasks.push(every(shutdown, s.conn_timeout, move || {
                let device = device.clone();
                async move { device.try_endpoint.notify_one() }
            }));
        }

        {
            let device = Arc::clone(self);
            let mut shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = device.try_endpoint.notified() => {}
                    }
                    device.try_candidate_endpoints();
                    let pause = device.settings.conn_next_try;
                    if !pause.is_zero() && !wait_or_kick(&mut shutdown, pause, None).await {
                        break;
                    }
                }
            }));
        }

        if s.ntp.use_ntp && !s.ntp.sync_time_interval.is_zero() {
            let device = Arc::clone(self);
            tasks.push(every(shutdown, s.ntp.sync_time_interval, move || {
                let device = device.clone();
                async move {
                    if let Some(offset) = sync_offset(&device.settings.ntp).await {
                        device.graph().set_ntp_offset_ms(offset);
                    }
                }
            }));
        }

        tasks
    }

    fn spawn_super_routines(self: &Arc<Self>, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let s = &self.settings;
        let mut tasks = Vec::new();

        if !s.repush_interval.is_zero() {
            let device = Arc::clone(self);
            tasks.push(every(shutdown, s.repush_interval, move || {
                let device = device.clone();
                async move { device.push_updates(true).await }
            }));
        }

        if !s.timeout_check_interval.is_zero() {
            let device = Arc::clone(self);
            tasks.push(every(shutdown, s.timeout_check_interval, move || {
                let device = device.clone();
                async move {
                    let Some(state) = device.super_state.clone() else {
                        return;
                    };
                    let peers_changed = state.refresh(Instant::now());
                    let nh_changed = state.recalculate();
                    if peers_changed || nh_changed {
                        debug!(peers_changed, nh_changed, "Super state changed");
                        device.push_updates(false).await;
                    }
                }
            }));
        }

        tasks
    }

    // === Routine bodies ===

    /// Purge expired L2 and flood entries. Returns the stats left behind.
    pub(crate) fn expire_caches(&self, now: Instant) -> (CacheStats, CacheStats) {
        let (cleared, fib) = {
            let mut l2fib = self.l2fib();
            (l2fib.clear_expired(now), l2fib.stats(now))
        };
        let (purged, dup) = {
            let mut cache = lock(&self.dup);
            (cache.purge_expired(now), cache.stats(now))
        };
        trace!(
            cleared,
            purged,
            l2fib = fib.entries,
            dup = dup.entries,
            "Forwarding caches expired"
        );
        if dup.fill_ratio() > DUP_CACHE_HIGH_WATER {
            warn!(
                entries = dup.entries,
                max = dup.max_entries,
                "Flood duplicate cache nearly full"
            );
        }
        (fib, dup)
    }

    async fn ping_neighbors(&self) {
        for peer in self.edge_peers() {
            if peer.is_running() && peer.endpoint().is_some() {
                self.send_ping(&peer, 0).await;
            }
        }
    }

    async fn send_register(&self) {
        let me = self.node_id();
        let msg = RegisterMsg {
            node_id: me,
            version: self.settings.version.clone(),
            peer_state_hash: self.peer_state_hash(),
            nh_state_hash: self.nh_state_hash(),
        };
        match OverlayHeader::wrap(me, NodeId::SUPER_NODE_MESSAGE, 0, &msg.encode()) {
            Ok(packet) => {
                let sent = self.send_to_super(Usage::Register, &packet).await;
                trace!(sent, "Register sent");
            }
            Err(e) => debug!(error = %e, "Cannot wrap register"),
        }
    }

    /// Re-resolve the configured URL of every static peer.
    async fn reset_static_endpoints(&self) {
        for peer in self.peers() {
            if !peer.is_static() {
                continue;
            }
            let Some(url) = peer.conn_url().map(str::to_string) else {
                continue;
            };
            match parse_endpoint(&url).await {
                Ok(endpoint) => {
                    if peer.endpoint().map(|e| e.dst()) != Some(endpoint.dst()) {
                        info!(%peer, to = %endpoint, "Static endpoint re-resolved");
                    }
                    peer.set_endpoint(endpoint);
                }
                Err(e) => debug!(%peer, url = %url, error = %e, "Cannot re-resolve endpoint"),
            }
        }
    }

    /// Point every silent peer at its next candidate endpoint. A candidate
    /// on its first try gets a burst of probe pings.
    fn try_candidate_endpoints(self: &Arc<Self>) {
        let now = Instant::now();
        for peer in self.edge_peers() {
            if peer.is_static() || peer.is_alive(now) {
                continue;
            }
            let candidate = peer.try_list().next_try(now);
            let Some((fast_try, url)) = candidate else {
                continue;
            };
            let device = Arc::clone(self);
            self.spawn_background(async move {
                let endpoint = match parse_endpoint(&url).await {
                    Ok(endpoint) => endpoint,
                    Err(e) => {
                        debug!(%peer, url = %url, error = %e, "Dropping unusable candidate");
                        peer.try_list().delete(&url);
                        return;
                    }
                };
                debug!(%peer, to = %endpoint, fast_try, "Trying endpoint");
                peer.set_endpoint(endpoint);
                if fast_try {
                    let probes = device.settings.conn_next_try.as_secs() + 1;
                    for i in 0..probes {
                        if i > 0 {
                            tokio::time::sleep(PROBE_PING_INTERVAL).await;
                        }
                        if device.is_shutting_down() {
                            break;
                        }
                        device.send_ping(&peer, 1).await;
                    }
                }
            });
        }
    }
}
