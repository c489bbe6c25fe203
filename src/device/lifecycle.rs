//! Device lifecycle: up, down, close, and peer management.

use crate::config::{EdgeConfig, PeerEntry};
use crate::device::handlers::{DecryptJob, EncryptJob};
use crate::device::{lock, write, Device, DeviceError, DeviceState, NodeRole, WorkQueues};
use crate::identity::{PrivateKey, PublicKey, StaticIdentity};
use crate::noise::CookieChecker;
use crate::peer::{Peer, PeerConfig};
use crate::transport::{parse_endpoint, Endpoint, ReceivedPacket};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Spawn `workers` tasks sharing one queue consumer.
fn spawn_pool<T, F, Fut>(
    name: &'static str,
    rx: mpsc::Receiver<T>,
    workers: usize,
    shutdown: &watch::Receiver<bool>,
    handler: F,
) -> Vec<tokio::task::JoinHandle<()>>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    (0..workers.max(1))
        .map(|worker| {
            let rx = rx.clone();
            let handler = handler.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                debug!(pool = name, worker, "Worker started");
                loop {
                    let item = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            _ = shutdown.changed() => None,
                            item = rx.recv() => item,
                        }
                    };
                    match item {
                        Some(item) => handler(item).await,
                        None => break,
                    }
                }
                debug!(pool = name, worker, "Worker stopped");
            })
        })
        .collect()
}

impl Device {
    // === Up / down ===

    /// Open the bind and start every task. Returns the listening port.
    pub async fn up(self: &Arc<Self>) -> Result<u16, DeviceError> {
        match self.state() {
            DeviceState::Up => return Err(DeviceError::AlreadyStarted),
            DeviceState::Closed => return Err(DeviceError::Closed),
            DeviceState::Down => {}
        }
        self.shutdown.send_replace(false);
        let (receiver, port) = self.bind.open(self.settings.listen_port).await?;

        let q = &self.settings.queues;
        let (handshake_tx, handshake_rx) = mpsc::channel(q.handshake.max(1));
        let (encryption_tx, encryption_rx) = mpsc::channel(q.encryption.max(1));
        let (decryption_tx, decryption_rx) = mpsc::channel(q.decryption.max(1));
        *lock(&self.queues) = Some(WorkQueues {
            handshake: handshake_tx,
            encryption: encryption_tx,
            decryption: decryption_tx,
        });

        let shutdown = self.shutdown.subscribe();
        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(
            Arc::clone(self).run_rx_loop(receiver, shutdown.clone()),
        ));
        tasks.extend(spawn_pool(
            "encryption",
            encryption_rx,
            q.workers,
            &shutdown,
            |job: EncryptJob| async move { job.run() },
        ));
        tasks.extend(spawn_pool(
            "decryption",
            decryption_rx,
            q.workers,
            &shutdown,
            |job: DecryptJob| async move { job.run() },
        ));
        let device = Arc::clone(self);
        tasks.extend(spawn_pool(
            "handshake",
            handshake_rx,
            1,
            &shutdown,
            move |packet: ReceivedPacket| {
                let device = device.clone();
                async move { device.handle_handshake(packet).await }
            },
        ));

        for peer in self.peers() {
            self.start_peer(&peer);
        }

        if self.role() == NodeRole::Edge {
            tasks.push(tokio::spawn(
                Arc::clone(self).run_tap_reader(shutdown.clone()),
            ));
        }
        if let Some(mut events) = self.tap.events() {
            let name = self.tap.name().to_string();
            let mut shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let event = tokio::select! {
                        _ = shutdown.changed() => break,
                        event = events.recv() => event,
                    };
                    match event {
                        Some(event) => info!(tap = %name, ?event, "TAP event"),
                        None => break,
                    }
                }
            }));
        }
        tasks.push(tokio::spawn(
            Arc::clone(self).run_timers(shutdown.clone()),
        ));
        tasks.extend(self.spawn_routines(&shutdown));
        lock(&self.tasks).extend(tasks);

        *lock(&self.state) = DeviceState::Up;
        info!(
            node = %self.node_id(),
            role = %self.role(),
            port,
            "Device up"
        );
        Ok(port)
    }

    /// Stop every task and close the bind. Peers and keys stay configured.
    pub async fn down(&self) {
        {
            let mut state = lock(&self.state);
            if *state != DeviceState::Up {
                return;
            }
            *state = DeviceState::Down;
        }
        self.shutdown.send_replace(true);
        self.bind.close();
        *lock(&self.queues) = None;

        for peer in self.peers() {
            for index in peer.stop().await {
                self.index_table.delete(index);
            }
        }
        let tasks: Vec<_> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!(node = %self.node_id(), "Device down");
    }

    /// Bring the device down for good and drop every peer.
    pub async fn close(&self) {
        self.down().await;
        // Tasks spawned while the device was never up
        self.shutdown.send_replace(true);
        let tasks: Vec<_> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        let peers = write(&self.peers).clear();
        for peer in peers {
            for index in peer.stop().await {
                self.index_table.delete(index);
            }
        }
        self.tap.close();
        *lock(&self.state) = DeviceState::Closed;
        info!(node = %self.node_id(), "Device closed");
    }

    // === Peers ===

    /// Add a peer. The configured endpoint, if any, is resolved now; a
    /// failure leaves it on the try list for later.
    pub async fn add_peer(self: &Arc<Self>, config: PeerConfig) -> Result<Arc<Peer>, DeviceError> {
        if self.state() == DeviceState::Closed {
            return Err(DeviceError::Closed);
        }
        let conn_url = config.conn_url.clone();
        let peer = {
            let identity = self.identity();
            Arc::new(Peer::new(config, &identity))
        };
        write(&self.peers).insert(Arc::clone(&peer))?;

        if let Some(url) = conn_url {
            match parse_endpoint(&url).await {
                Ok(endpoint) => peer.set_endpoint(endpoint),
                Err(e) => {
                    warn!(%peer, url = %url, error = %e, "Cannot resolve peer endpoint");
                    peer.try_list().update_p2p(&url, Instant::now());
                }
            }
        }
        if self.state().is_up() {
            self.start_peer(&peer);
        }
        info!(%peer, key = %peer.public_key(), super_node = peer.is_super(), "Peer added");
        Ok(peer)
    }

    pub async fn remove_peer(&self, key: &PublicKey) -> Result<(), DeviceError> {
        let peer = write(&self.peers)
            .remove(key)
            .ok_or_else(|| DeviceError::PeerNotFound(key.to_string()))?;
        for index in peer.stop().await {
            self.index_table.delete(index);
        }
        if !peer.is_super() {
            let id = peer.node_id();
            self.graph().remove_vertex(id, self.settings.use_p2p, false);
            self.l2fib().forget_node(id);
        }
        info!(%peer, "Peer removed");
        Ok(())
    }

    /// Replace the static private key. Every session is dropped and
    /// re-handshaken on demand.
    pub async fn set_private_key(&self, key: PrivateKey) {
        let identity = StaticIdentity::new(key);
        let public_key = *identity.public_key();
        *lock(&self.cookie_checker) = CookieChecker::new(&public_key);
        {
            let mut guard = write(&self.identity);
            *guard = identity;
        }
        let peers = self.peers();
        {
            let identity = self.identity();
            for peer in &peers {
                peer.handshake().set_local_identity(&identity);
            }
        }
        for peer in &peers {
            for index in peer.zero_keys() {
                self.index_table.delete(index);
            }
        }
        if peers.iter().any(|p| *p.public_key() == public_key) {
            if let Err(e) = self.remove_peer(&public_key).await {
                debug!(key = %public_key, error = %e, "Cannot remove own key as peer");
            }
        }
        info!(key = %public_key, "Private key changed");
    }

    /// Start the peer's queues and its two sequential tasks.
    fn start_peer(self: &Arc<Self>, peer: &Arc<Peer>) {
        let Some(receivers) = peer.start() else {
            return;
        };
        let sender = tokio::spawn(
            Arc::clone(self).run_sequential_sender(Arc::clone(peer), receivers.outbound),
        );
        let receiver = tokio::spawn(
            Arc::clone(self).run_sequential_receiver(Arc::clone(peer), receivers.inbound),
        );
        peer.add_task(sender);
        peer.add_task(receiver);
        debug!(%peer, "Peer started");
    }

    // === Endpoints ===

    /// Adopt the source of an authenticated packet as the peer's endpoint.
    pub(crate) fn update_endpoint_from(&self, peer: &Arc<Peer>, endpoint: Endpoint) {
        let changed = match peer.endpoint() {
            None => {
                peer.set_endpoint(endpoint);
                true
            }
            Some(_) => {
                let roamed = peer.roam_to(endpoint);
                if roamed {
                    debug!(%peer, to = %endpoint, "Peer roamed");
                }
                roamed
            }
        };
        if changed && self.settings.save_new_peers && !peer.is_static() {
            self.persist_peers();
        }
    }

    /// Write the current edge peers back to the config file.
    pub(crate) fn persist_peers(&self) {
        if self.role() != NodeRole::Edge {
            return;
        }
        let Some(path) = self.settings.config_path.as_ref() else {
            return;
        };
        let entries: Vec<PeerEntry> = self
            .edge_peers()
            .iter()
            .map(|peer| {
                let psk = peer.handshake().preshared_key().to_base64();
                let endpoint = match (peer.is_static(), peer.conn_url()) {
                    (true, Some(url)) => url.to_string(),
                    _ => peer
                        .endpoint()
                        .map(|e| e.dst_to_string())
                        .unwrap_or_default(),
                };
                PeerEntry {
                    node_id: peer.node_id(),
                    pub_key: peer.public_key().to_base64(),
                    psk,
                    endpoint,
                    persistent_keepalive: peer.timers().persistent_keepalive_interval().as_secs()
                        as u32,
                    static_conn: peer.is_static(),
                }
            })
            .collect();
        match EdgeConfig::save_peers(path, &entries) {
            Ok(()) => debug!(path = %path.display(), peers = entries.len(), "Peers saved"),
            Err(e) => warn!(path = %path.display(), error = %e, "Cannot save peers"),
        }
    }
}
