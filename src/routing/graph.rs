//! Latency graph and Floyd-Warshall.

use super::{DistTable, NextHopTable, RoutingError, SharedNhTable, INFINITY};
use crate::protocol::NodeId;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, warn};

/// Ten years; longer sample lifetimes are clamped to this.
const MAX_SAMPLE_LIFETIME: f64 = 10.0 * 365.0 * 86400.0;

/// Convert seconds from the wire into a duration, clamping garbage.
pub(crate) fn secs(x: f64) -> Duration {
    if x.is_nan() || x <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(x.min(MAX_SAMPLE_LIFETIME))
}

/// Recalculation and damping parameters.
#[derive(Clone, Debug)]
pub struct GraphSettings {
    /// Never compute; only use tables handed to `set_nh_table`.
    pub static_mode: bool,
    /// Milliseconds.
    pub jitter_tolerance: f64,
    pub jitter_tolerance_multiplier: f64,
    pub recalculate_cooldown: Duration,
    pub timeout_check_interval: Duration,
    /// How long a table installed from the super stays authoritative.
    pub super_node_info_timeout: Duration,
    /// Super nodes damp by absolute difference, edges by weight bucket.
    pub super_mode: bool,
}

impl Default for GraphSettings {
    fn default() -> Self {
        Self {
            static_mode: false,
            jitter_tolerance: 0.0,
            jitter_tolerance_multiplier: 1.0,
            recalculate_cooldown: Duration::ZERO,
            timeout_check_interval: Duration::from_secs(5),
            super_node_info_timeout: Duration::ZERO,
            super_mode: false,
        }
    }
}

/// One latency measurement `src -> dst`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PongSample {
    pub src: NodeId,
    pub dst: NodeId,
    /// Seconds.
    pub timediff: f64,
    /// Seconds the sample stays valid.
    pub time_to_alive: f64,
    /// Milliseconds added on top of the measured weight.
    pub additional_cost: f64,
}

#[derive(Clone, Debug)]
struct Latency {
    ping: f64,
    /// Weight seen by the last recalculation.
    ping_old: f64,
    /// Seconds.
    additional_cost: f64,
    valid_until: Instant,
}

/// Directed latency graph owned by one node.
pub struct Graph {
    settings: GraphSettings,
    vertices: BTreeSet<NodeId>,
    edges: BTreeMap<NodeId, BTreeMap<NodeId, Latency>>,
    recalculated_at: Option<Instant>,
    dist: DistTable,
    nh: Arc<NextHopTable>,
    /// Set when the table was replaced from outside.
    changed: bool,
    /// Topology shrank; recompute regardless of damping and cooldown.
    force: bool,
    nh_expire: Option<Instant>,
    ntp_offset_ms: i64,
    shared: Arc<SharedNhTable>,
}

impl Graph {
    pub fn new(settings: GraphSettings) -> Self {
        Self {
            settings,
            vertices: BTreeSet::new(),
            edges: BTreeMap::new(),
            recalculated_at: None,
            dist: DistTable::new(),
            nh: Arc::new(NextHopTable::new()),
            changed: false,
            force: false,
            nh_expire: None,
            ntp_offset_ms: 0,
            shared: Arc::new(SharedNhTable::default()),
        }
    }

    pub fn settings(&self) -> &GraphSettings {
        &self.settings
    }

    /// The cell forwarding reads the installed table from.
    pub fn shared(&self) -> Arc<SharedNhTable> {
        self.shared.clone()
    }

    // === Clock ===

    pub fn set_ntp_offset_ms(&mut self, offset: i64) {
        self.ntp_offset_ms = offset;
    }

    pub fn ntp_offset_ms(&self) -> i64 {
        self.ntp_offset_ms
    }

    /// Unix milliseconds corrected by the NTP offset.
    pub fn current_time_ms(&self) -> i64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        now + self.ntp_offset_ms
    }

    // === Weights ===

    pub fn vertices(&self) -> &BTreeSet<NodeId> {
        &self.vertices
    }

    pub fn neighbors(&self, v: NodeId) -> Vec<NodeId> {
        self.edges
            .get(&v)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn weight(&self, u: NodeId, v: NodeId, with_ac: bool) -> f64 {
        self.weight_at(u, v, with_ac, Instant::now())
    }

    fn weight_at(&self, u: NodeId, v: NodeId, with_ac: bool, now: Instant) -> f64 {
        if u == v {
            return 0.0;
        }
        let Some(e) = self.edges.get(&u).and_then(|m| m.get(&v)) else {
            return INFINITY;
        };
        if now > e.valid_until {
            return INFINITY;
        }
        let w = if with_ac {
            e.ping + e.additional_cost
        } else {
            e.ping
        };
        w.min(INFINITY)
    }

    pub fn old_weight(&self, u: NodeId, v: NodeId, with_ac: bool) -> f64 {
        if u == v {
            return 0.0;
        }
        let Some(e) = self.edges.get(&u).and_then(|m| m.get(&v)) else {
            return INFINITY;
        };
        let w = if with_ac {
            e.ping_old + e.additional_cost
        } else {
            e.ping_old
        };
        w.min(INFINITY)
    }

    /// Bucket a weight (ms) into its damping class.
    pub fn weight_type(&self, x: f64) -> f64 {
        let x = x.abs();
        let t = self.settings.jitter_tolerance;
        let r = self.settings.jitter_tolerance_multiplier;
        if t > 0.001 && r > 1.0 {
            (x / t).powf(1.0 / r).ceil().powf(r) * t
        } else {
            x
        }
    }

    /// Whether `new` (seconds) differs enough from the last computed
    /// weight of `u -> v` to warrant a recalculation.
    pub fn should_update(&self, u: NodeId, v: NodeId, new: f64) -> bool {
        let old = (self.old_weight(u, v, false) * 1000.0).abs();
        let new = (new * 1000.0).abs();
        if self.settings.super_mode {
            let t = self.settings.jitter_tolerance;
            let r = self.settings.jitter_tolerance_multiplier;
            if t > 0.001 && r >= 1.0 {
                let diff = (new - old).abs();
                diff > t + old.max(new) * (r - 1.0)
            } else {
                old != new
            }
        } else {
            self.weight_type(old) != self.weight_type(new)
        }
    }

    fn any_should_update(&self, now: Instant) -> bool {
        self.vertices.iter().any(|&u| {
            self.vertices
                .iter()
                .any(|&v| u != v && self.should_update(u, v, self.weight_at(u, v, false, now)))
        })
    }

    // === Mutation ===

    /// Record samples. Returns whether the installed table changed (only
    /// computed when both flags are set).
    pub fn update_latency(
        &mut self,
        samples: &[PongSample],
        recalculate: bool,
        check_change: bool,
    ) -> bool {
        self.update_latency_at(samples, recalculate, check_change, Instant::now())
    }

    fn update_latency_at(
        &mut self,
        samples: &[PongSample],
        recalculate: bool,
        check_change: bool,
        now: Instant,
    ) -> bool {
        let mut should_update = false;
        for s in samples {
            let additional_cost = s.additional_cost.max(0.0) / 1000.0;
            self.vertices.insert(s.src);
            self.vertices.insert(s.dst);
            if !self.edges.contains_key(&s.src) {
                self.recalculated_at = None;
            }
            should_update = should_update || self.should_update(s.src, s.dst, s.timediff);

            let valid_until = now + secs(s.time_to_alive);
            self.edges
                .entry(s.src)
                .or_default()
                .entry(s.dst)
                .and_modify(|e| {
                    e.ping = s.timediff;
                    e.valid_until = valid_until;
                    e.additional_cost = additional_cost;
                })
                .or_insert(Latency {
                    ping: s.timediff,
                    ping_old: INFINITY,
                    additional_cost,
                    valid_until,
                });
        }
        if should_update && recalculate {
            self.recalculate_at(check_change, now)
        } else {
            false
        }
    }

    /// Forget a node and every edge touching it.
    pub fn remove_vertex(&mut self, v: NodeId, recalculate: bool, check_change: bool) -> bool {
        self.vertices.remove(&v);
        self.edges.remove(&v);
        for m in self.edges.values_mut() {
            m.remove(&v);
        }
        self.changed = true;
        self.force = true;
        if recalculate {
            self.recalculate(check_change)
        } else {
            false
        }
    }

    fn remove_negative_weights(&mut self, now: Instant) {
        let negative: Vec<(NodeId, NodeId)> = self
            .edges
            .iter()
            .flat_map(|(u, m)| m.keys().map(move |v| (*u, *v)))
            .filter(|(u, v)| self.weight_at(*u, *v, true, now) < 0.0)
            .collect();
        for (u, v) in negative {
            debug!(target: "meshguard::internal", src = %u, dst = %v, "Clamping negative edge to 0");
            if let Some(e) = self.edges.get_mut(&u).and_then(|m| m.get_mut(&v)) {
                e.ping = 0.0;
            }
        }
    }

    // === Shortest paths ===

    /// All-pairs shortest paths over live edges.
    ///
    /// Equal-cost alternatives resolve to the lower next-hop ID. A negative
    /// cycle clamps negative edges to zero and retries once.
    pub fn floyd_warshall(&mut self) -> Result<(DistTable, NextHopTable), RoutingError> {
        self.floyd_warshall_at(Instant::now())
    }

    fn floyd_warshall_at(&mut self, now: Instant) -> Result<(DistTable, NextHopTable), RoutingError> {
        match self.floyd_warshall_once(now) {
            Err(RoutingError::NegativeCycle) => {
                warn!(target: "meshguard::internal", "Negative cycle detected, clamping and retrying");
                self.remove_negative_weights(now);
                self.floyd_warshall_once(now)
            }
            other => other,
        }
    }

    fn floyd_warshall_once(
        &mut self,
        now: Instant,
    ) -> Result<(DistTable, NextHopTable), RoutingError> {
        let verts: Vec<NodeId> = self.vertices.iter().copied().collect();
        let index: BTreeMap<NodeId, usize> =
            verts.iter().enumerate().map(|(i, v)| (*v, i)).collect();
        let n = verts.len();
        let mut dist = vec![vec![INFINITY; n]; n];
        let mut next: Vec<Vec<Option<usize>>> = vec![vec![None; n]; n];

        let mut snapshot = Vec::new();
        for (i, u) in verts.iter().enumerate() {
            dist[i][i] = 0.0;
            for v in self.neighbors(*u) {
                let Some(&j) = index.get(&v) else { continue };
                let w = self.weight_at(*u, v, true, now);
                if w < INFINITY {
                    dist[i][j] = w;
                    next[i][j] = Some(j);
                }
                snapshot.push((*u, v, self.weight_at(*u, v, false, now)));
            }
        }
        for (u, v, w) in snapshot {
            if let Some(e) = self.edges.get_mut(&u).and_then(|m| m.get_mut(&v)) {
                e.ping_old = w;
            }
        }

        for k in 0..n {
            for i in 0..n {
                if dist[i][k] >= INFINITY {
                    continue;
                }
                let Some(via) = next[i][k] else { continue };
                for j in 0..n {
                    if dist[k][j] >= INFINITY {
                        continue;
                    }
                    let through = dist[i][k] + dist[k][j];
                    if i == j {
                        dist[i][i] = dist[i][i].min(through);
                        continue;
                    }
                    let better = through < dist[i][j]
                        || (through == dist[i][j] && next[i][j].is_some_and(|cur| via < cur));
                    if better {
                        dist[i][j] = through;
                        next[i][j] = Some(via);
                    }
                }
            }
        }

        if (0..n).any(|i| dist[i][i] < 0.0) {
            return Err(RoutingError::NegativeCycle);
        }

        let mut dist_table = DistTable::new();
        let mut nh = NextHopTable::new();
        for (i, u) in verts.iter().enumerate() {
            let row = dist_table.entry(*u).or_default();
            for (j, v) in verts.iter().enumerate() {
                row.insert(*v, dist[i][j]);
                if let Some(hop) = next[i][j] {
                    nh.set(*u, *v, verts[hop]);
                }
            }
        }
        Ok((dist_table, nh))
    }

    /// Recompute when some edge left its damping class and the cooldown
    /// has passed. Returns whether the table changed (if `check_change`).
    pub fn recalculate(&mut self, check_change: bool) -> bool {
        self.recalculate_at(check_change, Instant::now())
    }

    fn recalculate_at(&mut self, check_change: bool, now: Instant) -> bool {
        if self.settings.static_mode {
            let changed = self.changed && check_change;
            self.changed = false;
            return changed;
        }
        if !self.force && !self.any_should_update(now) {
            return false;
        }
        let cooled = self.force
            || self
                .recalculated_at
                .map_or(true, |t| now >= t + self.settings.recalculate_cooldown);
        if !cooled {
            return false;
        }

        let (dist, nh) = match self.floyd_warshall_at(now) {
            Ok(tables) => tables,
            Err(e) => {
                error!(target: "meshguard::internal", error = %e, "Route computation failed");
                (DistTable::new(), NextHopTable::new())
            }
        };
        let changed = check_change && nh != *self.nh;
        self.dist = dist;
        self.install(nh);
        self.recalculated_at = Some(now);
        self.force = false;
        debug!(target: "meshguard::internal", changed, "Next-hop table recalculated");
        changed
    }

    fn install(&mut self, nh: NextHopTable) {
        let nh = Arc::new(nh);
        self.nh = nh.clone();
        self.shared.store(nh);
    }

    // === Installed table ===

    /// Install a table handed down by the super (or from config). It stays
    /// authoritative for `super_node_info_timeout`.
    pub fn set_nh_table(&mut self, nh: NextHopTable) {
        self.install(nh);
        self.changed = true;
        self.refresh_nh_expire();
    }

    /// Push out the expiry of the super-provided table.
    pub fn refresh_nh_expire(&mut self) {
        self.nh_expire = Some(Instant::now() + self.settings.super_node_info_timeout);
    }

    /// Whether the super-provided table has lapsed and local computation
    /// should take over.
    pub fn nh_table_expired(&self) -> bool {
        self.nh_expire.map_or(true, |t| Instant::now() > t)
    }

    /// The installed table, recomputing first if asked and the
    /// super-provided table has lapsed.
    pub fn nh_table(&mut self, recalculate: bool) -> Arc<NextHopTable> {
        if recalculate && self.nh_table_expired() {
            self.recalculate(false);
        }
        self.nh.clone()
    }

    pub fn dist_table(&self) -> &DistTable {
        &self.dist
    }

    /// Current weights of every ordered pair.
    pub fn edges_snapshot(&self, old: bool, with_ac: bool) -> DistTable {
        let mut out = DistTable::new();
        for &u in &self.vertices {
            let row = out.entry(u).or_default();
            for &v in &self.vertices {
                if u != v {
                    let w = if old {
                        self.old_weight(u, v, with_ac)
                    } else {
                        self.weight(u, v, with_ac)
                    };
                    row.insert(v, w);
                }
            }
        }
        out
    }
}
