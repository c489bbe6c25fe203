//! Offline path solver for a latency matrix.
//!
//! ```text
//! X 1   2   3
//! 1 0   0.5 Inf
//! 2 0.5 0   0.5
//! 3 Inf 0.5 0
//! ```

use super::{DistTable, Graph, GraphSettings, NextHopTable, PongSample, RoutingError, INFINITY};
use crate::protocol::NodeId;
use serde::Serialize;
use std::fmt;

/// Computed tables plus the node order of the input matrix.
#[derive(Debug, Serialize)]
pub struct SolveOutput {
    #[serde(rename = "NextHopTable")]
    pub next: NextHopTable,
    #[serde(rename = "DistanceTable")]
    pub dist: DistTable,
    #[serde(skip)]
    pub order: Vec<NodeId>,
}

fn parse_node(s: &str) -> Result<NodeId, RoutingError> {
    s.parse::<u16>()
        .map(NodeId)
        .map_err(|_| RoutingError::InvalidMatrix(format!("bad node id {:?}", s)))
}

fn parse_weight(s: &str) -> Result<f64, RoutingError> {
    if s.eq_ignore_ascii_case("inf") {
        return Ok(INFINITY);
    }
    s.parse::<f64>()
        .map_err(|_| RoutingError::InvalidMatrix(format!("bad weight {:?}", s)))
}

/// Parse a matrix into its node order and edge samples.
pub fn parse_matrix(text: &str) -> Result<(Vec<NodeId>, Vec<PongSample>), RoutingError> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let header = lines
        .next()
        .ok_or_else(|| RoutingError::InvalidMatrix("empty input".into()))?;
    let order = header
        .split_whitespace()
        .skip(1)
        .map(parse_node)
        .collect::<Result<Vec<_>, _>>()?;

    let mut samples = Vec::new();
    for line in lines {
        let mut fields = line.split_whitespace();
        let Some(first) = fields.next() else { continue };
        let src = parse_node(first)?;
        let weights: Vec<&str> = fields.collect();
        if weights.len() != order.len() {
            return Err(RoutingError::InvalidMatrix(format!(
                "row {} has {} columns, expected {}",
                src,
                weights.len(),
                order.len()
            )));
        }
        for (dst, w) in order.iter().zip(weights) {
            let w = parse_weight(w)?;
            if src != *dst && w < INFINITY {
                samples.push(PongSample {
                    src,
                    dst: *dst,
                    timediff: w,
                    time_to_alive: INFINITY,
                    additional_cost: 0.0,
                });
            }
        }
    }
    Ok((order, samples))
}

/// Run the routing engine over a matrix.
pub fn solve(text: &str) -> Result<SolveOutput, RoutingError> {
    let (order, samples) = parse_matrix(text)?;
    let mut graph = Graph::new(GraphSettings::default());
    graph.update_latency(&samples, false, false);
    let (dist, next) = graph.floyd_warshall()?;
    Ok(SolveOutput { next, dist, order })
}

impl SolveOutput {
    pub fn to_yaml(&self) -> Result<String, RoutingError> {
        serde_yaml::to_string(self).map_err(|e| RoutingError::Serialize(e.to_string()))
    }
}

impl fmt::Display for SolveOutput {
    /// Human readable `src -> dst  dist  path` listing.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "src\tdist\t\tpath")?;
        for u in &self.order {
            for v in &self.order {
                if u == v {
                    continue;
                }
                let d = self
                    .dist
                    .get(u)
                    .and_then(|m| m.get(v))
                    .copied()
                    .unwrap_or(INFINITY);
                let path: Vec<String> = self.next.path(*u, *v).iter().map(|n| n.to_string()).collect();
                writeln!(f, "{} -> {}\t{:.6}\t[{}]", u, v, d, path.join(" "))?;
            }
        }
        Ok(())
    }
}
