//! Circular-trade detector.
//!
//! Builds a directed multigraph over the window (node = address, edge =
//! aggregated taker→maker flow) and enumerates simple cycles of length 2–4.
//! Nodes live in an arena and edges are integer indices; no owning
//! back-references anywhere near the cycles.

use crate::detectors::{build_evidence, Detector, ScanCancel};
use crate::models::{Evidence, EvidenceKind};
use crate::store::Snapshot;
use std::collections::HashMap;

const MAX_CYCLE_LEN: usize = 4;
const MAX_CYCLES: usize = 10_000;

pub struct CircularTrade;

#[derive(Default, Clone)]
struct EdgeAgg {
    volume: f64,
    tx_hashes: Vec<String>,
    token_id: String,
    last_ts: i64,
}

struct TradeGraph {
    nodes: Vec<String>,
    edges: HashMap<(usize, usize), EdgeAgg>,
    adjacency: Vec<Vec<usize>>,
}

impl TradeGraph {
    fn build(snap: &Snapshot, cancel: &ScanCancel) -> Self {
        let mut nodes: Vec<String> = Vec::new();
        let mut index: HashMap<&str, usize> = HashMap::new();
        let mut edges: HashMap<(usize, usize), EdgeAgg> = HashMap::new();

        for (i, t) in snap.trades.iter().enumerate() {
            if cancel.checkpoint(i) {
                break;
            }
            if t.maker == t.taker {
                // Direct self-trades are the self-trade detector's business.
                continue;
            }
            let from = *index.entry(t.taker.as_str()).or_insert_with(|| {
                nodes.push(t.taker.clone());
                nodes.len() - 1
            });
            let to = *index.entry(t.maker.as_str()).or_insert_with(|| {
                nodes.push(t.maker.clone());
                nodes.len() - 1
            });

            let edge = edges.entry((from, to)).or_default();
            edge.volume += t.volume;
            edge.tx_hashes.push(t.tx_hash.clone());
            if edge.token_id.is_empty() {
                edge.token_id = t.token_id.clone();
            }
            edge.last_ts = edge.last_ts.max(t.timestamp);
        }

        let mut adjacency = vec![Vec::new(); nodes.len()];
        for &(from, to) in edges.keys() {
            adjacency[from].push(to);
        }
        for neighbors in adjacency.iter_mut() {
            neighbors.sort_unstable();
        }

        Self {
            nodes,
            edges,
            adjacency,
        }
    }

    /// Simple cycles of length 2..=4, each reported once with its minimal
    /// node as the anchor. Enumeration stops at `MAX_CYCLES`.
    fn cycles(&self) -> Vec<Vec<usize>> {
        let mut found = Vec::new();
        let mut path = Vec::with_capacity(MAX_CYCLE_LEN);

        for start in 0..self.nodes.len() {
            if found.len() >= MAX_CYCLES {
                break;
            }
            path.clear();
            path.push(start);
            self.dfs(start, start, &mut path, &mut found);
        }
        found
    }

    fn dfs(&self, start: usize, current: usize, path: &mut Vec<usize>, found: &mut Vec<Vec<usize>>) {
        if found.len() >= MAX_CYCLES {
            return;
        }
        for &next in &self.adjacency[current] {
            if found.len() >= MAX_CYCLES {
                return;
            }
            if next == start {
                if path.len() >= 2 {
                    found.push(path.clone());
                }
                continue;
            }
            // Anchoring on the minimal node keeps each cycle unique.
            if next <= start || path.contains(&next) || path.len() >= MAX_CYCLE_LEN {
                continue;
            }
            path.push(next);
            self.dfs(start, next, path, found);
            path.pop();
        }
    }
}

impl Detector for CircularTrade {
    fn kind(&self) -> EvidenceKind {
        EvidenceKind::CircularTrade
    }

    fn name(&self) -> &'static str {
        "circular-trades"
    }

    fn scan(&self, snap: &Snapshot, cancel: &ScanCancel) -> Vec<Evidence> {
        let graph = TradeGraph::build(snap, cancel);
        let mut findings = Vec::new();

        for cycle in graph.cycles() {
            let mut volumes = Vec::with_capacity(cycle.len());
            let mut tx_hashes = Vec::new();
            let mut total_volume = 0.0;
            let mut last_ts = 0i64;
            let mut token_id = String::new();

            for i in 0..cycle.len() {
                let from = cycle[i];
                let to = cycle[(i + 1) % cycle.len()];
                let Some(edge) = graph.edges.get(&(from, to)) else {
                    continue;
                };
                volumes.push(edge.volume);
                tx_hashes.extend(edge.tx_hashes.iter().cloned());
                total_volume += edge.volume;
                last_ts = last_ts.max(edge.last_ts);
                if token_id.is_empty() {
                    token_id = edge.token_id.clone();
                }
            }
            if volumes.len() != cycle.len() {
                continue;
            }

            let min = volumes.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = volumes.iter().cloned().fold(0.0f64, f64::max);
            if max <= 0.0 {
                continue;
            }
            let confidence = (0.6 + 0.1 * (min / max)).clamp(0.6, 0.9);

            let addresses: Vec<String> =
                cycle.iter().map(|&n| graph.nodes[n].clone()).collect();
            let discriminator = addresses.join(">");

            findings.push(build_evidence(
                EvidenceKind::CircularTrade,
                &discriminator,
                confidence,
                last_ts,
                addresses,
                tx_hashes,
                token_id,
                total_volume,
                serde_json::json!({
                    "cycle_length": cycle.len(),
                    "min_edge_volume": min,
                    "max_edge_volume": max,
                }),
            ));
        }

        findings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::testutil::{snapshot, trade};
    use crate::models::Side;

    #[test]
    fn two_party_round_trip_is_a_cycle() {
        // A sells to B, B sells back to A: taker→maker edges A→B and B→A.
        let trades = vec![
            trade(10, 0, 1_000, "0xb", "0xa", "0xm", Side::Buy, 100.0, 0.5),
            trade(11, 0, 1_100, "0xa", "0xb", "0xm", Side::Buy, 100.0, 0.5),
        ];
        let snap = snapshot(trades, vec![]);
        let findings = CircularTrade.scan(&snap, &ScanCancel::new());

        assert_eq!(findings.len(), 1);
        // Equal edge volumes push confidence to the 0.7 midpoint.
        assert!((findings[0].confidence - 0.7).abs() < 1e-9);
        assert_eq!(findings[0].addresses.len(), 2);
    }

    #[test]
    fn three_party_ring_is_detected_once() {
        let trades = vec![
            trade(10, 0, 1_000, "0xb", "0xa", "0xm", Side::Buy, 100.0, 0.5),
            trade(11, 0, 1_100, "0xc", "0xb", "0xm", Side::Buy, 100.0, 0.5),
            trade(12, 0, 1_200, "0xa", "0xc", "0xm", Side::Buy, 100.0, 0.5),
        ];
        let snap = snapshot(trades, vec![]);
        let findings = CircularTrade.scan(&snap, &ScanCancel::new());

        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].addresses.len(), 3);
        assert_eq!(findings[0].tx_hashes.len(), 3);
    }

    #[test]
    fn chain_without_closure_is_quiet() {
        let trades = vec![
            trade(10, 0, 1_000, "0xb", "0xa", "0xm", Side::Buy, 100.0, 0.5),
            trade(11, 0, 1_100, "0xc", "0xb", "0xm", Side::Buy, 100.0, 0.5),
        ];
        let snap = snapshot(trades, vec![]);
        assert!(CircularTrade.scan(&snap, &ScanCancel::new()).is_empty());
    }

    #[test]
    fn lopsided_volumes_lower_confidence() {
        let trades = vec![
            trade(10, 0, 1_000, "0xb", "0xa", "0xm", Side::Buy, 100.0, 0.5),
            trade(11, 0, 1_100, "0xa", "0xb", "0xm", Side::Buy, 10.0, 0.5),
        ];
        let snap = snapshot(trades, vec![]);
        let findings = CircularTrade.scan(&snap, &ScanCancel::new());
        assert_eq!(findings.len(), 1);
        // min/max = 0.1: confidence 0.61.
        assert!((findings[0].confidence - 0.61).abs() < 1e-9);
    }

    #[test]
    fn deterministic_output() {
        let trades = vec![
            trade(10, 0, 1_000, "0xb", "0xa", "0xm", Side::Buy, 100.0, 0.5),
            trade(11, 0, 1_100, "0xc", "0xb", "0xm", Side::Buy, 50.0, 0.5),
            trade(12, 0, 1_200, "0xa", "0xc", "0xm", Side::Buy, 75.0, 0.5),
            trade(13, 0, 1_300, "0xa", "0xb", "0xm", Side::Buy, 25.0, 0.5),
        ];
        let snap = snapshot(trades, vec![]);
        let a = serde_json::to_string(&CircularTrade.scan(&snap, &ScanCancel::new())).unwrap();
        let b = serde_json::to_string(&CircularTrade.scan(&snap, &ScanCancel::new())).unwrap();
        assert_eq!(a, b);
    }
}
