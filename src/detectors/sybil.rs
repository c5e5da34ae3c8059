//! Sybil-cluster detector.
//!
//! Several distinct wallets firing near-identical orders into the same
//! market side within seconds is one operator with many keys. Cluster
//! membership requires sizes to sit within ±20% of the group mean for most
//! of the group.

use crate::detectors::{build_evidence, Detector, ScanCancel};
use crate::models::{Evidence, EvidenceKind, Side, Trade};
use crate::store::Snapshot;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

const WINDOW_SECS: i64 = 10;
const MIN_CLUSTER: usize = 3;
const SIZE_TOLERANCE: f64 = 0.2;
const MIN_CONFORMING_FRACTION: f64 = 0.6;

pub struct SybilCluster;

impl Detector for SybilCluster {
    fn kind(&self) -> EvidenceKind {
        EvidenceKind::SybilCluster
    }

    fn name(&self) -> &'static str {
        "sybil-clusters"
    }

    fn scan(&self, snap: &Snapshot, cancel: &ScanCancel) -> Vec<Evidence> {
        let mut lanes: HashMap<(&str, Side), Vec<&Arc<Trade>>> = HashMap::new();
        for t in &snap.trades {
            lanes.entry((t.market_key(), t.side)).or_default().push(t);
        }

        let mut keys: Vec<(&str, Side)> = lanes.keys().copied().collect();
        keys.sort_by(|a, b| (a.0, a.1.as_str()).cmp(&(b.0, b.1.as_str())));

        let mut findings = Vec::new();
        for (li, key) in keys.into_iter().enumerate() {
            if cancel.checkpoint(li * crate::detectors::CANCEL_CHECK_INTERVAL) {
                break;
            }
            let lane = &lanes[&key];

            let mut i = 0usize;
            while i < lane.len() {
                // Widest window starting at i within 10 seconds.
                let start_ts = lane[i].timestamp;
                let mut j = i;
                while j < lane.len() && lane[j].timestamp - start_ts <= WINDOW_SECS {
                    j += 1;
                }
                let window = &lane[i..j];

                if let Some(evidence) = judge_window(key.0, key.1, window) {
                    findings.push(evidence);
                    i = j;
                } else {
                    i += 1;
                }
            }
        }
        findings
    }
}

fn judge_window(market: &str, side: Side, window: &[&Arc<Trade>]) -> Option<Evidence> {
    if window.len() < MIN_CLUSTER {
        return None;
    }

    let distinct: HashSet<&str> = window.iter().map(|t| t.taker.as_str()).collect();
    if distinct.len() < MIN_CLUSTER {
        return None;
    }

    let mean = window.iter().map(|t| t.size).sum::<f64>() / window.len() as f64;
    if mean <= 0.0 {
        return None;
    }
    let conforming = window
        .iter()
        .filter(|t| (t.size - mean).abs() / mean <= SIZE_TOLERANCE)
        .count();
    if (conforming as f64) < MIN_CONFORMING_FRACTION * window.len() as f64 {
        return None;
    }

    let confidence = (0.6 + 0.1 * (distinct.len() - MIN_CLUSTER) as f64).min(0.9);
    let first = window.first()?;
    let last_ts = window.iter().map(|t| t.timestamp).max()?;

    Some(build_evidence(
        EvidenceKind::SybilCluster,
        &format!("{market}:{}:{}:{}", side.as_str(), first.timestamp, window.len()),
        confidence,
        last_ts,
        window.iter().map(|t| t.taker.clone()).collect(),
        window.iter().map(|t| t.tx_hash.clone()).collect(),
        first.token_id.clone(),
        window.iter().map(|t| t.volume).sum(),
        serde_json::json!({
            "cluster_size": distinct.len(),
            "trades": window.len(),
            "mean_size": mean,
            "window_start": first.timestamp,
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::testutil::{snapshot, trade};

    fn burst(n: usize, base_ts: i64, size: f64) -> Vec<Trade> {
        (0..n)
            .map(|i| {
                trade(
                    100 + i as u64,
                    0,
                    base_ts + i as i64,
                    "0xmm",
                    &format!("0xsybil{i}"),
                    "0xm",
                    Side::Buy,
                    size,
                    0.5,
                )
            })
            .collect()
    }

    #[test]
    fn tight_burst_of_clones_fires() {
        let snap = snapshot(burst(4, 1_000, 25.0), vec![]);
        let findings = SybilCluster.scan(&snap, &ScanCancel::new());

        assert_eq!(findings.len(), 1);
        // Four distinct wallets: 0.6 + 0.1 · (4 − 3) = 0.7.
        assert!((findings[0].confidence - 0.7).abs() < 1e-9);
        assert_eq!(findings[0].addresses.len(), 4);
    }

    #[test]
    fn two_wallets_are_not_a_cluster() {
        let snap = snapshot(burst(2, 1_000, 25.0), vec![]);
        assert!(SybilCluster.scan(&snap, &ScanCancel::new()).is_empty());
    }

    #[test]
    fn spread_out_trades_do_not_cluster() {
        let mut trades = Vec::new();
        for i in 0..4usize {
            trades.push(trade(
                100 + i as u64,
                0,
                1_000 + i as i64 * 60,
                "0xmm",
                &format!("0xsybil{i}"),
                "0xm",
                Side::Buy,
                25.0,
                0.5,
            ));
        }
        let snap = snapshot(trades, vec![]);
        assert!(SybilCluster.scan(&snap, &ScanCancel::new()).is_empty());
    }

    #[test]
    fn ragged_sizes_break_the_cluster() {
        let mut trades = burst(2, 1_000, 25.0);
        trades.push(trade(200, 0, 1_002, "0xmm", "0xsybil2", "0xm", Side::Buy, 500.0, 0.5));
        trades.push(trade(201, 0, 1_003, "0xmm", "0xsybil3", "0xm", Side::Buy, 900.0, 0.5));
        let snap = snapshot(trades, vec![]);
        assert!(SybilCluster.scan(&snap, &ScanCancel::new()).is_empty());
    }

    #[test]
    fn opposite_sides_never_mix() {
        let mut trades = burst(2, 1_000, 25.0);
        trades.push(trade(200, 0, 1_002, "0xmm", "0xsybil9", "0xm", Side::Sell, 25.0, 0.5));
        let snap = snapshot(trades, vec![]);
        assert!(SybilCluster.scan(&snap, &ScanCancel::new()).is_empty());
    }
}
