//! Gas-price anomaly detector (front-running tell).
//!
//! A trade paying more than twice the median gas of the preceding 256
//! blocks' trades is bidding for priority. Zero gas prices (missing data)
//! never enter the baseline.

use crate::detectors::{build_evidence, Detector, ScanCancel};
use crate::models::{Evidence, EvidenceKind};
use crate::store::Snapshot;
use std::collections::VecDeque;

const LOOKBACK_BLOCKS: u64 = 256;
const RATIO_THRESHOLD: f64 = 2.0;
/// Baselines thinner than this are noise, not a median.
const MIN_BASELINE_SAMPLES: usize = 10;

pub struct GasAnomaly;

impl Detector for GasAnomaly {
    fn kind(&self) -> EvidenceKind {
        EvidenceKind::GasAnomaly
    }

    fn name(&self) -> &'static str {
        "gas-anomaly"
    }

    fn scan(&self, snap: &Snapshot, cancel: &ScanCancel) -> Vec<Evidence> {
        let mut findings = Vec::new();
        // (block, gas) for every priced trade, in snapshot order.
        let mut window: VecDeque<(u64, u128)> = VecDeque::new();

        let mut i = 0usize;
        while i < snap.trades.len() {
            if cancel.checkpoint(i) {
                break;
            }

            let block = snap.trades[i].block_number;
            // Baseline covers the preceding blocks only, never the current one.
            while let Some(&(b, _)) = window.front() {
                if b + LOOKBACK_BLOCKS < block {
                    window.pop_front();
                } else {
                    break;
                }
            }

            let median = median_gas(&window);

            let mut j = i;
            while j < snap.trades.len() && snap.trades[j].block_number == block {
                let t = &snap.trades[j];
                if let Some(median) = median {
                    if t.gas_price > 0 && window.len() >= MIN_BASELINE_SAMPLES {
                        let ratio = t.gas_price as f64 / median;
                        if ratio > RATIO_THRESHOLD {
                            let confidence = (0.4 + 0.1 * ratio.log2()).min(0.8);
                            findings.push(build_evidence(
                                EvidenceKind::GasAnomaly,
                                &format!("{}:{}", t.tx_hash, t.log_index),
                                confidence,
                                t.timestamp,
                                vec![t.taker.clone(), t.maker.clone()],
                                vec![t.tx_hash.clone()],
                                t.token_id.clone(),
                                t.volume,
                                serde_json::json!({
                                    "gas_price_wei": t.gas_price.to_string(),
                                    "median_gas_wei": format!("{median:.0}"),
                                    "ratio": ratio,
                                }),
                            ));
                        }
                    }
                }
                j += 1;
            }

            // Fold the whole block into the baseline after judging it.
            for t in &snap.trades[i..j] {
                if t.gas_price > 0 {
                    window.push_back((block, t.gas_price));
                }
            }
            i = j;
        }

        findings
    }
}

fn median_gas(window: &VecDeque<(u64, u128)>) -> Option<f64> {
    if window.is_empty() {
        return None;
    }
    let mut gases: Vec<u128> = window.iter().map(|&(_, g)| g).collect();
    gases.sort_unstable();
    let mid = gases.len() / 2;
    let median = if gases.len() % 2 == 0 {
        (gases[mid - 1] as f64 + gases[mid] as f64) / 2.0
    } else {
        gases[mid] as f64
    };
    Some(median)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::testutil::{snapshot, trade};
    use crate::models::Side;

    const GWEI: u128 = 1_000_000_000;

    fn baseline_trades(n: u64, gas: u128) -> Vec<crate::models::Trade> {
        (0..n)
            .map(|i| {
                let mut t = trade(
                    100 + i,
                    0,
                    1_000 + i as i64,
                    "0xa",
                    "0xb",
                    "0xm",
                    Side::Buy,
                    1.0,
                    0.5,
                );
                t.gas_price = gas;
                t
            })
            .collect()
    }

    #[test]
    fn fires_above_twice_median() {
        let mut trades = baseline_trades(12, 30 * GWEI);
        let mut hot = trade(150, 0, 2_000, "0xa", "0xfront", "0xm", Side::Buy, 1.0, 0.5);
        hot.gas_price = 240 * GWEI; // 8x the median
        trades.push(hot);

        let snap = snapshot(trades, vec![]);
        let findings = GasAnomaly.scan(&snap, &ScanCancel::new());
        assert_eq!(findings.len(), 1);
        // 0.4 + 0.1 * log2(8) = 0.7
        assert!((findings[0].confidence - 0.7).abs() < 1e-9);
    }

    #[test]
    fn confidence_caps_at_point_eight() {
        let mut trades = baseline_trades(12, 30 * GWEI);
        let mut hot = trade(150, 0, 2_000, "0xa", "0xfront", "0xm", Side::Buy, 1.0, 0.5);
        hot.gas_price = 30 * GWEI * 1_000;
        trades.push(hot);

        let snap = snapshot(trades, vec![]);
        let findings = GasAnomaly.scan(&snap, &ScanCancel::new());
        assert_eq!(findings.len(), 1);
        assert!((findings[0].confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn normal_gas_stays_quiet() {
        let mut trades = baseline_trades(12, 30 * GWEI);
        let mut normal = trade(150, 0, 2_000, "0xa", "0xb", "0xm", Side::Buy, 1.0, 0.5);
        normal.gas_price = 45 * GWEI;
        trades.push(normal);

        let snap = snapshot(trades, vec![]);
        assert!(GasAnomaly.scan(&snap, &ScanCancel::new()).is_empty());
    }

    #[test]
    fn stale_blocks_leave_the_baseline() {
        let mut trades = baseline_trades(12, 30 * GWEI);
        // 300 blocks later the old baseline is gone; nothing to compare to.
        let mut hot = trade(500, 0, 5_000, "0xa", "0xb", "0xm", Side::Buy, 1.0, 0.5);
        hot.gas_price = 240 * GWEI;
        trades.push(hot);

        let snap = snapshot(trades, vec![]);
        assert!(GasAnomaly.scan(&snap, &ScanCancel::new()).is_empty());
    }

    #[test]
    fn thin_baseline_is_ignored() {
        let mut trades = baseline_trades(3, 30 * GWEI);
        let mut hot = trade(150, 0, 2_000, "0xa", "0xb", "0xm", Side::Buy, 1.0, 0.5);
        hot.gas_price = 240 * GWEI;
        trades.push(hot);

        let snap = snapshot(trades, vec![]);
        assert!(GasAnomaly.scan(&snap, &ScanCancel::new()).is_empty());
    }
}
