//! Volume-spike detector.
//!
//! Five-minute buckets per market, compared against a one-hour rolling mean
//! evaluated on a one-minute stride. Quiet markets never spike: the baseline
//! must clear a dollar floor before a ratio means anything.

use crate::detectors::{build_evidence, Detector, ScanCancel};
use crate::models::{Evidence, EvidenceKind};
use crate::store::Snapshot;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

const BUCKET_SECS: i64 = 300;
const STRIDE_SECS: i64 = 60;
const BASELINE_SECS: i64 = 3_600;
const BASELINE_BUCKETS: f64 = (BASELINE_SECS / BUCKET_SECS) as f64;
const RATIO_THRESHOLD: f64 = 10.0;
/// Minimum rolling-mean bucket volume, in collateral units.
const MIN_BASELINE: f64 = 500.0;

pub struct VolumeSpike;

impl Detector for VolumeSpike {
    fn kind(&self) -> EvidenceKind {
        EvidenceKind::VolumeSpike
    }

    fn name(&self) -> &'static str {
        "volume-spikes"
    }

    fn scan(&self, snap: &Snapshot, cancel: &ScanCancel) -> Vec<Evidence> {
        // Time-ordered (ts, volume, trade) per market.
        let mut by_market: HashMap<&str, Vec<&Arc<crate::models::Trade>>> = HashMap::new();
        for t in &snap.trades {
            by_market.entry(t.market_key()).or_default().push(t);
        }

        let mut markets: Vec<&str> = by_market.keys().copied().collect();
        markets.sort_unstable();

        let mut findings = Vec::new();
        for (mi, market) in markets.into_iter().enumerate() {
            if cancel.checkpoint(mi * crate::detectors::CANCEL_CHECK_INTERVAL) {
                break;
            }
            let trades = &by_market[market];

            // Prefix sums over the market's volume series.
            let times: Vec<i64> = trades.iter().map(|t| t.timestamp).collect();
            let mut prefix = Vec::with_capacity(trades.len() + 1);
            prefix.push(0.0f64);
            for t in trades.iter() {
                prefix.push(prefix.last().unwrap() + t.volume);
            }
            let volume_between = |lo: i64, hi: i64| -> f64 {
                // (lo, hi]
                let a = times.partition_point(|&ts| ts <= lo);
                let b = times.partition_point(|&ts| ts <= hi);
                prefix[b] - prefix[a]
            };

            // Candidate evaluation points: one per stride with any activity.
            let mut minutes: BTreeSet<i64> = BTreeSet::new();
            for &ts in &times {
                minutes.insert((ts.div_euclid(STRIDE_SECS) + 1) * STRIDE_SECS);
            }

            // Best firing per 5-minute span so overlapping strides coalesce.
            let mut best: HashMap<i64, (f64, i64, f64, f64)> = HashMap::new();
            for &m in &minutes {
                let bucket = volume_between(m - BUCKET_SECS, m);
                let baseline_total = volume_between(m - BASELINE_SECS - BUCKET_SECS, m - BUCKET_SECS);
                let mean = baseline_total / BASELINE_BUCKETS;
                if mean < MIN_BASELINE {
                    continue;
                }
                let ratio = bucket / mean;
                if ratio <= RATIO_THRESHOLD {
                    continue;
                }
                let span = m.div_euclid(BUCKET_SECS);
                let entry = best.entry(span).or_insert((0.0, m, mean, bucket));
                if ratio > entry.0 {
                    *entry = (ratio, m, mean, bucket);
                }
            }

            let mut spans: Vec<i64> = best.keys().copied().collect();
            spans.sort_unstable();

            for span in spans {
                let (ratio, m, mean, bucket) = best[&span];
                let confidence = (0.3 + 0.05 * ratio.log10()).min(0.7);

                let in_bucket: Vec<&&Arc<crate::models::Trade>> = trades
                    .iter()
                    .filter(|t| t.timestamp > m - BUCKET_SECS && t.timestamp <= m)
                    .collect();
                let addresses: Vec<String> = in_bucket
                    .iter()
                    .flat_map(|t| [t.maker.clone(), t.taker.clone()])
                    .collect();
                let tx_hashes: Vec<String> =
                    in_bucket.iter().map(|t| t.tx_hash.clone()).collect();
                let token_id = in_bucket
                    .first()
                    .map(|t| t.token_id.clone())
                    .unwrap_or_default();

                findings.push(build_evidence(
                    EvidenceKind::VolumeSpike,
                    &format!("{market}:{span}"),
                    confidence,
                    m,
                    addresses,
                    tx_hashes,
                    token_id,
                    bucket,
                    serde_json::json!({
                        "bucket_volume": bucket,
                        "baseline_mean": mean,
                        "ratio": ratio,
                        "window_end": m,
                    }),
                ));
            }
        }

        findings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::testutil::{snapshot, trade};
    use crate::models::Side;

    /// One hour of steady $1,000-per-bucket flow, then a $12,000 burst.
    fn spike_snapshot(burst_volume: f64) -> Snapshot {
        let mut trades = Vec::new();
        let mut block = 100u64;
        // Steady state: $200 prints every minute for 60 minutes.
        for i in 0..60i64 {
            trades.push(trade(
                block,
                0,
                i * 60,
                "0xmm",
                "0xflow",
                "0xm",
                Side::Buy,
                400.0,
                0.5,
            ));
            block += 1;
        }
        // Burst inside one 5-minute bucket right after the baseline hour.
        for i in 0..5i64 {
            trades.push(trade(
                block,
                0,
                3_600 + i * 30,
                "0xmm",
                "0xpump",
                "0xm",
                Side::Buy,
                burst_volume / 5.0 / 0.5,
                0.5,
            ));
            block += 1;
        }
        snapshot(trades, vec![])
    }

    #[test]
    fn spike_fires_with_log_scaled_confidence() {
        let snap = spike_snapshot(12_000.0);
        let findings = VolumeSpike.scan(&snap, &ScanCancel::new());

        assert!(!findings.is_empty());
        let top = findings
            .iter()
            .max_by(|a, b| a.confidence.partial_cmp(&b.confidence).unwrap())
            .unwrap();
        // ratio 12: confidence 0.3 + 0.05·log10(12) ≈ 0.354.
        assert!((top.confidence - 0.3539).abs() < 0.01);
    }

    #[test]
    fn steady_flow_stays_quiet() {
        let snap = spike_snapshot(0.0);
        let mut snap = snap;
        // Drop the zero-volume burst trades entirely.
        snap.trades.retain(|t| t.volume > 0.0);
        assert!(VolumeSpike.scan(&snap, &ScanCancel::new()).is_empty());
    }

    #[test]
    fn thin_baseline_never_spikes() {
        // $10 baseline buckets, then a huge print: mean below the floor.
        let mut trades = Vec::new();
        for i in 0..60i64 {
            trades.push(trade(
                100 + i as u64,
                0,
                i * 60,
                "0xmm",
                "0xflow",
                "0xm",
                Side::Buy,
                4.0,
                0.5,
            ));
        }
        trades.push(trade(300, 0, 3_630, "0xmm", "0xpump", "0xm", Side::Buy, 20_000.0, 0.5));
        let snap = snapshot(trades, vec![]);
        assert!(VolumeSpike.scan(&snap, &ScanCancel::new()).is_empty());
    }

    #[test]
    fn deterministic_output() {
        let snap = spike_snapshot(12_000.0);
        let a = serde_json::to_string(&VolumeSpike.scan(&snap, &ScanCancel::new())).unwrap();
        let b = serde_json::to_string(&VolumeSpike.scan(&snap, &ScanCancel::new())).unwrap();
        assert_eq!(a, b);
    }
}
