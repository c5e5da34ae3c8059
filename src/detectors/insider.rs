//! New-wallet insider detector.
//!
//! A wallet trading far above a market's typical size within a day of its
//! first appearance anywhere in the store is a classic insider pattern.

use crate::detectors::{build_evidence, Detector, ScanCancel};
use crate::models::{Evidence, EvidenceKind};
use crate::store::Snapshot;
use std::collections::{HashMap, VecDeque};

const NEW_WALLET_MAX_AGE_SECS: i64 = 24 * 60 * 60;
const SIZE_MULTIPLE: f64 = 5.0;
/// Rolling per-market size window.
const MARKET_WINDOW: usize = 1_000;
/// A size baseline needs at least this many prior trades to be meaningful.
const MIN_PRIOR_TRADES: usize = 10;

pub struct NewWalletInsider;

impl Detector for NewWalletInsider {
    fn kind(&self) -> EvidenceKind {
        EvidenceKind::NewWalletInsider
    }

    fn name(&self) -> &'static str {
        "insider"
    }

    fn scan(&self, snap: &Snapshot, cancel: &ScanCancel) -> Vec<Evidence> {
        // First appearance of each address across the entire snapshot.
        let mut earliest: HashMap<&str, i64> = HashMap::new();
        for t in &snap.trades {
            for addr in [t.maker.as_str(), t.taker.as_str()] {
                earliest
                    .entry(addr)
                    .and_modify(|ts| *ts = (*ts).min(t.timestamp))
                    .or_insert(t.timestamp);
            }
        }

        let mut findings = Vec::new();
        let mut windows: HashMap<&str, (VecDeque<f64>, f64)> = HashMap::new();

        for (i, t) in snap.trades.iter().enumerate() {
            if cancel.checkpoint(i) {
                break;
            }

            let market = t.market_key();
            let (window, sum) = windows.entry(market).or_default();

            if window.len() >= MIN_PRIOR_TRADES {
                let mean = *sum / window.len() as f64;
                if mean > 0.0 && t.size > SIZE_MULTIPLE * mean {
                    for (role, addr) in [("maker", t.maker.as_str()), ("taker", t.taker.as_str())]
                    {
                        let age = t.timestamp - earliest.get(addr).copied().unwrap_or(t.timestamp);
                        if age < NEW_WALLET_MAX_AGE_SECS {
                            let ratio = t.size / mean;
                            let confidence = (ratio / 10.0).clamp(0.8, 1.0);
                            findings.push(build_evidence(
                                EvidenceKind::NewWalletInsider,
                                &format!("{}:{}:{}", t.tx_hash, t.log_index, addr),
                                confidence,
                                t.timestamp,
                                vec![addr.to_string()],
                                vec![t.tx_hash.clone()],
                                t.token_id.clone(),
                                t.volume,
                                serde_json::json!({
                                    "role": role,
                                    "account_age_secs": age,
                                    "trade_size": t.size,
                                    "market_mean_size": mean,
                                    "size_multiple": ratio,
                                }),
                            ));
                        }
                    }
                }
            }

            window.push_back(t.size);
            *sum += t.size;
            if window.len() > MARKET_WINDOW {
                if let Some(evicted) = window.pop_front() {
                    *sum -= evicted;
                }
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

    #[test]
    fn fires_for_fresh_wallet_with_outsized_trade() {
        let mut trades = Vec::new();
        // Two old wallets establish a 1.0-size baseline over 15 trades.
        for i in 0..15u64 {
            trades.push(trade(
                100 + i,
                0,
                1_000 + i as i64,
                "0xold1",
                "0xold2",
                "0xm",
                Side::Buy,
                1.0,
                0.5,
            ));
        }
        // Brand-new wallet takes a 10x-mean position minutes later.
        trades.push(trade(
            200,
            0,
            2_000,
            "0xold1",
            "0xfresh",
            "0xm",
            Side::Buy,
            10.0,
            0.5,
        ));

        let snap = snapshot(trades, vec![]);
        let findings = NewWalletInsider.scan(&snap, &ScanCancel::new());

        let fresh: Vec<_> = findings
            .iter()
            .filter(|e| e.addresses.contains(&"0xfresh".to_string()))
            .collect();
        assert_eq!(fresh.len(), 1);
        assert!((fresh[0].confidence - 1.0).abs() < 1e-9);
        assert_eq!(fresh[0].kind, EvidenceKind::NewWalletInsider);
    }

    #[test]
    fn old_wallets_do_not_fire() {
        let mut trades = Vec::new();
        for i in 0..15u64 {
            trades.push(trade(
                100 + i,
                0,
                1_000 + i as i64,
                "0xold1",
                "0xold2",
                "0xm",
                Side::Buy,
                1.0,
                0.5,
            ));
        }
        // Same wallet, two days later, outsized trade: aged past the window.
        trades.push(trade(
            5_000,
            0,
            1_000 + 2 * 86_400,
            "0xold1",
            "0xold2",
            "0xm",
            Side::Buy,
            10.0,
            0.5,
        ));

        let snap = snapshot(trades, vec![]);
        assert!(NewWalletInsider.scan(&snap, &ScanCancel::new()).is_empty());
    }

    #[test]
    fn thin_markets_have_no_baseline() {
        let trades = vec![
            trade(1, 0, 100, "0xa", "0xb", "0xm", Side::Buy, 1.0, 0.5),
            trade(2, 0, 101, "0xa", "0xc", "0xm", Side::Buy, 50.0, 0.5),
        ];
        let snap = snapshot(trades, vec![]);
        assert!(NewWalletInsider.scan(&snap, &ScanCancel::new()).is_empty());
    }

    #[test]
    fn deterministic_output() {
        let mut trades = Vec::new();
        for i in 0..15u64 {
            trades.push(trade(
                100 + i,
                0,
                1_000 + i as i64,
                "0xold1",
                "0xold2",
                "0xm",
                Side::Buy,
                1.0,
                0.5,
            ));
        }
        trades.push(trade(200, 0, 2_000, "0xa", "0xnew", "0xm", Side::Buy, 9.0, 0.5));

        let snap = snapshot(trades, vec![]);
        let a = serde_json::to_string(&NewWalletInsider.scan(&snap, &ScanCancel::new())).unwrap();
        let b = serde_json::to_string(&NewWalletInsider.scan(&snap, &ScanCancel::new())).unwrap();
        assert_eq!(a, b);
    }
}
