//! High win-rate detector.
//!
//! A "win" is an entry whose market moves at least 5% in the trade's favor
//! within the following 24 hours, measured against the market's last
//! observed price inside that window. Wallets that win more than 90% of at
//! least ten trades are flagged; nobody is that good honestly.

use crate::detectors::{build_evidence, Detector, ScanCancel};
use crate::models::{Evidence, EvidenceKind, Side};
use crate::store::Snapshot;
use std::collections::HashMap;

const MIN_TRADES: usize = 10;
const WIN_RATE_THRESHOLD: f64 = 0.9;
const FAVORABLE_MOVE: f64 = 0.05;
const EXIT_WINDOW_SECS: i64 = 24 * 60 * 60;

pub struct HighWinRate;

#[derive(Default)]
struct WalletStat {
    wins: usize,
    total: usize,
    tx_hashes: Vec<String>,
    last_token: String,
    last_ts: i64,
    volume: f64,
}

impl Detector for HighWinRate {
    fn kind(&self) -> EvidenceKind {
        EvidenceKind::HighWinRate
    }

    fn name(&self) -> &'static str {
        "high-winrate"
    }

    fn scan(&self, snap: &Snapshot, cancel: &ScanCancel) -> Vec<Evidence> {
        // Price series per market, already time-ordered by the snapshot.
        let mut series: HashMap<&str, Vec<(i64, f64)>> = HashMap::new();
        for t in &snap.trades {
            series.entry(t.market_key()).or_default().push((t.timestamp, t.price));
        }

        let mut stats: HashMap<&str, WalletStat> = HashMap::new();

        for (i, t) in snap.trades.iter().enumerate() {
            if cancel.checkpoint(i) {
                break;
            }

            let Some(prices) = series.get(t.market_key()) else {
                continue;
            };
            // Last observation strictly after entry, within 24 h.
            let lo = prices.partition_point(|(ts, _)| *ts <= t.timestamp);
            let hi = prices.partition_point(|(ts, _)| *ts <= t.timestamp + EXIT_WINDOW_SECS);
            if hi <= lo {
                continue;
            }
            let exit = prices[hi - 1].1;

            let won = match t.side {
                Side::Buy => exit >= t.price * (1.0 + FAVORABLE_MOVE),
                Side::Sell => exit <= t.price * (1.0 - FAVORABLE_MOVE),
            };

            let stat = stats.entry(t.taker.as_str()).or_default();
            stat.total += 1;
            if won {
                stat.wins += 1;
            }
            stat.tx_hashes.push(t.tx_hash.clone());
            stat.last_token = t.token_id.clone();
            stat.last_ts = t.timestamp;
            stat.volume += t.volume;
        }

        let mut wallets: Vec<(&str, WalletStat)> = stats.into_iter().collect();
        wallets.sort_by(|a, b| a.0.cmp(b.0));

        let mut findings = Vec::new();
        for (wallet, stat) in wallets {
            if stat.total < MIN_TRADES {
                continue;
            }
            let win_rate = stat.wins as f64 / stat.total as f64;
            if win_rate <= WIN_RATE_THRESHOLD {
                continue;
            }
            let confidence =
                (0.5 + 0.5 * (win_rate - WIN_RATE_THRESHOLD) / 0.1).clamp(0.5, 1.0);
            findings.push(build_evidence(
                EvidenceKind::HighWinRate,
                &format!("{wallet}:{}:{}", stat.wins, stat.total),
                confidence,
                stat.last_ts,
                vec![wallet.to_string()],
                stat.tx_hashes.clone(),
                stat.last_token.clone(),
                stat.volume,
                serde_json::json!({
                    "wins": stat.wins,
                    "trades": stat.total,
                    "win_rate": win_rate,
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

    /// One wallet buys low ten times; the market prints 10% higher shortly
    /// after every entry.
    fn winning_snapshot(wins: usize, losses: usize) -> Snapshot {
        let mut trades = Vec::new();
        let mut block = 100u64;
        let mut ts = 10_000i64;

        for i in 0..(wins + losses) {
            let entry = 0.50;
            trades.push(trade(block, 0, ts, "0xmm", "0xsharp", "0xm", Side::Buy, 1.0, entry));
            // The follow-up print decides the outcome inside the window.
            let follow = if i < wins { 0.60 } else { 0.50 };
            trades.push(trade(block + 1, 0, ts + 600, "0xmm", "0xcrowd", "0xm", Side::Buy, 1.0, follow));
            block += 10;
            ts += 3_600;
        }
        snapshot(trades, vec![])
    }

    #[test]
    fn flags_wallet_above_ninety_percent() {
        let snap = winning_snapshot(12, 0);
        let findings = HighWinRate.scan(&snap, &ScanCancel::new());

        let sharp: Vec<_> = findings
            .iter()
            .filter(|e| e.addresses.contains(&"0xsharp".to_string()))
            .collect();
        assert_eq!(sharp.len(), 1);
        // 100% win rate pins confidence at 1.0.
        assert!((sharp[0].confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn below_min_trades_is_ignored() {
        let snap = winning_snapshot(5, 0);
        let findings = HighWinRate.scan(&snap, &ScanCancel::new());
        assert!(findings
            .iter()
            .all(|e| !e.addresses.contains(&"0xsharp".to_string())));
    }

    #[test]
    fn mixed_record_stays_quiet() {
        // 7 of 14: well under the threshold.
        let snap = winning_snapshot(7, 7);
        let findings = HighWinRate.scan(&snap, &ScanCancel::new());
        assert!(findings
            .iter()
            .all(|e| !e.addresses.contains(&"0xsharp".to_string())));
    }

    #[test]
    fn deterministic_output() {
        let snap = winning_snapshot(11, 1);
        let a = serde_json::to_string(&HighWinRate.scan(&snap, &ScanCancel::new())).unwrap();
        let b = serde_json::to_string(&HighWinRate.scan(&snap, &ScanCancel::new())).unwrap();
        assert_eq!(a, b);
    }
}
