//! Market-health aggregator.
//!
//! Composes detector output into a per-market score. Repeat findings of the
//! same kind decay by 1/√n so one noisy detector cannot zero a market on
//! its own, while score never moves up when evidence is added.

use crate::models::{Evidence, MarketHealth, RiskLevel, SuspiciousAddress};
use crate::store::Snapshot;
use std::collections::HashMap;
use std::sync::Arc;

pub const MIN_TRADES: usize = 20;
pub const TOP_SUSPICIOUS: usize = 50;

/// Health for every market with at least `min_trades` trades, worst first.
pub fn compute_market_health(snap: &Snapshot, min_trades: usize) -> Vec<MarketHealth> {
    let mut trade_counts: HashMap<&str, usize> = HashMap::new();
    let mut token_to_market: HashMap<&str, &str> = HashMap::new();
    for t in &snap.trades {
        *trade_counts.entry(t.market_key()).or_default() += 1;
        token_to_market.entry(t.token_id.as_str()).or_insert_with(|| t.market_key());
    }

    let mut by_market: HashMap<&str, Vec<&Arc<Evidence>>> = HashMap::new();
    for e in &snap.evidence {
        let market = token_to_market
            .get(e.token_id.as_str())
            .copied()
            .unwrap_or(e.token_id.as_str());
        by_market.entry(market).or_default().push(e);
    }

    let mut out = Vec::new();
    for (&market, &count) in &trade_counts {
        if count < min_trades {
            continue;
        }
        let mut items: Vec<&Arc<Evidence>> =
            by_market.get(market).cloned().unwrap_or_default();
        // Occurrence order must be stable for the 1/√n decay.
        items.sort_by(|a, b| (a.timestamp, a.id.as_str()).cmp(&(b.timestamp, b.id.as_str())));

        let mut score = 100.0f64;
        let mut kind_counts: HashMap<&'static str, usize> = HashMap::new();
        let mut evidence_counts: HashMap<String, usize> = HashMap::new();
        let mut address_scores: HashMap<&str, (f64, usize)> = HashMap::new();

        for e in &items {
            let n = kind_counts.entry(e.kind.as_str()).or_default();
            *n += 1;
            let penalty = e.kind.base_weight() * e.confidence / (*n as f64).sqrt();
            score -= penalty;

            *evidence_counts.entry(e.kind.as_str().to_string()).or_default() += 1;
            for addr in &e.addresses {
                let entry = address_scores.entry(addr.as_str()).or_default();
                entry.0 += e.kind.base_weight() * e.confidence;
                entry.1 += 1;
            }
        }
        let score = score.clamp(0.0, 100.0);

        let mut suspicious: Vec<SuspiciousAddress> = address_scores
            .into_iter()
            .map(|(address, (risk_score, evidence_count))| SuspiciousAddress {
                address: address.to_string(),
                risk_score,
                evidence_count,
            })
            .collect();
        suspicious.sort_by(|a, b| {
            b.risk_score
                .partial_cmp(&a.risk_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.address.cmp(&b.address))
        });
        suspicious.truncate(TOP_SUSPICIOUS);

        out.push(MarketHealth {
            market: market.to_string(),
            health_score: score,
            risk_level: RiskLevel::from_score(score),
            trade_count: count,
            evidence_counts,
            suspicious_addresses: suspicious,
        });
    }

    out.sort_by(|a, b| {
        a.health_score
            .partial_cmp(&b.health_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.market.cmp(&b.market))
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::testutil::{snapshot, trade};
    use crate::models::{EvidenceKind, Side};

    fn evidence(id: &str, kind: EvidenceKind, confidence: f64, ts: i64, addr: &str) -> Evidence {
        Evidence {
            id: id.to_string(),
            kind,
            confidence,
            timestamp: ts,
            addresses: vec![addr.to_string()],
            tx_hashes: vec![format!("0xtx{id}")],
            token_id: "0xm".to_string(),
            volume: 100.0,
            details: serde_json::json!({}),
        }
    }

    fn snapshot_with_evidence(evidence_items: Vec<Evidence>) -> Snapshot {
        let trades: Vec<_> = (0..25u64)
            .map(|i| trade(100 + i, 0, 1_000 + i as i64, "0xa", "0xb", "0xm", Side::Buy, 1.0, 0.5))
            .collect();
        let mut snap = snapshot(trades, vec![]);
        snap.evidence = evidence_items.into_iter().map(Arc::new).collect();
        snap
    }

    #[test]
    fn repeated_self_trades_decay_by_inverse_sqrt() {
        let snap = snapshot_with_evidence(vec![
            evidence("a", EvidenceKind::SelfTrade, 1.0, 1_001, "0xw"),
            evidence("b", EvidenceKind::SelfTrade, 1.0, 1_002, "0xw"),
        ]);
        let health = compute_market_health(&snap, MIN_TRADES);
        assert_eq!(health.len(), 1);

        // 100 − 15 − 15/√2 ≈ 74.4.
        let expected = 100.0 - 15.0 - 15.0 / 2.0f64.sqrt();
        assert!((health[0].health_score - expected).abs() < 0.05);
        assert_eq!(health[0].risk_level, RiskLevel::Medium);
        assert_eq!(health[0].evidence_counts["self_trade"], 2);
    }

    #[test]
    fn score_is_monotone_in_evidence() {
        let base = snapshot_with_evidence(vec![evidence(
            "a",
            EvidenceKind::VolumeSpike,
            0.5,
            1_001,
            "0xw",
        )]);
        let more = snapshot_with_evidence(vec![
            evidence("a", EvidenceKind::VolumeSpike, 0.5, 1_001, "0xw"),
            evidence("b", EvidenceKind::GasAnomaly, 0.6, 1_002, "0xw"),
        ]);

        let s1 = compute_market_health(&base, MIN_TRADES)[0].health_score;
        let s2 = compute_market_health(&more, MIN_TRADES)[0].health_score;
        assert!(s2 < s1);
    }

    #[test]
    fn score_clamps_at_zero() {
        let items: Vec<Evidence> = (0..100)
            .map(|i| {
                evidence(
                    &format!("e{i:03}"),
                    EvidenceKind::SelfTrade,
                    1.0,
                    1_000 + i,
                    "0xw",
                )
            })
            .collect();
        let snap = snapshot_with_evidence(items);
        let health = compute_market_health(&snap, MIN_TRADES);
        assert_eq!(health[0].health_score, 0.0);
        assert_eq!(health[0].risk_level, RiskLevel::Critical);
    }

    #[test]
    fn thin_markets_are_excluded() {
        let trades: Vec<_> = (0..5u64)
            .map(|i| trade(100 + i, 0, 1_000, "0xa", "0xb", "0xm", Side::Buy, 1.0, 0.5))
            .collect();
        let snap = snapshot(trades, vec![]);
        assert!(compute_market_health(&snap, MIN_TRADES).is_empty());
    }

    #[test]
    fn suspicious_addresses_rank_by_contribution() {
        let snap = snapshot_with_evidence(vec![
            evidence("a", EvidenceKind::SelfTrade, 1.0, 1_001, "0xheavy"),
            evidence("b", EvidenceKind::GasAnomaly, 0.5, 1_002, "0xlight"),
        ]);
        let health = compute_market_health(&snap, MIN_TRADES);
        let suspects = &health[0].suspicious_addresses;
        assert_eq!(suspects[0].address, "0xheavy");
        assert!(suspects[0].risk_score > suspects[1].risk_score);
    }
}
