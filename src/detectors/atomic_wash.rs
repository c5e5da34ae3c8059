//! Atomic-wash detector.
//!
//! Strong form: a single transaction that splits collateral, fills against
//! itself and merges back, all touching one account. Weak form: one address
//! whose buy and sell volume in a single (block, market) nearly cancel.

use crate::detectors::{build_evidence, Detector, ScanCancel};
use crate::models::{Evidence, EvidenceKind, Side, TokenOp, TokenOpKind, Trade};
use crate::store::Snapshot;
use std::collections::HashMap;
use std::sync::Arc;

/// |buy − sell| / max(buy, sell) must stay under this.
const BALANCE_TOLERANCE: f64 = 0.2;
const CONFIDENCE_FLOOR: f64 = 0.90;
const CONFIDENCE_CEIL: f64 = 0.98;

pub struct AtomicWash;

impl Detector for AtomicWash {
    fn kind(&self) -> EvidenceKind {
        EvidenceKind::AtomicWash
    }

    fn name(&self) -> &'static str {
        "atomic-wash"
    }

    fn scan(&self, snap: &Snapshot, cancel: &ScanCancel) -> Vec<Evidence> {
        let mut findings = scan_atomic_transactions(snap, cancel);
        findings.extend(scan_balanced_blocks(snap, cancel));
        findings
    }
}

/// Split → fill → merge inside one transaction, same account throughout.
fn scan_atomic_transactions(snap: &Snapshot, cancel: &ScanCancel) -> Vec<Evidence> {
    let mut fills_by_tx: HashMap<&str, Vec<Arc<Trade>>> = HashMap::new();
    for t in &snap.trades {
        fills_by_tx.entry(t.tx_hash.as_str()).or_default().push(t.clone());
    }

    let mut ops_by_tx: HashMap<&str, Vec<Arc<TokenOp>>> = HashMap::new();
    for op in &snap.ops {
        ops_by_tx.entry(op.tx_hash.as_str()).or_default().push(op.clone());
    }

    let mut tx_hashes: Vec<&str> = ops_by_tx.keys().copied().collect();
    tx_hashes.sort_unstable();

    let mut findings = Vec::new();
    for (i, tx) in tx_hashes.into_iter().enumerate() {
        if cancel.checkpoint(i) {
            break;
        }
        let ops = &ops_by_tx[tx];
        let Some(fills) = fills_by_tx.get(tx) else {
            continue;
        };

        let splits: Vec<&Arc<TokenOp>> =
            ops.iter().filter(|o| o.kind == TokenOpKind::Split).collect();
        let merges: Vec<&Arc<TokenOp>> =
            ops.iter().filter(|o| o.kind == TokenOpKind::Merge).collect();
        if splits.is_empty() || merges.is_empty() {
            continue;
        }

        // The splitting account must sit on one side of a fill.
        let account = splits.iter().find_map(|s| {
            fills
                .iter()
                .any(|f| f.maker == s.stakeholder || f.taker == s.stakeholder)
                .then(|| s.stakeholder.clone())
        });
        let Some(account) = account else {
            continue;
        };

        let split_amount: u128 = splits.iter().map(|s| s.amount).sum();
        let merge_amount: u128 = merges.iter().map(|m| m.amount).sum();
        let max_amount = split_amount.max(merge_amount);
        if max_amount == 0 {
            continue;
        }
        let closeness = 1.0 - split_amount.abs_diff(merge_amount) as f64 / max_amount as f64;
        let confidence =
            CONFIDENCE_FLOOR + (CONFIDENCE_CEIL - CONFIDENCE_FLOOR) * closeness.clamp(0.0, 1.0);

        let mut addresses = vec![account];
        addresses.extend(fills.iter().flat_map(|f| [f.maker.clone(), f.taker.clone()]));
        let volume: f64 = fills.iter().map(|f| f.volume).sum();
        let last_ts = fills
            .iter()
            .map(|f| f.timestamp)
            .chain(ops.iter().map(|o| o.timestamp))
            .max()
            .unwrap_or(0);

        findings.push(build_evidence(
            EvidenceKind::AtomicWash,
            &format!("tx:{tx}"),
            confidence,
            last_ts,
            addresses,
            vec![tx.to_string()],
            fills[0].token_id.clone(),
            volume,
            serde_json::json!({
                "form": "atomic_tx",
                "splits": splits.len(),
                "fills": fills.len(),
                "merges": merges.len(),
                "split_amount": split_amount.to_string(),
                "merge_amount": merge_amount.to_string(),
            }),
        ));
    }
    findings
}

/// Near-equal buy and sell volume by one address in one (block, market).
fn scan_balanced_blocks(snap: &Snapshot, cancel: &ScanCancel) -> Vec<Evidence> {
    #[derive(Default)]
    struct Flow {
        buy: f64,
        sell: f64,
        tx_hashes: Vec<String>,
        last_ts: i64,
    }

    let mut flows: HashMap<(u64, String, String), Flow> = HashMap::new();
    for (i, t) in snap.trades.iter().enumerate() {
        if cancel.checkpoint(i) {
            break;
        }
        // The taker trades the printed side; the maker takes the other.
        for (addr, side) in [
            (t.taker.as_str(), t.side),
            (
                t.maker.as_str(),
                match t.side {
                    Side::Buy => Side::Sell,
                    Side::Sell => Side::Buy,
                },
            ),
        ] {
            if t.maker == t.taker && side == Side::Sell {
                // A direct self-trade would double count; credit it once.
                continue;
            }
            let flow = flows
                .entry((t.block_number, addr.to_string(), t.token_id.clone()))
                .or_default();
            match side {
                Side::Buy => flow.buy += t.volume,
                Side::Sell => flow.sell += t.volume,
            }
            flow.tx_hashes.push(t.tx_hash.clone());
            flow.last_ts = flow.last_ts.max(t.timestamp);
        }
    }

    let mut keys: Vec<_> = flows.keys().cloned().collect();
    keys.sort();

    let mut findings = Vec::new();
    for key in keys {
        let flow = &flows[&key];
        let max = flow.buy.max(flow.sell);
        if flow.buy <= 0.0 || flow.sell <= 0.0 || max <= 0.0 {
            continue;
        }
        let imbalance = (flow.buy - flow.sell).abs() / max;
        if imbalance >= BALANCE_TOLERANCE {
            continue;
        }
        let closeness = 1.0 - imbalance / BALANCE_TOLERANCE;
        let confidence = CONFIDENCE_FLOOR + (CONFIDENCE_CEIL - CONFIDENCE_FLOOR) * closeness;

        let (block, addr, token) = key;
        findings.push(build_evidence(
            EvidenceKind::AtomicWash,
            &format!("block:{block}:{addr}:{token}"),
            confidence,
            flow.last_ts,
            vec![addr],
            flow.tx_hashes.clone(),
            token,
            flow.buy + flow.sell,
            serde_json::json!({
                "form": "balanced_block",
                "buy_volume": flow.buy,
                "sell_volume": flow.sell,
                "imbalance": imbalance,
            }),
        ));
    }
    findings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::testutil::{op, snapshot, trade};
    use crate::detectors::ScanCancel;

    #[test]
    fn split_fill_merge_in_one_tx_fires_at_full_confidence() {
        // Single tx: split 1 USDC, both fills at 0.5, merge 1 USDC back.
        let mut t1 = trade(10, 1, 1_000, "0xbot", "0xcounter", "0xyes", Side::Buy, 1.0, 0.5);
        t1.tx_hash = "0xwash".to_string();
        let mut t2 = trade(10, 2, 1_000, "0xcounter", "0xbot", "0xno", Side::Sell, 1.0, 0.5);
        t2.tx_hash = "0xwash".to_string();

        let ops = vec![
            op(TokenOpKind::Split, "0xwash", 0, 10, 1_000, "0xbot", 1_000_000),
            op(TokenOpKind::Merge, "0xwash", 3, 10, 1_000, "0xbot", 1_000_000),
        ];

        let snap = snapshot(vec![t1, t2], ops);
        let findings = scan_atomic_transactions(&snap, &ScanCancel::new());

        assert_eq!(findings.len(), 1);
        assert!((findings[0].confidence - 0.98).abs() < 1e-9);
        assert!(findings[0].addresses.contains(&"0xbot".to_string()));
    }

    #[test]
    fn split_without_merge_is_not_atomic() {
        let mut t = trade(10, 1, 1_000, "0xbot", "0xcounter", "0xyes", Side::Buy, 1.0, 0.5);
        t.tx_hash = "0xhalf".to_string();
        let ops = vec![op(TokenOpKind::Split, "0xhalf", 0, 10, 1_000, "0xbot", 1_000_000)];

        let snap = snapshot(vec![t], ops);
        assert!(scan_atomic_transactions(&snap, &ScanCancel::new()).is_empty());
    }

    #[test]
    fn unrelated_stakeholder_is_not_linked() {
        let mut t = trade(10, 1, 1_000, "0xa", "0xb", "0xyes", Side::Buy, 1.0, 0.5);
        t.tx_hash = "0xmixed".to_string();
        let ops = vec![
            op(TokenOpKind::Split, "0xmixed", 0, 10, 1_000, "0xstranger", 1_000_000),
            op(TokenOpKind::Merge, "0xmixed", 2, 10, 1_000, "0xstranger", 1_000_000),
        ];

        let snap = snapshot(vec![t], ops);
        assert!(scan_atomic_transactions(&snap, &ScanCancel::new()).is_empty());
    }

    #[test]
    fn balanced_flow_in_one_block_fires() {
        // One wallet both buys and sells ~equal volume of a market in block 20.
        let trades = vec![
            trade(20, 0, 2_000, "0xmm", "0xw", "0xm", Side::Buy, 100.0, 0.5),
            trade(20, 1, 2_000, "0xmm2", "0xw", "0xm", Side::Sell, 95.0, 0.5),
        ];
        let snap = snapshot(trades, vec![]);
        let findings = scan_balanced_blocks(&snap, &ScanCancel::new());

        let wallet: Vec<_> = findings
            .iter()
            .filter(|e| e.addresses == vec!["0xw".to_string()])
            .collect();
        assert_eq!(wallet.len(), 1);
        // 5% imbalance: confidence 0.90 + 0.08 * 0.75 = 0.96.
        assert!((wallet[0].confidence - 0.96).abs() < 1e-9);
    }

    #[test]
    fn one_sided_flow_is_quiet() {
        let trades = vec![
            trade(20, 0, 2_000, "0xmm", "0xw", "0xm", Side::Buy, 100.0, 0.5),
            trade(21, 0, 2_010, "0xmm", "0xw", "0xm", Side::Buy, 100.0, 0.5),
        ];
        let snap = snapshot(trades, vec![]);
        let findings = scan_balanced_blocks(&snap, &ScanCancel::new());
        assert!(findings.iter().all(|e| e.addresses != vec!["0xw".to_string()]));
    }
}
