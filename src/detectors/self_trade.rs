//! Self-trade detector.
//!
//! Direct form: maker and taker are the same wallet. Coordinated form:
//! mirror-image fills (same market, size, price, minute) between trades
//! whose participant sets overlap.

use crate::detectors::{build_evidence, Detector, ScanCancel};
use crate::models::{Evidence, EvidenceKind, Trade};
use crate::store::Snapshot;
use std::collections::HashMap;
use std::sync::Arc;

const COORDINATED_BUCKET_SECS: i64 = 60;
const DIRECT_CONFIDENCE: f64 = 1.0;
const COORDINATED_CONFIDENCE: f64 = 0.9;

pub struct SelfTrade;

impl Detector for SelfTrade {
    fn kind(&self) -> EvidenceKind {
        EvidenceKind::SelfTrade
    }

    fn name(&self) -> &'static str {
        "self-trades"
    }

    fn scan(&self, snap: &Snapshot, cancel: &ScanCancel) -> Vec<Evidence> {
        let mut findings = Vec::new();

        // Direct: one wallet on both sides of a fill.
        for (i, t) in snap.trades.iter().enumerate() {
            if cancel.checkpoint(i) {
                break;
            }
            if t.maker == t.taker {
                findings.push(build_evidence(
                    EvidenceKind::SelfTrade,
                    &format!("{}:{}", t.tx_hash, t.log_index),
                    DIRECT_CONFIDENCE,
                    t.timestamp,
                    vec![t.maker.clone()],
                    vec![t.tx_hash.clone()],
                    t.token_id.clone(),
                    t.volume,
                    serde_json::json!({
                        "form": "direct",
                        "size": t.size,
                        "price": t.price,
                    }),
                ));
            }
        }

        // Coordinated: identical (size, price, minute) fills in one market
        // with overlapping participants.
        let mut groups: HashMap<(String, u64, u64, i64), Vec<Arc<Trade>>> = HashMap::new();
        for t in &snap.trades {
            let key = (
                t.market_key().to_string(),
                (t.size * 1e6).round() as u64,
                (t.price * 1e4).round() as u64,
                t.timestamp.div_euclid(COORDINATED_BUCKET_SECS),
            );
            groups.entry(key).or_default().push(t.clone());
        }

        let mut keys: Vec<_> = groups.keys().cloned().collect();
        keys.sort();

        for key in keys {
            let group = &groups[&key];
            if group.len() < 2 || !participants_overlap(group) {
                continue;
            }

            let addresses: Vec<String> = group
                .iter()
                .flat_map(|t| [t.maker.clone(), t.taker.clone()])
                .collect();
            let tx_hashes: Vec<String> = group.iter().map(|t| t.tx_hash.clone()).collect();
            let volume: f64 = group.iter().map(|t| t.volume).sum();
            let last = group.iter().map(|t| t.timestamp).max().unwrap_or(0);

            findings.push(build_evidence(
                EvidenceKind::CoordinatedSelfTrade,
                &format!("{}:{}:{}:{}", key.0, key.1, key.2, key.3),
                COORDINATED_CONFIDENCE,
                last,
                addresses,
                tx_hashes,
                group[0].token_id.clone(),
                volume,
                serde_json::json!({
                    "form": "coordinated",
                    "group_size": group.len(),
                    "size": group[0].size,
                    "price": group[0].price,
                }),
            ));
        }

        findings
    }
}

/// Some wallet appears in at least two distinct trades of the group.
fn participants_overlap(group: &[Arc<Trade>]) -> bool {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    for (i, t) in group.iter().enumerate() {
        for addr in [t.maker.as_str(), t.taker.as_str()] {
            match seen.get(addr) {
                Some(&first) if first != i => return true,
                Some(_) => {}
                None => {
                    seen.insert(addr, i);
                }
            }
        }
    }
    false
}
