//! Detector suite: eight independent analyzers over a read-only snapshot.
//!
//! Detectors are a tagged set of `{kind, scan}` values, not a hierarchy.
//! Every detector is a pure function of the snapshot: same input, byte-equal
//! findings, which is what makes evidence ids and re-scans idempotent.

pub mod atomic_wash;
pub mod circular;
pub mod gas_anomaly;
pub mod health;
pub mod insider;
pub mod self_trade;
pub mod sybil;
pub mod volume_spike;
pub mod win_rate;

use crate::models::{Evidence, EvidenceKind};
use crate::store::Snapshot;
use alloy_primitives::keccak256;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Incremental-scan window after each streaming tick.
pub const INCREMENTAL_WINDOW_SECS: i64 = 60 * 60;
pub const INCREMENTAL_WINDOW_TRADES: usize = 5_000;

/// Detectors poll this flag once per `CANCEL_CHECK_INTERVAL` trades.
pub const CANCEL_CHECK_INTERVAL: usize = 1_000;

/// Cooperative cancellation for long scans. Cancellation is not an error:
/// a cancelled scan returns whatever it found so far.
#[derive(Clone, Default)]
pub struct ScanCancel(Arc<AtomicBool>);

impl ScanCancel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// True when the scan should stop at this trade boundary.
    pub fn checkpoint(&self, index: usize) -> bool {
        index % CANCEL_CHECK_INTERVAL == 0 && self.is_cancelled()
    }
}

pub trait Detector: Send + Sync {
    fn kind(&self) -> EvidenceKind;

    /// Route segment the REST surface exposes this detector under.
    fn name(&self) -> &'static str;

    fn scan(&self, snap: &Snapshot, cancel: &ScanCancel) -> Vec<Evidence>;
}

/// Deterministic content-derived evidence id.
pub(crate) fn evidence_id(kind: EvidenceKind, discriminator: &str) -> String {
    let digest = keccak256(format!("{}|{}", kind.as_str(), discriminator).as_bytes());
    format!("{}_{}", kind.as_str(), &hex::encode(digest)[..16])
}

/// Assemble an evidence item with canonicalized participant sets.
#[allow(clippy::too_many_arguments)]
pub(crate) fn build_evidence(
    kind: EvidenceKind,
    discriminator: &str,
    confidence: f64,
    timestamp: i64,
    mut addresses: Vec<String>,
    mut tx_hashes: Vec<String>,
    token_id: String,
    volume: f64,
    details: serde_json::Value,
) -> Evidence {
    addresses.sort();
    addresses.dedup();
    tx_hashes.sort();
    tx_hashes.dedup();
    Evidence {
        id: evidence_id(kind, discriminator),
        kind,
        confidence,
        timestamp,
        addresses,
        tx_hashes,
        token_id,
        volume,
        details,
    }
}

/// The eight analyzers in their fixed scan order.
pub struct DetectorSuite {
    detectors: Vec<Box<dyn Detector>>,
}

impl Default for DetectorSuite {
    fn default() -> Self {
        Self::standard()
    }
}

impl DetectorSuite {
    pub fn standard() -> Self {
        Self {
            detectors: vec![
                Box::new(insider::NewWalletInsider),
                Box::new(win_rate::HighWinRate),
                Box::new(gas_anomaly::GasAnomaly),
                Box::new(self_trade::SelfTrade),
                Box::new(circular::CircularTrade),
                Box::new(atomic_wash::AtomicWash),
                Box::new(volume_spike::VolumeSpike),
                Box::new(sybil::SybilCluster),
            ],
        }
    }

    pub fn all(&self) -> impl Iterator<Item = &dyn Detector> {
        self.detectors.iter().map(|d| d.as_ref())
    }

    pub fn by_name(&self, name: &str) -> Option<&dyn Detector> {
        self.detectors
            .iter()
            .map(|d| d.as_ref())
            .find(|d| d.name() == name)
    }

    /// The "basic" REST group.
    pub fn basic(&self) -> Vec<&dyn Detector> {
        ["insider", "high-winrate", "gas-anomaly"]
            .iter()
            .filter_map(|n| self.by_name(n))
            .collect()
    }

    /// The "advanced" REST group.
    pub fn advanced(&self) -> Vec<&dyn Detector> {
        [
            "self-trades",
            "circular-trades",
            "atomic-wash",
            "volume-spikes",
            "sybil-clusters",
        ]
        .iter()
        .filter_map(|n| self.by_name(n))
        .collect()
    }

    /// Run every detector over one snapshot.
    pub fn run_all(&self, snap: &Snapshot, cancel: &ScanCancel) -> Vec<Evidence> {
        let mut out = Vec::new();
        for detector in &self.detectors {
            if cancel.is_cancelled() {
                break;
            }
            out.extend(detector.scan(snap, cancel));
        }
        out
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use crate::models::{Side, TokenOp, TokenOpKind, Trade};
    use crate::store::Snapshot;
    use std::sync::Arc;

    pub fn snapshot(trades: Vec<Trade>, ops: Vec<TokenOp>) -> Snapshot {
        let mut trades: Vec<Arc<Trade>> = trades.into_iter().map(Arc::new).collect();
        trades.sort_by(|a, b| {
            (a.block_number, a.log_index, a.tx_hash.as_str())
                .cmp(&(b.block_number, b.log_index, b.tx_hash.as_str()))
        });
        let mut ops: Vec<Arc<TokenOp>> = ops.into_iter().map(Arc::new).collect();
        ops.sort_by(|a, b| {
            (a.block_number, a.log_index, a.tx_hash.as_str())
                .cmp(&(b.block_number, b.log_index, b.tx_hash.as_str()))
        });
        Snapshot {
            trades,
            ops,
            evidence: Vec::new(),
            taken_at: 2_000_000_000,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn trade(
        block: u64,
        log_index: u64,
        ts: i64,
        maker: &str,
        taker: &str,
        token: &str,
        side: Side,
        size: f64,
        price: f64,
    ) -> Trade {
        Trade {
            tx_hash: format!("0xtx{block:05}{log_index:03}"),
            log_index,
            block_number: block,
            timestamp: ts,
            exchange: "0xexchange".to_string(),
            maker: maker.to_string(),
            taker: taker.to_string(),
            maker_asset_id: if side == Side::Buy { "0x0".into() } else { token.into() },
            taker_asset_id: if side == Side::Buy { token.into() } else { "0x0".into() },
            maker_amount_filled: (size * price * 1e6) as u128,
            taker_amount_filled: (size * 1e6) as u128,
            token_id: token.to_string(),
            side,
            price,
            size,
            volume: size * price,
            gas_price: 30_000_000_000,
            market_slug: None,
            is_wash: false,
            price_out_of_range: false,
        }
    }

    pub fn op(
        kind: TokenOpKind,
        tx_hash: &str,
        log_index: u64,
        block: u64,
        ts: i64,
        stakeholder: &str,
        amount: u128,
    ) -> TokenOp {
        TokenOp {
            kind,
            tx_hash: tx_hash.to_string(),
            log_index,
            block_number: block,
            timestamp: ts,
            stakeholder: stakeholder.to_string(),
            collateral: crate::models::USDC_ADDRESS.to_string(),
            parent_collection_id: format!("0x{}", "00".repeat(32)),
            condition_id: format!("0x{}", "aa".repeat(32)),
            partition: vec![1, 2],
            amount,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suite_exposes_basic_and_advanced_groups() {
        let suite = DetectorSuite::standard();
        assert_eq!(suite.basic().len(), 3);
        assert_eq!(suite.advanced().len(), 5);
        assert!(suite.by_name("self-trades").is_some());
        assert!(suite.by_name("nonsense").is_none());
    }

    #[test]
    fn evidence_ids_are_deterministic_and_kind_scoped() {
        let a = evidence_id(EvidenceKind::SelfTrade, "0xtx:1");
        let b = evidence_id(EvidenceKind::SelfTrade, "0xtx:1");
        let c = evidence_id(EvidenceKind::CircularTrade, "0xtx:1");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("self_trade_"));
    }

    #[test]
    fn cancel_checkpoint_only_at_boundaries() {
        let cancel = ScanCancel::new();
        cancel.cancel();
        assert!(cancel.checkpoint(0));
        assert!(cancel.checkpoint(1_000));
        assert!(!cancel.checkpoint(999));
    }
}
