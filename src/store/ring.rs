//! In-memory side of the evidence store.
//!
//! Trades, evidence and alerts live in bounded rings with oldest-first
//! eviction. Secondary indices (tx hash, address, token id) are maintained
//! atomically with the ring under a single writer lock; readers take cheap
//! `Arc` snapshots and never block the writer for long.

use crate::bus::{AlertBus, BusMessage};
use crate::models::{now_ts, Alert, Evidence, Side, StoreStats, TokenOp, Trade};
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub trade_capacity: usize,
    pub alert_capacity: usize,
    pub evidence_capacity: usize,
    pub op_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            trade_capacity: 50_000,
            alert_capacity: 1_000,
            evidence_capacity: 50_000,
            op_capacity: 10_000,
        }
    }
}

/// Query filter shared by the ring and the durable store.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TradeFilter {
    pub token_id: Option<String>,
    pub address: Option<String>,
    pub is_wash: Option<bool>,
    pub side: Option<Side>,
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl TradeFilter {
    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(100).clamp(1, 5_000)
    }
}

/// Read-only view handed to detectors. Trades and ops are in ascending
/// (block, log-index) order, ties broken by tx hash, so every scan over the
/// same snapshot is deterministic.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub trades: Vec<Arc<Trade>>,
    pub ops: Vec<Arc<TokenOp>>,
    pub evidence: Vec<Arc<Evidence>>,
    pub taken_at: i64,
}

#[derive(Default)]
struct Inner {
    trades: VecDeque<Arc<Trade>>,
    by_key: HashMap<(String, u64), Arc<Trade>>,
    by_tx: HashMap<String, Vec<Arc<Trade>>>,
    by_address: HashMap<String, Vec<Arc<Trade>>>,
    by_token: HashMap<String, Vec<Arc<Trade>>>,
    ops: VecDeque<Arc<TokenOp>>,
    op_keys: HashSet<(String, u64)>,
    evidence: VecDeque<Arc<Evidence>>,
    evidence_ids: HashSet<String>,
    alerts: VecDeque<Alert>,
    alert_ids: HashSet<String>,
    wash_txs: HashSet<String>,
    unsynced_trades: Vec<Arc<Trade>>,
    unsynced_alerts: Vec<Alert>,
    unsynced_evidence: Vec<Arc<Evidence>>,
    total_trades_seen: u64,
    total_volume: f64,
}

/// Exclusive owner of the trade and evidence collections.
pub struct EvidenceStore {
    inner: RwLock<Inner>,
    cfg: StoreConfig,
    bus: Arc<AlertBus>,
    streaming: AtomicBool,
    last_block: AtomicU64,
}

impl EvidenceStore {
    pub fn new(cfg: StoreConfig, bus: Arc<AlertBus>) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            cfg,
            bus,
            streaming: AtomicBool::new(false),
            last_block: AtomicU64::new(0),
        }
    }

    /// Append a trade, maintaining all indices and evicting the eldest when
    /// full. A duplicate (tx hash, log index) is a no-op returning the
    /// existing record, with no event published.
    pub fn add_trade(&self, trade: Trade, notify: bool) -> Arc<Trade> {
        let arc = {
            let mut inner = self.inner.write();
            let key = trade.key();
            if let Some(existing) = inner.by_key.get(&key) {
                return existing.clone();
            }

            let mut trade = trade;
            if inner.wash_txs.contains(&trade.tx_hash) {
                trade.is_wash = true;
            }
            let arc = Arc::new(trade);

            insert_by_order(&mut inner.trades, arc.clone());
            inner.by_key.insert(key, arc.clone());
            index_trade(&mut inner, &arc);
            inner.unsynced_trades.push(arc.clone());
            inner.total_trades_seen += 1;
            inner.total_volume += arc.volume;

            while inner.trades.len() > self.cfg.trade_capacity {
                evict_oldest(&mut inner);
            }
            arc
        };

        if notify {
            self.bus.publish(BusMessage::NewTrade((*arc).clone()));
        }
        arc
    }

    /// Record a split/merge. Duplicates are ignored.
    pub fn add_op(&self, op: TokenOp) {
        let mut inner = self.inner.write();
        let key = (op.tx_hash.clone(), op.log_index);
        if !inner.op_keys.insert(key) {
            return;
        }
        inner.ops.push_back(Arc::new(op));
        while inner.ops.len() > self.cfg.op_capacity {
            if let Some(old) = inner.ops.pop_front() {
                inner.op_keys.remove(&(old.tx_hash.clone(), old.log_index));
            }
        }
    }

    /// Add a detection finding. Returns false for a duplicate id. Wash-type
    /// evidence marks the cited transactions; findings above their kind's
    /// threshold derive an alert.
    pub fn add_evidence(&self, evidence: Evidence) -> bool {
        let (arc, newly_washed) = {
            let mut inner = self.inner.write();
            if !inner.evidence_ids.insert(evidence.id.clone()) {
                return false;
            }
            let arc = Arc::new(evidence);
            inner.evidence.push_back(arc.clone());
            inner.unsynced_evidence.push(arc.clone());

            let mut newly_washed: Vec<Arc<Trade>> = Vec::new();
            if arc.kind.is_wash() {
                for tx in &arc.tx_hashes {
                    if inner.wash_txs.insert(tx.clone()) {
                        if let Some(trades) = inner.by_tx.get(tx) {
                            newly_washed.extend(trades.iter().cloned());
                        }
                    }
                }
            }

            while inner.evidence.len() > self.cfg.evidence_capacity {
                if let Some(old) = inner.evidence.pop_front() {
                    inner.evidence_ids.remove(&old.id);
                }
            }
            (arc, newly_washed)
        };

        for trade in newly_washed {
            let mut flagged = (*trade).clone();
            flagged.is_wash = true;
            self.bus.publish(BusMessage::SuspiciousTrade(flagged));
        }
        if let Some(alert) = Alert::from_evidence(&arc) {
            self.add_alert(alert);
        }
        true
    }

    /// Append an alert and publish it. Duplicate ids are a no-op.
    pub fn add_alert(&self, alert: Alert) {
        let published = {
            let mut inner = self.inner.write();
            if !inner.alert_ids.insert(alert.id.clone()) {
                None
            } else {
                inner.alerts.push_back(alert.clone());
                inner.unsynced_alerts.push(alert.clone());
                while inner.alerts.len() > self.cfg.alert_capacity {
                    if let Some(old) = inner.alerts.pop_front() {
                        inner.alert_ids.remove(&old.id);
                    }
                }
                Some(alert)
            }
        };
        if let Some(alert) = published {
            debug!(alert = %alert.id, severity = ?alert.severity, "alert raised");
            self.bus.publish(BusMessage::NewAlert(alert));
        }
    }

    /// Acknowledge an alert in place.
    pub fn ack_alert(&self, alert_id: &str) -> bool {
        let mut inner = self.inner.write();
        for alert in inner.alerts.iter_mut() {
            if alert.id == alert_id {
                alert.ack = true;
                return true;
            }
        }
        false
    }

    /// Full-ring snapshot for on-demand analysis.
    pub fn snapshot(&self) -> Snapshot {
        let inner = self.inner.read();
        let mut trades: Vec<_> = inner.trades.iter().cloned().collect();
        let mut ops: Vec<_> = inner.ops.iter().cloned().collect();
        let evidence: Vec<_> = inner.evidence.iter().cloned().collect();
        drop(inner);

        trades.sort_by(|a, b| {
            (a.block_number, a.log_index, a.tx_hash.as_str())
                .cmp(&(b.block_number, b.log_index, b.tx_hash.as_str()))
        });
        ops.sort_by(|a, b| {
            (a.block_number, a.log_index, a.tx_hash.as_str())
                .cmp(&(b.block_number, b.log_index, b.tx_hash.as_str()))
        });

        Snapshot {
            trades,
            ops,
            evidence,
            taken_at: now_ts(),
        }
    }

    /// Snapshot restricted to the incremental-scan window: the last
    /// `max_age_secs` of trades or the last `max_trades`, whichever is the
    /// smaller set.
    pub fn snapshot_window(&self, max_age_secs: i64, max_trades: usize) -> Snapshot {
        let mut snap = self.snapshot();
        let cutoff = snap.taken_at - max_age_secs;

        let by_age = snap.trades.partition_point(|t| t.timestamp < cutoff);
        let by_count = snap.trades.len().saturating_sub(max_trades);
        let start = by_age.max(by_count);
        snap.trades.drain(..start);
        snap.ops.retain(|op| op.timestamp >= cutoff);
        snap
    }

    /// Serve a query from memory. The second return value is false when the
    /// request reaches back past the ring window and the caller should fall
    /// through to the durable store.
    pub fn query_trades(&self, filter: &TradeFilter) -> (Vec<Trade>, bool) {
        let inner = self.inner.read();

        if let Some(since) = filter.since {
            let window_start = inner.trades.front().map(|t| t.timestamp).unwrap_or(i64::MAX);
            let ring_full = inner.trades.len() >= self.cfg.trade_capacity;
            if ring_full && since < window_start {
                return (Vec::new(), false);
            }
        }

        // Narrow the candidate set through the best index available.
        let mut candidates: Vec<Arc<Trade>> = if let Some(token) = &filter.token_id {
            inner.by_token.get(token).cloned().unwrap_or_default()
        } else if let Some(addr) = &filter.address {
            inner.by_address.get(addr).cloned().unwrap_or_default()
        } else {
            inner.trades.iter().cloned().collect()
        };

        let wash = &inner.wash_txs;
        candidates.retain(|t| {
            if let Some(addr) = &filter.address {
                if &t.maker != addr && &t.taker != addr {
                    return false;
                }
            }
            if let Some(side) = filter.side {
                if t.side != side {
                    return false;
                }
            }
            if let Some(since) = filter.since {
                if t.timestamp < since {
                    return false;
                }
            }
            if let Some(until) = filter.until {
                if t.timestamp > until {
                    return false;
                }
            }
            if let Some(is_wash) = filter.is_wash {
                let flagged = t.is_wash || wash.contains(&t.tx_hash);
                if flagged != is_wash {
                    return false;
                }
            }
            true
        });

        // Most recent first for the API surface.
        candidates.sort_by(|a, b| {
            (b.block_number, b.log_index, b.tx_hash.as_str())
                .cmp(&(a.block_number, a.log_index, a.tx_hash.as_str()))
        });

        let offset = filter.offset.unwrap_or(0);
        let out = candidates
            .into_iter()
            .skip(offset)
            .take(filter.effective_limit())
            .map(|t| {
                let mut t = (*t).clone();
                t.is_wash = t.is_wash || wash.contains(&t.tx_hash);
                t
            })
            .collect();
        (out, true)
    }

    pub fn recent_alerts(&self, limit: usize) -> Vec<Alert> {
        let inner = self.inner.read();
        inner.alerts.iter().rev().take(limit).cloned().collect()
    }

    pub fn recent_evidence(&self, limit: usize) -> Vec<Arc<Evidence>> {
        let inner = self.inner.read();
        inner.evidence.iter().rev().take(limit).cloned().collect()
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.read();
        let wash_trade_count = inner
            .trades
            .iter()
            .filter(|t| t.is_wash || inner.wash_txs.contains(&t.tx_hash))
            .count() as u64;
        StoreStats {
            total_trades: inner.total_trades_seen,
            total_volume: inner.total_volume,
            wash_trade_count,
            total_alerts: inner.alerts.len() as u64,
            total_evidence: inner.evidence.len() as u64,
            is_streaming: self.streaming.load(Ordering::Relaxed),
            last_block: self.last_block.load(Ordering::Relaxed),
        }
    }

    /// Rewrite the market slug of every stored trade for a token. Idempotent;
    /// used when an asynchronous catalog resolution lands.
    pub fn patch_market(&self, token_id: &str, slug: &str) -> usize {
        let mut inner = self.inner.write();
        let stale: Vec<Arc<Trade>> = inner
            .by_token
            .get(token_id)
            .map(|v| {
                v.iter()
                    .filter(|t| t.market_slug.as_deref() != Some(slug))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        for old in &stale {
            let mut patched = (**old).clone();
            patched.market_slug = Some(slug.to_string());
            let patched = Arc::new(patched);
            replace_trade(&mut inner, old, patched);
        }
        stale.len()
    }

    /// Clone the pending spill batch under the read lock. The spill task
    /// writes it out with no lock held, then calls [`mark_synced`].
    pub fn unsynced_batch(&self) -> (Vec<Arc<Trade>>, Vec<Alert>, Vec<Arc<Evidence>>) {
        let inner = self.inner.read();
        (
            inner.unsynced_trades.clone(),
            inner.unsynced_alerts.clone(),
            inner.unsynced_evidence.clone(),
        )
    }

    /// Drop the first `trades`/`alerts`/`evidence` pending entries after a
    /// successful durable write.
    pub fn mark_synced(&self, trades: usize, alerts: usize, evidence: usize) {
        let mut inner = self.inner.write();
        let n = trades.min(inner.unsynced_trades.len());
        inner.unsynced_trades.drain(..n);
        let n = alerts.min(inner.unsynced_alerts.len());
        inner.unsynced_alerts.drain(..n);
        let n = evidence.min(inner.unsynced_evidence.len());
        inner.unsynced_evidence.drain(..n);
    }

    pub fn set_streaming(&self, streaming: bool) {
        self.streaming.store(streaming, Ordering::Relaxed);
    }

    pub fn set_last_block(&self, block: u64) {
        self.last_block.store(block, Ordering::Relaxed);
    }

    pub fn last_block(&self) -> u64 {
        self.last_block.load(Ordering::Relaxed)
    }

    pub fn bus(&self) -> &Arc<AlertBus> {
        &self.bus
    }

    pub fn trade_ring_len(&self) -> usize {
        self.inner.read().trades.len()
    }
}

/// Keep the ring ordered by (block, log-index, tx). Appends are the common
/// case; out-of-order inserts only happen on backfills.
fn insert_by_order(trades: &mut VecDeque<Arc<Trade>>, t: Arc<Trade>) {
    let in_order = trades.back().map_or(true, |b| {
        (b.block_number, b.log_index, b.tx_hash.as_str())
            <= (t.block_number, t.log_index, t.tx_hash.as_str())
    });
    if in_order {
        trades.push_back(t);
        return;
    }
    let idx = trades.partition_point(|x| {
        (x.block_number, x.log_index, x.tx_hash.as_str())
            <= (t.block_number, t.log_index, t.tx_hash.as_str())
    });
    trades.insert(idx, t);
}

fn index_trade(inner: &mut Inner, t: &Arc<Trade>) {
    inner
        .by_tx
        .entry(t.tx_hash.clone())
        .or_default()
        .push(t.clone());
    inner
        .by_address
        .entry(t.maker.clone())
        .or_default()
        .push(t.clone());
    if t.taker != t.maker {
        inner
            .by_address
            .entry(t.taker.clone())
            .or_default()
            .push(t.clone());
    }
    inner
        .by_token
        .entry(t.token_id.clone())
        .or_default()
        .push(t.clone());
}

fn unindex_trade(inner: &mut Inner, t: &Arc<Trade>) {
    remove_ref(&mut inner.by_tx, &t.tx_hash, t);
    remove_ref(&mut inner.by_address, &t.maker, t);
    if t.taker != t.maker {
        remove_ref(&mut inner.by_address, &t.taker, t);
    }
    remove_ref(&mut inner.by_token, &t.token_id, t);
}

fn remove_ref(index: &mut HashMap<String, Vec<Arc<Trade>>>, key: &str, t: &Arc<Trade>) {
    if let Some(refs) = index.get_mut(key) {
        refs.retain(|r| !Arc::ptr_eq(r, t));
        if refs.is_empty() {
            index.remove(key);
        }
    }
}

fn evict_oldest(inner: &mut Inner) {
    if let Some(old) = inner.trades.pop_front() {
        inner.by_key.remove(&(old.tx_hash.clone(), old.log_index));
        unindex_trade(inner, &old);
    }
}

fn replace_trade(inner: &mut Inner, old: &Arc<Trade>, new: Arc<Trade>) {
    if let Some(slot) = inner.trades.iter_mut().find(|t| Arc::ptr_eq(t, old)) {
        *slot = new.clone();
    }
    inner
        .by_key
        .insert((new.tx_hash.clone(), new.log_index), new.clone());
    for index in [&mut inner.by_tx, &mut inner.by_address, &mut inner.by_token] {
        for refs in index.values_mut() {
            for slot in refs.iter_mut() {
                if Arc::ptr_eq(slot, old) {
                    *slot = new.clone();
                }
            }
        }
    }
    if let Some(slot) = inner
        .unsynced_trades
        .iter_mut()
        .find(|t| Arc::ptr_eq(t, old))
    {
        *slot = new.clone();
    }
}
