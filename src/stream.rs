//! Streaming controller: the poll loop that drives ingestion.
//!
//! Explicit state machine (Idle → Streaming → Stopping → Idle) with a
//! cooperative stop flag. Every tick fetches confirmed logs, decodes and
//! commits them, advances the durable sync point only after the commit
//! lands, then re-scans the affected window with the detector suite. A bad
//! tick logs and retries; it never kills the loop.

use crate::bus::BusMessage;
use crate::chain::decoder::subscribed_topics;
use crate::chain::{DecodedEvent, LogDecoder, MarketResolver, RpcClient};
use crate::detectors::{
    DetectorSuite, ScanCancel, INCREMENTAL_WINDOW_SECS, INCREMENTAL_WINDOW_TRADES,
};
use crate::models::now_ts;
use crate::store::db::SYNC_STATE_KEY;
use crate::store::{EvidenceStore, SpillDb};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const DEFAULT_CONFIRMATIONS: u64 = 3;
/// How long a cooperative stop may take before the task is aborted.
const STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Idle,
    Streaming,
    Stopping,
}

pub struct StreamController {
    rpc: Arc<RpcClient>,
    decoder: Arc<LogDecoder>,
    store: Arc<EvidenceStore>,
    db: SpillDb,
    resolver: Arc<MarketResolver>,
    suite: Arc<DetectorSuite>,
    exchange_addresses: Vec<String>,
    confirmations: u64,
    state: Mutex<StreamState>,
    stop_flag: Arc<AtomicBool>,
    scan_cancel: Mutex<ScanCancel>,
    task: Mutex<Option<JoinHandle<()>>>,
    pending_resolutions: Arc<Mutex<HashSet<String>>>,
}

impl StreamController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rpc: Arc<RpcClient>,
        decoder: Arc<LogDecoder>,
        store: Arc<EvidenceStore>,
        db: SpillDb,
        resolver: Arc<MarketResolver>,
        suite: Arc<DetectorSuite>,
        exchange_addresses: Vec<String>,
        confirmations: u64,
    ) -> Self {
        Self {
            rpc,
            decoder,
            store,
            db,
            resolver,
            suite,
            exchange_addresses,
            confirmations,
            state: Mutex::new(StreamState::Idle),
            stop_flag: Arc::new(AtomicBool::new(false)),
            scan_cancel: Mutex::new(ScanCancel::new()),
            task: Mutex::new(None),
            pending_resolutions: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn state(&self) -> StreamState {
        *self.state.lock()
    }

    /// Begin streaming. Idempotent: a second start while streaming is a
    /// no-op returning false.
    pub fn start(self: Arc<Self>, poll_interval: Duration, blocks_per_poll: u64) -> bool {
        {
            let mut state = self.state.lock();
            if *state != StreamState::Idle {
                return false;
            }
            *state = StreamState::Streaming;
        }
        self.stop_flag.store(false, Ordering::Relaxed);

        let controller = self.clone();
        let handle = tokio::spawn(async move {
            controller.run_loop(poll_interval, blocks_per_poll).await;
        });
        *self.task.lock() = Some(handle);
        info!(
            poll_secs = poll_interval.as_secs(),
            blocks_per_poll, "🌊 Stream controller started"
        );
        true
    }

    /// Cooperative stop. The running tick finishes or is aborted after the
    /// grace period; either way the controller lands back in Idle.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock();
            if *state == StreamState::Idle {
                return;
            }
            *state = StreamState::Stopping;
        }
        self.stop_flag.store(true, Ordering::Relaxed);
        self.scan_cancel.lock().cancel();

        let deadline = tokio::time::Instant::now() + STOP_GRACE;
        while tokio::time::Instant::now() < deadline {
            if *self.state.lock() == StreamState::Idle {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
        *self.state.lock() = StreamState::Idle;
        self.store.set_streaming(false);
        warn!("stream stop exceeded grace period; task aborted");
    }

    async fn run_loop(self: Arc<Self>, poll_interval: Duration, blocks_per_poll: u64) {
        self.store.set_streaming(true);

        // Resume from the durable sync point after a restart.
        if self.store.last_block() == 0 {
            match self.db.load_sync_state(SYNC_STATE_KEY).await {
                Ok(Some(block)) => {
                    info!(block, "resuming stream from durable sync state");
                    self.store.set_last_block(block);
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "could not load sync state"),
            }
        }

        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if self.stop_flag.load(Ordering::Relaxed) {
                break;
            }
            if let Err(e) = self.tick(blocks_per_poll).await {
                warn!(error = %e, "tick failed; will retry next poll");
            }
            if self.stop_flag.load(Ordering::Relaxed) {
                break;
            }
        }

        self.store.set_streaming(false);
        *self.state.lock() = StreamState::Idle;
        info!("🛑 Stream controller idle");
    }

    async fn tick(&self, blocks_per_poll: u64) -> Result<()> {
        let head = self
            .rpc
            .block_number()
            .await
            .context("fetch chain head")?;

        let Some((from, to)) = poll_range(
            head,
            self.confirmations,
            self.store.last_block(),
            blocks_per_poll,
        ) else {
            return Ok(());
        };

        let ingested = self.ingest_range(from, to, true).await?;

        // The batch is durably committed inside ingest_range; only now may
        // the sync point move.
        self.store.set_last_block(to);
        self.db
            .set_sync_state(SYNC_STATE_KEY, to, now_ts())
            .await
            .context("persist sync state")?;

        if ingested > 0 {
            debug!(from, to, ingested, "tick committed");
            self.run_incremental_detectors();
        }
        Ok(())
    }

    /// Fetch, decode, enrich and commit one block range. Returns the number
    /// of trades ingested. The trade batch is written to the durable store
    /// before returning so a crash never loses committed work.
    pub async fn ingest_range(&self, from: u64, to: u64, notify: bool) -> Result<usize> {
        let logs = self
            .rpc
            .get_logs(from, to, &self.exchange_addresses, &subscribed_topics())
            .await
            .with_context(|| format!("getLogs [{from}, {to}]"))?;

        let mut batch = Vec::new();
        for log in &logs {
            if log.removed {
                continue;
            }
            let Some(event) = self.decoder.decode(log) else {
                continue;
            };
            match event {
                DecodedEvent::Trade(mut trade) => {
                    trade.timestamp = self
                        .rpc
                        .block_timestamp(trade.block_number)
                        .await
                        .context("block timestamp")?;
                    trade.gas_price = self.rpc.transaction_gas_price(&trade.tx_hash).await;

                    match self.resolver.resolve(&trade.token_id) {
                        Some(market) => trade.market_slug = Some(market.slug.clone()),
                        None => self.schedule_resolution(trade.token_id.clone()),
                    }

                    batch.push(self.store.add_trade(trade, notify));
                }
                DecodedEvent::Op(mut op) => {
                    op.timestamp = self
                        .rpc
                        .block_timestamp(op.block_number)
                        .await
                        .context("block timestamp")?;
                    self.store.add_op(op);
                }
            }
        }

        if !batch.is_empty() {
            self.db
                .sync_batch(&batch, &[], &[])
                .await
                .context("commit trade batch")?;
        }
        Ok(batch.len())
    }

    /// Unknown token: store keeps the trade with `market=unknown` and a
    /// background lookup patches it in place once the catalog answers.
    fn schedule_resolution(&self, token_id: String) {
        if !self.pending_resolutions.lock().insert(token_id.clone()) {
            return;
        }

        let resolver = self.resolver.clone();
        let store = self.store.clone();
        let db = self.db.clone();
        let pending = self.pending_resolutions.clone();
        tokio::spawn(async move {
            let outcome = resolver.resolve_or_fetch(&token_id).await;
            pending.lock().remove(&token_id);
            match outcome {
                Ok(Some(market)) => {
                    store.patch_market(&token_id, &market.slug);
                    if let Err(e) = db.update_market_slug(&token_id, &market.slug).await {
                        warn!(error = %e, "market slug backfill failed");
                    }
                    if let Err(e) = db.upsert_market(&market).await {
                        warn!(error = %e, "market upsert failed");
                    }
                }
                Ok(None) => debug!(token_id, "catalog does not know this token"),
                Err(e) => debug!(token_id, error = %e, "market resolution failed"),
            }
        });
    }

    /// Re-scan only the affected window after a committed tick.
    fn run_incremental_detectors(&self) {
        let cancel = ScanCancel::new();
        *self.scan_cancel.lock() = cancel.clone();

        let snap = self
            .store
            .snapshot_window(INCREMENTAL_WINDOW_SECS, INCREMENTAL_WINDOW_TRADES);
        let window_trades = snap.trades.len();
        let findings = self.suite.run_all(&snap, &cancel);
        let mut fresh = 0usize;
        for evidence in findings {
            if self.store.add_evidence(evidence) {
                fresh += 1;
            }
        }

        if fresh > 0 {
            info!(window_trades, fresh, "🔍 incremental scan produced evidence");
        }
        self.store.bus().publish(BusMessage::AnalysisStats(serde_json::json!({
            "window_trades": window_trades,
            "new_evidence": fresh,
        })));
    }

    /// One-shot backfill of the last `blocks` confirmed blocks, then a full
    /// detector pass. Does not move the streaming sync point.
    pub async fn backfill(&self, blocks: u64) -> Result<usize> {
        let head = self.rpc.block_number().await.context("fetch chain head")?;
        let to = head.saturating_sub(self.confirmations);
        if to == 0 {
            return Ok(0);
        }
        let from = to.saturating_sub(blocks.saturating_sub(1)).max(1);

        let ingested = self.ingest_range(from, to, false).await?;
        info!(from, to, ingested, "📦 backfill complete");

        let cancel = ScanCancel::new();
        let snap = self.store.snapshot();
        for evidence in self.suite.run_all(&snap, &cancel) {
            self.store.add_evidence(evidence);
        }
        Ok(ingested)
    }
}

/// Next block range to poll, honoring the confirmation depth. None when
/// nothing new is confirmed yet.
fn poll_range(
    head: u64,
    confirmations: u64,
    last_block: u64,
    blocks_per_poll: u64,
) -> Option<(u64, u64)> {
    let confirmed = head.saturating_sub(confirmations);
    if confirmed == 0 {
        return None;
    }
    let from = if last_block == 0 {
        confirmed
    } else {
        last_block + 1
    };
    if from > confirmed {
        return None;
    }
    let to = confirmed.min(from + blocks_per_poll.max(1) - 1);
    Some((from, to))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::AlertBus;
    use crate::chain::{DecodeStats, NullCatalog};
    use crate::store::StoreConfig;

    fn controller() -> (Arc<StreamController>, tempfile::TempDir) {
        let bus = Arc::new(AlertBus::new());
        let store = Arc::new(EvidenceStore::new(StoreConfig::default(), bus));
        let dir = tempfile::tempdir().unwrap();
        let db = SpillDb::new(dir.path().join("t.db").to_str().unwrap()).unwrap();
        let controller = Arc::new(StreamController::new(
            // Nothing listens here; ticks fail soft, which is all these
            // lifecycle tests need.
            Arc::new(RpcClient::new("http://127.0.0.1:1".to_string())),
            Arc::new(LogDecoder::new(Arc::new(DecodeStats::default()))),
            store,
            db,
            Arc::new(MarketResolver::new(Arc::new(NullCatalog))),
            Arc::new(DetectorSuite::standard()),
            vec![crate::models::DEFAULT_EXCHANGE_ADDRESSES.to_string()],
            DEFAULT_CONFIRMATIONS,
        ));
        (controller, dir)
    }

    #[test]
    fn poll_range_respects_confirmation_depth() {
        // Head 100, 3 confirmations, resuming from 90: process (91, 97).
        assert_eq!(poll_range(100, 3, 90, 200), Some((91, 97)));
        // Caught up at 97: blocks 98-100 stay unconfirmed.
        assert_eq!(poll_range(100, 3, 97, 200), None);
        // Cold start lands on the confirmed head only.
        assert_eq!(poll_range(100, 3, 0, 200), Some((97, 97)));
        // Batch cap limits the range.
        assert_eq!(poll_range(1_000, 3, 100, 50), Some((101, 150)));
        // Nothing confirmed on a young chain.
        assert_eq!(poll_range(2, 3, 0, 50), None);
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_returns_to_idle() {
        let (controller, _dir) = controller();
        assert_eq!(controller.state(), StreamState::Idle);

        assert!(controller.clone().start(Duration::from_millis(10), 10));
        assert!(!controller.clone().start(Duration::from_millis(10), 10));
        assert_eq!(controller.state(), StreamState::Streaming);

        controller.stop().await;
        assert_eq!(controller.state(), StreamState::Idle);

        // A stopped controller can start again.
        assert!(controller.clone().start(Duration::from_millis(10), 10));
        controller.stop().await;
        assert_eq!(controller.state(), StreamState::Idle);
    }

    #[tokio::test]
    async fn stop_on_idle_is_a_no_op() {
        let (controller, _dir) = controller();
        controller.stop().await;
        assert_eq!(controller.state(), StreamState::Idle);
    }
}
