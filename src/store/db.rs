//! Durable SQLite spill behind the in-memory rings.
//!
//! Every 10 s a background task writes the pending trades, alerts and
//! evidence in one transaction, keyed so duplicates are ignored. A failed
//! write rolls back and the whole batch retries on the next tick; the rings
//! are never affected by spill failures.

use crate::models::{Alert, Evidence, EvidenceKind, Severity, Side, Trade};
use crate::store::ring::{EvidenceStore, TradeFilter};
use anyhow::{Context, Result};
use rusqlite::types::Value;
use rusqlite::{params, Connection};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const SPILL_INTERVAL_SECS: u64 = 10;
pub const SYNC_STATE_KEY: &str = "stream";

#[derive(Clone)]
pub struct SpillDb {
    conn: Arc<Mutex<Connection>>,
}

impl SpillDb {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open spill db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS trades (
                tx_hash TEXT NOT NULL,
                log_index INTEGER NOT NULL,
                block_number INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                exchange TEXT NOT NULL,
                maker TEXT NOT NULL,
                taker TEXT NOT NULL,
                maker_asset_id TEXT NOT NULL,
                taker_asset_id TEXT NOT NULL,
                maker_amount_filled TEXT NOT NULL,
                taker_amount_filled TEXT NOT NULL,
                token_id TEXT NOT NULL,
                side TEXT NOT NULL,
                price REAL NOT NULL,
                size REAL NOT NULL,
                volume REAL NOT NULL,
                gas_price TEXT NOT NULL,
                market_slug TEXT,
                is_wash INTEGER NOT NULL DEFAULT 0,
                UNIQUE(tx_hash, log_index)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_trades_token_ts ON trades(token_id, timestamp DESC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_trades_ts ON trades(timestamp DESC)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS alerts (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                severity TEXT NOT NULL,
                confidence REAL NOT NULL,
                timestamp INTEGER NOT NULL,
                token_id TEXT NOT NULL,
                evidence_id TEXT NOT NULL,
                message TEXT NOT NULL,
                ack INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS evidence (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                confidence REAL NOT NULL,
                timestamp INTEGER NOT NULL,
                token_id TEXT NOT NULL,
                volume REAL NOT NULL,
                addresses TEXT NOT NULL,
                tx_hashes TEXT NOT NULL,
                details TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS markets (
                condition_id TEXT PRIMARY KEY,
                question_id TEXT NOT NULL,
                oracle TEXT NOT NULL,
                yes_token_id TEXT NOT NULL,
                no_token_id TEXT NOT NULL,
                slug TEXT NOT NULL,
                question TEXT,
                status TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sync_state (
                key TEXT PRIMARY KEY,
                last_block INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Write one spill batch in a single transaction. Duplicates are ignored
    /// by key, so retries after partial failures are safe.
    pub async fn sync_batch(
        &self,
        trades: &[Arc<Trade>],
        alerts: &[Alert],
        evidence: &[Arc<Evidence>],
    ) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().context("begin spill transaction")?;

        for t in trades {
            tx.execute(
                "INSERT OR IGNORE INTO trades \
                 (tx_hash, log_index, block_number, timestamp, exchange, maker, taker, \
                  maker_asset_id, taker_asset_id, maker_amount_filled, taker_amount_filled, \
                  token_id, side, price, size, volume, gas_price, market_slug, is_wash) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
                params![
                    &t.tx_hash,
                    t.log_index as i64,
                    t.block_number as i64,
                    t.timestamp,
                    &t.exchange,
                    &t.maker,
                    &t.taker,
                    &t.maker_asset_id,
                    &t.taker_asset_id,
                    t.maker_amount_filled.to_string(),
                    t.taker_amount_filled.to_string(),
                    &t.token_id,
                    t.side.as_str(),
                    t.price,
                    t.size,
                    t.volume,
                    t.gas_price.to_string(),
                    t.market_slug.as_deref(),
                    t.is_wash as i64,
                ],
            )?;
        }

        for a in alerts {
            tx.execute(
                "INSERT OR IGNORE INTO alerts \
                 (id, kind, severity, confidence, timestamp, token_id, evidence_id, message, ack) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    &a.id,
                    a.kind.as_str(),
                    a.severity.as_str(),
                    a.confidence,
                    a.timestamp,
                    &a.token_id,
                    &a.evidence_id,
                    &a.message,
                    a.ack as i64,
                ],
            )?;
        }

        for e in evidence {
            tx.execute(
                "INSERT OR IGNORE INTO evidence \
                 (id, kind, confidence, timestamp, token_id, volume, addresses, tx_hashes, details) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    &e.id,
                    e.kind.as_str(),
                    e.confidence,
                    e.timestamp,
                    &e.token_id,
                    e.volume,
                    serde_json::to_string(&e.addresses).unwrap_or_default(),
                    serde_json::to_string(&e.tx_hashes).unwrap_or_default(),
                    e.details.to_string(),
                ],
            )?;
        }

        tx.commit().context("commit spill transaction")?;
        Ok(())
    }

    pub async fn upsert_market(&self, m: &crate::models::MarketInfo) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO markets \
             (condition_id, question_id, oracle, yes_token_id, no_token_id, slug, question, status) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
             ON CONFLICT(condition_id) DO UPDATE SET \
                slug = excluded.slug, question = excluded.question, status = excluded.status",
            params![
                &m.condition_id,
                &m.question_id,
                &m.oracle,
                &m.yes_token_id,
                &m.no_token_id,
                &m.slug,
                m.question.as_deref(),
                &m.status,
            ],
        )?;
        Ok(())
    }

    /// Backfill the slug onto trades persisted before the market resolved.
    pub async fn update_market_slug(&self, token_id: &str, slug: &str) -> Result<usize> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "UPDATE trades SET market_slug = ?2 WHERE token_id = ?1 AND \
             (market_slug IS NULL OR market_slug != ?2)",
            params![token_id, slug],
        )?;
        Ok(n)
    }

    /// All persisted markets, for warming the resolver cache on boot.
    pub async fn load_markets(&self) -> Result<Vec<crate::models::MarketInfo>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT condition_id, question_id, oracle, yes_token_id, no_token_id, slug, question, status \
             FROM markets ORDER BY condition_id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(crate::models::MarketInfo {
                condition_id: row.get(0)?,
                question_id: row.get(1)?,
                oracle: row.get(2)?,
                yes_token_id: row.get(3)?,
                no_token_id: row.get(4)?,
                slug: row.get(5)?,
                question: row.get(6)?,
                status: row.get(7)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            if let Ok(m) = row {
                out.push(m);
            }
        }
        Ok(out)
    }

    pub async fn load_sync_state(&self, key: &str) -> Result<Option<u64>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare_cached("SELECT last_block FROM sync_state WHERE key = ?1 LIMIT 1")?;
        let mut rows = stmt.query(params![key])?;
        match rows.next()? {
            Some(row) => {
                let block: i64 = row.get(0)?;
                Ok(Some(block as u64))
            }
            None => Ok(None),
        }
    }

    pub async fn set_sync_state(&self, key: &str, last_block: u64, updated_at: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO sync_state (key, last_block, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                last_block = excluded.last_block,
                updated_at = excluded.updated_at",
            params![key, last_block as i64, updated_at],
        )?;
        Ok(())
    }

    /// Trade query for requests that reach back past the in-memory window.
    pub async fn query_trades(&self, filter: &TradeFilter) -> Result<Vec<Trade>> {
        let mut sql = String::from(
            "SELECT tx_hash, log_index, block_number, timestamp, exchange, maker, taker, \
             maker_asset_id, taker_asset_id, maker_amount_filled, taker_amount_filled, \
             token_id, side, price, size, volume, gas_price, market_slug, is_wash \
             FROM trades WHERE 1=1",
        );
        let mut args: Vec<Value> = Vec::new();

        if let Some(token) = &filter.token_id {
            args.push(Value::Text(token.clone()));
            sql.push_str(&format!(" AND token_id = ?{}", args.len()));
        }
        if let Some(addr) = &filter.address {
            args.push(Value::Text(addr.clone()));
            sql.push_str(&format!(
                " AND (maker = ?{n} OR taker = ?{n})",
                n = args.len()
            ));
        }
        if let Some(side) = filter.side {
            args.push(Value::Text(side.as_str().to_string()));
            sql.push_str(&format!(" AND side = ?{}", args.len()));
        }
        if let Some(since) = filter.since {
            args.push(Value::Integer(since));
            sql.push_str(&format!(" AND timestamp >= ?{}", args.len()));
        }
        if let Some(until) = filter.until {
            args.push(Value::Integer(until));
            sql.push_str(&format!(" AND timestamp <= ?{}", args.len()));
        }
        if let Some(is_wash) = filter.is_wash {
            args.push(Value::Integer(is_wash as i64));
            sql.push_str(&format!(" AND is_wash = ?{}", args.len()));
        }

        args.push(Value::Integer(filter.effective_limit() as i64));
        sql.push_str(&format!(
            " ORDER BY block_number DESC, log_index DESC LIMIT ?{}",
            args.len()
        ));
        args.push(Value::Integer(filter.offset.unwrap_or(0) as i64));
        sql.push_str(&format!(" OFFSET ?{}", args.len()));

        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args), row_to_trade)?;

        let mut out = Vec::new();
        for row in rows {
            match row {
                Ok(t) => out.push(t),
                Err(e) => warn!(error = %e, "skipping unreadable trade row"),
            }
        }
        Ok(out)
    }

    pub async fn trade_count(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached("SELECT COUNT(*) FROM trades")?;
        let count: i64 = stmt.query_row([], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub async fn recent_alerts(&self, limit: usize) -> Result<Vec<Alert>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, kind, severity, confidence, timestamp, token_id, evidence_id, message, ack \
             FROM alerts ORDER BY timestamp DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit.clamp(1, 5_000) as i64], row_to_alert)?;
        let mut out = Vec::new();
        for row in rows {
            if let Ok(a) = row {
                out.push(a);
            }
        }
        Ok(out)
    }
}

fn row_to_trade(row: &rusqlite::Row<'_>) -> rusqlite::Result<Trade> {
    let side: String = row.get(12)?;
    let maker_amount: String = row.get(9)?;
    let taker_amount: String = row.get(10)?;
    let gas_price: String = row.get(16)?;
    let log_index: i64 = row.get(1)?;
    let block_number: i64 = row.get(2)?;
    let is_wash: i64 = row.get(18)?;
    Ok(Trade {
        tx_hash: row.get(0)?,
        log_index: log_index as u64,
        block_number: block_number as u64,
        timestamp: row.get(3)?,
        exchange: row.get(4)?,
        maker: row.get(5)?,
        taker: row.get(6)?,
        maker_asset_id: row.get(7)?,
        taker_asset_id: row.get(8)?,
        maker_amount_filled: maker_amount.parse().unwrap_or(0),
        taker_amount_filled: taker_amount.parse().unwrap_or(0),
        token_id: row.get(11)?,
        side: Side::parse(&side).unwrap_or(Side::Buy),
        price: row.get(13)?,
        size: row.get(14)?,
        volume: row.get(15)?,
        gas_price: gas_price.parse().unwrap_or(0),
        market_slug: row.get(17)?,
        is_wash: is_wash != 0,
        price_out_of_range: false,
    })
}

fn row_to_alert(row: &rusqlite::Row<'_>) -> rusqlite::Result<Alert> {
    let kind: String = row.get(1)?;
    let severity: String = row.get(2)?;
    let ack: i64 = row.get(8)?;
    Ok(Alert {
        id: row.get(0)?,
        kind: parse_kind(&kind),
        severity: parse_severity(&severity),
        confidence: row.get(3)?,
        timestamp: row.get(4)?,
        token_id: row.get(5)?,
        evidence_id: row.get(6)?,
        message: row.get(7)?,
        ack: ack != 0,
    })
}

fn parse_kind(s: &str) -> EvidenceKind {
    EvidenceKind::all()
        .into_iter()
        .find(|k| k.as_str() == s)
        .unwrap_or(EvidenceKind::VolumeSpike)
}

fn parse_severity(s: &str) -> Severity {
    match s {
        "CRITICAL" => Severity::Critical,
        "HIGH" => Severity::High,
        "MEDIUM" => Severity::Medium,
        _ => Severity::Low,
    }
}

/// Periodic spill loop. Reads the pending batch under a short read lock,
/// writes with no lock held, and only drains the rings' pending lists after
/// a successful commit.
pub async fn run_spill_loop(store: Arc<EvidenceStore>, db: SpillDb) {
    let mut ticker = tokio::time::interval(Duration::from_secs(SPILL_INTERVAL_SECS));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        let (trades, alerts, evidence) = store.unsynced_batch();
        if trades.is_empty() && alerts.is_empty() && evidence.is_empty() {
            continue;
        }

        match db.sync_batch(&trades, &alerts, &evidence).await {
            Ok(()) => {
                store.mark_synced(trades.len(), alerts.len(), evidence.len());
                debug!(
                    trades = trades.len(),
                    alerts = alerts.len(),
                    evidence = evidence.len(),
                    "spill batch committed"
                );
            }
            Err(e) => {
                warn!(error = %e, "spill failed; batch retries next tick");
            }
        }
    }
}
