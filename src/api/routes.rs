//! `/api` handlers.
//!
//! Read endpoints serve from the in-memory rings and only reach the durable
//! store when a query outruns the ring window. Errors come back as
//! `{error, detail}` with a matching status code and never disturb the
//! background pipeline.

use crate::api::AppState;
use crate::bus::BusMessage;
use crate::detectors::{health, ScanCancel};
use crate::error::ForensicsError;
use crate::models::{now_ts, Alert, Evidence, MarketInfo, Side, Trade};
use crate::store::TradeFilter;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Deadline for simple queries.
const SIMPLE_DEADLINE: Duration = Duration::from_secs(30);
/// Deadline for a full health scan.
const FULL_DEADLINE: Duration = Duration::from_secs(120);

const HOT_MARKETS: usize = 20;
const HOT_WINDOW_SECS: i64 = 24 * 60 * 60;

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error: &'static str,
    detail: String,
}

impl ApiError {
    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: "bad_request",
            detail: detail.into(),
        }
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            error: "not_found",
            detail: detail.into(),
        }
    }

    pub fn upstream(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            error: "upstream",
            detail: detail.into(),
        }
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: "internal",
            detail: detail.into(),
        }
    }

    /// Map a typed pipeline error onto its REST status.
    pub fn from_forensics(e: &ForensicsError) -> Self {
        Self {
            status: StatusCode::from_u16(e.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            error: match e {
                ForensicsError::Upstream(_) => "upstream",
                ForensicsError::Decode(_) => "decode",
                ForensicsError::NotFound(_) => "not_found",
                ForensicsError::Capacity => "capacity",
                ForensicsError::Persistence(_) => "persistence",
                ForensicsError::Cancelled => "cancelled",
            },
            detail: e.to_string(),
        }
    }

    /// Map an anyhow chain, preferring the typed kind when one is inside.
    pub fn from_anyhow(e: anyhow::Error) -> Self {
        match e.downcast_ref::<ForensicsError>() {
            Some(fe) => Self::from_forensics(fe),
            None => Self::internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.error,
            "detail": self.detail,
        });
        (self.status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct TradeQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub token_id: Option<String>,
    pub address: Option<String>,
    pub is_wash: Option<bool>,
    pub side: Option<String>,
    pub since: Option<i64>,
    pub until: Option<i64>,
}

impl TradeQuery {
    fn into_filter(self) -> Result<TradeFilter, ApiError> {
        if let Some(limit) = self.limit {
            if !(1..=5_000).contains(&limit) {
                return Err(ApiError::bad_request("limit must be in 1..5000"));
            }
        }
        let side = match self.side.as_deref() {
            None => None,
            Some(s) => Some(
                Side::parse(s).ok_or_else(|| ApiError::bad_request("side must be BUY or SELL"))?,
            ),
        };
        Ok(TradeFilter {
            token_id: self.token_id.map(|t| t.to_lowercase()),
            address: self.address.map(|a| a.to_lowercase()),
            is_wash: self.is_wash,
            side,
            since: self.since,
            until: self.until,
            limit: self.limit,
            offset: self.offset,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct TradesResponse {
    pub trades: Vec<Trade>,
    pub count: usize,
    pub source: &'static str,
    pub timestamp: i64,
}

/// GET /api/trades
pub async fn get_trades(
    Query(query): Query<TradeQuery>,
    State(state): State<AppState>,
) -> Result<Json<TradesResponse>, ApiError> {
    let filter = query.into_filter()?;
    let (trades, from_memory) = state.store.query_trades(&filter);

    let (trades, source) = if from_memory {
        (trades, "memory")
    } else {
        let trades = state
            .db
            .query_trades(&filter)
            .await
            .map_err(|e| ApiError::internal(e.to_string()))?;
        (trades, "durable")
    };

    Ok(Json(TradesResponse {
        count: trades.len(),
        trades,
        source,
        timestamp: now_ts(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct TimelineQuery {
    pub hours: Option<i64>,
    pub interval: Option<i64>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct TimelineBucket {
    pub bucket_start: i64,
    pub trade_count: usize,
    pub volume: f64,
    pub wash_count: usize,
}

/// GET /api/trades/timeline
pub async fn get_trades_timeline(
    Query(query): Query<TimelineQuery>,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let hours = query.hours.unwrap_or(24);
    if !(1..=168).contains(&hours) {
        return Err(ApiError::bad_request("hours must be in 1..168"));
    }
    let interval = query.interval.unwrap_or(300);
    if interval < 10 {
        return Err(ApiError::bad_request("interval must be at least 10 seconds"));
    }

    let snap = state.store.snapshot();
    let buckets = bucket_timeline(&snap.trades, now_ts(), hours, interval);
    Ok(Json(serde_json::json!({
        "hours": hours,
        "interval": interval,
        "buckets": buckets,
        "timestamp": now_ts(),
    })))
}

fn bucket_timeline(
    trades: &[Arc<Trade>],
    now: i64,
    hours: i64,
    interval: i64,
) -> Vec<TimelineBucket> {
    let cutoff = now - hours * 3_600;
    let mut buckets: HashMap<i64, TimelineBucket> = HashMap::new();
    for t in trades {
        if t.timestamp < cutoff {
            continue;
        }
        let start = t.timestamp.div_euclid(interval) * interval;
        let b = buckets.entry(start).or_insert(TimelineBucket {
            bucket_start: start,
            trade_count: 0,
            volume: 0.0,
            wash_count: 0,
        });
        b.trade_count += 1;
        b.volume += t.volume;
        if t.is_wash {
            b.wash_count += 1;
        }
    }
    let mut out: Vec<TimelineBucket> = buckets.into_values().collect();
    out.sort_by_key(|b| b.bucket_start);
    out
}

#[derive(Debug, Serialize)]
pub struct AnalysisResponse {
    pub analysis_type: String,
    pub evidence: Vec<Evidence>,
    pub count: usize,
    pub timestamp: i64,
}

/// Run named detectors over the full ring under a deadline. A scan that
/// overruns is cancelled at the next trade boundary and returns what it
/// found; new findings land in the store (idempotent by id).
async fn scan_named(state: &AppState, names: Vec<String>, deadline: Duration) -> Vec<Evidence> {
    let suite = state.suite.clone();
    let snap = state.store.snapshot();
    let cancel = ScanCancel::new();
    let scan_cancel = cancel.clone();

    let watchdog = tokio::spawn(async move {
        tokio::time::sleep(deadline).await;
        cancel.cancel();
    });

    let findings = tokio::task::spawn_blocking(move || {
        let mut out = Vec::new();
        for name in &names {
            if let Some(detector) = suite.by_name(name) {
                out.extend(detector.scan(&snap, &scan_cancel));
            }
        }
        out
    })
    .await
    .unwrap_or_default();
    watchdog.abort();

    for evidence in &findings {
        state.store.add_evidence(evidence.clone());
    }
    findings
}

async fn analysis(
    state: AppState,
    analysis_type: &str,
    names: &[&str],
    deadline: Duration,
) -> Json<AnalysisResponse> {
    let names = names.iter().map(|n| n.to_string()).collect();
    let evidence = scan_named(&state, names, deadline).await;
    state
        .bus
        .publish(BusMessage::AnalysisStats(serde_json::json!({
            "analysis_type": analysis_type,
            "count": evidence.len(),
        })));
    Json(AnalysisResponse {
        analysis_type: analysis_type.to_string(),
        count: evidence.len(),
        evidence,
        timestamp: now_ts(),
    })
}

/// GET /api/trades/analysis/insider
pub async fn get_analysis_insider(State(state): State<AppState>) -> Json<AnalysisResponse> {
    analysis(state, "insider", &["insider"], SIMPLE_DEADLINE).await
}

/// GET /api/trades/analysis/high-winrate
pub async fn get_analysis_high_winrate(State(state): State<AppState>) -> Json<AnalysisResponse> {
    analysis(state, "high-winrate", &["high-winrate"], SIMPLE_DEADLINE).await
}

/// GET /api/trades/analysis/gas-anomaly
pub async fn get_analysis_gas_anomaly(State(state): State<AppState>) -> Json<AnalysisResponse> {
    analysis(state, "gas-anomaly", &["gas-anomaly"], SIMPLE_DEADLINE).await
}

/// GET /api/trades/analysis/full
pub async fn get_analysis_full(State(state): State<AppState>) -> Json<AnalysisResponse> {
    analysis(
        state,
        "full",
        &["insider", "high-winrate", "gas-anomaly"],
        FULL_DEADLINE,
    )
    .await
}

/// GET /api/trades/analysis/advanced/self-trades
pub async fn get_advanced_self_trades(State(state): State<AppState>) -> Json<AnalysisResponse> {
    analysis(state, "self-trades", &["self-trades"], SIMPLE_DEADLINE).await
}

/// GET /api/trades/analysis/advanced/circular-trades
pub async fn get_advanced_circular(State(state): State<AppState>) -> Json<AnalysisResponse> {
    analysis(state, "circular-trades", &["circular-trades"], SIMPLE_DEADLINE).await
}

/// GET /api/trades/analysis/advanced/atomic-wash
pub async fn get_advanced_atomic_wash(State(state): State<AppState>) -> Json<AnalysisResponse> {
    analysis(state, "atomic-wash", &["atomic-wash"], SIMPLE_DEADLINE).await
}

/// GET /api/trades/analysis/advanced/volume-spikes
pub async fn get_advanced_volume_spikes(State(state): State<AppState>) -> Json<AnalysisResponse> {
    analysis(state, "volume-spikes", &["volume-spikes"], SIMPLE_DEADLINE).await
}

/// GET /api/trades/analysis/advanced/sybil-clusters
pub async fn get_advanced_sybil(State(state): State<AppState>) -> Json<AnalysisResponse> {
    analysis(state, "sybil-clusters", &["sybil-clusters"], SIMPLE_DEADLINE).await
}

/// GET /api/trades/analysis/advanced/market-health
pub async fn get_market_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    // Refresh evidence first so the rollup reflects the current ring.
    let all: Vec<String> = [
        "insider",
        "high-winrate",
        "gas-anomaly",
        "self-trades",
        "circular-trades",
        "atomic-wash",
        "volume-spikes",
        "sybil-clusters",
    ]
    .iter()
    .map(|n| n.to_string())
    .collect();
    let _ = scan_named(&state, all, FULL_DEADLINE).await;

    let snap = state.store.snapshot();
    let markets = health::compute_market_health(&snap, health::MIN_TRADES);
    let count = markets.len();
    Json(serde_json::json!({
        "markets": markets,
        "count": count,
        "timestamp": now_ts(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct FlaggedTxQuery {
    pub analysis_type: Option<String>,
}

/// GET /api/trades/analysis/flagged-tx
pub async fn get_flagged_tx(
    Query(query): Query<FlaggedTxQuery>,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let name = query
        .analysis_type
        .ok_or_else(|| ApiError::bad_request("analysis_type is required"))?;
    if state.suite.by_name(&name).is_none() {
        return Err(ApiError::not_found(format!("unknown analysis type: {name}")));
    }
    let evidence = scan_named(&state, vec![name.clone()], SIMPLE_DEADLINE).await;

    let mut tx_hashes: Vec<String> = evidence.iter().flat_map(|e| e.tx_hashes.clone()).collect();
    tx_hashes.sort();
    tx_hashes.dedup();
    let mut addresses: Vec<String> = evidence.iter().flat_map(|e| e.addresses.clone()).collect();
    addresses.sort();
    addresses.dedup();

    Ok(Json(serde_json::json!({
        "analysis_type": name,
        "tx_hashes": tx_hashes,
        "addresses": addresses,
        "timestamp": now_ts(),
    })))
}

#[derive(Debug, Serialize)]
pub struct MarketSummary {
    #[serde(flatten)]
    pub market: MarketInfo,
    pub trade_count: usize,
    pub volume_24h: f64,
}

/// GET /api/markets
pub async fn get_markets(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snap = state.store.snapshot();
    let cutoff = now_ts() - HOT_WINDOW_SECS;

    let markets: Vec<MarketSummary> = state
        .resolver
        .all()
        .into_iter()
        .map(|m| summarize_market(&m, &snap.trades, cutoff))
        .collect();
    let count = markets.len();

    Json(serde_json::json!({
        "markets": markets,
        "count": count,
        "timestamp": now_ts(),
    }))
}

/// GET /api/markets/hot
pub async fn get_markets_hot(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snap = state.store.snapshot();
    let cutoff = now_ts() - HOT_WINDOW_SECS;

    let mut markets: Vec<MarketSummary> = state
        .resolver
        .all()
        .into_iter()
        .map(|m| summarize_market(&m, &snap.trades, cutoff))
        .collect();
    markets.sort_by(|a, b| {
        b.volume_24h
            .partial_cmp(&a.volume_24h)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    markets.truncate(HOT_MARKETS);
    let count = markets.len();

    Json(serde_json::json!({
        "markets": markets,
        "count": count,
        "timestamp": now_ts(),
    }))
}

fn summarize_market(market: &MarketInfo, trades: &[Arc<Trade>], cutoff: i64) -> MarketSummary {
    let mut trade_count = 0usize;
    let mut volume_24h = 0.0f64;
    for t in trades {
        if t.token_id == market.yes_token_id || t.token_id == market.no_token_id {
            trade_count += 1;
            if t.timestamp >= cutoff {
                volume_24h += t.volume;
            }
        }
    }
    MarketSummary {
        market: market.clone(),
        trade_count,
        volume_24h,
    }
}

/// GET /api/markets/:token_id
pub async fn get_market(
    Path(token_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<MarketInfo>, ApiError> {
    state
        .resolver
        .resolve(&token_id.to_lowercase())
        .map(|m| Json((*m).clone()))
        .ok_or_else(|| ApiError::not_found(format!("no market for token {token_id}")))
}

#[derive(Debug, Deserialize)]
pub struct AlertQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct AlertsResponse {
    pub alerts: Vec<Alert>,
    pub count: usize,
    pub timestamp: i64,
}

/// GET /api/alerts
pub async fn get_alerts(
    Query(query): Query<AlertQuery>,
    State(state): State<AppState>,
) -> Json<AlertsResponse> {
    let limit = query.limit.unwrap_or(100).clamp(1, 1_000);
    let alerts = state.store.recent_alerts(limit);
    Json(AlertsResponse {
        count: alerts.len(),
        alerts,
        timestamp: now_ts(),
    })
}

/// GET /api/alerts/recent
pub async fn get_alerts_recent(State(state): State<AppState>) -> Json<AlertsResponse> {
    let alerts = state.store.recent_alerts(50);
    Json(AlertsResponse {
        count: alerts.len(),
        alerts,
        timestamp: now_ts(),
    })
}

/// POST /api/alerts/:alert_id/ack
pub async fn post_alert_ack(
    Path(alert_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !state.store.ack_alert(&alert_id) {
        return Err(ApiError::not_found(format!("no alert {alert_id}")));
    }
    Ok(Json(serde_json::json!({
        "id": alert_id,
        "acked": true,
    })))
}

/// GET /api/alerts/stats
pub async fn get_alerts_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    let alerts = state.store.recent_alerts(usize::MAX);
    let mut by_kind: HashMap<&'static str, usize> = HashMap::new();
    let mut by_severity: HashMap<&'static str, usize> = HashMap::new();
    let mut acked = 0usize;
    for a in &alerts {
        *by_kind.entry(a.kind.as_str()).or_default() += 1;
        *by_severity.entry(a.severity.as_str()).or_default() += 1;
        if a.ack {
            acked += 1;
        }
    }
    Json(serde_json::json!({
        "total": alerts.len(),
        "acked": acked,
        "by_kind": by_kind,
        "by_severity": by_severity,
        "timestamp": now_ts(),
    }))
}

/// GET /api/system/stats
pub async fn get_system_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    let stats = state.store.stats();
    Json(serde_json::json!({
        "stats": stats,
        "decode": state.decode_stats.snapshot(),
        "bus": {
            "subscribers": state.bus.subscriber_count(),
            "dropped_messages": state.bus.dropped_total(),
        },
        "markets_cached": state.resolver.len(),
        "stream_state": state.controller.state(),
        "timestamp": now_ts(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct FetchQuery {
    pub blocks: Option<u64>,
}

/// POST /api/system/fetch
pub async fn post_system_fetch(
    Query(query): Query<FetchQuery>,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let blocks = query.blocks.unwrap_or(state.config.blocks_per_poll);
    if blocks == 0 || blocks > 10_000 {
        return Err(ApiError::bad_request("blocks must be in 1..10000"));
    }

    let ingested = state
        .controller
        .backfill(blocks)
        .await
        .map_err(|e| match e.downcast_ref::<ForensicsError>() {
            Some(_) => ApiError::from_anyhow(e),
            None => ApiError::upstream(e.to_string()),
        })?;

    Ok(Json(serde_json::json!({
        "blocks": blocks,
        "ingested": ingested,
        "timestamp": now_ts(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct StreamStartQuery {
    pub poll_interval: Option<u64>,
    pub blocks_per_poll: Option<u64>,
}

/// POST /api/system/stream/start
pub async fn post_stream_start(
    Query(query): Query<StreamStartQuery>,
    State(state): State<AppState>,
) -> Json<serde_json::Value> {
    let poll_interval = query
        .poll_interval
        .unwrap_or(state.config.poll_interval_seconds)
        .max(1);
    let blocks_per_poll = query
        .blocks_per_poll
        .unwrap_or(state.config.blocks_per_poll)
        .max(1);

    let started = state
        .controller
        .clone()
        .start(Duration::from_secs(poll_interval), blocks_per_poll);

    Json(serde_json::json!({
        "started": started,
        "state": state.controller.state(),
        "poll_interval": poll_interval,
        "blocks_per_poll": blocks_per_poll,
    }))
}

/// POST /api/system/stream/stop
pub async fn post_stream_stop(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.controller.stop().await;
    Json(serde_json::json!({
        "state": state.controller.state(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade_at(ts: i64, volume: f64, is_wash: bool) -> Arc<Trade> {
        Arc::new(Trade {
            tx_hash: format!("0x{ts}"),
            log_index: 0,
            block_number: ts as u64,
            timestamp: ts,
            exchange: "0xe".to_string(),
            maker: "0xa".to_string(),
            taker: "0xb".to_string(),
            maker_asset_id: "0x0".to_string(),
            taker_asset_id: "0xt".to_string(),
            maker_amount_filled: 0,
            taker_amount_filled: 0,
            token_id: "0xt".to_string(),
            side: Side::Buy,
            price: 0.5,
            size: volume * 2.0,
            volume,
            gas_price: 0,
            market_slug: None,
            is_wash,
            price_out_of_range: false,
        })
    }

    #[test]
    fn timeline_buckets_aggregate_and_sort() {
        let now = 10_000;
        let trades = vec![
            trade_at(9_000, 10.0, false),
            trade_at(9_010, 5.0, true),
            trade_at(9_400, 2.0, false),
            // Outside the window entirely.
            trade_at(100, 99.0, false),
        ];
        let buckets = bucket_timeline(&trades, now, 1, 300);

        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].bucket_start, 9_000);
        assert_eq!(buckets[0].trade_count, 2);
        assert!((buckets[0].volume - 15.0).abs() < 1e-9);
        assert_eq!(buckets[0].wash_count, 1);
        assert_eq!(buckets[1].bucket_start, 9_300);
    }

    #[test]
    fn trade_query_validates_side_and_limit() {
        let bad_side = TradeQuery {
            limit: None,
            offset: None,
            token_id: None,
            address: None,
            is_wash: None,
            side: Some("HOLD".to_string()),
            since: None,
            until: None,
        };
        assert!(bad_side.into_filter().is_err());

        let bad_limit = TradeQuery {
            limit: Some(0),
            offset: None,
            token_id: None,
            address: None,
            is_wash: None,
            side: None,
            since: None,
            until: None,
        };
        assert!(bad_limit.into_filter().is_err());

        let good = TradeQuery {
            limit: Some(50),
            offset: None,
            token_id: Some("0xABC".to_string()),
            address: None,
            is_wash: Some(true),
            side: Some("SELL".to_string()),
            since: Some(1),
            until: None,
        };
        let filter = good.into_filter().unwrap();
        assert_eq!(filter.token_id.as_deref(), Some("0xabc"));
        assert_eq!(filter.side, Some(Side::Sell));
    }
}
