//! Polysleuth - on-chain forensics for a conditional-token CLOB venue.
//!
//! Ingests `OrderFilled` / `PositionSplit` / `PositionsMerge` logs from a
//! Polygon-class chain, indexes them in a bounded evidence store with a
//! SQLite spill, runs eight manipulation detectors over every committed
//! window, and serves the findings over REST and WebSocket.

#![allow(dead_code)]

mod api;
mod bus;
mod chain;
mod detectors;
mod error;
mod middleware;
mod models;
mod store;
mod stream;

use anyhow::{Context, Result};
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::Response,
    routing::{get, post},
    Router,
};
use std::path::PathBuf;
use std::{env, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::{
    api::AppState,
    bus::{AlertBus, BusMessage},
    chain::{DecodeStats, LogDecoder, MarketResolver, NullCatalog, RpcClient},
    detectors::DetectorSuite,
    models::{now_ts, Config},
    store::{db::run_spill_loop, EvidenceStore, SpillDb, StoreConfig},
    stream::StreamController,
};

const STATS_BROADCAST_SECS: u64 = 10;

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let config = Config::from_env().context("load configuration")?;
    info!("🔎 Polysleuth forensics engine starting");
    info!(
        exchanges = config.exchange_addresses.len(),
        confirmations = config.confirmations,
        "⚙️  Watching CTF exchange contracts"
    );

    // Durable store first so everything else can warm from it.
    let db_path = resolve_data_path(Some(config.db_path.clone()), "polysleuth.db");
    let db = SpillDb::new(&db_path).context("open durable store")?;
    info!("💾 Durable store at: {}", db_path);

    let bus = Arc::new(AlertBus::new());
    let store = Arc::new(EvidenceStore::new(
        StoreConfig {
            trade_capacity: config.ring_trades,
            alert_capacity: config.ring_alerts,
            evidence_capacity: config.ring_trades,
            ..Default::default()
        },
        bus.clone(),
    ));

    // The market catalog is an external collaborator behind a narrow trait;
    // without one configured, trades stay market=unknown until restart.
    let resolver = Arc::new(MarketResolver::new(Arc::new(NullCatalog)));
    match db.load_markets().await {
        Ok(markets) => {
            let n = markets.len();
            for market in markets {
                resolver.register_info(market);
            }
            if n > 0 {
                info!("🗺️  Warmed {} markets from the durable store", n);
            }
        }
        Err(e) => warn!(error = %e, "could not warm market cache"),
    }

    let rpc = Arc::new(RpcClient::new(config.rpc_url.clone()));
    let decode_stats = Arc::new(DecodeStats::default());
    let decoder = Arc::new(LogDecoder::new(decode_stats.clone()));
    let suite = Arc::new(DetectorSuite::standard());

    let controller = Arc::new(StreamController::new(
        rpc,
        decoder,
        store.clone(),
        db.clone(),
        resolver.clone(),
        suite.clone(),
        config.exchange_addresses.clone(),
        config.confirmations,
    ));

    let app_state = AppState {
        store: store.clone(),
        db: db.clone(),
        resolver,
        suite,
        bus: bus.clone(),
        controller: controller.clone(),
        decode_stats,
        config: config.clone(),
    };

    // Periodic durable spill for alerts/evidence and anything the tick
    // committed only to memory.
    tokio::spawn(run_spill_loop(store.clone(), db.clone()));

    // Periodic stats broadcast so dashboards update without polling.
    {
        let store = store.clone();
        let bus = bus.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(STATS_BROADCAST_SECS));
            loop {
                ticker.tick().await;
                bus.publish(BusMessage::Stats(store.stats()));
            }
        });
    }

    // Tip-following starts immediately unless explicitly disabled; the REST
    // surface can stop and restart it at will.
    let autostart = env::var("STREAM_AUTOSTART")
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(true);
    if autostart {
        controller.clone().start(
            Duration::from_secs(config.poll_interval_seconds),
            config.blocks_per_poll,
        );
    } else {
        info!("⏸️  Stream autostart disabled; use /api/system/stream/start");
    }

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/api/trades", get(api::routes::get_trades))
        .route("/api/trades/timeline", get(api::routes::get_trades_timeline))
        .route(
            "/api/trades/analysis/insider",
            get(api::routes::get_analysis_insider),
        )
        .route(
            "/api/trades/analysis/high-winrate",
            get(api::routes::get_analysis_high_winrate),
        )
        .route(
            "/api/trades/analysis/gas-anomaly",
            get(api::routes::get_analysis_gas_anomaly),
        )
        .route(
            "/api/trades/analysis/full",
            get(api::routes::get_analysis_full),
        )
        .route(
            "/api/trades/analysis/advanced/self-trades",
            get(api::routes::get_advanced_self_trades),
        )
        .route(
            "/api/trades/analysis/advanced/circular-trades",
            get(api::routes::get_advanced_circular),
        )
        .route(
            "/api/trades/analysis/advanced/atomic-wash",
            get(api::routes::get_advanced_atomic_wash),
        )
        .route(
            "/api/trades/analysis/advanced/volume-spikes",
            get(api::routes::get_advanced_volume_spikes),
        )
        .route(
            "/api/trades/analysis/advanced/sybil-clusters",
            get(api::routes::get_advanced_sybil),
        )
        .route(
            "/api/trades/analysis/advanced/market-health",
            get(api::routes::get_market_health),
        )
        .route(
            "/api/trades/analysis/flagged-tx",
            get(api::routes::get_flagged_tx),
        )
        .route("/api/markets", get(api::routes::get_markets))
        .route("/api/markets/hot", get(api::routes::get_markets_hot))
        .route("/api/markets/:token_id", get(api::routes::get_market))
        .route("/api/alerts", get(api::routes::get_alerts))
        .route("/api/alerts/recent", get(api::routes::get_alerts_recent))
        .route("/api/alerts/:alert_id/ack", post(api::routes::post_alert_ack))
        .route("/api/alerts/stats", get(api::routes::get_alerts_stats))
        .route("/api/system/stats", get(api::routes::get_system_stats))
        .route("/api/system/fetch", post(api::routes::post_system_fetch))
        .route(
            "/api/system/stream/start",
            post(api::routes::post_stream_start),
        )
        .route(
            "/api/system/stream/stop",
            post(api::routes::post_stream_stop),
        )
        .route("/ws", get(websocket_handler))
        .with_state(app_state)
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn(
            crate::middleware::logging::request_logging,
        ));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("🎯 API server listening on {}", addr);

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

/// WebSocket endpoint: pushes bus traffic and answers simple commands.
async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let mut sub = state.bus.subscribe();

    // Greet, then replay recent state so a fresh client is never empty.
    if send_frame(&mut socket, &BusMessage::Connected { server_time: now_ts() })
        .await
        .is_err()
    {
        return;
    }
    let (recent, _) = state.store.query_trades(&crate::store::TradeFilter {
        limit: Some(50),
        ..Default::default()
    });
    for trade in recent.into_iter().rev() {
        if send_frame(&mut socket, &BusMessage::NewTrade(trade)).await.is_err() {
            return;
        }
    }
    for alert in state.store.recent_alerts(50).into_iter().rev() {
        if send_frame(&mut socket, &BusMessage::NewAlert(alert)).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            msg = sub.recv() => {
                let Some(msg) = msg else { break };
                if send_frame(&mut socket, &msg).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if handle_client_command(&mut socket, &state, &text).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
}

/// Client commands: `{cmd: ping|get_stats|get_recent_trades|get_recent_alerts}`.
async fn handle_client_command(
    socket: &mut WebSocket,
    state: &AppState,
    text: &str,
) -> Result<(), axum::Error> {
    let Ok(json) = serde_json::from_str::<serde_json::Value>(text) else {
        return Ok(());
    };
    let cmd = json.get("cmd").and_then(|c| c.as_str()).unwrap_or("");

    match cmd {
        "ping" => {
            let timestamp = json
                .get("timestamp")
                .and_then(|t| t.as_i64())
                .unwrap_or_else(now_ts);
            send_frame(socket, &BusMessage::Pong { timestamp }).await?;
        }
        "get_stats" => {
            send_frame(socket, &BusMessage::Stats(state.store.stats())).await?;
        }
        "get_recent_trades" => {
            let limit = json
                .get("limit")
                .and_then(|l| l.as_u64())
                .unwrap_or(50)
                .clamp(1, 500) as usize;
            let (trades, _) = state.store.query_trades(&crate::store::TradeFilter {
                limit: Some(limit),
                ..Default::default()
            });
            for trade in trades.into_iter().rev() {
                send_frame(socket, &BusMessage::NewTrade(trade)).await?;
            }
        }
        "get_recent_alerts" => {
            let limit = json
                .get("limit")
                .and_then(|l| l.as_u64())
                .unwrap_or(50)
                .clamp(1, 500) as usize;
            for alert in state.store.recent_alerts(limit).into_iter().rev() {
                send_frame(socket, &BusMessage::NewAlert(alert)).await?;
            }
        }
        _ => {}
    }
    Ok(())
}

async fn send_frame(socket: &mut WebSocket, msg: &BusMessage) -> Result<(), axum::Error> {
    let frame = msg.frame().to_string();
    socket.send(Message::Text(frame)).await
}

/// Health check endpoint.
async fn health_check() -> &'static str {
    "🔎 Polysleuth operational"
}

/// Initialize tracing with env-filter overrides.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "polysleuth_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    let _ = dotenv::dotenv();

    // Also try the crate dir .env when launched from elsewhere.
    let manifest_env = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}

/// Relative data paths resolve against the crate dir, not the caller's cwd.
fn resolve_data_path(env_value: Option<String>, default_filename: &str) -> String {
    let base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let Some(raw) = env_value.filter(|v| !v.trim().is_empty()) else {
        return base.join(default_filename).to_string_lossy().to_string();
    };

    let p = PathBuf::from(raw);
    if p.is_absolute() || p.starts_with("./") || p.starts_with("../") {
        return p.to_string_lossy().to_string();
    }
    base.join(p).to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_paths_resolve_against_crate_dir() {
        let resolved = resolve_data_path(None, "polysleuth.db");
        assert!(resolved.ends_with("polysleuth.db"));
        assert!(PathBuf::from(&resolved).is_absolute());

        let absolute = resolve_data_path(Some("/tmp/x.db".to_string()), "polysleuth.db");
        assert_eq!(absolute, "/tmp/x.db");

        let dotted = resolve_data_path(Some("./local.db".to_string()), "polysleuth.db");
        assert_eq!(dotted, "./local.db");
    }
}
