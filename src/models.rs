use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Trade direction relative to the outcome token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Side> {
        match s {
            "BUY" => Some(Side::Buy),
            "SELL" => Some(Side::Sell),
            _ => None,
        }
    }
}

/// One decoded `OrderFilled` occurrence. Identity is (tx_hash, log_index).
///
/// Raw filled amounts are 6-decimal fixed point integers straight off the
/// wire; `price`/`size`/`volume` are derived in integer space at decode time
/// (see `chain::decoder`) and exposed as floats for the API surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub tx_hash: String,
    pub log_index: u64,
    pub block_number: u64,
    /// Block timestamp, seconds.
    pub timestamp: i64,
    pub exchange: String,
    pub maker: String,
    pub taker: String,
    pub maker_asset_id: String,
    pub taker_asset_id: String,
    pub maker_amount_filled: u128,
    pub taker_amount_filled: u128,
    /// The non-zero asset side.
    pub token_id: String,
    pub side: Side,
    /// Collateral per share, 4-decimal, half-even rounded.
    pub price: f64,
    /// Outcome tokens filled, 6-decimal.
    pub size: f64,
    /// Notional, `round(size × price, 6)`.
    pub volume: f64,
    /// Effective gas price in wei; 0 when unavailable.
    pub gas_price: u128,
    /// Resolved market slug; `None` until the catalog resolves the token.
    pub market_slug: Option<String>,
    /// True when at least one wash-type evidence item cites this tx.
    #[serde(default)]
    pub is_wash: bool,
    /// Price fell outside [0, 1]; flagged but stored.
    #[serde(default)]
    pub price_out_of_range: bool,
}

impl Trade {
    pub fn key(&self) -> (String, u64) {
        (self.tx_hash.clone(), self.log_index)
    }

    /// Market grouping key for detectors: slug when resolved, token id otherwise.
    pub fn market_key(&self) -> &str {
        self.market_slug.as_deref().unwrap_or(&self.token_id)
    }
}

/// Kind of a decoded CTF position operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenOpKind {
    Split,
    Merge,
}

/// A decoded `PositionSplit` / `PositionsMerge` occurrence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenOp {
    pub kind: TokenOpKind,
    pub tx_hash: String,
    pub log_index: u64,
    pub block_number: u64,
    pub timestamp: i64,
    pub stakeholder: String,
    pub collateral: String,
    pub parent_collection_id: String,
    pub condition_id: String,
    pub partition: Vec<u64>,
    /// Collateral amount, 6-decimal fixed point.
    pub amount: u128,
}

/// The nine enumerated evidence kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    SelfTrade,
    CoordinatedSelfTrade,
    CircularTrade,
    AtomicWash,
    SybilCluster,
    NewWalletInsider,
    VolumeSpike,
    HighWinRate,
    GasAnomaly,
}

impl EvidenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceKind::SelfTrade => "self_trade",
            EvidenceKind::CoordinatedSelfTrade => "coordinated_self_trade",
            EvidenceKind::CircularTrade => "circular_trade",
            EvidenceKind::AtomicWash => "atomic_wash",
            EvidenceKind::SybilCluster => "sybil_cluster",
            EvidenceKind::NewWalletInsider => "new_wallet_insider",
            EvidenceKind::VolumeSpike => "volume_spike",
            EvidenceKind::HighWinRate => "high_win_rate",
            EvidenceKind::GasAnomaly => "gas_anomaly",
        }
    }

    /// Base penalty weight in the market-health score.
    pub fn base_weight(&self) -> f64 {
        match self {
            EvidenceKind::SelfTrade => 15.0,
            EvidenceKind::CoordinatedSelfTrade => 15.0,
            EvidenceKind::CircularTrade => 12.0,
            EvidenceKind::AtomicWash => 12.0,
            EvidenceKind::SybilCluster => 10.0,
            EvidenceKind::NewWalletInsider => 8.0,
            EvidenceKind::HighWinRate => 6.0,
            EvidenceKind::VolumeSpike => 5.0,
            EvidenceKind::GasAnomaly => 3.0,
        }
    }

    /// Minimum confidence at which an evidence item becomes an alert.
    pub fn alert_threshold(&self) -> f64 {
        match self {
            EvidenceKind::SelfTrade => 0.95,
            EvidenceKind::CoordinatedSelfTrade => 0.85,
            EvidenceKind::AtomicWash => 0.90,
            EvidenceKind::CircularTrade => 0.70,
            EvidenceKind::SybilCluster => 0.70,
            EvidenceKind::NewWalletInsider => 0.80,
            EvidenceKind::HighWinRate => 0.70,
            EvidenceKind::VolumeSpike => 0.50,
            EvidenceKind::GasAnomaly => 0.60,
        }
    }

    /// Wash-type kinds mark the trades in their tx set as wash trades.
    pub fn is_wash(&self) -> bool {
        matches!(
            self,
            EvidenceKind::SelfTrade
                | EvidenceKind::CoordinatedSelfTrade
                | EvidenceKind::CircularTrade
                | EvidenceKind::AtomicWash
        )
    }

    pub fn all() -> [EvidenceKind; 9] {
        [
            EvidenceKind::SelfTrade,
            EvidenceKind::CoordinatedSelfTrade,
            EvidenceKind::CircularTrade,
            EvidenceKind::AtomicWash,
            EvidenceKind::SybilCluster,
            EvidenceKind::NewWalletInsider,
            EvidenceKind::VolumeSpike,
            EvidenceKind::HighWinRate,
            EvidenceKind::GasAnomaly,
        ]
    }
}

/// One detection finding. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    /// Deterministic content-derived id.
    pub id: String,
    pub kind: EvidenceKind,
    pub confidence: f64,
    pub timestamp: i64,
    /// Involved addresses, sorted and deduplicated.
    pub addresses: Vec<String>,
    /// Involved transactions, sorted and deduplicated.
    pub tx_hashes: Vec<String>,
    pub token_id: String,
    pub volume: f64,
    /// Type-specific details, opaque key/value.
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }

    /// Severity from the health-score penalty the evidence carries.
    pub fn from_penalty(penalty: f64) -> Severity {
        if penalty >= 12.0 {
            Severity::Critical
        } else if penalty >= 8.0 {
            Severity::High
        } else if penalty >= 4.0 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

/// A notification-worthy evidence item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub kind: EvidenceKind,
    pub severity: Severity,
    pub confidence: f64,
    pub timestamp: i64,
    pub token_id: String,
    pub evidence_id: String,
    pub message: String,
    /// Acknowledged by an operator. The only mutable field.
    #[serde(default)]
    pub ack: bool,
}

impl Alert {
    /// Derive an alert from evidence if it clears its kind's threshold.
    pub fn from_evidence(e: &Evidence) -> Option<Alert> {
        if e.confidence < e.kind.alert_threshold() {
            return None;
        }
        let penalty = e.kind.base_weight() * e.confidence;
        Some(Alert {
            id: format!("alert_{}", e.id),
            kind: e.kind,
            severity: Severity::from_penalty(penalty),
            confidence: e.confidence,
            timestamp: e.timestamp,
            token_id: e.token_id.clone(),
            evidence_id: e.id.clone(),
            message: format!(
                "{} confidence {:.2} on {}",
                e.kind.as_str(),
                e.confidence,
                e.token_id
            ),
            ack: false,
        })
    }
}

/// Outcome side of a binary market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Yes,
    No,
}

/// A resolved market. A token id belongs to at most one (market, outcome).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketInfo {
    pub condition_id: String,
    pub question_id: String,
    pub oracle: String,
    pub yes_token_id: String,
    pub no_token_id: String,
    pub slug: String,
    pub question: Option<String>,
    pub status: String,
}

impl MarketInfo {
    pub fn outcome_of(&self, token_id: &str) -> Option<Outcome> {
        if token_id == self.yes_token_id {
            Some(Outcome::Yes)
        } else if token_id == self.no_token_id {
            Some(Outcome::No)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Band a health score into a risk level.
    pub fn from_score(score: f64) -> RiskLevel {
        if score >= 80.0 {
            RiskLevel::Low
        } else if score >= 60.0 {
            RiskLevel::Medium
        } else if score >= 40.0 {
            RiskLevel::High
        } else {
            RiskLevel::Critical
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspiciousAddress {
    pub address: String,
    pub risk_score: f64,
    pub evidence_count: usize,
}

/// Per-market health rollup. Recomputed on demand, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketHealth {
    pub market: String,
    pub health_score: f64,
    pub risk_level: RiskLevel,
    pub trade_count: usize,
    pub evidence_counts: HashMap<String, usize>,
    pub suspicious_addresses: Vec<SuspiciousAddress>,
}

/// Store-level counters surfaced through `/api/system/stats`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_trades: u64,
    pub total_volume: f64,
    pub wash_trade_count: u64,
    pub total_alerts: u64,
    pub total_evidence: u64,
    pub is_streaming: bool,
    pub last_block: u64,
}

/// Application configuration, environment-driven.
#[derive(Debug, Clone)]
pub struct Config {
    pub rpc_url: String,
    pub exchange_addresses: Vec<String>,
    pub db_path: String,
    pub poll_interval_seconds: u64,
    pub blocks_per_poll: u64,
    pub confirmations: u64,
    pub ring_trades: usize,
    pub ring_alerts: usize,
    pub port: u16,
}

/// Polymarket CTF Exchange on Polygon mainnet.
pub const DEFAULT_EXCHANGE_ADDRESSES: &str = "0x4bfb41d5b3570defd03c39a9a4d8de6bd8b8982e";

/// USDC on Polygon mainnet, the collateral behind outcome tokens.
pub const USDC_ADDRESS: &str = "0x2791bca1f2de4661ed88a30c99a7a9449aa84174";

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let rpc_url = std::env::var("POLYGON_RPC_URL")
            .map_err(|_| anyhow::anyhow!("POLYGON_RPC_URL must be set"))?;

        let exchange_addresses = std::env::var("EXCHANGE_ADDRESSES")
            .unwrap_or_else(|_| DEFAULT_EXCHANGE_ADDRESSES.to_string())
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();

        let db_path = std::env::var("DB_PATH").unwrap_or_else(|_| "./polysleuth.db".to_string());

        let poll_interval_seconds = std::env::var("POLL_INTERVAL_SECONDS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .unwrap_or(5);

        let blocks_per_poll = std::env::var("BLOCKS_PER_POLL")
            .unwrap_or_else(|_| "200".to_string())
            .parse()
            .unwrap_or(200);

        let confirmations = std::env::var("CONFIRMATIONS")
            .unwrap_or_else(|_| "3".to_string())
            .parse()
            .unwrap_or(3);

        let ring_trades = std::env::var("RING_TRADES")
            .unwrap_or_else(|_| "50000".to_string())
            .parse()
            .unwrap_or(50_000);

        let ring_alerts = std::env::var("RING_ALERTS")
            .unwrap_or_else(|_| "1000".to_string())
            .parse()
            .unwrap_or(1_000);

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .unwrap_or(3000);

        Ok(Self {
            rpc_url,
            exchange_addresses,
            db_path,
            poll_interval_seconds,
            blocks_per_poll,
            confirmations,
            ring_trades,
            ring_alerts,
            port,
        })
    }
}

/// Current unix timestamp, seconds.
pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_level_bands() {
        assert_eq!(RiskLevel::from_score(100.0), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(80.0), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(79.9), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(60.0), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(40.0), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(39.9), RiskLevel::Critical);
        assert_eq!(RiskLevel::from_score(0.0), RiskLevel::Critical);
    }

    #[test]
    fn alert_derivation_respects_threshold() {
        let mut e = Evidence {
            id: "self_trade_abc".to_string(),
            kind: EvidenceKind::SelfTrade,
            confidence: 1.0,
            timestamp: 1_700_000_000,
            addresses: vec!["0xaa".to_string()],
            tx_hashes: vec!["0x01".to_string()],
            token_id: "0xtok".to_string(),
            volume: 100.0,
            details: serde_json::json!({}),
        };
        let alert = Alert::from_evidence(&e).expect("above threshold");
        assert_eq!(alert.severity, Severity::Critical);
        assert!(!alert.ack);

        e.confidence = 0.5;
        assert!(Alert::from_evidence(&e).is_none());
    }

    #[test]
    fn side_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Side::Buy).unwrap(), "\"BUY\"");
        assert_eq!(Side::parse("SELL"), Some(Side::Sell));
    }
}
