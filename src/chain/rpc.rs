//! Polygon JSON-RPC client for log retrieval.
//!
//! Raw JSON-RPC 2.0 over HTTP, no heavyweight provider stack. All calls
//! retry with exponential backoff; `eth_getLogs` ranges the node rejects as
//! too large are halved and retried until they fit.

use crate::error::ForensicsError;
use parking_lot::Mutex;
use reqwest::Client;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, warn};

const BACKOFF_INITIAL_MS: u64 = 500;
const BACKOFF_CAP_MS: u64 = 30_000;
const MAX_ATTEMPTS: u32 = 6;
/// Ranges at or below this size are never split further.
const MIN_SPLIT_SPAN: u64 = 1_000;
const TIMESTAMP_CACHE_CAPACITY: usize = 4_096;
const GAS_CACHE_CAPACITY: usize = 4_096;

/// One entry from an `eth_getLogs` response, fields still hex-encoded.
#[derive(Debug, Clone, Deserialize)]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    #[serde(rename = "blockNumber")]
    pub block_number: String,
    #[serde(rename = "transactionHash")]
    pub transaction_hash: String,
    #[serde(rename = "logIndex")]
    pub log_index: String,
    #[serde(default)]
    pub removed: bool,
}

impl RawLog {
    pub fn block_number_u64(&self) -> Option<u64> {
        parse_hex_u64(&self.block_number)
    }

    pub fn log_index_u64(&self) -> Option<u64> {
        parse_hex_u64(&self.log_index)
    }

    pub fn topic0(&self) -> Option<&str> {
        self.topics.first().map(|s| s.as_str())
    }
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<serde_json::Value>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

enum CallFailure {
    /// The node answered with an oversized-range complaint; split, don't retry.
    RangeTooLarge(String),
    /// Transport or transient node failure; retry with backoff.
    Retryable(String),
}

/// Insertion-ordered bounded cache. Eviction drops the oldest entry.
struct BoundedCache<K, V> {
    map: HashMap<K, V>,
    order: VecDeque<K>,
    capacity: usize,
}

impl<K: std::hash::Hash + Eq + Clone, V: Clone> BoundedCache<K, V> {
    fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn get(&self, key: &K) -> Option<V> {
        self.map.get(key).cloned()
    }

    fn insert(&mut self, key: K, value: V) {
        if self.map.insert(key.clone(), value).is_none() {
            self.order.push_back(key);
            if self.order.len() > self.capacity {
                if let Some(oldest) = self.order.pop_front() {
                    self.map.remove(&oldest);
                }
            }
        }
    }
}

/// Block-range and tip-following log retrieval against a Polygon-class node.
pub struct RpcClient {
    client: Client,
    url: String,
    timestamps: Mutex<BoundedCache<u64, i64>>,
    gas_prices: Mutex<BoundedCache<String, u128>>,
}

impl RpcClient {
    pub fn new(url: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();

        Self {
            client,
            url,
            timestamps: Mutex::new(BoundedCache::new(TIMESTAMP_CACHE_CAPACITY)),
            gas_prices: Mutex::new(BoundedCache::new(GAS_CACHE_CAPACITY)),
        }
    }

    /// Current chain head.
    pub async fn block_number(&self) -> Result<u64, ForensicsError> {
        let result = self.call("eth_blockNumber", serde_json::json!([])).await?;
        result
            .as_str()
            .and_then(parse_hex_u64)
            .ok_or_else(|| ForensicsError::Upstream("non-hex block number".to_string()))
    }

    /// Logs matching any of `topic0s` emitted by `addresses` in `[from, to]`.
    ///
    /// Oversized ranges are split in half and re-queried; results come back
    /// sorted by (block, log index).
    pub async fn get_logs(
        &self,
        from: u64,
        to: u64,
        addresses: &[String],
        topic0s: &[String],
    ) -> Result<Vec<RawLog>, ForensicsError> {
        let mut out: Vec<RawLog> = Vec::new();
        let mut pending: Vec<(u64, u64)> = vec![(from, to)];

        while let Some((lo, hi)) = pending.pop() {
            match self.get_logs_range(lo, hi, addresses, topic0s).await {
                Ok(mut logs) => out.append(&mut logs),
                Err(CallFailure::RangeTooLarge(msg)) => {
                    let span = hi.saturating_sub(lo) + 1;
                    if span <= MIN_SPLIT_SPAN {
                        return Err(ForensicsError::Upstream(msg));
                    }
                    let mid = lo + span / 2;
                    debug!(lo, hi, mid, "splitting oversized log range");
                    pending.push((mid, hi));
                    pending.push((lo, mid - 1));
                }
                Err(CallFailure::Retryable(msg)) => return Err(ForensicsError::Upstream(msg)),
            }
        }

        out.sort_by_key(|l| (l.block_number_u64().unwrap_or(0), l.log_index_u64().unwrap_or(0)));
        Ok(out)
    }

    async fn get_logs_range(
        &self,
        from: u64,
        to: u64,
        addresses: &[String],
        topic0s: &[String],
    ) -> Result<Vec<RawLog>, CallFailure> {
        let params = serde_json::json!([{
            "fromBlock": format!("0x{from:x}"),
            "toBlock": format!("0x{to:x}"),
            "address": addresses,
            "topics": [topic0s],
        }]);

        let result = self
            .call_classified("eth_getLogs", params)
            .await?;

        serde_json::from_value::<Vec<RawLog>>(result)
            .map_err(|e| CallFailure::Retryable(format!("malformed getLogs response: {e}")))
    }

    /// Block timestamp in seconds, LRU-cached.
    pub async fn block_timestamp(&self, block: u64) -> Result<i64, ForensicsError> {
        if let Some(ts) = self.timestamps.lock().get(&block) {
            return Ok(ts);
        }

        let params = serde_json::json!([format!("0x{block:x}"), false]);
        let result = self.call("eth_getBlockByNumber", params).await?;
        let ts = result
            .get("timestamp")
            .and_then(|t| t.as_str())
            .and_then(parse_hex_u64)
            .ok_or_else(|| ForensicsError::Upstream(format!("block {block} missing timestamp")))?
            as i64;

        self.timestamps.lock().insert(block, ts);
        Ok(ts)
    }

    /// Effective gas price of a transaction in wei; 0 when the node has no
    /// record (the gas-anomaly detector excludes zeros from its medians).
    pub async fn transaction_gas_price(&self, tx_hash: &str) -> u128 {
        if let Some(gas) = self.gas_prices.lock().get(&tx_hash.to_string()) {
            return gas;
        }

        let params = serde_json::json!([tx_hash]);
        let gas = match self.call("eth_getTransactionByHash", params).await {
            Ok(result) => result
                .get("gasPrice")
                .and_then(|g| g.as_str())
                .and_then(parse_hex_u128)
                .unwrap_or(0),
            Err(e) => {
                warn!(tx_hash, error = %e, "gas price lookup failed");
                0
            }
        };

        self.gas_prices.lock().insert(tx_hash.to_string(), gas);
        gas
    }

    /// One JSON-RPC call with exponential backoff on transient failures.
    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, ForensicsError> {
        match self.call_classified(method, params).await {
            Ok(v) => Ok(v),
            Err(CallFailure::RangeTooLarge(msg)) | Err(CallFailure::Retryable(msg)) => {
                Err(ForensicsError::Upstream(msg))
            }
        }
    }

    async fn call_classified(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, CallFailure> {
        let mut delay = Duration::from_millis(BACKOFF_INITIAL_MS);
        let mut last_err = String::new();

        for attempt in 1..=MAX_ATTEMPTS {
            match self.call_once(method, &params).await {
                Ok(v) => return Ok(v),
                Err(CallFailure::RangeTooLarge(msg)) => {
                    return Err(CallFailure::RangeTooLarge(msg))
                }
                Err(CallFailure::Retryable(msg)) => {
                    debug!(method, attempt, error = %msg, "RPC attempt failed");
                    last_err = msg;
                }
            }

            if attempt < MAX_ATTEMPTS {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_millis(BACKOFF_CAP_MS));
            }
        }

        warn!(method, error = %last_err, "RPC retries exhausted");
        Err(CallFailure::Retryable(last_err))
    }

    async fn call_once(
        &self,
        method: &str,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value, CallFailure> {
        let payload = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1,
        });

        let response: JsonRpcResponse = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| CallFailure::Retryable(format!("{method}: {e}")))?
            .json()
            .await
            .map_err(|e| CallFailure::Retryable(format!("{method}: bad response body: {e}")))?;

        if let Some(err) = response.error {
            let msg = format!("{method}: RPC error {}: {}", err.code, err.message);
            if is_range_error(err.code, &err.message) {
                return Err(CallFailure::RangeTooLarge(msg));
            }
            return Err(CallFailure::Retryable(msg));
        }

        response
            .result
            .ok_or_else(|| CallFailure::Retryable(format!("{method}: empty result")))
    }
}

/// Node-specific complaints that mean "narrow the block range".
fn is_range_error(code: i64, message: &str) -> bool {
    if code == -32005 || code == -32602 {
        return true;
    }
    let m = message.to_ascii_lowercase();
    m.contains("range") || m.contains("too many") || m.contains("response size")
}

pub fn parse_hex_u64(s: &str) -> Option<u64> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16).ok()
}

pub fn parse_hex_u128(s: &str) -> Option<u128> {
    u128::from_str_radix(s.trim_start_matches("0x"), 16).ok()
}
