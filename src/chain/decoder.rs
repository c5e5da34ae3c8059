//! Bit-exact decoding of exchange and CTF events out of raw logs.
//!
//! Three events are in scope: `OrderFilled` (a CLOB fill), `PositionSplit`
//! (collateral minted into a YES+NO pair) and `PositionsMerge` (the burn).
//! Malformed logs are counted and dropped; decoding is never fatal to the
//! ingestion loop.

use crate::chain::ctf::u256_hex;
use crate::chain::rpc::RawLog;
use crate::error::ForensicsError;
use crate::models::{Side, TokenOp, TokenOpKind, Trade};
use alloy_primitives::{keccak256, U256};
use lazy_static::lazy_static;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Canonical event signatures the ingestor subscribes to.
pub mod signatures {
    pub const ORDER_FILLED: &str =
        "OrderFilled(bytes32,bytes32,address,address,uint256,uint256,uint256,uint256,uint256)";
    pub const POSITION_SPLIT: &str =
        "PositionSplit(address,address,bytes32,bytes32,uint256[],uint256)";
    pub const POSITIONS_MERGE: &str =
        "PositionsMerge(address,address,bytes32,bytes32,uint256[],uint256)";
}

lazy_static! {
    pub static ref ORDER_FILLED_TOPIC: String = event_topic(signatures::ORDER_FILLED);
    pub static ref POSITION_SPLIT_TOPIC: String = event_topic(signatures::POSITION_SPLIT);
    pub static ref POSITIONS_MERGE_TOPIC: String = event_topic(signatures::POSITIONS_MERGE);
}

fn event_topic(signature: &str) -> String {
    format!("0x{}", hex::encode(keccak256(signature.as_bytes())))
}

/// The topic0 filter set for `eth_getLogs`.
pub fn subscribed_topics() -> Vec<String> {
    vec![
        ORDER_FILLED_TOPIC.clone(),
        POSITION_SPLIT_TOPIC.clone(),
        POSITIONS_MERGE_TOPIC.clone(),
    ]
}

/// Decode-failure counters, surfaced through `/api/system/stats`.
#[derive(Debug, Default)]
pub struct DecodeStats {
    pub order_filled: AtomicU64,
    pub splits: AtomicU64,
    pub merges: AtomicU64,
    pub malformed: AtomicU64,
    pub unknown_topic: AtomicU64,
}

impl DecodeStats {
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "order_filled": self.order_filled.load(Ordering::Relaxed),
            "splits": self.splits.load(Ordering::Relaxed),
            "merges": self.merges.load(Ordering::Relaxed),
            "malformed": self.malformed.load(Ordering::Relaxed),
            "unknown_topic": self.unknown_topic.load(Ordering::Relaxed),
        })
    }

    pub fn decode_errors(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub enum DecodedEvent {
    Trade(Trade),
    Op(TokenOp),
}

/// 32-byte word reader over a log's indexed topics and data, in slot order.
struct SlotReader {
    words: Vec<[u8; 32]>,
    /// Word count contributed by topics; dynamic-array offsets in data are
    /// relative to the word after this boundary.
    topic_words: usize,
}

impl SlotReader {
    fn from_log(log: &RawLog) -> Result<Self, ForensicsError> {
        let mut words = Vec::new();
        for topic in log.topics.iter().skip(1) {
            words.push(decode_word(topic)?);
        }
        let topic_words = words.len();

        let data = hex::decode(log.data.trim_start_matches("0x"))
            .map_err(|e| ForensicsError::Decode(format!("bad data hex: {e}")))?;
        if data.len() % 32 != 0 {
            return Err(ForensicsError::Decode(format!(
                "data length {} not word-aligned",
                data.len()
            )));
        }
        for chunk in data.chunks_exact(32) {
            let mut w = [0u8; 32];
            w.copy_from_slice(chunk);
            words.push(w);
        }

        Ok(Self { words, topic_words })
    }

    fn len(&self) -> usize {
        self.words.len()
    }

    fn u256(&self, i: usize) -> Result<U256, ForensicsError> {
        self.words
            .get(i)
            .map(|w| U256::from_be_bytes(*w))
            .ok_or_else(|| ForensicsError::Decode(format!("missing slot {i}")))
    }

    fn u128(&self, i: usize) -> Result<u128, ForensicsError> {
        let v = self.u256(i)?;
        u128::try_from(v).map_err(|_| ForensicsError::Decode(format!("slot {i} exceeds u128")))
    }

    fn address(&self, i: usize) -> Result<String, ForensicsError> {
        let w = self
            .words
            .get(i)
            .ok_or_else(|| ForensicsError::Decode(format!("missing slot {i}")))?;
        Ok(format!("0x{}", hex::encode(&w[12..])))
    }

    fn b256_hex(&self, i: usize) -> Result<String, ForensicsError> {
        let w = self
            .words
            .get(i)
            .ok_or_else(|| ForensicsError::Decode(format!("missing slot {i}")))?;
        Ok(format!("0x{}", hex::encode(w)))
    }

    /// Index of the first data word, for resolving dynamic-array offsets.
    fn data_base(&self) -> usize {
        self.topic_words
    }
}

fn decode_word(hex_word: &str) -> Result<[u8; 32], ForensicsError> {
    let bytes = hex::decode(hex_word.trim_start_matches("0x"))
        .map_err(|e| ForensicsError::Decode(format!("bad topic hex: {e}")))?;
    if bytes.len() != 32 {
        return Err(ForensicsError::Decode(format!(
            "topic length {} != 32",
            bytes.len()
        )));
    }
    let mut w = [0u8; 32];
    w.copy_from_slice(&bytes);
    Ok(w)
}

/// Integer division rounded half to even.
fn div_round_half_even(numerator: u128, denominator: u128) -> u128 {
    let q = numerator / denominator;
    let twice_rem = (numerator % denominator) * 2;
    if twice_rem > denominator || (twice_rem == denominator && q % 2 == 1) {
        q + 1
    } else {
        q
    }
}

/// Stateless log decoder with shared failure counters.
pub struct LogDecoder {
    stats: std::sync::Arc<DecodeStats>,
}

impl LogDecoder {
    pub fn new(stats: std::sync::Arc<DecodeStats>) -> Self {
        Self { stats }
    }

    pub fn stats(&self) -> &DecodeStats {
        &self.stats
    }

    /// Decode one log. Malformed or unrecognized logs return `None` after
    /// bumping the matching counter.
    pub fn decode(&self, log: &RawLog) -> Option<DecodedEvent> {
        let topic0 = match log.topic0() {
            Some(t) => t.to_ascii_lowercase(),
            None => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let result = if topic0 == *ORDER_FILLED_TOPIC {
            decode_order_filled(log).map(DecodedEvent::Trade)
        } else if topic0 == *POSITION_SPLIT_TOPIC {
            decode_position_op(log, TokenOpKind::Split).map(DecodedEvent::Op)
        } else if topic0 == *POSITIONS_MERGE_TOPIC {
            decode_position_op(log, TokenOpKind::Merge).map(DecodedEvent::Op)
        } else {
            self.stats.unknown_topic.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        match result {
            Ok(event) => {
                match &event {
                    DecodedEvent::Trade(_) => {
                        self.stats.order_filled.fetch_add(1, Ordering::Relaxed)
                    }
                    DecodedEvent::Op(op) if op.kind == TokenOpKind::Split => {
                        self.stats.splits.fetch_add(1, Ordering::Relaxed)
                    }
                    DecodedEvent::Op(_) => self.stats.merges.fetch_add(1, Ordering::Relaxed),
                };
                Some(event)
            }
            Err(e) => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                debug!(tx = %log.transaction_hash, error = %e, "dropped malformed log");
                None
            }
        }
    }
}

/// `OrderFilled` slots: makerOrderHash, takerOrderHash, maker, taker,
/// makerAssetId, takerAssetId, makerAmountFilled, takerAmountFilled, fee.
pub fn decode_order_filled(log: &RawLog) -> Result<Trade, ForensicsError> {
    let slots = SlotReader::from_log(log)?;
    if slots.len() < 9 {
        return Err(ForensicsError::Decode(format!(
            "OrderFilled needs 9 slots, got {}",
            slots.len()
        )));
    }

    let maker = slots.address(2)?;
    let taker = slots.address(3)?;
    let maker_asset = slots.u256(4)?;
    let taker_asset = slots.u256(5)?;
    let maker_amount = slots.u128(6)?;
    let taker_amount = slots.u128(7)?;

    // Exactly one side is collateral (asset id zero).
    let (side, token, usdc_amount, token_amount) =
        match (maker_asset.is_zero(), taker_asset.is_zero()) {
            (true, false) => (Side::Buy, taker_asset, maker_amount, taker_amount),
            (false, true) => (Side::Sell, maker_asset, taker_amount, maker_amount),
            (true, true) => {
                return Err(ForensicsError::Decode("both asset ids zero".to_string()))
            }
            (false, false) => {
                return Err(ForensicsError::Decode("both asset ids non-zero".to_string()))
            }
        };

    if token_amount == 0 {
        return Err(ForensicsError::Decode("zero token amount".to_string()));
    }

    // price = usdc / tokens, half-even to 4 decimals, all in integer space.
    let price_4dp = div_round_half_even(usdc_amount * 10_000, token_amount);
    let volume_6dp = div_round_half_even(token_amount * price_4dp, 10_000);

    let price = price_4dp as f64 / 1e4;
    let size = token_amount as f64 / 1e6;
    let volume = volume_6dp as f64 / 1e6;

    let block_number = log
        .block_number_u64()
        .ok_or_else(|| ForensicsError::Decode("bad block number".to_string()))?;
    let log_index = log
        .log_index_u64()
        .ok_or_else(|| ForensicsError::Decode("bad log index".to_string()))?;

    Ok(Trade {
        tx_hash: log.transaction_hash.to_ascii_lowercase(),
        log_index,
        block_number,
        timestamp: 0,
        exchange: log.address.to_ascii_lowercase(),
        maker,
        taker,
        maker_asset_id: u256_hex(maker_asset),
        taker_asset_id: u256_hex(taker_asset),
        maker_amount_filled: maker_amount,
        taker_amount_filled: taker_amount,
        token_id: u256_hex(token),
        side,
        price,
        size,
        volume,
        gas_price: 0,
        market_slug: None,
        is_wash: false,
        price_out_of_range: price > 1.0,
    })
}

/// `PositionSplit` / `PositionsMerge` layout: stakeholder, parentCollectionId
/// and conditionId indexed; data carries (collateral, partition[], amount).
pub fn decode_position_op(log: &RawLog, kind: TokenOpKind) -> Result<TokenOp, ForensicsError> {
    if log.topics.len() < 4 {
        return Err(ForensicsError::Decode(format!(
            "position op needs 4 topics, got {}",
            log.topics.len()
        )));
    }

    let slots = SlotReader::from_log(log)?;
    let stakeholder = slots.address(0)?;
    let parent_collection_id = slots.b256_hex(1)?;
    let condition_id = slots.b256_hex(2)?;

    let base = slots.data_base();
    let collateral = slots.address(base)?;
    let partition_offset = slots.u128(base + 1)? as usize;
    if partition_offset % 32 != 0 {
        return Err(ForensicsError::Decode("misaligned partition offset".to_string()));
    }
    let amount = slots.u128(base + 2)?;

    let len_slot = base + partition_offset / 32;
    let partition_len = slots.u128(len_slot)? as usize;
    if partition_len > 32 {
        return Err(ForensicsError::Decode(format!(
            "partition length {partition_len} implausible"
        )));
    }
    let mut partition = Vec::with_capacity(partition_len);
    for i in 0..partition_len {
        let v = slots.u128(len_slot + 1 + i)?;
        let v = u64::try_from(v)
            .map_err(|_| ForensicsError::Decode("partition index set exceeds u64".to_string()))?;
        partition.push(v);
    }

    let block_number = log
        .block_number_u64()
        .ok_or_else(|| ForensicsError::Decode("bad block number".to_string()))?;
    let log_index = log
        .log_index_u64()
        .ok_or_else(|| ForensicsError::Decode("bad log index".to_string()))?;

    Ok(TokenOp {
        kind,
        tx_hash: log.transaction_hash.to_ascii_lowercase(),
        log_index,
        block_number,
        timestamp: 0,
        stakeholder,
        collateral,
        parent_collection_id,
        condition_id,
        partition,
        amount,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn word_hex(bytes: &[u8]) -> String {
        let mut w = [0u8; 32];
        w[32 - bytes.len()..].copy_from_slice(bytes);
        hex::encode(w)
    }

    fn u256_word(v: u128) -> String {
        word_hex(&v.to_be_bytes())
    }

    fn order_filled_log(
        maker_asset: u128,
        taker_asset: u128,
        maker_amount: u128,
        taker_amount: u128,
    ) -> RawLog {
        let data = format!(
            "0x{}{}{}{}{}{}{}",
            word_hex(&hex::decode("1111111111111111111111111111111111111111").unwrap()),
            word_hex(&hex::decode("2222222222222222222222222222222222222222").unwrap()),
            u256_word(maker_asset),
            u256_word(taker_asset),
            u256_word(maker_amount),
            u256_word(taker_amount),
            u256_word(0),
        );
        serde_json::from_value(serde_json::json!({
            "address": "0x4bfb41d5b3570defd03c39a9a4d8de6bd8b8982e",
            "topics": [
                ORDER_FILLED_TOPIC.clone(),
                format!("0x{}", word_hex(&[0xA1])),
                format!("0x{}", word_hex(&[0xA2])),
            ],
            "data": data,
            "blockNumber": "0x64",
            "transactionHash": "0xAABB",
            "logIndex": "0x1",
        }))
        .unwrap()
    }

    #[test]
    fn buy_decode_matches_expected_derivations() {
        // makerAssetId = 0 (collateral), equal 3.0 fills: price 1.0000.
        let log = order_filled_log(0, 0x1234_5678, 3_000_000, 3_000_000);
        let trade = decode_order_filled(&log).unwrap();

        assert_eq!(trade.side, Side::Buy);
        assert!(trade.token_id.ends_with("12345678"));
        assert_eq!(trade.price, 1.0);
        assert_eq!(trade.size, 3.0);
        assert_eq!(trade.volume, 3.0);
        assert!(!trade.price_out_of_range);
        assert_eq!(trade.block_number, 100);
        assert_eq!(trade.log_index, 1);
    }

    #[test]
    fn sell_decode_derives_price_from_taker_collateral() {
        // maker sells 2.0 tokens for 1.0 USDC: price 0.5000.
        let log = order_filled_log(0x99, 0, 1_000_000, 2_000_000);
        let trade = decode_order_filled(&log).unwrap();
        assert_eq!(trade.side, Side::Sell);
        assert_eq!(trade.price, 0.5);
        assert_eq!(trade.size, 2.0);
        assert_eq!(trade.volume, 1.0);
    }

    #[test]
    fn both_asset_ids_non_zero_is_rejected() {
        let log = order_filled_log(0x1, 0x2, 1_000_000, 1_000_000);
        assert!(decode_order_filled(&log).is_err());
    }

    #[test]
    fn zero_token_amount_is_rejected() {
        let log = order_filled_log(0, 0x2, 1_000_000, 0);
        assert!(decode_order_filled(&log).is_err());
    }

    #[test]
    fn half_even_rounding_on_exact_halves() {
        // 1.0001 USDC for 2.0 tokens: exact .5 remainder onto an even digit.
        let even = decode_order_filled(&order_filled_log(0, 0x2, 1_000_100, 2_000_000)).unwrap();
        assert_eq!(even.price, 0.5);

        // Exact .5 remainder onto an odd digit rounds up to even.
        let odd = decode_order_filled(&order_filled_log(0, 0x2, 1_000_300, 2_000_000)).unwrap();
        assert_eq!(odd.price, 0.5002);
    }

    #[test]
    fn out_of_range_price_is_flagged_but_decoded() {
        let log = order_filled_log(0, 0x2, 3_000_000, 2_000_000);
        let trade = decode_order_filled(&log).unwrap();
        assert_eq!(trade.price, 1.5);
        assert!(trade.price_out_of_range);
    }

    #[test]
    fn split_decode_reads_dynamic_partition() {
        let data = format!(
            "0x{}{}{}{}{}{}",
            word_hex(&hex::decode("2791bca1f2de4661ed88a30c99a7a9449aa84174").unwrap()),
            u256_word(0x60),
            u256_word(1_000_000),
            u256_word(2),
            u256_word(1),
            u256_word(2),
        );
        let log: RawLog = serde_json::from_value(serde_json::json!({
            "address": "0x4bfb41d5b3570defd03c39a9a4d8de6bd8b8982e",
            "topics": [
                POSITION_SPLIT_TOPIC.clone(),
                format!("0x{}", word_hex(&hex::decode("3333333333333333333333333333333333333333").unwrap())),
                format!("0x{}", word_hex(&[0x00])),
                format!("0x{}", word_hex(&[0xCC])),
            ],
            "data": data,
            "blockNumber": "0x65",
            "transactionHash": "0xDDEE",
            "logIndex": "0x3",
        }))
        .unwrap();

        let op = decode_position_op(&log, TokenOpKind::Split).unwrap();
        assert_eq!(op.kind, TokenOpKind::Split);
        assert_eq!(op.stakeholder, "0x3333333333333333333333333333333333333333");
        assert_eq!(op.amount, 1_000_000);
        assert_eq!(op.partition, vec![1, 2]);
        assert!(op.condition_id.ends_with("cc"));
    }

    #[test]
    fn decoder_counts_malformed_and_unknown() {
        let decoder = LogDecoder::new(Arc::new(DecodeStats::default()));

        let good = order_filled_log(0, 0x2, 1_000_000, 1_000_000);
        assert!(decoder.decode(&good).is_some());

        let bad = order_filled_log(0x1, 0x2, 1_000_000, 1_000_000);
        assert!(decoder.decode(&bad).is_none());

        let mut unknown = order_filled_log(0, 0x2, 1, 1);
        unknown.topics[0] = format!("0x{}", word_hex(&[0xFF]));
        assert!(decoder.decode(&unknown).is_none());

        assert_eq!(decoder.stats().order_filled.load(Ordering::Relaxed), 1);
        assert_eq!(decoder.stats().malformed.load(Ordering::Relaxed), 1);
        assert_eq!(decoder.stats().unknown_topic.load(Ordering::Relaxed), 1);
    }
}
