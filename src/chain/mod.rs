//! On-chain ingestion: JSON-RPC client, log decoding, token-id derivation,
//! and market resolution.

pub mod ctf;
pub mod decoder;
pub mod markets;
pub mod rpc;

pub use decoder::{DecodeStats, DecodedEvent, LogDecoder};
pub use markets::{MarketCatalog, MarketResolver, NullCatalog};
pub use rpc::{RawLog, RpcClient};
