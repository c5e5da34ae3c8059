//! Evidence store: bounded in-memory rings with secondary indices and a
//! durable SQLite spill.

pub mod db;
pub mod ring;

pub use db::SpillDb;
pub use ring::{EvidenceStore, Snapshot, StoreConfig, TradeFilter};
