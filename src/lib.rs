//! Polysleuth backend library.
//!
//! Exposes the forensic pipeline for binaries and tests: chain ingestion,
//! the evidence store, the detector suite, the alert bus and the REST
//! surface types.

pub mod api;
pub mod bus;
pub mod chain;
pub mod detectors;
pub mod error;
pub mod middleware;
pub mod models;
pub mod store;
pub mod stream;

pub use bus::{AlertBus, BusMessage};
pub use error::ForensicsError;
pub use store::{EvidenceStore, Snapshot, SpillDb, StoreConfig, TradeFilter};
