//! REST surface and shared application state.

pub mod routes;

use crate::bus::AlertBus;
use crate::chain::{DecodeStats, MarketResolver};
use crate::detectors::DetectorSuite;
use crate::models::Config;
use crate::store::{EvidenceStore, SpillDb};
use crate::stream::StreamController;
use std::sync::Arc;

/// Application state shared across handlers and background tasks.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<EvidenceStore>,
    pub db: SpillDb,
    pub resolver: Arc<MarketResolver>,
    pub suite: Arc<DetectorSuite>,
    pub bus: Arc<AlertBus>,
    pub controller: Arc<StreamController>,
    pub decode_stats: Arc<DecodeStats>,
    pub config: Config,
}
