//! Token-id → market resolution.
//!
//! The resolver owns the market cache. Metadata comes from the venue's
//! off-chain catalog through the narrow `MarketCatalog` contract; everything
//! else (YES/NO token ids) is derived deterministically on-chain-style.

use crate::chain::ctf;
use crate::models::{MarketInfo, USDC_ADDRESS};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Metadata for one condition as the catalog reports it.
#[derive(Debug, Clone)]
pub struct MarketMeta {
    pub condition_id: String,
    pub question_id: String,
    pub oracle: String,
    pub slug: String,
    pub question: Option<String>,
    pub status: String,
}

/// Narrow contract to the venue's market catalog.
#[async_trait]
pub trait MarketCatalog: Send + Sync {
    /// Look a token id up. `Ok(None)` when the venue does not know it.
    async fn lookup(&self, token_id: &str) -> anyhow::Result<Option<MarketMeta>>;
}

/// Catalog that knows nothing. Trades stay `market=unknown`.
pub struct NullCatalog;

#[async_trait]
impl MarketCatalog for NullCatalog {
    async fn lookup(&self, _token_id: &str) -> anyhow::Result<Option<MarketMeta>> {
        Ok(None)
    }
}

/// Exclusive owner of the market cache.
pub struct MarketResolver {
    by_token: RwLock<HashMap<String, Arc<MarketInfo>>>,
    by_condition: RwLock<HashMap<String, Arc<MarketInfo>>>,
    catalog: Arc<dyn MarketCatalog>,
}

impl MarketResolver {
    pub fn new(catalog: Arc<dyn MarketCatalog>) -> Self {
        Self {
            by_token: RwLock::new(HashMap::new()),
            by_condition: RwLock::new(HashMap::new()),
            catalog,
        }
    }

    /// Cache-only lookup.
    pub fn resolve(&self, token_id: &str) -> Option<Arc<MarketInfo>> {
        self.by_token.read().get(token_id).cloned()
    }

    /// Register a condition, deriving both outcome token ids. Idempotent per
    /// condition id; re-registering returns the cached market.
    pub fn register(&self, meta: MarketMeta) -> anyhow::Result<Arc<MarketInfo>> {
        if let Some(existing) = self.by_condition.read().get(&meta.condition_id) {
            return Ok(existing.clone());
        }

        let condition = ctf::parse_b256(&meta.condition_id)
            .ok_or_else(|| anyhow::anyhow!("bad condition id: {}", meta.condition_id))?;
        let collateral = ctf::parse_address(USDC_ADDRESS)
            .ok_or_else(|| anyhow::anyhow!("bad collateral address"))?;
        let (yes_token_id, no_token_id) = ctf::outcome_token_ids(collateral, condition);

        let market = Arc::new(MarketInfo {
            condition_id: meta.condition_id.clone(),
            question_id: meta.question_id,
            oracle: meta.oracle,
            yes_token_id: yes_token_id.clone(),
            no_token_id: no_token_id.clone(),
            slug: meta.slug,
            question: meta.question,
            status: meta.status,
        });

        self.by_condition
            .write()
            .insert(meta.condition_id, market.clone());
        let mut by_token = self.by_token.write();
        by_token.insert(yes_token_id, market.clone());
        by_token.insert(no_token_id, market.clone());

        debug!(slug = %market.slug, "market registered");
        Ok(market)
    }

    /// Seed the cache with an already-derived market (e.g. from the durable
    /// store on boot).
    pub fn register_info(&self, info: MarketInfo) -> Arc<MarketInfo> {
        if let Some(existing) = self.by_condition.read().get(&info.condition_id) {
            return existing.clone();
        }
        let market = Arc::new(info);
        self.by_condition
            .write()
            .insert(market.condition_id.clone(), market.clone());
        let mut by_token = self.by_token.write();
        by_token.insert(market.yes_token_id.clone(), market.clone());
        by_token.insert(market.no_token_id.clone(), market.clone());
        market
    }

    /// Cache lookup, falling back to the catalog. A catalog hit is cached so
    /// later trades resolve synchronously.
    pub async fn resolve_or_fetch(&self, token_id: &str) -> anyhow::Result<Option<Arc<MarketInfo>>> {
        if let Some(market) = self.resolve(token_id) {
            return Ok(Some(market));
        }

        match self.catalog.lookup(token_id).await? {
            Some(meta) => Ok(Some(self.register(meta)?)),
            None => Ok(None),
        }
    }

    pub fn all(&self) -> Vec<Arc<MarketInfo>> {
        let mut markets: Vec<_> = self.by_condition.read().values().cloned().collect();
        markets.sort_by(|a, b| a.condition_id.cmp(&b.condition_id));
        markets
    }

    pub fn len(&self) -> usize {
        self.by_condition.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_condition.read().is_empty()
    }
}
