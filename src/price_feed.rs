// Price Feed Integration
//
// The engine never talks to a market-data provider directly. Anything that can
// answer "latest price for symbol X" implements PriceFeed. The sweeper keeps a
// PriceCache warm from the upstream feed on one timer and evaluates signals
// against the cache on another, so a slow provider never stalls evaluation.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::{Price, Timestamp};

/// A single price observation for a symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub symbol: String,
    pub price: Price,
    pub timestamp: Timestamp,
}

impl PriceUpdate {
    pub fn new(symbol: impl Into<String>, price: Price, timestamp: Timestamp) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            timestamp,
        }
    }

    pub fn is_stale(&self, now: Timestamp, ttl_ms: u64) -> bool {
        let ttl = i64::try_from(ttl_ms).unwrap_or(i64::MAX);
        now.as_millis().saturating_sub(self.timestamp.as_millis()) > ttl
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PriceFeedError {
    #[error("No price available for {0}")]
    NotAvailable(String),

    #[error("Price for {symbol} is stale ({age_ms}ms old)")]
    Stale { symbol: String, age_ms: i64 },

    #[error("Price provider error: {0}")]
    Upstream(String),
}

/// Source of current market prices.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    async fn latest_price(&self, symbol: &str) -> Result<PriceUpdate, PriceFeedError>;
}

/// Latest price per symbol with a freshness window. Written by the price
/// refresh loop, read as a [`PriceFeed`] by everything else.
#[derive(Debug)]
pub struct PriceCache {
    ttl_ms: u64,
    entries: RwLock<HashMap<String, PriceUpdate>>,
}

impl PriceCache {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            ttl_ms,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Keeps the newer of the cached and incoming update.
    pub fn update(&self, update: PriceUpdate) {
        let mut entries = self.entries.write();
        match entries.get(&update.symbol) {
            Some(existing) if existing.timestamp > update.timestamp => {}
            _ => {
                entries.insert(update.symbol.clone(), update);
            }
        }
    }

    pub fn get(&self, symbol: &str, now: Timestamp) -> Result<PriceUpdate, PriceFeedError> {
        let entries = self.entries.read();
        let update = entries
            .get(symbol)
            .ok_or_else(|| PriceFeedError::NotAvailable(symbol.to_string()))?;

        if update.is_stale(now, self.ttl_ms) {
            return Err(PriceFeedError::Stale {
                symbol: symbol.to_string(),
                age_ms: now.as_millis() - update.timestamp.as_millis(),
            });
        }
        Ok(update.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl PriceFeed for PriceCache {
    async fn latest_price(&self, symbol: &str) -> Result<PriceUpdate, PriceFeedError> {
        self.get(symbol, Timestamp::now())
    }
}

/// Mock feed for testing and the simulation binary. Prices are set by hand
/// and always reported as observed now.
#[derive(Debug, Default)]
pub struct MockPriceFeed {
    prices: RwLock<HashMap<String, Price>>,
}

impl MockPriceFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_price(&self, symbol: impl Into<String>, price: Price) {
        self.prices.write().insert(symbol.into(), price);
    }

    pub fn remove(&self, symbol: &str) {
        self.prices.write().remove(symbol);
    }
}

#[async_trait]
impl PriceFeed for MockPriceFeed {
    async fn latest_price(&self, symbol: &str) -> Result<PriceUpdate, PriceFeedError> {
        let price = self
            .prices
            .read()
            .get(symbol)
            .copied()
            .ok_or_else(|| PriceFeedError::NotAvailable(symbol.to_string()))?;
        Ok(PriceUpdate::new(symbol, price, Timestamp::now()))
    }
}
