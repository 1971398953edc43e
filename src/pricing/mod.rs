//! Token → USD price cache with an ordered chain of fallback sources
//!
//! Lookup order: fresh cache entry, then each source in priority order, then
//! the last cached value however old, then the registry's fallback constant.
//! Price lookups never fail: an unavailable price must not block balance
//! display.

mod sources;

use crate::tokens::registry;
use alloy::primitives::Address;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

pub use sources::{
    MarketDataSource, PairAggregatorSource, PriceSource, RouteQuotePriceSource, SourcePrice,
};

/// Where a returned price came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceOrigin {
    /// Stablecoin pegged to $1, no lookup
    Pegged,
    /// Fresh cache hit
    Cache,
    /// Just fetched from the named source
    Source(&'static str),
    /// Every source failed; expired cache entry served
    StaleCache,
    /// Every source failed and nothing was cached
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenPrice {
    pub price: f64,
    pub change_24h: Option<f64>,
    pub origin: PriceOrigin,
}

#[derive(Debug, Clone)]
struct PriceCacheEntry {
    price: f64,
    change_24h: Option<f64>,
    fetched_at: Instant,
}

pub struct PriceOracleCache {
    sources: Vec<Arc<dyn PriceSource>>,
    cache: Arc<RwLock<HashMap<Address, PriceCacheEntry>>>,
    ttl: Duration,
}

impl PriceOracleCache {
    /// `sources` are tried in the given order
    pub fn new(sources: Vec<Arc<dyn PriceSource>>, ttl: Duration) -> Self {
        Self {
            sources,
            cache: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    pub async fn get_price(&self, token: Address, symbol: &str) -> TokenPrice {
        if registry().is_stablecoin(&token) {
            return TokenPrice {
                price: 1.0,
                change_24h: Some(0.0),
                origin: PriceOrigin::Pegged,
            };
        }

        if let Some(entry) = self.cached(token).await {
            if entry.fetched_at.elapsed() < self.ttl {
                return TokenPrice {
                    price: entry.price,
                    change_24h: entry.change_24h,
                    origin: PriceOrigin::Cache,
                };
            }
        }

        for source in self.sources.iter().filter(|s| s.supports(token)) {
            match source.fetch(token, symbol).await {
                Ok(reading) if reading.price.is_finite() && reading.price > 0.0 => {
                    self.set(token, reading).await;
                    tracing::debug!(
                        token = %token,
                        symbol = symbol,
                        price = reading.price,
                        source = source.name(),
                        "Fetched token price"
                    );
                    return TokenPrice {
                        price: reading.price,
                        change_24h: reading.change_24h,
                        origin: PriceOrigin::Source(source.name()),
                    };
                }
                Ok(reading) => {
                    tracing::warn!(
                        token = %token,
                        source = source.name(),
                        price = reading.price,
                        "Price source returned an unusable price"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        token = %token,
                        symbol = symbol,
                        source = source.name(),
                        error = %e,
                        "Price source failed, trying next"
                    );
                }
            }
        }

        if let Some(entry) = self.cached(token).await {
            tracing::warn!(
                token = %token,
                age_secs = entry.fetched_at.elapsed().as_secs(),
                "All price sources failed, serving stale cached price"
            );
            return TokenPrice {
                price: entry.price,
                change_24h: entry.change_24h,
                origin: PriceOrigin::StaleCache,
            };
        }

        let fallback = registry().fallback_price(&token);
        tracing::warn!(
            token = %token,
            symbol = symbol,
            fallback_price = fallback,
            "All price sources failed and nothing cached, using fallback constant"
        );
        TokenPrice {
            price: fallback,
            change_24h: None,
            origin: PriceOrigin::Fallback,
        }
    }

    async fn cached(&self, token: Address) -> Option<PriceCacheEntry> {
        self.cache.read().await.get(&token).cloned()
    }

    /// Insert or overwrite a cache entry
    pub async fn set(&self, token: Address, reading: SourcePrice) {
        let mut cache = self.cache.write().await;
        cache.insert(
            token,
            PriceCacheEntry {
                price: reading.price,
                change_24h: reading.change_24h,
                fetched_at: Instant::now(),
            },
        );
    }

    /// Drop every cached price
    pub async fn reset(&self) {
        self.cache.write().await.clear();
    }
}
