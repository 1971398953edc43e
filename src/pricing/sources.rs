//! External price sources, queried in priority order by `PriceOracleCache`

use crate::quote::{QuoteProvider, QuoteRequest};
use crate::tokens::{addresses, registry};
use crate::{Error, Result};
use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// A price reading from one source
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourcePrice {
    pub price: f64,
    pub change_24h: Option<f64>,
}

#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Name used in logs and cache provenance
    fn name(&self) -> &'static str;

    /// Whether this source can price the token at all
    fn supports(&self, _token: Address) -> bool {
        true
    }

    async fn fetch(&self, token: Address, symbol: &str) -> Result<SourcePrice>;
}

fn http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))
}

/// Prices tokens that have a canonical on-chain route by quoting one unit
/// into USDC through the protocol route, so the displayed price matches what
/// a sell would actually receive.
pub struct RouteQuotePriceSource {
    provider: Arc<dyn QuoteProvider>,
    routed_tokens: HashSet<Address>,
    chain_id: u64,
}

impl RouteQuotePriceSource {
    pub fn new(provider: Arc<dyn QuoteProvider>, routed_tokens: &[Address], chain_id: u64) -> Self {
        Self {
            provider,
            routed_tokens: routed_tokens.iter().copied().collect(),
            chain_id,
        }
    }
}

#[async_trait]
impl PriceSource for RouteQuotePriceSource {
    fn name(&self) -> &'static str {
        "protocol_route_quote"
    }

    fn supports(&self, token: Address) -> bool {
        self.routed_tokens.contains(&token)
    }

    async fn fetch(&self, token: Address, _symbol: &str) -> Result<SourcePrice> {
        let decimals = registry().get(&token).map(|t| t.decimals).unwrap_or(18);
        let one_unit = U256::from(10).pow(U256::from(decimals));

        let request = QuoteRequest {
            chain_id: self.chain_id,
            token_in: token,
            token_out: addresses::USDC,
            amount_in: one_unit,
            user_address: addresses::ZERO_ADDRESS,
            slippage_percent: 1.0,
        };
        let quote = self.provider.quote(&request).await?;

        // USDC has 6 decimals
        let price = crate::chain::units_to_f64(quote.amount_out, 6);
        if price <= 0.0 {
            return Err(Error::NoLiquidity);
        }
        Ok(SourcePrice {
            price,
            change_24h: None,
        })
    }
}

#[derive(Debug, Deserialize)]
struct MarketDataEntry {
    usd: Option<f64>,
    usd_24h_change: Option<f64>,
}

/// Generic market-data API keyed by contract address
pub struct MarketDataSource {
    client: Client,
    base_url: String,
    platform: String,
}

impl MarketDataSource {
    pub fn new(base_url: &str, platform: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            platform: platform.to_string(),
        })
    }
}

#[async_trait]
impl PriceSource for MarketDataSource {
    fn name(&self) -> &'static str {
        "market_data"
    }

    async fn fetch(&self, token: Address, _symbol: &str) -> Result<SourcePrice> {
        let contract = token.to_string().to_lowercase();
        let url = format!("{}/simple/token_price/{}", self.base_url, self.platform);

        let response = self
            .client
            .get(&url)
            .query(&[
                ("contract_addresses", contract.as_str()),
                ("vs_currencies", "usd"),
                ("include_24hr_change", "true"),
            ])
            .send()
            .await?
            .error_for_status()?;

        let body: HashMap<String, MarketDataEntry> = response.json().await?;
        let entry = body
            .into_iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(&contract))
            .map(|(_, v)| v)
            .ok_or_else(|| Error::Network(format!("market data has no listing for {}", token)))?;

        let price = entry
            .usd
            .filter(|p| *p > 0.0)
            .ok_or_else(|| Error::Network(format!("market data returned no USD price for {}", token)))?;

        Ok(SourcePrice {
            price,
            change_24h: entry.usd_24h_change,
        })
    }
}

#[derive(Debug, Deserialize)]
struct PairPriceChange {
    h24: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct PairLiquidity {
    usd: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct PairToken {
    address: String,
}

#[derive(Debug, Deserialize)]
struct DexPair {
    #[serde(rename = "chainId")]
    chain_id: String,
    #[serde(rename = "baseToken")]
    base_token: PairToken,
    #[serde(rename = "priceUsd")]
    price_usd: Option<String>,
    #[serde(rename = "priceChange")]
    price_change: Option<PairPriceChange>,
    liquidity: Option<PairLiquidity>,
}

#[derive(Debug, Deserialize)]
struct TokenPairsResponse {
    pairs: Option<Vec<DexPair>>,
}

/// Secondary aggregator over DEX pairs; picks the deepest pair on our chain
pub struct PairAggregatorSource {
    client: Client,
    base_url: String,
    chain: String,
}

impl PairAggregatorSource {
    pub fn new(base_url: &str, chain: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            chain: chain.to_string(),
        })
    }

    fn best_pair(&self, token: Address, pairs: Vec<DexPair>) -> Option<SourcePrice> {
        let token_str = token.to_string();
        pairs
            .into_iter()
            .filter(|p| p.chain_id == self.chain)
            .filter(|p| p.base_token.address.eq_ignore_ascii_case(&token_str))
            .filter_map(|p| {
                let price: f64 = p.price_usd.as_deref()?.parse().ok()?;
                let liquidity = p.liquidity.as_ref().and_then(|l| l.usd).unwrap_or(0.0);
                let change = p.price_change.as_ref().and_then(|c| c.h24);
                Some((liquidity, price, change))
            })
            .filter(|(_, price, _)| *price > 0.0)
            .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(_, price, change_24h)| SourcePrice { price, change_24h })
    }
}

#[async_trait]
impl PriceSource for PairAggregatorSource {
    fn name(&self) -> &'static str {
        "pair_aggregator"
    }

    async fn fetch(&self, token: Address, symbol: &str) -> Result<SourcePrice> {
        let url = format!("{}/latest/dex/tokens/{}", self.base_url, token);
        let response: TokenPairsResponse = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        self.best_pair(token, response.pairs.unwrap_or_default())
            .ok_or_else(|| Error::Network(format!("no priced {} pair for {}", self.chain, symbol)))
    }
}
