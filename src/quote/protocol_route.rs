//! Protocol-specific quoting endpoint for tokens the aggregator does not index

use super::types::{parse_calldata, parse_raw_amount, ProviderKind, Quote, QuoteRequest, QuoteTransaction};
use super::QuoteProvider;
use crate::{Error, Result};
use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RouteTx {
    to: Address,
    #[serde(default)]
    value: Option<String>,
    data: String,
    #[serde(default)]
    gas: Option<String>,
    #[serde(default)]
    gas_price: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RouteResult {
    token_in: Address,
    amount_in: String,
    token_out: Address,
    amount_out: String,
    #[serde(default)]
    price_impact: Option<f64>,
    #[serde(default)]
    gas: Option<String>,
    #[serde(default)]
    tx: Option<RouteTx>,
}

#[derive(Debug, Deserialize)]
struct RouteResponse {
    result: Option<RouteResult>,
    #[serde(default)]
    error: Option<String>,
}

/// Slippage percent to basis points
fn slippage_bps(percent: f64) -> u32 {
    (percent * 100.0).round().max(0.0) as u32
}

fn map_response(request: &QuoteRequest, response: RouteResponse) -> Result<Quote> {
    let result = match (response.result, response.error) {
        (Some(result), _) => result,
        (None, Some(error)) => return Err(Error::Quote(format!("Protocol route: {}", error))),
        (None, None) => return Err(Error::Quote("Protocol route returned no result".to_string())),
    };

    if result.token_in != request.token_in || result.token_out != request.token_out {
        return Err(Error::Quote(format!(
            "Protocol route quoted {} -> {}, requested {} -> {}",
            result.token_in, result.token_out, request.token_in, request.token_out
        )));
    }

    let transaction = match result.tx {
        Some(tx) => Some(QuoteTransaction {
            to: tx.to,
            data: parse_calldata(&tx.data)?,
            value: match tx.value.as_deref() {
                Some(raw) if !raw.is_empty() => parse_raw_amount("tx.value", raw)?,
                _ => U256::ZERO,
            },
            gas: tx.gas.as_deref().and_then(|g| g.parse().ok()),
            gas_price: tx.gas_price.as_deref().and_then(|g| g.parse().ok()),
        }),
        None => None,
    };

    Ok(Quote {
        provider: ProviderKind::ProtocolRoute,
        token_in: result.token_in,
        token_out: result.token_out,
        amount_in: parse_raw_amount("amountIn", &result.amount_in)?,
        amount_out: parse_raw_amount("amountOut", &result.amount_out)?,
        price_impact_percent: result.price_impact.map(f64::abs).unwrap_or(0.0),
        gas_estimate: result.gas.as_deref().and_then(|g| g.parse().ok()),
        transaction,
    })
}

pub struct ProtocolRouteProvider {
    client: Client,
    base_url: String,
}

impl ProtocolRouteProvider {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl QuoteProvider for ProtocolRouteProvider {
    fn name(&self) -> &'static str {
        "protocol_route"
    }

    async fn quote(&self, request: &QuoteRequest) -> Result<Quote> {
        let response: RouteResponse = self
            .client
            .get(format!("{}/quote", self.base_url))
            .query(&[
                ("chainId", request.chain_id.to_string()),
                ("tokenIn", request.token_in.to_string()),
                ("tokenOut", request.token_out.to_string()),
                ("amountIn", request.amount_in.to_string()),
                ("slippage", slippage_bps(request.slippage_percent).to_string()),
                ("signer", request.user_address.to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        map_response(request, response)
    }
}
