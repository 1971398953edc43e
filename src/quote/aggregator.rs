//! Generic multi-source aggregator (Odos-compatible `sor` API)

use super::types::{parse_calldata, parse_raw_amount, ProviderKind, Quote, QuoteRequest, QuoteTransaction};
use super::QuoteProvider;
use crate::{Error, Result};
use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InputToken {
    token_address: Address,
    amount: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OutputToken {
    token_address: Address,
    proportion: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AggregatorQuoteBody {
    chain_id: u64,
    input_tokens: Vec<InputToken>,
    output_tokens: Vec<OutputToken>,
    user_addr: Address,
    slippage_limit_percent: f64,
    compact: bool,
}

impl AggregatorQuoteBody {
    fn from_request(request: &QuoteRequest) -> Self {
        Self {
            chain_id: request.chain_id,
            input_tokens: vec![InputToken {
                token_address: request.token_in,
                amount: request.amount_in.to_string(),
            }],
            output_tokens: vec![OutputToken {
                token_address: request.token_out,
                proportion: 1.0,
            }],
            user_addr: request.user_address,
            slippage_limit_percent: request.slippage_percent,
            compact: true,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AggregatorTransaction {
    to: Address,
    data: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    gas: Option<serde_json::Value>,
    #[serde(default)]
    gas_price: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AggregatorQuoteResponse {
    out_amounts: Vec<String>,
    #[serde(default)]
    price_impact: Option<f64>,
    #[serde(default)]
    gas_estimate: Option<f64>,
    #[serde(default)]
    path_id: Option<String>,
    #[serde(default)]
    transaction: Option<AggregatorTransaction>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AssembleBody<'a> {
    user_addr: Address,
    path_id: &'a str,
    simulate: bool,
}

#[derive(Debug, Deserialize)]
struct AssembleResponse {
    transaction: AggregatorTransaction,
}

/// Numbers that arrive either as JSON numbers or decimal strings
fn loose_u128(value: &serde_json::Value) -> Option<u128> {
    match value {
        serde_json::Value::Number(n) => n.as_u64().map(u128::from).or_else(|| n.as_f64().map(|f| f as u128)),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn map_transaction(tx: AggregatorTransaction) -> Result<QuoteTransaction> {
    let value = match tx.value.as_deref() {
        Some(raw) if !raw.is_empty() => parse_raw_amount("value", raw)?,
        _ => U256::ZERO,
    };
    Ok(QuoteTransaction {
        to: tx.to,
        data: parse_calldata(&tx.data)?,
        value,
        gas: tx.gas.as_ref().and_then(loose_u128).map(|g| g as u64),
        gas_price: tx.gas_price.as_ref().and_then(loose_u128),
    })
}

/// Normalize an aggregator response into the canonical quote
fn map_response(request: &QuoteRequest, response: AggregatorQuoteResponse) -> Result<Quote> {
    let amount_out = match response.out_amounts.first() {
        Some(raw) => parse_raw_amount("outAmounts[0]", raw)?,
        None => U256::ZERO,
    };

    Ok(Quote {
        provider: ProviderKind::Aggregator,
        token_in: request.token_in,
        token_out: request.token_out,
        amount_in: request.amount_in,
        amount_out,
        // The aggregator reports impact as a signed percentage
        price_impact_percent: response.price_impact.map(f64::abs).unwrap_or(0.0),
        gas_estimate: response.gas_estimate.map(|g| g.max(0.0) as u64),
        transaction: response.transaction.map(map_transaction).transpose()?,
    })
}

pub struct AggregatorProvider {
    client: Client,
    base_url: String,
}

impl AggregatorProvider {
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

    async fn assemble(&self, user: Address, path_id: &str) -> Result<QuoteTransaction> {
        let response: AssembleResponse = self
            .client
            .post(format!("{}/sor/assemble", self.base_url))
            .json(&AssembleBody {
                user_addr: user,
                path_id,
                simulate: false,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        map_transaction(response.transaction)
    }
}

#[async_trait]
impl QuoteProvider for AggregatorProvider {
    fn name(&self) -> &'static str {
        "aggregator"
    }

    async fn quote(&self, request: &QuoteRequest) -> Result<Quote> {
        let response = self
            .client
            .post(format!("{}/sor/quote/v2", self.base_url))
            .json(&AggregatorQuoteBody::from_request(request))
            .send()
            .await?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Quote(format!("Aggregator rejected quote ({}): {}", status, body)));
        }
        let body: AggregatorQuoteResponse = response.error_for_status()?.json().await?;

        let path_id = body.path_id.clone();
        let mut quote = map_response(request, body)?;

        // Pricing calls use the zero address and never need calldata
        if quote.transaction.is_none() && !request.user_address.is_zero() && !quote.amount_out.is_zero() {
            if let Some(path_id) = path_id {
                quote.transaction = Some(self.assemble(request.user_address, &path_id).await?);
            }
        }

        tracing::debug!(
            token_in = %request.token_in,
            token_out = %request.token_out,
            amount_out = %quote.amount_out,
            price_impact = quote.price_impact_percent,
            "Aggregator quote"
        );
        Ok(quote)
    }
}
