//! Canonical quote types shared by every provider

use crate::protocols::PreparedCall;
use crate::{Error, Result};
use alloy::primitives::{Address, Bytes, U256};
use serde::{Deserialize, Serialize};

/// Provider-agnostic swap request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteRequest {
    pub chain_id: u64,
    pub token_in: Address,
    pub token_out: Address,
    /// Raw input amount in `token_in` units
    pub amount_in: U256,
    /// Wallet that will execute the swap
    pub user_address: Address,
    pub slippage_percent: f64,
}

/// Which adapter produced a quote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Generic multi-source aggregator
    Aggregator,
    /// Protocol-specific route for special-routed tokens
    ProtocolRoute,
}

/// Executable swap payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteTransaction {
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
    pub gas: Option<u64>,
    pub gas_price: Option<u128>,
}

/// The one quote shape the rest of the system depends on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub provider: ProviderKind,
    pub token_in: Address,
    pub token_out: Address,
    pub amount_in: U256,
    pub amount_out: U256,
    /// Percent, e.g. 0.35 for 0.35%
    pub price_impact_percent: f64,
    pub gas_estimate: Option<u64>,
    pub transaction: Option<QuoteTransaction>,
}

impl Quote {
    /// Swap call for submission; quotes fetched for pricing carry none
    pub fn to_prepared_call(&self) -> Result<PreparedCall> {
        let tx = self.transaction.as_ref().ok_or_else(|| {
            Error::Quote("Quote has no transaction payload to execute".to_string())
        })?;
        Ok(PreparedCall {
            to: tx.to,
            data: tx.data.clone(),
            value: tx.value,
        })
    }

    /// Output after the worst-case slippage the user accepted
    pub fn min_amount_out(&self, slippage_percent: f64) -> U256 {
        let bps = (slippage_percent.clamp(0.0, 100.0) * 100.0).round() as u64;
        self.amount_out * U256::from(10_000 - bps) / U256::from(10_000u64)
    }
}

/// Parse a decimal integer string the way providers send raw amounts
pub(crate) fn parse_raw_amount(field: &str, raw: &str) -> Result<U256> {
    raw.trim()
        .parse::<U256>()
        .map_err(|e| Error::Quote(format!("Provider sent invalid {} '{}': {}", field, raw, e)))
}

/// Hex calldata from a provider response
pub(crate) fn parse_calldata(raw: &str) -> Result<Bytes> {
    raw.parse::<Bytes>()
        .map_err(|e| Error::Quote(format!("Provider sent invalid calldata: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quote(amount_out: u64) -> Quote {
        Quote {
            provider: ProviderKind::Aggregator,
            token_in: Address::ZERO,
            token_out: Address::ZERO,
            amount_in: U256::from(1u64),
            amount_out: U256::from(amount_out),
            price_impact_percent: 0.1,
            gas_estimate: None,
            transaction: None,
        }
    }

    #[test]
    fn test_min_amount_out_applies_slippage() {
        assert_eq!(quote(1_000_000).min_amount_out(0.5), U256::from(995_000u64));
        assert_eq!(quote(1_000_000).min_amount_out(0.0), U256::from(1_000_000u64));
    }

    #[test]
    fn test_pricing_quote_is_not_executable() {
        assert!(matches!(quote(1).to_prepared_call(), Err(Error::Quote(_))));
    }

    #[test]
    fn test_parse_raw_amount_rejects_garbage() {
        assert_eq!(parse_raw_amount("amountOut", "42").unwrap(), U256::from(42u64));
        assert!(parse_raw_amount("amountOut", "4.2").is_err());
    }
}
