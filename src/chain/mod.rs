//! Read-only chain access
//!
//! Queries native and ERC20 balances and arbitrary view functions with
//! `eth_call`. This module never signs anything; submission lives in
//! `executor::submit`.

pub mod units;

use crate::{Error, Result};
use alloy::primitives::{Address, Bytes, U256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

pub use units::{f64_to_units, format_units, parse_units, units_to_f64};

/// ERC20 `balanceOf(address)` selector
const BALANCE_OF_SELECTOR: [u8; 4] = [0x70, 0xa0, 0x82, 0x31];
/// ERC20 `decimals()` selector
const DECIMALS_SELECTOR: [u8; 4] = [0x31, 0x3c, 0xe5, 0x67];

/// Read-only view of token balances on one chain
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// `balanceOf(owner)` on an ERC20 (or receipt token) contract
    async fn erc20_balance(&self, token: Address, owner: Address) -> Result<U256>;

    /// `decimals()` on an ERC20 contract
    async fn erc20_decimals(&self, token: Address) -> Result<u8>;

    /// Native asset balance
    async fn native_balance(&self, owner: Address) -> Result<U256>;

    /// Read-only `eth_call` returning the raw ABI-encoded result
    async fn call(&self, to: Address, calldata: Vec<u8>) -> Result<Bytes>;
}

/// Call a view function that returns a single uint256
pub async fn call_uint(
    reader: &dyn ChainReader,
    to: Address,
    calldata: Vec<u8>,
    what: &str,
) -> Result<U256> {
    let result = reader.call(to, calldata).await?;
    decode_word(&result)
        .ok_or_else(|| Error::Chain(format!("{} on {} returned {} bytes", what, to, result.len())))
}

/// Run an external call under a deadline, mapping expiry to `Error::Timeout`
pub async fn with_timeout<T, F>(limit: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(format!(
            "{} did not complete within {} ms",
            what,
            limit.as_millis()
        ))),
    }
}

/// `ChainReader` backed by a JSON-RPC endpoint
pub struct RpcChainReader {
    rpc_url: url::Url,
    timeout: Duration,
}

impl RpcChainReader {
    pub fn new(rpc_url: url::Url, timeout: Duration) -> Self {
        Self { rpc_url, timeout }
    }
}

#[async_trait]
impl ChainReader for RpcChainReader {
    async fn erc20_balance(&self, token: Address, owner: Address) -> Result<U256> {
        let mut calldata = BALANCE_OF_SELECTOR.to_vec();
        calldata.extend_from_slice(&[0u8; 12]);
        calldata.extend_from_slice(owner.as_slice());

        call_uint(self, token, calldata, "balanceOf").await
    }

    async fn erc20_decimals(&self, token: Address) -> Result<u8> {
        let result = self.call(token, DECIMALS_SELECTOR.to_vec()).await?;
        decode_u8(&result)
            .ok_or_else(|| Error::Chain(format!("decimals on {} returned malformed data", token)))
    }

    async fn native_balance(&self, owner: Address) -> Result<U256> {
        let provider = ProviderBuilder::new().connect_http(self.rpc_url.clone());
        with_timeout(self.timeout, "eth_getBalance", async move {
            provider
                .get_balance(owner)
                .await
                .map_err(|e| Error::Chain(format!("eth_getBalance failed: {}", e)))
        })
        .await
    }

    async fn call(&self, to: Address, calldata: Vec<u8>) -> Result<Bytes> {
        let provider = ProviderBuilder::new().connect_http(self.rpc_url.clone());
        let tx = TransactionRequest::default()
            .to(to)
            .input(Bytes::from(calldata).into());

        with_timeout(self.timeout, "eth_call", async move {
            provider
                .call(tx)
                .await
                .map_err(|e| Error::Chain(format!("eth_call to {} failed: {}", to, e)))
        })
        .await
    }
}

/// First ABI word as U256
fn decode_word(data: &[u8]) -> Option<U256> {
    if data.len() < 32 {
        return None;
    }
    Some(U256::from_be_slice(&data[..32]))
}

/// ABI-encoded uint8: 31 zero bytes then the value
fn decode_u8(data: &[u8]) -> Option<u8> {
    if data.len() < 32 || data[..31].iter().any(|b| *b != 0) {
        return None;
    }
    Some(data[31])
}
