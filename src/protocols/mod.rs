//! Supported yield protocols
//!
//! Each protocol is a `ProtocolKind` variant with a fixed capability
//! interface (`ProtocolAdapter`): read the user's position in underlying
//! units and build the ordered calls for a deposit or a withdrawal. Adding a protocol
//! means adding a variant and pointing it at an adapter family.

mod adapters;

use crate::chain::ChainReader;
use crate::tokens::addresses;
use crate::{Error, Result};
use alloy::primitives::{address, Address, Bytes, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use adapters::{AaveV3Market, CometMarket, CTokenMarket, Erc4626Vault};
pub(crate) use adapters::{approve, transfer};
#[cfg(test)]
pub(crate) use adapters::{IERC4626, IMToken};

/// A contract call ready to be signed or relayed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedCall {
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
}

impl PreparedCall {
    pub fn new(to: Address, data: Vec<u8>) -> Self {
        Self {
            to,
            data: Bytes::from(data),
            value: U256::ZERO,
        }
    }
}

/// Position size in raw units of the underlying asset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnderlyingBalance {
    pub raw: U256,
    pub decimals: u8,
}

/// Capability interface every protocol implements
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    fn kind(&self) -> ProtocolKind;

    /// Receipt token whose balance represents the position
    fn receipt_token(&self) -> Address;

    /// Asset deposited into the protocol
    fn underlying(&self) -> Address;

    /// Read the owner's position converted to the underlying asset.
    ///
    /// The default suits rebasing receipts (aTokens, Comet), whose balance
    /// already counts underlying units. Share-based receipts override it.
    async fn get_balance(&self, reader: &dyn ChainReader, owner: Address) -> Result<UnderlyingBalance> {
        let token = self.receipt_token();
        let raw = reader.erc20_balance(token, owner).await?;
        let decimals = reader.erc20_decimals(token).await?;
        Ok(UnderlyingBalance { raw, decimals })
    }

    /// Approve + supply `amount` of the underlying on behalf of `owner`
    fn build_deposit(&self, owner: Address, amount: U256) -> Vec<PreparedCall>;

    /// Withdraw `amount` of the underlying back to `owner`
    fn build_withdraw(&self, owner: Address, amount: U256) -> Vec<PreparedCall>;
}

/// The closed set of supported protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    Aave,
    Compound,
    Morpho,
    Spark,
    Seamless,
    Moonwell,
    Fluid,
}

/// Deployment addresses on Base
mod deployments {
    use super::*;

    pub const AAVE_POOL: Address = address!("a238dd80c259a72e81d7e4664a9801593f98d1c5");
    pub const AAVE_AUSDC: Address = address!("4e65fe4dba92790696d040ac24aa414708f5c0ab");
    pub const COMPOUND_CUSDCV3: Address = address!("b125e6687d4313864e53df431d5425969c15eb2f");
    pub const MORPHO_USDC_VAULT: Address = address!("ee8f4ec5672f09119b96ab6fb59c27e1b7e44b61");
    pub const SPARK_USDC_VAULT: Address = address!("7bfa7c4f149e7415b73bdedfe609237e29cbf34a");
    pub const SEAMLESS_USDC_VAULT: Address = address!("616a4e1db48e22028f6bbf20444cd3b8e3273738");
    pub const MOONWELL_MUSDC: Address = address!("edc817a28e8b93b03976fbd4a3ddbc9f7d176c22");
    pub const FLUID_FUSDC: Address = address!("f42f5795d9ac7e9d757db633d693cd548cfd9169");
}

impl ProtocolKind {
    pub const ALL: [ProtocolKind; 7] = [
        ProtocolKind::Aave,
        ProtocolKind::Compound,
        ProtocolKind::Morpho,
        ProtocolKind::Spark,
        ProtocolKind::Seamless,
        ProtocolKind::Moonwell,
        ProtocolKind::Fluid,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ProtocolKind::Aave => "aave",
            ProtocolKind::Compound => "compound",
            ProtocolKind::Morpho => "morpho",
            ProtocolKind::Spark => "spark",
            ProtocolKind::Seamless => "seamless",
            ProtocolKind::Moonwell => "moonwell",
            ProtocolKind::Fluid => "fluid",
        }
    }

    /// Smallest deposit the protocol accepts, in underlying units
    pub fn min_deposit(&self) -> f64 {
        match self {
            // Comet rejects dust supplies
            ProtocolKind::Compound => 1.0,
            _ => 0.01,
        }
    }

    /// Adapter implementing this protocol's capability interface
    pub fn adapter(&self) -> Box<dyn ProtocolAdapter> {
        use deployments::*;

        match self {
            ProtocolKind::Aave => Box::new(AaveV3Market::new(
                ProtocolKind::Aave,
                AAVE_POOL,
                AAVE_AUSDC,
                addresses::USDC,
            )),
            ProtocolKind::Compound => Box::new(CometMarket::new(
                ProtocolKind::Compound,
                COMPOUND_CUSDCV3,
                addresses::USDC,
            )),
            ProtocolKind::Morpho => Box::new(Erc4626Vault::new(
                ProtocolKind::Morpho,
                MORPHO_USDC_VAULT,
                addresses::USDC,
            )),
            ProtocolKind::Spark => Box::new(Erc4626Vault::new(
                ProtocolKind::Spark,
                SPARK_USDC_VAULT,
                addresses::USDC,
            )),
            ProtocolKind::Seamless => Box::new(Erc4626Vault::new(
                ProtocolKind::Seamless,
                SEAMLESS_USDC_VAULT,
                addresses::USDC,
            )),
            ProtocolKind::Moonwell => Box::new(CTokenMarket::new(
                ProtocolKind::Moonwell,
                MOONWELL_MUSDC,
                addresses::USDC,
            )),
            ProtocolKind::Fluid => Box::new(Erc4626Vault::new(
                ProtocolKind::Fluid,
                FLUID_FUSDC,
                addresses::USDC,
            )),
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProtocolKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ProtocolKind::ALL
            .iter()
            .copied()
            .find(|p| p.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::InvalidArgument(format!("Unknown protocol: {}", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_trips_names() {
        for kind in ProtocolKind::ALL {
            assert_eq!(kind.name().parse::<ProtocolKind>().unwrap(), kind);
        }
        assert_eq!("AAVE".parse::<ProtocolKind>().unwrap(), ProtocolKind::Aave);
        assert!("uniswap".parse::<ProtocolKind>().is_err());
    }

    #[test]
    fn test_every_kind_has_matching_adapter() {
        for kind in ProtocolKind::ALL {
            let adapter = kind.adapter();
            assert_eq!(adapter.kind(), kind);
            assert_eq!(adapter.underlying(), addresses::USDC);
        }
    }

    #[test]
    fn test_receipt_tokens_are_distinct() {
        let mut tokens: Vec<Address> = ProtocolKind::ALL
            .iter()
            .map(|k| k.adapter().receipt_token())
            .collect();
        tokens.sort();
        tokens.dedup();
        assert_eq!(tokens.len(), ProtocolKind::ALL.len());
    }
}
