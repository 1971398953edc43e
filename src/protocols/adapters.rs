//! Adapter families shared by the supported protocols

use super::{PreparedCall, ProtocolAdapter, ProtocolKind, UnderlyingBalance};
use crate::chain::{call_uint, ChainReader};
use crate::Result;
use alloy::primitives::{Address, U256};
use alloy::sol;
use alloy::sol_types::SolCall;
use async_trait::async_trait;

/// Scale of cToken exchange rate mantissas
const EXCHANGE_RATE_SCALE: u64 = 1_000_000_000_000_000_000;

sol! {
    interface IERC20 {
        function approve(address spender, uint256 amount) external returns (bool);
        function transfer(address to, uint256 amount) external returns (bool);
    }

    interface IAavePool {
        function supply(address asset, uint256 amount, address onBehalfOf, uint16 referralCode) external;
        function withdraw(address asset, uint256 amount, address to) external returns (uint256);
    }

    interface IComet {
        function supply(address asset, uint256 amount) external;
        function withdraw(address asset, uint256 amount) external;
    }

    interface IERC4626 {
        function deposit(uint256 assets, address receiver) external returns (uint256 shares);
        function withdraw(uint256 assets, address receiver, address owner) external returns (uint256 shares);
        function convertToAssets(uint256 shares) external view returns (uint256 assets);
    }

    interface IMToken {
        function mint(uint256 mintAmount) external returns (uint256);
        function redeemUnderlying(uint256 redeemAmount) external returns (uint256);
        function exchangeRateStored() external view returns (uint256);
    }
}

/// ERC20 approval call
pub(crate) fn approve(token: Address, spender: Address, amount: U256) -> PreparedCall {
    PreparedCall::new(token, IERC20::approveCall { spender, amount }.abi_encode())
}

/// ERC20 transfer call
pub(crate) fn transfer(token: Address, to: Address, amount: U256) -> PreparedCall {
    PreparedCall::new(token, IERC20::transferCall { to, amount }.abi_encode())
}

/// Aave v3 style pool with a separate aToken receipt
pub struct AaveV3Market {
    kind: ProtocolKind,
    pool: Address,
    a_token: Address,
    asset: Address,
}

impl AaveV3Market {
    pub fn new(kind: ProtocolKind, pool: Address, a_token: Address, asset: Address) -> Self {
        Self {
            kind,
            pool,
            a_token,
            asset,
        }
    }
}

impl ProtocolAdapter for AaveV3Market {
    fn kind(&self) -> ProtocolKind {
        self.kind
    }

    fn receipt_token(&self) -> Address {
        self.a_token
    }

    fn underlying(&self) -> Address {
        self.asset
    }

    fn build_deposit(&self, owner: Address, amount: U256) -> Vec<PreparedCall> {
        vec![
            approve(self.asset, self.pool, amount),
            PreparedCall::new(
                self.pool,
                IAavePool::supplyCall {
                    asset: self.asset,
                    amount,
                    onBehalfOf: owner,
                    referralCode: 0,
                }
                .abi_encode(),
            ),
        ]
    }

    fn build_withdraw(&self, owner: Address, amount: U256) -> Vec<PreparedCall> {
        vec![PreparedCall::new(
            self.pool,
            IAavePool::withdrawCall {
                asset: self.asset,
                amount,
                to: owner,
            }
            .abi_encode(),
        )]
    }
}

/// Compound v3 (Comet): the market contract is also the receipt token
pub struct CometMarket {
    kind: ProtocolKind,
    comet: Address,
    asset: Address,
}

impl CometMarket {
    pub fn new(kind: ProtocolKind, comet: Address, asset: Address) -> Self {
        Self { kind, comet, asset }
    }
}

impl ProtocolAdapter for CometMarket {
    fn kind(&self) -> ProtocolKind {
        self.kind
    }

    fn receipt_token(&self) -> Address {
        self.comet
    }

    fn underlying(&self) -> Address {
        self.asset
    }

    fn build_deposit(&self, _owner: Address, amount: U256) -> Vec<PreparedCall> {
        vec![
            approve(self.asset, self.comet, amount),
            PreparedCall::new(
                self.comet,
                IComet::supplyCall {
                    asset: self.asset,
                    amount,
                }
                .abi_encode(),
            ),
        ]
    }

    fn build_withdraw(&self, _owner: Address, amount: U256) -> Vec<PreparedCall> {
        vec![PreparedCall::new(
            self.comet,
            IComet::withdrawCall {
                asset: self.asset,
                amount,
            }
            .abi_encode(),
        )]
    }
}

/// ERC4626 vault (Morpho, Spark, Seamless, Fluid); shares are the receipt
pub struct Erc4626Vault {
    kind: ProtocolKind,
    vault: Address,
    asset: Address,
}

impl Erc4626Vault {
    pub fn new(kind: ProtocolKind, vault: Address, asset: Address) -> Self {
        Self { kind, vault, asset }
    }
}

#[async_trait]
impl ProtocolAdapter for Erc4626Vault {
    fn kind(&self) -> ProtocolKind {
        self.kind
    }

    fn receipt_token(&self) -> Address {
        self.vault
    }

    fn underlying(&self) -> Address {
        self.asset
    }

    /// Shares stay flat as the vault earns; `convertToAssets` prices them
    async fn get_balance(&self, reader: &dyn ChainReader, owner: Address) -> Result<UnderlyingBalance> {
        let shares = reader.erc20_balance(self.vault, owner).await?;
        let decimals = reader.erc20_decimals(self.asset).await?;
        if shares.is_zero() {
            return Ok(UnderlyingBalance { raw: U256::ZERO, decimals });
        }

        let raw = call_uint(
            reader,
            self.vault,
            IERC4626::convertToAssetsCall { shares }.abi_encode(),
            "convertToAssets",
        )
        .await?;
        Ok(UnderlyingBalance { raw, decimals })
    }

    fn build_deposit(&self, owner: Address, amount: U256) -> Vec<PreparedCall> {
        vec![
            approve(self.asset, self.vault, amount),
            PreparedCall::new(
                self.vault,
                IERC4626::depositCall {
                    assets: amount,
                    receiver: owner,
                }
                .abi_encode(),
            ),
        ]
    }

    fn build_withdraw(&self, owner: Address, amount: U256) -> Vec<PreparedCall> {
        vec![PreparedCall::new(
            self.vault,
            IERC4626::withdrawCall {
                assets: amount,
                receiver: owner,
                owner,
            }
            .abi_encode(),
        )]
    }
}

/// Compound v2 style cToken market (Moonwell)
pub struct CTokenMarket {
    kind: ProtocolKind,
    m_token: Address,
    asset: Address,
}

impl CTokenMarket {
    pub fn new(kind: ProtocolKind, m_token: Address, asset: Address) -> Self {
        Self {
            kind,
            m_token,
            asset,
        }
    }
}

#[async_trait]
impl ProtocolAdapter for CTokenMarket {
    fn kind(&self) -> ProtocolKind {
        self.kind
    }

    fn receipt_token(&self) -> Address {
        self.m_token
    }

    fn underlying(&self) -> Address {
        self.asset
    }

    /// `balanceOf × exchangeRateStored / 1e18`, in underlying units
    async fn get_balance(&self, reader: &dyn ChainReader, owner: Address) -> Result<UnderlyingBalance> {
        let tokens = reader.erc20_balance(self.m_token, owner).await?;
        let decimals = reader.erc20_decimals(self.asset).await?;
        if tokens.is_zero() {
            return Ok(UnderlyingBalance { raw: U256::ZERO, decimals });
        }

        let rate = call_uint(
            reader,
            self.m_token,
            IMToken::exchangeRateStoredCall {}.abi_encode(),
            "exchangeRateStored",
        )
        .await?;
        let raw = tokens.saturating_mul(rate) / U256::from(EXCHANGE_RATE_SCALE);
        Ok(UnderlyingBalance { raw, decimals })
    }

    fn build_deposit(&self, _owner: Address, amount: U256) -> Vec<PreparedCall> {
        vec![
            approve(self.asset, self.m_token, amount),
            PreparedCall::new(
                self.m_token,
                IMToken::mintCall { mintAmount: amount }.abi_encode(),
            ),
        ]
    }

    fn build_withdraw(&self, _owner: Address, amount: U256) -> Vec<PreparedCall> {
        vec![PreparedCall::new(
            self.m_token,
            IMToken::redeemUnderlyingCall {
                redeemAmount: amount,
            }
            .abi_encode(),
        )]
    }
}
