//! Live balance aggregation across the wallet and every configured protocol
//!
//! `get_all_balances` is the display path: it never fails, and a protocol
//! whose read errors is reported as a zero balance. The `try_*` methods
//! propagate read errors for callers that must not mistake a failed read for
//! an empty balance (reconciliation and the export gate).

use crate::chain::{units_to_f64, ChainReader};
use crate::config::SafetyPolicy;
use crate::pricing::PriceOracleCache;
use crate::protocols::ProtocolKind;
use crate::tokens::{addresses, registry};
use crate::Result;
use alloy::primitives::{Address, U256};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Where a balance is held
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "protocol")]
pub enum BalanceSource {
    /// Directly in the wallet
    Liquid,
    /// Deposited in a protocol, held as its receipt token
    Protocol(ProtocolKind),
}

impl fmt::Display for BalanceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BalanceSource::Liquid => f.write_str("wallet"),
            BalanceSource::Protocol(kind) => write!(f, "{}", kind),
        }
    }
}

/// One freshly read balance; never persisted
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProtocolBalance {
    pub source: BalanceSource,
    /// Token whose balance was read (receipt token for protocols)
    pub token: Address,
    /// Symbol of the asset the balance is worth
    pub token_symbol: String,
    /// Raw units of the underlying asset, shares already converted
    pub raw_units: U256,
    pub decimals: u8,
    pub amount: f64,
    pub value_usd: f64,
}

impl ProtocolBalance {
    fn empty(source: BalanceSource, token: Address, token_symbol: &str, decimals: u8) -> Self {
        Self {
            source,
            token,
            token_symbol: token_symbol.to_string(),
            raw_units: U256::ZERO,
            decimals,
            amount: 0.0,
            value_usd: 0.0,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.raw_units.is_zero()
    }

    pub fn protocol(&self) -> Option<ProtocolKind> {
        match self.source {
            BalanceSource::Protocol(kind) => Some(kind),
            BalanceSource::Liquid => None,
        }
    }
}

/// Sum of `value_usd`
pub fn total_value_usd(balances: &[ProtocolBalance]) -> f64 {
    balances.iter().map(|b| b.value_usd).sum()
}

pub struct BalanceAggregator {
    reader: Arc<dyn ChainReader>,
    prices: Arc<PriceOracleCache>,
    protocols: Vec<ProtocolKind>,
    liquid_tokens: Vec<Address>,
    dust_threshold: f64,
    inter_call_delay: Duration,
}

impl BalanceAggregator {
    pub fn new(
        reader: Arc<dyn ChainReader>,
        prices: Arc<PriceOracleCache>,
        protocols: Vec<ProtocolKind>,
        policy: &SafetyPolicy,
        inter_call_delay: Duration,
    ) -> Self {
        Self {
            reader,
            prices,
            protocols,
            liquid_tokens: vec![addresses::USDC, addresses::NATIVE_ETH],
            dust_threshold: policy.dust_threshold,
            inter_call_delay,
        }
    }

    pub fn prices(&self) -> &PriceOracleCache {
        &self.prices
    }

    pub fn protocols(&self) -> &[ProtocolKind] {
        &self.protocols
    }

    pub fn dust_threshold(&self) -> f64 {
        self.dust_threshold
    }

    /// Pause between consecutive reads to stay under provider rate limits
    pub async fn throttle(&self) {
        if !self.inter_call_delay.is_zero() {
            tokio::time::sleep(self.inter_call_delay).await;
        }
    }

    /// Liquid balances followed by one entry per configured protocol
    pub async fn get_all_balances(&self, owner: Address) -> Vec<ProtocolBalance> {
        let mut balances = Vec::with_capacity(self.liquid_tokens.len() + self.protocols.len());

        for &token in &self.liquid_tokens {
            match self.read_liquid(owner, token).await {
                Ok(balance) => balances.push(balance),
                Err(e) => {
                    tracing::warn!(owner = %owner, token = %token, error = %e, "Liquid balance read failed, reporting zero");
                    balances.push(self.empty_liquid(token));
                }
            }
        }

        for (i, &protocol) in self.protocols.iter().enumerate() {
            if i > 0 {
                self.throttle().await;
            }
            match self.read_protocol(owner, protocol).await {
                Ok(balance) => balances.push(balance),
                Err(e) => {
                    tracing::warn!(
                        owner = %owner,
                        protocol = %protocol,
                        error = %e,
                        "Protocol balance read failed, reporting zero"
                    );
                    balances.push(self.empty_protocol(protocol));
                }
            }
        }

        tracing::debug!(
            owner = %owner,
            total_usd = total_value_usd(&balances),
            "Aggregated balances"
        );
        balances
    }

    /// Non-dust balance in one protocol; `None` when empty or unreadable
    pub async fn get_protocol_balance(
        &self,
        owner: Address,
        protocol: ProtocolKind,
    ) -> Option<ProtocolBalance> {
        match self.read_protocol(owner, protocol).await {
            Ok(balance) if !balance.is_zero() => Some(balance),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(owner = %owner, protocol = %protocol, error = %e, "Protocol balance read failed");
                None
            }
        }
    }

    /// Like `get_protocol_balance` but read failures are returned
    pub async fn try_protocol_balance(
        &self,
        owner: Address,
        protocol: ProtocolKind,
    ) -> Result<ProtocolBalance> {
        self.read_protocol(owner, protocol).await
    }

    /// Liquid balances; the first failed read aborts
    pub async fn try_liquid_balances(&self, owner: Address) -> Result<Vec<ProtocolBalance>> {
        let mut balances = Vec::with_capacity(self.liquid_tokens.len());
        for &token in &self.liquid_tokens {
            balances.push(self.read_liquid(owner, token).await?);
        }
        Ok(balances)
    }

    /// One liquid token balance, read failures returned
    pub async fn try_liquid_balance(&self, owner: Address, token: Address) -> Result<ProtocolBalance> {
        self.read_liquid(owner, token).await
    }

    /// USD price for one unit of the given token
    pub async fn price_of(&self, token: Address) -> f64 {
        self.prices.get_price(token, registry().symbol(&token)).await.price
    }

    async fn read_protocol(&self, owner: Address, protocol: ProtocolKind) -> Result<ProtocolBalance> {
        let adapter = protocol.adapter();
        let reading = adapter.get_balance(self.reader.as_ref(), owner).await?;
        let underlying = adapter.underlying();

        Ok(self
            .valued(
                BalanceSource::Protocol(protocol),
                adapter.receipt_token(),
                underlying,
                reading.raw,
                reading.decimals,
            )
            .await)
    }

    async fn read_liquid(&self, owner: Address, token: Address) -> Result<ProtocolBalance> {
        if token == addresses::NATIVE_ETH {
            let raw = self.reader.native_balance(owner).await?;
            return Ok(self
                .valued(BalanceSource::Liquid, token, addresses::WETH, raw, 18)
                .await);
        }

        let raw = self.reader.erc20_balance(token, owner).await?;
        let decimals = self.reader.erc20_decimals(token).await?;
        Ok(self
            .valued(BalanceSource::Liquid, token, token, raw, decimals)
            .await)
    }

    async fn valued(
        &self,
        source: BalanceSource,
        token: Address,
        price_token: Address,
        raw: U256,
        decimals: u8,
    ) -> ProtocolBalance {
        let symbol = registry().symbol(&price_token);
        let amount = units_to_f64(raw, decimals);
        if raw.is_zero() || amount < self.dust_threshold {
            return ProtocolBalance::empty(source, token, symbol, decimals);
        }

        let price = self.prices.get_price(price_token, symbol).await.price;
        ProtocolBalance {
            source,
            token,
            token_symbol: symbol.to_string(),
            raw_units: raw,
            decimals,
            amount,
            value_usd: amount * price,
        }
    }

    fn empty_liquid(&self, token: Address) -> ProtocolBalance {
        if token == addresses::NATIVE_ETH {
            ProtocolBalance::empty(BalanceSource::Liquid, token, registry().symbol(&addresses::WETH), 18)
        } else {
            let decimals = registry().get(&token).map(|t| t.decimals).unwrap_or(18);
            ProtocolBalance::empty(BalanceSource::Liquid, token, registry().symbol(&token), decimals)
        }
    }

    fn empty_protocol(&self, protocol: ProtocolKind) -> ProtocolBalance {
        let adapter = protocol.adapter();
        let underlying = adapter.underlying();
        let decimals = registry().get(&underlying).map(|t| t.decimals).unwrap_or(18);
        ProtocolBalance::empty(
            BalanceSource::Protocol(protocol),
            adapter.receipt_token(),
            registry().symbol(&underlying),
            decimals,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeChain, ScriptedPriceSource};
    use crate::Error;
    use alloy::primitives::address;

    const OWNER: Address = address!("2222222222222222222222222222222222222222");

    fn aggregator(chain: Arc<FakeChain>) -> BalanceAggregator {
        let eth = Arc::new(ScriptedPriceSource::fixed("market_data", 3000.0));
        let prices = Arc::new(PriceOracleCache::new(vec![eth], Duration::from_secs(60)));
        BalanceAggregator::new(
            chain,
            prices,
            ProtocolKind::ALL.to_vec(),
            &SafetyPolicy::default(),
            Duration::ZERO,
        )
    }

    fn receipt(protocol: ProtocolKind) -> Address {
        protocol.adapter().receipt_token()
    }

    #[tokio::test]
    async fn test_all_reads_failing_yields_zero_entries() {
        let chain = Arc::new(FakeChain::new());
        chain.fail_all(true);
        let balances = aggregator(chain).get_all_balances(OWNER).await;

        assert_eq!(balances.len(), 2 + ProtocolKind::ALL.len());
        assert!(balances.iter().all(|b| b.is_zero() && b.value_usd == 0.0));
    }

    #[tokio::test]
    async fn test_one_failing_protocol_does_not_hide_others() {
        let chain = Arc::new(FakeChain::new());
        chain.set_units(receipt(ProtocolKind::Aave), OWNER, 30.0);
        chain.set_units(receipt(ProtocolKind::Morpho), OWNER, 12.5);
        chain.fail_token(receipt(ProtocolKind::Compound));

        let agg = aggregator(chain);
        let balances = agg.get_all_balances(OWNER).await;
        let value = |kind| {
            balances
                .iter()
                .find(|b| b.source == BalanceSource::Protocol(kind))
                .map(|b| b.value_usd)
                .unwrap()
        };

        assert_eq!(value(ProtocolKind::Aave), 30.0);
        assert_eq!(value(ProtocolKind::Morpho), 12.5);
        assert_eq!(value(ProtocolKind::Compound), 0.0);
        assert!((total_value_usd(&balances) - 42.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_rebasing_receipt_decimals_come_from_chain() {
        let chain = Arc::new(FakeChain::new());
        let token = receipt(ProtocolKind::Aave);
        chain.set_decimals(token, 18);
        chain.set_balance(token, OWNER, U256::from(2_500_000_000_000_000_000u128));

        let balance = aggregator(chain)
            .get_protocol_balance(OWNER, ProtocolKind::Aave)
            .await
            .unwrap();
        assert_eq!(balance.decimals, 18);
        assert!((balance.amount - 2.5).abs() < 1e-12);
        assert_eq!(balance.token_symbol, "USDC");
    }

    #[tokio::test]
    async fn test_vault_shares_reported_in_underlying_units() {
        let chain = Arc::new(FakeChain::new());
        let vault = receipt(ProtocolKind::Spark);
        // 18-decimal shares over 6-decimal USDC, 1.02 USDC per share
        chain.set_decimals(vault, 18);
        chain.set_balance(vault, OWNER, U256::from(2_500_000_000_000_000_000u128));
        chain.set_exchange_rate(vault, U256::from(1_020_000u64));

        let balance = aggregator(chain)
            .get_protocol_balance(OWNER, ProtocolKind::Spark)
            .await
            .unwrap();
        assert_eq!(balance.decimals, 6);
        assert_eq!(balance.raw_units, U256::from(2_550_000u64));
        assert!((balance.value_usd - 2.55).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_ctoken_valued_through_exchange_rate() {
        let chain = Arc::new(FakeChain::new());
        let m_token = receipt(ProtocolKind::Moonwell);
        // 500 mUSDC (8 decimals) at 0.022 USDC each
        chain.set_decimals(m_token, 8);
        chain.set_balance(m_token, OWNER, U256::from(50_000_000_000u64));
        chain.set_exchange_rate(m_token, U256::from(220_000_000_000_000u64));

        let balance = aggregator(chain)
            .try_protocol_balance(OWNER, ProtocolKind::Moonwell)
            .await
            .unwrap();
        assert_eq!(balance.decimals, 6);
        assert!((balance.amount - 11.0).abs() < 1e-9);
        assert!((balance.value_usd - 11.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_vault_value_grows_while_shares_stay_flat() {
        let chain = Arc::new(FakeChain::new());
        let vault = receipt(ProtocolKind::Morpho);
        chain.set_units(vault, OWNER, 100.0);
        let agg = aggregator(chain.clone());

        let before = agg.try_protocol_balance(OWNER, ProtocolKind::Morpho).await.unwrap();
        chain.set_share_price(vault, 1.03);
        let after = agg.try_protocol_balance(OWNER, ProtocolKind::Morpho).await.unwrap();

        assert!((before.value_usd - 100.0).abs() < 1e-9);
        assert!((after.value_usd - 103.0).abs() < 1e-9);
        assert_eq!(chain.balance(vault, OWNER), U256::from(100_000_000u64));
    }

    #[tokio::test]
    async fn test_dust_counts_as_absent() {
        let chain = Arc::new(FakeChain::new());
        let token = receipt(ProtocolKind::Fluid);
        chain.set_decimals(token, 18);
        chain.set_exchange_rate(token, U256::from(1_000_000u64));
        // 1e-9 shares convert to less than one raw USDC unit
        chain.set_balance(token, OWNER, U256::from(1_000_000_000u64));

        let agg = aggregator(chain);
        assert!(agg.get_protocol_balance(OWNER, ProtocolKind::Fluid).await.is_none());
        let balance = agg.try_protocol_balance(OWNER, ProtocolKind::Fluid).await.unwrap();
        assert!(balance.is_zero());
    }

    #[tokio::test]
    async fn test_try_variants_propagate_failures() {
        let chain = Arc::new(FakeChain::new());
        chain.fail_token(receipt(ProtocolKind::Moonwell));
        chain.fail_token(addresses::USDC);

        let agg = aggregator(chain);
        assert!(agg.get_protocol_balance(OWNER, ProtocolKind::Moonwell).await.is_none());
        assert!(matches!(
            agg.try_protocol_balance(OWNER, ProtocolKind::Moonwell).await,
            Err(Error::Chain(_))
        ));
        assert!(agg.try_liquid_balances(OWNER).await.is_err());
    }

    #[tokio::test]
    async fn test_native_balance_priced_as_weth() {
        let chain = Arc::new(FakeChain::new());
        chain.set_native(OWNER, U256::from(500_000_000_000_000_000u128));

        let liquid = aggregator(chain).try_liquid_balances(OWNER).await.unwrap();
        let eth = liquid.iter().find(|b| b.token == addresses::NATIVE_ETH).unwrap();
        assert!((eth.value_usd - 1500.0).abs() < 1e-6);
        assert_eq!(eth.token_symbol, "WETH");
    }
}
