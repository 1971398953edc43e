//! Shared token registry
//!
//! Single source of truth for token metadata (symbol, decimals, peg) used by
//! pricing, balance aggregation and the quote router.

use alloy::primitives::{address, Address};
use std::collections::HashMap;

/// Token metadata
#[derive(Debug, Clone, Copy)]
pub struct TokenInfo {
    /// Token symbol (e.g., "USDC", "WETH")
    pub symbol: &'static str,
    /// Number of decimals
    pub decimals: u8,
    /// Whether this is a stablecoin (pegged to $1)
    pub is_stablecoin: bool,
    /// Last-resort USD price when every price source fails
    pub fallback_price_usd: Option<f64>,
}

impl TokenInfo {
    pub const fn stablecoin(symbol: &'static str, decimals: u8) -> Self {
        Self {
            symbol,
            decimals,
            is_stablecoin: true,
            fallback_price_usd: Some(1.0),
        }
    }

    pub const fn token(symbol: &'static str, decimals: u8, fallback: Option<f64>) -> Self {
        Self {
            symbol,
            decimals,
            is_stablecoin: false,
            fallback_price_usd: fallback,
        }
    }
}

/// Well-known token addresses on Base
pub mod addresses {
    use super::*;

    pub const USDC: Address = address!("833589fcd6edb6e08f4c7c32d4f71b54bda02913");
    pub const USDBC: Address = address!("d9aaec86b65d86f6a7b5b1b0c42ffa531710b6ca");
    pub const DAI: Address = address!("50c5725949a6f0c72e6c4a641f24049a917db0cb");
    pub const WETH: Address = address!("4200000000000000000000000000000000000006");
    pub const CBETH: Address = address!("2ae3f1ec7f1f5012cfeab0185bfc7aa3cf0dec22");

    /// Placeholder used by aggregators for the chain's native asset
    pub const NATIVE_ETH: Address = address!("eeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee");
    pub const ZERO_ADDRESS: Address = address!("0000000000000000000000000000000000000000");
}

/// Token registry providing token info lookups
pub struct TokenRegistry {
    tokens: HashMap<Address, TokenInfo>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        use addresses::*;

        let mut tokens = HashMap::new();
        tokens.insert(USDC, TokenInfo::stablecoin("USDC", 6));
        tokens.insert(USDBC, TokenInfo::stablecoin("USDbC", 6));
        tokens.insert(DAI, TokenInfo::stablecoin("DAI", 18));
        tokens.insert(WETH, TokenInfo::token("WETH", 18, Some(3000.0)));
        tokens.insert(NATIVE_ETH, TokenInfo::token("ETH", 18, Some(3000.0)));
        tokens.insert(CBETH, TokenInfo::token("cbETH", 18, Some(3200.0)));

        Self { tokens }
    }

    /// Get token info by address
    pub fn get(&self, address: &Address) -> Option<&TokenInfo> {
        self.tokens.get(address)
    }

    /// Check if an address is a known stablecoin
    pub fn is_stablecoin(&self, address: &Address) -> bool {
        self.tokens
            .get(address)
            .map(|t| t.is_stablecoin)
            .unwrap_or(false)
    }

    /// Symbol for display, "UNKNOWN" for unregistered tokens
    pub fn symbol(&self, address: &Address) -> &'static str {
        self.tokens
            .get(address)
            .map(|t| t.symbol)
            .unwrap_or("UNKNOWN")
    }

    /// Documented fallback price; 0.0 when the token has none
    pub fn fallback_price(&self, address: &Address) -> f64 {
        self.tokens
            .get(address)
            .and_then(|t| t.fallback_price_usd)
            .unwrap_or(0.0)
    }
}

impl Default for TokenRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static REGISTRY: std::sync::OnceLock<TokenRegistry> = std::sync::OnceLock::new();

/// Get the global token registry
pub fn registry() -> &'static TokenRegistry {
    REGISTRY.get_or_init(TokenRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usdc_is_stablecoin() {
        let registry = TokenRegistry::new();
        assert!(registry.is_stablecoin(&addresses::USDC));
        assert!(registry.is_stablecoin(&addresses::DAI));
        assert!(!registry.is_stablecoin(&addresses::WETH));
    }

    #[test]
    fn test_fallback_price() {
        let registry = TokenRegistry::new();
        assert_eq!(registry.fallback_price(&addresses::USDC), 1.0);
        assert_eq!(registry.fallback_price(&addresses::ZERO_ADDRESS), 0.0);
        assert!(registry.fallback_price(&addresses::WETH) > 0.0);
    }

    #[test]
    fn test_symbol_lookup() {
        let reg = registry();
        assert_eq!(reg.symbol(&addresses::USDC), "USDC");
        assert_eq!(reg.symbol(&addresses::ZERO_ADDRESS), "UNKNOWN");
        assert_eq!(reg.get(&addresses::USDC).unwrap().decimals, 6);
    }
}
