//! Configuration for the custody assistant

pub mod rpc;

use crate::protocols::ProtocolKind;
use crate::{Error, Result};
use alloy::primitives::Address;
use serde::{Deserialize, Serialize};
use std::path::Path;

// Re-export RPC config
pub use rpc::RpcConfig;

/// Master secret for the encrypted key store
pub const KEYSTORE_MASTER_KEY_ENV: &str = "KEYSTORE_MASTER_KEY";

/// Overrides `Config::database_url`
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";

/// Supported blockchain networks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Ethereum,
    Arbitrum,
    Optimism,
    Base,
}

impl Network {
    pub fn chain_id(&self) -> u64 {
        match self {
            Network::Ethereum => 1,
            Network::Arbitrum => 42161,
            Network::Optimism => 10,
            Network::Base => 8453,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Network::Ethereum => "ethereum",
            Network::Arbitrum => "arbitrum",
            Network::Optimism => "optimism",
            Network::Base => "base",
        }
    }
}

/// Safety thresholds. These are empirical policy constants, not derived values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyPolicy {
    /// Maximum USD the key may leave behind before export is blocked
    pub export_tolerance_usd: f64,
    /// Token amount below which a balance counts as closed
    pub dust_threshold: f64,
    /// USD drift tolerated before a position record is rewritten
    pub reconcile_tolerance_usd: f64,
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self {
            export_tolerance_usd: 0.01,
            dust_threshold: 0.000_001,
            reconcile_tolerance_usd: 0.01,
        }
    }
}

/// Price source settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    /// How long a fetched price is served from cache
    pub cache_ttl_secs: u64,
    /// Per-request timeout for price sources
    pub timeout_secs: u64,
    /// Generic market-data API (token price by contract)
    pub market_data_url: String,
    /// Secondary DEX pair aggregator API
    pub pair_aggregator_url: String,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 300,
            timeout_secs: 10,
            market_data_url: "https://api.coingecko.com/api/v3".to_string(),
            pair_aggregator_url: "https://api.dexscreener.com".to_string(),
        }
    }
}

/// Swap quote settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteConfig {
    /// Requests allowed per provider per window
    pub max_requests_per_window: u32,
    /// Rate limit window length
    pub window_secs: u64,
    /// Minimum user slippage (percent)
    pub min_slippage_percent: f64,
    /// Maximum user slippage (percent)
    pub max_slippage_percent: f64,
    /// Quotes with a larger price impact are rejected
    pub max_price_impact_percent: f64,
    /// Generic multi-source aggregator API
    pub aggregator_url: String,
    /// Protocol-specific quoting API for special-routed tokens
    pub protocol_route_url: String,
    /// Tokens that only the protocol route can price
    #[serde(default)]
    pub protocol_routed_tokens: Vec<Address>,
    /// Per-request timeout for quote providers
    pub timeout_secs: u64,
}

impl Default for QuoteConfig {
    fn default() -> Self {
        Self {
            max_requests_per_window: 60,
            window_secs: 60,
            min_slippage_percent: 0.1,
            max_slippage_percent: 5.0,
            max_price_impact_percent: 10.0,
            aggregator_url: "https://api.odos.xyz".to_string(),
            protocol_route_url: "https://api.protocol-route.example/v1".to_string(),
            protocol_routed_tokens: Vec::new(),
            timeout_secs: 10,
        }
    }
}

/// Transaction execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Smallest deposit/withdraw accepted (USD)
    pub min_amount_usd: f64,
    /// Pause between consecutive RPC reads when iterating protocols
    pub inter_call_delay_ms: u64,
    /// Gasless relay endpoint for delegated wallets
    pub relay_url: String,
    /// How long a top-up prompt keeps the deposit monitor active
    pub deposit_watch_minutes: i64,
    /// Per-request timeout for RPC and relay calls
    pub timeout_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            min_amount_usd: 0.01,
            inter_call_delay_ms: 150,
            relay_url: "https://relay.example/v1/bundles".to_string(),
            deposit_watch_minutes: 30,
            timeout_secs: 10,
        }
    }
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Network the wallets live on
    pub network: Network,
    /// Protocols included in balance aggregation
    pub protocols: Vec<ProtocolKind>,
    /// Safety thresholds
    #[serde(default)]
    pub policy: SafetyPolicy,
    /// Price source settings
    #[serde(default)]
    pub pricing: PricingConfig,
    /// Quote settings
    #[serde(default)]
    pub quotes: QuoteConfig,
    /// Execution settings
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// SQLite connection string
    pub database_url: String,
    /// Path to audit log file
    pub audit_log_path: Option<String>,
}

impl Config {
    /// Load a JSON config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::Config(e.to_string()))?;
        let mut config: Config =
            serde_json::from_str(&content).map_err(|e| Error::Config(e.to_string()))?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(DATABASE_URL_ENV) {
            tracing::debug!("Using DATABASE_URL for persistence");
            self.database_url = url;
        }
    }

    /// Reject settings that would weaken the safety gate
    pub fn validate(&self) -> Result<()> {
        if self.policy.export_tolerance_usd < 0.0 {
            return Err(Error::Config(
                "policy.export_tolerance_usd must not be negative".to_string(),
            ));
        }
        if self.policy.dust_threshold < 0.0 {
            return Err(Error::Config(
                "policy.dust_threshold must not be negative".to_string(),
            ));
        }
        if self.quotes.min_slippage_percent > self.quotes.max_slippage_percent {
            return Err(Error::Config(format!(
                "quotes.min_slippage_percent ({}) exceeds max_slippage_percent ({})",
                self.quotes.min_slippage_percent, self.quotes.max_slippage_percent
            )));
        }
        if self.quotes.max_requests_per_window == 0 {
            return Err(Error::Config(
                "quotes.max_requests_per_window must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: Network::Base,
            protocols: ProtocolKind::ALL.to_vec(),
            policy: SafetyPolicy::default(),
            pricing: PricingConfig::default(),
            quotes: QuoteConfig::default(),
            execution: ExecutionConfig::default(),
            database_url: "sqlite://custody.db?mode=rwc".to_string(),
            audit_log_path: Some("audit.jsonl".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_deserialize_defaults_sections() {
        let value = serde_json::json!({
            "network": "base",
            "protocols": ["aave", "morpho"],
            "database_url": "sqlite::memory:",
            "audit_log_path": null
        });
        let parsed: Config = serde_json::from_value(value).expect("parse config");
        assert_eq!(parsed.network, Network::Base);
        assert_eq!(parsed.protocols, vec![ProtocolKind::Aave, ProtocolKind::Morpho]);
        assert!((parsed.policy.export_tolerance_usd - 0.01).abs() < f64::EPSILON);
        assert_eq!(parsed.quotes.window_secs, 60);
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn config_rejects_inverted_slippage_bounds() {
        let mut config = Config::default();
        config.quotes.min_slippage_percent = 10.0;
        config.quotes.max_slippage_percent = 1.0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn default_config_covers_all_protocols() {
        let config = Config::default();
        assert_eq!(config.protocols.len(), 7);
        assert_eq!(config.network.chain_id(), 8453);
    }
}
