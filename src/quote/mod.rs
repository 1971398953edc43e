//! Swap quotes across two providers under shared rate limits
//!
//! `QuoteRouter::get_quote` runs, in order: the provider's rate-limit window,
//! slippage bounds, provider selection (protocol route for special-routed
//! tokens, aggregator otherwise), then quote validation (zero output and
//! price impact). Both providers return the canonical `Quote`.

mod aggregator;
mod protocol_route;
mod rate_limit;
mod types;

pub use aggregator::AggregatorProvider;
pub use protocol_route::ProtocolRouteProvider;
pub use rate_limit::RateLimiter;
pub use types::{ProviderKind, Quote, QuoteRequest, QuoteTransaction};

use crate::config::QuoteConfig;
use crate::{Error, Result};
use alloy::primitives::Address;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// One external quoting backend
#[async_trait]
pub trait QuoteProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn quote(&self, request: &QuoteRequest) -> Result<Quote>;
}

struct LimitedProvider {
    provider: Arc<dyn QuoteProvider>,
    limiter: RateLimiter,
}

impl LimitedProvider {
    fn new(provider: Arc<dyn QuoteProvider>, config: &QuoteConfig) -> Self {
        Self {
            provider,
            limiter: RateLimiter::new(
                config.max_requests_per_window,
                Duration::from_secs(config.window_secs),
            ),
        }
    }
}

pub struct QuoteRouter {
    aggregator: LimitedProvider,
    protocol_route: LimitedProvider,
    routed_tokens: HashSet<Address>,
    min_slippage_percent: f64,
    max_slippage_percent: f64,
    max_price_impact_percent: f64,
}

impl QuoteRouter {
    pub fn new(
        aggregator: Arc<dyn QuoteProvider>,
        protocol_route: Arc<dyn QuoteProvider>,
        config: &QuoteConfig,
    ) -> Self {
        Self {
            aggregator: LimitedProvider::new(aggregator, config),
            protocol_route: LimitedProvider::new(protocol_route, config),
            routed_tokens: config.protocol_routed_tokens.iter().copied().collect(),
            min_slippage_percent: config.min_slippage_percent,
            max_slippage_percent: config.max_slippage_percent,
            max_price_impact_percent: config.max_price_impact_percent,
        }
    }

    /// Whether a pair must go through the protocol route
    pub fn is_protocol_routed(&self, token_in: Address, token_out: Address) -> bool {
        self.routed_tokens.contains(&token_in) || self.routed_tokens.contains(&token_out)
    }

    pub async fn get_quote(&self, request: &QuoteRequest) -> Result<Quote> {
        let routed = self.is_protocol_routed(request.token_in, request.token_out);
        let (primary, secondary) = if routed {
            (&self.protocol_route, &self.aggregator)
        } else {
            (&self.aggregator, &self.protocol_route)
        };

        // (1) fail fast without a network call
        primary.limiter.try_acquire().await?;

        // (2)
        self.validate_slippage(request.slippage_percent)?;

        // (3) the aggregator cannot price routed tokens, so only the generic
        // path falls back, and only on transient failures
        let quote = match primary.provider.quote(request).await {
            Ok(quote) => quote,
            Err(e) if !routed && e.is_retryable() => {
                tracing::warn!(
                    provider = primary.provider.name(),
                    fallback = secondary.provider.name(),
                    error = %e,
                    "Quote provider failed, trying fallback"
                );
                if let Err(limited) = secondary.limiter.try_acquire().await {
                    // The primary failure is the cause worth reporting
                    tracing::warn!(
                        fallback = secondary.provider.name(),
                        error = %limited,
                        "Fallback provider rate limited, returning primary error"
                    );
                    return Err(e);
                }
                secondary.provider.quote(request).await?
            }
            Err(e) => return Err(e),
        };

        // (4)
        self.validate_quote(&quote)?;

        tracing::info!(
            provider = ?quote.provider,
            token_in = %quote.token_in,
            token_out = %quote.token_out,
            amount_out = %quote.amount_out,
            price_impact = quote.price_impact_percent,
            "Quote accepted"
        );
        Ok(quote)
    }

    fn validate_slippage(&self, slippage: f64) -> Result<()> {
        if !slippage.is_finite()
            || slippage < self.min_slippage_percent
            || slippage > self.max_slippage_percent
        {
            return Err(Error::InvalidSlippage {
                requested: slippage,
                min: self.min_slippage_percent,
                max: self.max_slippage_percent,
            });
        }
        Ok(())
    }

    fn validate_quote(&self, quote: &Quote) -> Result<()> {
        if quote.amount_out.is_zero() {
            return Err(Error::NoLiquidity);
        }
        if quote.price_impact_percent > self.max_price_impact_percent {
            return Err(Error::SlippageTooHigh {
                price_impact: quote.price_impact_percent,
                max: self.max_price_impact_percent,
            });
        }
        Ok(())
    }
}

/// Lets price sources quote through the router's limits and validation
#[async_trait]
impl QuoteProvider for QuoteRouter {
    fn name(&self) -> &'static str {
        "router"
    }

    async fn quote(&self, request: &QuoteRequest) -> Result<Quote> {
        self.get_quote(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubQuoteProvider;
    use crate::tokens::addresses;
    use alloy::primitives::U256;

    fn config(max_requests: u32) -> QuoteConfig {
        QuoteConfig {
            max_requests_per_window: max_requests,
            window_secs: 60,
            protocol_routed_tokens: vec![addresses::CBETH],
            ..QuoteConfig::default()
        }
    }

    fn request(token_in: Address, slippage: f64) -> QuoteRequest {
        QuoteRequest {
            chain_id: 8453,
            token_in,
            token_out: addresses::USDC,
            amount_in: U256::from(1_000_000u64),
            user_address: Address::ZERO,
            slippage_percent: slippage,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_blocks_without_network_call() {
        let aggregator = Arc::new(StubQuoteProvider::returning_out(U256::from(990u64)));
        let route = Arc::new(StubQuoteProvider::returning_out(U256::from(1u64)));
        let router = QuoteRouter::new(aggregator.clone(), route, &config(2));

        router.get_quote(&request(addresses::WETH, 0.5)).await.unwrap();
        router.get_quote(&request(addresses::WETH, 0.5)).await.unwrap();

        let err = router.get_quote(&request(addresses::WETH, 0.5)).await.unwrap_err();
        assert!(matches!(err, Error::RateLimitExceeded { retry_after_ms } if retry_after_ms > 0));
        assert_eq!(aggregator.calls(), 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(router.get_quote(&request(addresses::WETH, 0.5)).await.is_ok());
        assert_eq!(aggregator.calls(), 3);
    }

    #[tokio::test]
    async fn test_slippage_bounds() {
        let aggregator = Arc::new(StubQuoteProvider::returning_out(U256::from(990u64)));
        let route = Arc::new(StubQuoteProvider::returning_out(U256::from(1u64)));
        let router = QuoteRouter::new(aggregator.clone(), route, &config(10));

        let low = router.get_quote(&request(addresses::WETH, 0.05)).await;
        assert!(matches!(low, Err(Error::InvalidSlippage { .. })));
        let high = router.get_quote(&request(addresses::WETH, 50.0)).await;
        assert!(matches!(high, Err(Error::InvalidSlippage { .. })));
        assert_eq!(aggregator.calls(), 0);
    }

    #[tokio::test]
    async fn test_routed_token_uses_protocol_route() {
        let aggregator = Arc::new(StubQuoteProvider::returning_out(U256::from(990u64)));
        let route = Arc::new(StubQuoteProvider::returning_out(U256::from(3150u64)));
        let router = QuoteRouter::new(aggregator.clone(), route.clone(), &config(10));

        let quote = router.get_quote(&request(addresses::CBETH, 0.5)).await.unwrap();
        assert_eq!(quote.amount_out, U256::from(3150u64));
        assert_eq!(route.calls(), 1);
        assert_eq!(aggregator.calls(), 0);
    }

    #[tokio::test]
    async fn test_zero_output_is_no_liquidity() {
        let aggregator = Arc::new(StubQuoteProvider::returning_out(U256::ZERO));
        let route = Arc::new(StubQuoteProvider::returning_out(U256::from(1u64)));
        let router = QuoteRouter::new(aggregator, route, &config(10));

        let err = router.get_quote(&request(addresses::WETH, 0.5)).await.unwrap_err();
        assert!(matches!(err, Error::NoLiquidity));
    }

    #[tokio::test]
    async fn test_price_impact_ceiling_names_actual_impact() {
        let aggregator =
            Arc::new(StubQuoteProvider::returning_out(U256::from(990u64)).with_price_impact(12.5));
        let route = Arc::new(StubQuoteProvider::returning_out(U256::from(1u64)));
        let router = QuoteRouter::new(aggregator, route, &config(10));

        let err = router.get_quote(&request(addresses::WETH, 0.5)).await.unwrap_err();
        match &err {
            Error::SlippageTooHigh { price_impact, max } => {
                assert_eq!(*price_impact, 12.5);
                assert_eq!(*max, 10.0);
            }
            other => panic!("expected SlippageTooHigh, got {:?}", other),
        }
        assert!(err.to_string().contains("12.50%"));
    }

    #[tokio::test]
    async fn test_transient_failure_falls_back_to_route() {
        let aggregator = Arc::new(StubQuoteProvider::returning_out(U256::from(990u64)));
        aggregator.fail_next(Error::Timeout("aggregator".into()));
        let route = Arc::new(StubQuoteProvider::returning_out(U256::from(985u64)));
        let router = QuoteRouter::new(aggregator.clone(), route.clone(), &config(10));

        let quote = router.get_quote(&request(addresses::WETH, 0.5)).await.unwrap();
        assert_eq!(quote.amount_out, U256::from(985u64));
        assert_eq!(aggregator.calls(), 1);
        assert_eq!(route.calls(), 1);
    }

    #[tokio::test]
    async fn test_rate_limited_fallback_reports_primary_error() {
        let aggregator = Arc::new(StubQuoteProvider::returning_out(U256::from(990u64)));
        let route = Arc::new(StubQuoteProvider::returning_out(U256::from(985u64)));
        let router = QuoteRouter::new(aggregator.clone(), route.clone(), &config(1));

        // Spend the route's only request in this window
        router.get_quote(&request(addresses::CBETH, 0.5)).await.unwrap();

        aggregator.fail_next(Error::Timeout("aggregator".into()));
        let err = router.get_quote(&request(addresses::WETH, 0.5)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(route.calls(), 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_does_not_fall_back() {
        let aggregator = Arc::new(StubQuoteProvider::returning_out(U256::from(990u64)));
        aggregator.fail_next(Error::Quote("bad token".into()));
        let route = Arc::new(StubQuoteProvider::returning_out(U256::from(985u64)));
        let router = QuoteRouter::new(aggregator, route.clone(), &config(10));

        assert!(router.get_quote(&request(addresses::WETH, 0.5)).await.is_err());
        assert_eq!(route.calls(), 0);
    }
}
