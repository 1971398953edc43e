//! Builds the component graph from configuration

use crate::audit::AuditLog;
use crate::balances::BalanceAggregator;
use crate::chain::RpcChainReader;
use crate::config::{Config, QuoteConfig, RpcConfig};
use crate::deposit_monitor::DepositMonitor;
use crate::executor::{DirectSubmitter, GaslessSubmitter, Submitters, TransactionExecutor};
use crate::export_gate::ExportSafetyGate;
use crate::pricing::{MarketDataSource, PairAggregatorSource, PriceOracleCache, PriceSource, RouteQuotePriceSource};
use crate::quote::{AggregatorProvider, ProtocolRouteProvider, QuoteRouter};
use crate::reconcile::PositionReconciler;
use crate::store::Database;
use crate::wallet::EncryptedKeyStore;
use crate::Result;
use secrecy::SecretString;
use std::sync::Arc;
use std::time::Duration;

pub struct Services {
    pub config: Config,
    pub db: Database,
    pub keystore: Arc<EncryptedKeyStore>,
    pub prices: Arc<PriceOracleCache>,
    pub balances: Arc<BalanceAggregator>,
    pub reconciler: Arc<PositionReconciler>,
    pub quotes: Arc<QuoteRouter>,
    pub executor: TransactionExecutor,
    pub gate: ExportSafetyGate,
    pub monitor: DepositMonitor,
}

impl Services {
    /// Connect to the database (running pending migrations) and wire every
    /// component against the configured network
    pub async fn connect(config: Config, rpc: &RpcConfig, master_key: &SecretString) -> Result<Self> {
        config.validate()?;
        let rpc_url = rpc.url_for(config.network)?;
        let chain_id = config.network.chain_id();

        let db = Database::connect(&config.database_url).await?;
        let applied = db.run_migrations().await?;
        if !applied.is_empty() {
            tracing::info!(applied = ?applied, "Applied pending migrations");
        }
        let keystore = Arc::new(EncryptedKeyStore::new(db.clone(), master_key)?);

        let quotes = Arc::new(quote_router(&config.quotes)?);

        // Routed tokens price through the router so lookups share its limits
        let price_timeout = Duration::from_secs(config.pricing.timeout_secs);
        let sources: Vec<Arc<dyn PriceSource>> = vec![
            Arc::new(RouteQuotePriceSource::new(
                quotes.clone(),
                &config.quotes.protocol_routed_tokens,
                chain_id,
            )),
            Arc::new(MarketDataSource::new(
                &config.pricing.market_data_url,
                config.network.name(),
                price_timeout,
            )?),
            Arc::new(PairAggregatorSource::new(
                &config.pricing.pair_aggregator_url,
                config.network.name(),
                price_timeout,
            )?),
        ];
        let prices = Arc::new(PriceOracleCache::new(
            sources,
            Duration::from_secs(config.pricing.cache_ttl_secs),
        ));

        let rpc_timeout = Duration::from_secs(config.execution.timeout_secs);
        let balances = Arc::new(BalanceAggregator::new(
            Arc::new(RpcChainReader::new(rpc_url.clone(), rpc_timeout)),
            prices.clone(),
            config.protocols.clone(),
            &config.policy,
            Duration::from_millis(config.execution.inter_call_delay_ms),
        ));
        let reconciler = Arc::new(PositionReconciler::new(
            db.clone(),
            balances.clone(),
            &config.policy,
        ));

        let gasless = Arc::new(GaslessSubmitter::new(
            keystore.clone(),
            &config.execution.relay_url,
            chain_id,
            rpc_timeout,
        )?);
        let submitters = Submitters {
            direct: Arc::new(DirectSubmitter::new(keystore.clone(), rpc_url, rpc_timeout)),
            gasless: gasless.clone(),
        };

        let monitor = DepositMonitor::new();
        let mut executor = TransactionExecutor::new(
            db.clone(),
            keystore.clone(),
            balances.clone(),
            quotes.clone(),
            submitters,
            monitor.clone(),
            config.execution.clone(),
            chain_id,
        );
        let mut gate = ExportSafetyGate::new(
            db.clone(),
            keystore.clone(),
            balances.clone(),
            reconciler.clone(),
            gasless,
            &config.policy,
        );

        if let Some(path) = &config.audit_log_path {
            let audit = AuditLog::new(path);
            executor = executor.with_audit(audit.clone());
            gate = gate.with_audit(audit);
        }

        tracing::info!(
            network = config.network.name(),
            chain_id = chain_id,
            protocols = config.protocols.len(),
            audit = config.audit_log_path.is_some(),
            "Services ready"
        );

        Ok(Self {
            config,
            db,
            keystore,
            prices,
            balances,
            reconciler,
            quotes,
            executor,
            gate,
            monitor,
        })
    }
}

/// Router over the configured HTTP quote providers
pub fn quote_router(config: &QuoteConfig) -> Result<QuoteRouter> {
    let timeout = Duration::from_secs(config.timeout_secs);
    Ok(QuoteRouter::new(
        Arc::new(AggregatorProvider::new(&config.aggregator_url, timeout)?),
        Arc::new(ProtocolRouteProvider::new(&config.protocol_route_url, timeout)?),
        config,
    ))
}
