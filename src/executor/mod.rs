//! Deposit, withdraw, zap and harvest execution
//!
//! Drives the per-user state machine in `state`. Nothing reaches the chain
//! before an explicit `confirm`, and position or transaction records are
//! written only after a submission succeeds. A failed attempt keeps its plan
//! so `retry` can run it again unchanged.

mod state;
mod submit;

pub use state::{
    transition, ExecutionEvent, ExecutionPlan, ExecutionState, Operation, OperationKind,
};
pub use submit::{DirectSubmitter, GaslessSubmitter, SubmissionReceipt, TransactionSubmitter};

use crate::audit::{self, AuditLog};
use crate::balances::BalanceAggregator;
use crate::chain::{f64_to_units, units_to_f64};
use crate::config::ExecutionConfig;
use crate::deposit_monitor::DepositMonitor;
use crate::protocols::{approve, PreparedCall, ProtocolKind};
use crate::quote::{QuoteRequest, QuoteRouter};
use crate::store::{
    Database, PositionRecord, TransactionKind, TransactionRecord, TransactionStatus, WalletKind,
    WalletRecord,
};
use crate::tokens::registry;
use crate::wallet::EncryptedKeyStore;
use crate::{Error, Result};
use alloy::primitives::Address;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

/// Submission back-ends, chosen by wallet kind
#[derive(Clone)]
pub struct Submitters {
    pub direct: Arc<dyn TransactionSubmitter>,
    pub gasless: Arc<dyn TransactionSubmitter>,
}

impl Submitters {
    pub fn for_wallet(&self, wallet: &WalletRecord) -> &Arc<dyn TransactionSubmitter> {
        match wallet.kind {
            WalletKind::Direct => &self.direct,
            WalletKind::Delegated => &self.gasless,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutcome {
    pub state: ExecutionState,
    pub receipt: SubmissionReceipt,
    /// Position opened by a deposit or zap
    pub position: Option<PositionRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HarvestOutcome {
    pub protocol: ProtocolKind,
    pub harvested_usd: f64,
    pub receipt: SubmissionReceipt,
}

/// Calls plus the underlying amount they put into the protocol
struct BuiltExecution {
    calls: Vec<PreparedCall>,
    underlying_amount: f64,
}

pub struct TransactionExecutor {
    db: Database,
    keystore: Arc<EncryptedKeyStore>,
    balances: Arc<BalanceAggregator>,
    quotes: Arc<QuoteRouter>,
    submitters: Submitters,
    monitor: DepositMonitor,
    config: ExecutionConfig,
    chain_id: u64,
    audit: Option<AuditLog>,
}

impl TransactionExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        keystore: Arc<EncryptedKeyStore>,
        balances: Arc<BalanceAggregator>,
        quotes: Arc<QuoteRouter>,
        submitters: Submitters,
        monitor: DepositMonitor,
        config: ExecutionConfig,
        chain_id: u64,
    ) -> Self {
        Self {
            db,
            keystore,
            balances,
            quotes,
            submitters,
            monitor,
            config,
            chain_id,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Start an operation, replacing any unfinished one
    pub async fn begin(&self, user_id: i64, operation: Operation) -> Result<ExecutionState> {
        if operation.kind == OperationKind::Zap && operation.token_in.is_none() {
            return Err(Error::InvalidArgument("Zap requires an input token".to_string()));
        }
        self.keystore.wallet(user_id).await?;

        let state = ExecutionState::start(operation);
        self.save(user_id, &state).await?;
        Ok(state)
    }

    pub async fn state(&self, user_id: i64) -> Result<Option<ExecutionState>> {
        match self.db.load_session(user_id).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Validate a user-entered amount. On success the state is `Confirming`;
    /// on failure it returns to `AmountInput` and the error names the fix.
    pub async fn submit_amount(&self, user_id: i64, input: &str) -> Result<ExecutionState> {
        let state = self.require_state(user_id).await?;
        let amount = parse_amount(input)?;

        let state = transition(state, ExecutionEvent::AmountEntered(amount))?;
        let operation = state.operation().clone();

        match self.validate(user_id, &operation, amount).await {
            Ok(()) => {
                let state = transition(state, ExecutionEvent::Validated)?;
                self.save(user_id, &state).await?;
                Ok(state)
            }
            Err(e) => {
                let state = transition(state, ExecutionEvent::Rejected(e.to_string()))?;
                self.save(user_id, &state).await?;
                Err(e)
            }
        }
    }

    /// Explicit user confirmation; the only way into `Executing`
    pub async fn confirm(&self, user_id: i64) -> Result<ExecutionOutcome> {
        let state = self.require_state(user_id).await?;
        let state = transition(state, ExecutionEvent::Confirmed)?;
        self.save(user_id, &state).await?;
        self.execute(user_id, state).await
    }

    /// Re-run a failed attempt with identical parameters
    pub async fn retry(&self, user_id: i64) -> Result<ExecutionOutcome> {
        let state = self.require_state(user_id).await?;
        let state = transition(state, ExecutionEvent::Retry)?;
        self.save(user_id, &state).await?;
        self.execute(user_id, state).await
    }

    /// Drop in-flight session state. Already-submitted transactions are not
    /// affected.
    pub async fn cancel(&self, user_id: i64) -> Result<()> {
        if let Some(state) = self.state(user_id).await? {
            if matches!(state, ExecutionState::Executing { .. }) {
                tracing::warn!(
                    user_id = user_id,
                    "Cancelled while executing; a submitted transaction may still confirm"
                );
            }
        }
        self.db.clear_session(user_id).await?;
        self.monitor.clear(user_id).await;
        Ok(())
    }

    /// Withdraw accrued yield (live value above cost basis) from a protocol
    pub async fn harvest(&self, user_id: i64, protocol: ProtocolKind) -> Result<HarvestOutcome> {
        let wallet = self.keystore.wallet(user_id).await?;
        let records = self.db.positions_for_protocol(user_id, protocol).await?;
        if records.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "No tracked {} position to harvest",
                protocol
            )));
        }

        let live = self.balances.try_protocol_balance(wallet.address, protocol).await?;
        let invested: f64 = records.iter().map(|r| r.amount_invested).sum();
        let harvestable = live.value_usd - invested;
        if harvestable < self.config.min_amount_usd {
            return Err(Error::InvalidAmount(format!(
                "No yield to harvest from {} (${:.4} accrued)",
                protocol,
                harvestable.max(0.0)
            )));
        }

        let adapter = protocol.adapter();
        let underlying = adapter.underlying();
        let price = self.balances.price_of(underlying).await;
        if price <= 0.0 {
            return Err(Error::InvalidAmount(format!("No price for {}", registry().symbol(&underlying))));
        }
        let units = f64_to_units(harvestable / price, token_decimals(underlying))?;
        let calls = adapter.build_withdraw(wallet.address, units);

        let receipt = self
            .submitters
            .for_wallet(&wallet)
            .submit(&wallet, &calls)
            .await?;

        let recorded: f64 = records.iter().map(|r| r.current_value.max(0.0)).sum();
        for record in &records {
            let share = if recorded > 0.0 {
                record.current_value.max(0.0) / recorded
            } else {
                1.0 / records.len() as f64
            };
            self.db.record_harvest(&record.id, harvestable * share).await?;
        }

        self.db
            .insert_transaction(&TransactionRecord {
                hash: receipt.tx_hash.clone(),
                user_id,
                wallet_address: wallet.address,
                kind: TransactionKind::Harvest,
                token_symbol: registry().symbol(&underlying).to_string(),
                amount: harvestable / price,
                status: TransactionStatus::Success,
                pool_id: records.first().map(|r| r.pool_id.clone()),
                protocol: Some(protocol),
                yield_earned: Some(harvestable),
                gas_used: receipt.gas_used,
                created_at: Utc::now(),
            })
            .await?;

        tracing::info!(
            user_id = user_id,
            protocol = %protocol,
            harvested_usd = harvestable,
            tx_hash = %receipt.tx_hash,
            "Harvested yield"
        );
        audit::record(
            self.audit.as_ref(),
            "harvest",
            user_id,
            "success",
            json!({ "protocol": protocol, "harvested_usd": harvestable, "tx_hash": receipt.tx_hash }),
        )
        .await;

        Ok(HarvestOutcome {
            protocol,
            harvested_usd: harvestable,
            receipt,
        })
    }

    async fn validate(&self, user_id: i64, operation: &Operation, amount: f64) -> Result<()> {
        let underlying = operation.protocol.adapter().underlying();
        let min = match operation.kind {
            OperationKind::Withdraw => self.config.min_amount_usd,
            OperationKind::Deposit | OperationKind::Zap => {
                operation.protocol.min_deposit().max(self.config.min_amount_usd)
            }
        };
        // Minimums are in underlying units; a zap amount is in its input token
        let deposited = match (operation.kind, operation.token_in) {
            (OperationKind::Zap, Some(token_in)) if token_in != underlying => {
                self.underlying_equivalent(token_in, underlying, amount).await?
            }
            _ => amount,
        };
        if deposited < min {
            return Err(Error::InvalidAmount(format!(
                "Minimum for {} on {} is {} {}",
                kind_label(operation.kind),
                operation.protocol,
                min,
                registry().symbol(&underlying)
            )));
        }

        let wallet = self.keystore.wallet(user_id).await?;

        let available = match operation.kind {
            OperationKind::Deposit => {
                self.balances
                    .try_liquid_balance(wallet.address, underlying)
                    .await?
                    .amount
            }
            OperationKind::Zap => {
                let token_in = operation.token_in.ok_or_else(|| {
                    Error::InvalidArgument("Zap requires an input token".to_string())
                })?;
                self.balances
                    .try_liquid_balance(wallet.address, token_in)
                    .await?
                    .amount
            }
            OperationKind::Withdraw => {
                let position = self
                    .balances
                    .try_protocol_balance(wallet.address, operation.protocol)
                    .await?;
                if amount > position.amount {
                    return Err(Error::InvalidAmount(format!(
                        "Requested {} exceeds your {} balance of {:.6}",
                        amount, operation.protocol, position.amount
                    )));
                }
                return Ok(());
            }
        };

        if amount > available {
            let shortfall = amount - available;
            self.monitor
                .start(
                    user_id,
                    &format!("top_up:{}", operation.protocol),
                    self.config.deposit_watch_minutes,
                )
                .await;
            tracing::info!(
                user_id = user_id,
                available = available,
                required = amount,
                "Insufficient balance, watching for top-up"
            );
            return Err(Error::InsufficientBalance {
                available,
                required: amount,
                shortfall,
                top_up_address: wallet.address,
            });
        }

        Ok(())
    }

    /// `amount` of `token_in` expressed in units of `underlying` at oracle prices
    async fn underlying_equivalent(
        &self,
        token_in: Address,
        underlying: Address,
        amount: f64,
    ) -> Result<f64> {
        let price_in = self.balances.price_of(token_in).await;
        let price_out = self.balances.price_of(underlying).await;
        if price_in <= 0.0 || price_out <= 0.0 {
            return Err(Error::InvalidAmount(format!(
                "No price to value {} as {}",
                registry().symbol(&token_in),
                registry().symbol(&underlying)
            )));
        }
        Ok(amount * price_in / price_out)
    }

    async fn execute(&self, user_id: i64, state: ExecutionState) -> Result<ExecutionOutcome> {
        let plan = match &state {
            ExecutionState::Executing { plan } => plan.clone(),
            other => {
                return Err(Error::InvalidTransition(format!(
                    "cannot execute from {}",
                    other.name()
                )))
            }
        };
        let wallet = self.keystore.wallet(user_id).await?;
        let submitter = self.submitters.for_wallet(&wallet);

        tracing::info!(
            user_id = user_id,
            operation = kind_label(plan.operation.kind),
            protocol = %plan.operation.protocol,
            amount = plan.amount,
            attempt = plan.attempts,
            submitter = submitter.name(),
            "Executing"
        );

        let attempt = async {
            let built = self.build(&wallet, &plan).await?;
            let receipt = submitter.submit(&wallet, &built.calls).await?;
            Ok::<_, Error>((built, receipt))
        }
        .await;

        let (built, receipt) = match attempt {
            Ok(done) => done,
            Err(e) => {
                tracing::warn!(
                    user_id = user_id,
                    protocol = %plan.operation.protocol,
                    error = %e,
                    retryable = e.is_retryable(),
                    "Execution failed, nothing recorded"
                );
                let failed = transition(state, ExecutionEvent::SubmissionFailed(e.to_string()))?;
                self.save(user_id, &failed).await?;
                audit::record(
                    self.audit.as_ref(),
                    "execution",
                    user_id,
                    "failed",
                    json!({ "plan": plan, "error": e.to_string() }),
                )
                .await;
                return Err(e);
            }
        };

        let position = self.record_success(user_id, &wallet, &plan, &built, &receipt).await?;
        let state = transition(
            state,
            ExecutionEvent::Submitted {
                tx_hash: receipt.tx_hash.clone(),
            },
        )?;
        self.db.clear_session(user_id).await?;

        audit::record(
            self.audit.as_ref(),
            "execution",
            user_id,
            "success",
            json!({ "plan": plan, "tx_hash": receipt.tx_hash }),
        )
        .await;

        Ok(ExecutionOutcome {
            state,
            receipt,
            position,
        })
    }

    async fn build(&self, wallet: &WalletRecord, plan: &ExecutionPlan) -> Result<BuiltExecution> {
        let operation = &plan.operation;
        let adapter = operation.protocol.adapter();
        let underlying = adapter.underlying();
        let underlying_decimals = token_decimals(underlying);

        match operation.kind {
            OperationKind::Deposit => Ok(BuiltExecution {
                calls: adapter.build_deposit(
                    wallet.address,
                    f64_to_units(plan.amount, underlying_decimals)?,
                ),
                underlying_amount: plan.amount,
            }),
            OperationKind::Withdraw => Ok(BuiltExecution {
                calls: adapter.build_withdraw(
                    wallet.address,
                    f64_to_units(plan.amount, underlying_decimals)?,
                ),
                underlying_amount: plan.amount,
            }),
            OperationKind::Zap => {
                let token_in = operation.token_in.ok_or_else(|| {
                    Error::InvalidArgument("Zap requires an input token".to_string())
                })?;
                let amount_in = f64_to_units(plan.amount, token_decimals(token_in))?;
                let quote = self
                    .quotes
                    .get_quote(&QuoteRequest {
                        chain_id: self.chain_id,
                        token_in,
                        token_out: underlying,
                        amount_in,
                        user_address: wallet.address,
                        slippage_percent: operation.slippage_percent,
                    })
                    .await?;

                let swap = quote.to_prepared_call()?;
                let min_out = quote.min_amount_out(operation.slippage_percent);

                let mut calls = vec![approve(token_in, swap.to, amount_in), swap];
                calls.extend(adapter.build_deposit(wallet.address, min_out));
                Ok(BuiltExecution {
                    calls,
                    underlying_amount: units_to_f64(min_out, underlying_decimals),
                })
            }
        }
    }

    async fn record_success(
        &self,
        user_id: i64,
        wallet: &WalletRecord,
        plan: &ExecutionPlan,
        built: &BuiltExecution,
        receipt: &SubmissionReceipt,
    ) -> Result<Option<PositionRecord>> {
        let operation = &plan.operation;
        let underlying = operation.protocol.adapter().underlying();
        let value_usd = built.underlying_amount * self.balances.price_of(underlying).await;

        let (kind, symbol_token) = match operation.kind {
            OperationKind::Deposit => (TransactionKind::Deposit, underlying),
            OperationKind::Withdraw => (TransactionKind::Withdraw, underlying),
            OperationKind::Zap => (
                TransactionKind::Zap,
                operation.token_in.unwrap_or(underlying),
            ),
        };

        let position = match operation.kind {
            OperationKind::Deposit | OperationKind::Zap => {
                let position = PositionRecord::opened(
                    user_id,
                    operation.protocol,
                    &operation.pool_id,
                    value_usd,
                    operation.apy,
                    &receipt.tx_hash,
                );
                self.db.insert_position(&position).await?;
                Some(position)
            }
            OperationKind::Withdraw => {
                self.apply_withdraw(user_id, operation.protocol, value_usd).await?;
                None
            }
        };

        self.db
            .insert_transaction(&TransactionRecord {
                hash: receipt.tx_hash.clone(),
                user_id,
                wallet_address: wallet.address,
                kind,
                token_symbol: registry().symbol(&symbol_token).to_string(),
                amount: plan.amount,
                status: TransactionStatus::Success,
                pool_id: Some(operation.pool_id.clone()),
                protocol: Some(operation.protocol),
                yield_earned: None,
                gas_used: receipt.gas_used,
                created_at: Utc::now(),
            })
            .await?;

        Ok(position)
    }

    /// Full exit deletes the protocol's records; partial exit scales them
    async fn apply_withdraw(&self, user_id: i64, protocol: ProtocolKind, withdrawn_usd: f64) -> Result<()> {
        let records = self.db.positions_for_protocol(user_id, protocol).await?;
        let total: f64 = records.iter().map(|r| r.current_value.max(0.0)).sum();

        if total <= 0.0 || withdrawn_usd >= total - self.config.min_amount_usd {
            for record in &records {
                self.db.delete_position(&record.id).await?;
            }
            tracing::info!(user_id = user_id, protocol = %protocol, "Position closed");
            return Ok(());
        }

        let keep = 1.0 - withdrawn_usd / total;
        for record in &records {
            self.db
                .scale_position(
                    &record.id,
                    record.amount_invested * keep,
                    record.current_value * keep,
                    record.tokens_owned * keep,
                )
                .await?;
        }
        Ok(())
    }

    async fn require_state(&self, user_id: i64) -> Result<ExecutionState> {
        self.state(user_id).await?.ok_or_else(|| {
            Error::InvalidTransition("No operation in progress; start a new one".to_string())
        })
    }

    async fn save(&self, user_id: i64, state: &ExecutionState) -> Result<()> {
        self.db
            .save_session(user_id, &serde_json::to_string(state)?)
            .await
    }
}

fn parse_amount(input: &str) -> Result<f64> {
    let amount: f64 = input
        .trim()
        .trim_start_matches('$')
        .parse()
        .map_err(|_| Error::InvalidAmount(format!("'{}' is not a number", input.trim())))?;
    if !amount.is_finite() || amount <= 0.0 {
        return Err(Error::InvalidAmount("Amount must be a positive number".to_string()));
    }
    Ok(amount)
}

fn token_decimals(token: Address) -> u8 {
    registry().get(&token).map(|t| t.decimals).unwrap_or(18)
}

fn kind_label(kind: OperationKind) -> &'static str {
    match kind {
        OperationKind::Deposit => "deposit",
        OperationKind::Withdraw => "withdraw",
        OperationKind::Zap => "zap",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use crate::tokens::addresses;

    const POOL: &str = "aave-v3-usdc";

    async fn confirmed_deposit(h: &Harness, user_id: i64, amount: &str) -> ExecutionState {
        h.executor
            .begin(user_id, Operation::deposit(ProtocolKind::Aave, POOL, 4.0))
            .await
            .unwrap();
        h.executor.submit_amount(user_id, amount).await.unwrap()
    }

    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount(" $12.5 ").unwrap(), 12.5);
        assert!(matches!(parse_amount("abc"), Err(Error::InvalidAmount(_))));
        assert!(matches!(parse_amount("0"), Err(Error::InvalidAmount(_))));
        assert!(matches!(parse_amount("-3"), Err(Error::InvalidAmount(_))));
    }

    #[tokio::test]
    async fn test_failed_deposit_records_nothing_and_retry_succeeds() {
        let h = Harness::new().await;
        let wallet = h.delegated_user(1).await;
        h.chain.set_units(addresses::USDC, wallet.address, 25.0);

        let state = confirmed_deposit(&h, 1, "10").await;
        assert_eq!(state.name(), "confirming");

        h.gasless.fail_next(Error::Submission("execution reverted".into()));
        let err = h.executor.confirm(1).await.unwrap_err();
        assert!(err.is_retryable());

        assert!(h.db.positions_for_user(1).await.unwrap().is_empty());
        assert!(h.db.transactions_for_user(1).await.unwrap().is_empty());
        let failed = h.executor.state(1).await.unwrap().unwrap();
        assert_eq!(failed.name(), "failed");

        let outcome = h.executor.retry(1).await.unwrap();
        assert_eq!(outcome.state.name(), "succeeded");

        let positions = h.db.positions_for_user(1).await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].amount_invested, 10.0);
        assert_eq!(positions[0].entry_apy, 4.0);
        assert_eq!(h.db.transactions_for_user(1).await.unwrap().len(), 1);
        assert_eq!(h.gasless.submissions().len(), 2);
        // Retry submitted exactly the same calls
        let submissions = h.gasless.submissions();
        assert_eq!(submissions[0], submissions[1]);
        assert!(h.executor.state(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_wallet_kind_selects_submission_path() {
        let h = Harness::new().await;
        let delegated = h.delegated_user(1).await;
        let direct = h.direct_user(2).await;
        h.chain.set_units(addresses::USDC, delegated.address, 25.0);
        h.chain.set_units(addresses::USDC, direct.address, 25.0);

        confirmed_deposit(&h, 1, "10").await;
        h.executor.confirm(1).await.unwrap();
        assert_eq!(h.gasless.submissions().len(), 1);
        assert!(h.direct.submissions().is_empty());

        confirmed_deposit(&h, 2, "10").await;
        h.executor.confirm(2).await.unwrap();
        assert_eq!(h.direct.submissions().len(), 1);
        assert_eq!(h.gasless.submissions().len(), 1);
    }

    #[tokio::test]
    async fn test_insufficient_balance_starts_top_up_flow() {
        let h = Harness::new().await;
        let wallet = h.delegated_user(1).await;
        h.chain.set_units(addresses::USDC, wallet.address, 4.0);

        h.executor
            .begin(1, Operation::deposit(ProtocolKind::Aave, POOL, 4.0))
            .await
            .unwrap();
        let err = h.executor.submit_amount(1, "10").await.unwrap_err();

        match err {
            Error::InsufficientBalance {
                available,
                shortfall,
                top_up_address,
                ..
            } => {
                assert_eq!(available, 4.0);
                assert_eq!(shortfall, 6.0);
                assert_eq!(top_up_address, wallet.address);
            }
            other => panic!("expected InsufficientBalance, got {:?}", other),
        }
        assert!(h.monitor.is_active(1).await);
        assert_eq!(h.executor.state(1).await.unwrap().unwrap().name(), "amount_input");
        assert!(h.gasless.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_below_protocol_minimum_rejected() {
        let h = Harness::new().await;
        let wallet = h.delegated_user(1).await;
        h.chain.set_units(addresses::USDC, wallet.address, 100.0);

        h.executor
            .begin(1, Operation::deposit(ProtocolKind::Compound, "compound-usdc", 5.0))
            .await
            .unwrap();
        let err = h.executor.submit_amount(1, "0.5").await.unwrap_err();
        assert!(matches!(err, Error::InvalidAmount(_)));
    }

    #[tokio::test]
    async fn test_zap_minimum_checked_in_underlying_value() {
        let h = Harness::new().await;
        let wallet = h.delegated_user(1).await;
        h.chain.set_units(addresses::WETH, wallet.address, 1.0);

        h.executor
            .begin(
                1,
                Operation::zap(ProtocolKind::Compound, "compound-usdc", 5.0, addresses::WETH, 0.5),
            )
            .await
            .unwrap();
        // 0.5 WETH is ~1500 USDC, well above Compound's 1 USDC floor
        let state = h.executor.submit_amount(1, "0.5").await.unwrap();
        assert_eq!(state.name(), "confirming");

        // 0.0002 WETH is ~0.60 USDC
        h.executor
            .begin(
                1,
                Operation::zap(ProtocolKind::Compound, "compound-usdc", 5.0, addresses::WETH, 0.5),
            )
            .await
            .unwrap();
        let err = h.executor.submit_amount(1, "0.0002").await.unwrap_err();
        assert!(matches!(err, Error::InvalidAmount(_)));
    }

    #[tokio::test]
    async fn test_confirm_required_before_execution() {
        let h = Harness::new().await;
        h.delegated_user(1).await;
        h.executor
            .begin(1, Operation::deposit(ProtocolKind::Aave, POOL, 4.0))
            .await
            .unwrap();

        let err = h.executor.confirm(1).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition(_)));
        assert!(h.gasless.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_full_withdraw_deletes_records() {
        let h = Harness::new().await;
        let wallet = h.delegated_user(1).await;
        h.open_position(1, ProtocolKind::Aave, 30.0).await;
        h.chain.set_units(h.receipt(ProtocolKind::Aave), wallet.address, 30.0);

        h.executor
            .begin(1, Operation::withdraw(ProtocolKind::Aave, POOL))
            .await
            .unwrap();
        h.executor.submit_amount(1, "30").await.unwrap();
        h.executor.confirm(1).await.unwrap();

        assert!(h.db.positions_for_user(1).await.unwrap().is_empty());
        let txs = h.db.transactions_for_user(1).await.unwrap();
        assert_eq!(txs[0].kind, TransactionKind::Withdraw);
    }

    #[tokio::test]
    async fn test_partial_withdraw_scales_records() {
        let h = Harness::new().await;
        let wallet = h.delegated_user(1).await;
        h.open_position(1, ProtocolKind::Aave, 40.0).await;
        h.chain.set_units(h.receipt(ProtocolKind::Aave), wallet.address, 40.0);

        h.executor
            .begin(1, Operation::withdraw(ProtocolKind::Aave, POOL))
            .await
            .unwrap();
        h.executor.submit_amount(1, "10").await.unwrap();
        h.executor.confirm(1).await.unwrap();

        let positions = h.db.positions_for_user(1).await.unwrap();
        assert_eq!(positions.len(), 1);
        assert!((positions[0].amount_invested - 30.0).abs() < 1e-9);
        assert!((positions[0].current_value - 30.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_withdraw_more_than_position_rejected() {
        let h = Harness::new().await;
        let wallet = h.delegated_user(1).await;
        h.chain.set_units(h.receipt(ProtocolKind::Aave), wallet.address, 5.0);

        h.executor
            .begin(1, Operation::withdraw(ProtocolKind::Aave, POOL))
            .await
            .unwrap();
        let err = h.executor.submit_amount(1, "6").await.unwrap_err();
        assert!(matches!(err, Error::InvalidAmount(_)));
        assert!(!h.monitor.is_active(1).await);
    }

    #[tokio::test]
    async fn test_cancel_clears_session() {
        let h = Harness::new().await;
        h.delegated_user(1).await;
        h.executor
            .begin(1, Operation::deposit(ProtocolKind::Aave, POOL, 4.0))
            .await
            .unwrap();

        h.executor.cancel(1).await.unwrap();
        assert!(h.executor.state(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_harvest_moves_yield_out_of_position() {
        let h = Harness::new().await;
        let wallet = h.delegated_user(1).await;
        h.open_position(1, ProtocolKind::Morpho, 100.0).await;
        // Share count unchanged since deposit; the vault's share price rose 3%
        let vault = h.receipt(ProtocolKind::Morpho);
        h.chain.set_units(vault, wallet.address, 100.0);
        h.chain.set_share_price(vault, 1.03);

        let outcome = h.executor.harvest(1, ProtocolKind::Morpho).await.unwrap();
        assert!((outcome.harvested_usd - 3.0).abs() < 1e-6);

        let position = &h.db.positions_for_user(1).await.unwrap()[0];
        assert_eq!(position.amount_invested, 100.0);
        assert!((position.yield_earned - 3.0).abs() < 1e-6);

        let txs = h.db.transactions_for_user(1).await.unwrap();
        assert_eq!(txs[0].kind, TransactionKind::Harvest);
        assert!((txs[0].yield_earned.unwrap() - 3.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_harvest_without_yield_rejected() {
        let h = Harness::new().await;
        let wallet = h.delegated_user(1).await;
        h.open_position(1, ProtocolKind::Morpho, 100.0).await;
        h.chain.set_units(h.receipt(ProtocolKind::Morpho), wallet.address, 100.0);

        let err = h.executor.harvest(1, ProtocolKind::Morpho).await.unwrap_err();
        assert!(matches!(err, Error::InvalidAmount(_)));
        assert!(h.gasless.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_zap_swaps_then_deposits() {
        let h = Harness::new().await;
        let wallet = h.delegated_user(1).await;
        h.chain.set_units(addresses::WETH, wallet.address, 1.0);

        h.executor
            .begin(
                1,
                Operation::zap(ProtocolKind::Aave, POOL, 4.0, addresses::WETH, 0.5),
            )
            .await
            .unwrap();
        h.executor.submit_amount(1, "0.01").await.unwrap();
        let outcome = h.executor.confirm(1).await.unwrap();

        let calls = &h.gasless.submissions()[0];
        // approve input, swap, approve underlying, supply
        assert_eq!(calls.len(), 4);
        let position = outcome.position.unwrap();
        // Stub quote returns 30 USDC; 0.5% slippage floor
        assert!((position.amount_invested - 29.85).abs() < 1e-6);
        let txs = h.db.transactions_for_user(1).await.unwrap();
        assert_eq!(txs[0].kind, TransactionKind::Zap);
        assert_eq!(txs[0].token_symbol, "WETH");
    }
}
