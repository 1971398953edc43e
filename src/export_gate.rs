//! Private-key export gate
//!
//! A key may be shown only when it controls all of the user's funds. Value it
//! does not control (liquid funds at a delegated wallet, and anything parked
//! in a protocol) is summed from live reads on every check. Nothing here is
//! cached: `export_key` and every remediation re-run the full check, and any
//! read that cannot be completed blocks the export.

use crate::audit::{self, AuditLog};
use crate::balances::{total_value_usd, BalanceAggregator, ProtocolBalance};
use crate::config::SafetyPolicy;
use crate::executor::TransactionSubmitter;
use crate::protocols::{transfer, PreparedCall, ProtocolKind};
use crate::reconcile::PositionReconciler;
use crate::store::{
    Database, PositionRecord, TransactionKind, TransactionRecord, TransactionStatus, WalletKind,
    WalletRecord,
};
use crate::tokens::addresses;
use crate::wallet::EncryptedKeyStore;
use crate::{Error, Result};
use alloy::primitives::Address;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::Serialize;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;

/// A way for the user to bring the blocking value under the key's control
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Remediation {
    /// Move liquid funds from the delegated wallet to the owner key's address
    MigrateLiquidFunds {
        from: Address,
        to: Address,
        value_usd: f64,
    },
    /// Withdraw from these protocols first
    ExitPositions {
        protocols: Vec<ProtocolKind>,
        value_usd: f64,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportDecision {
    pub user_id: i64,
    pub allowed: bool,
    /// USD value the stored key does not directly control
    pub blocking_value_usd: f64,
    pub liquid_usd: f64,
    pub positions_usd: f64,
    /// Tracked positions after reconciliation
    pub positions: Vec<PositionRecord>,
    /// Live protocol balances at the wallet address, tracked or not
    pub live_positions: Vec<ProtocolBalance>,
    pub remediation: Vec<Remediation>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationOutcome {
    /// `None` when there was nothing above dust to move
    pub tx_hash: Option<String>,
    pub transferred: Vec<ProtocolBalance>,
    /// Re-evaluated from live balances after the transfer
    pub decision: ExportDecision,
    pub retry_offered: bool,
}

pub struct ExportSafetyGate {
    db: Database,
    keystore: Arc<EncryptedKeyStore>,
    balances: Arc<BalanceAggregator>,
    reconciler: Arc<PositionReconciler>,
    gasless: Arc<dyn TransactionSubmitter>,
    tolerance_usd: f64,
    audit: Option<AuditLog>,
}

impl ExportSafetyGate {
    pub fn new(
        db: Database,
        keystore: Arc<EncryptedKeyStore>,
        balances: Arc<BalanceAggregator>,
        reconciler: Arc<PositionReconciler>,
        gasless: Arc<dyn TransactionSubmitter>,
        policy: &SafetyPolicy,
    ) -> Self {
        Self {
            db,
            keystore,
            balances,
            reconciler,
            gasless,
            tolerance_usd: policy.export_tolerance_usd,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Fresh export check. Errors with `SafetyBlocked` when any balance that
    /// counts towards the decision cannot be read.
    pub async fn can_export(&self, user_id: i64) -> Result<ExportDecision> {
        let wallet = self.keystore.wallet(user_id).await?;

        let decision = match self.evaluate(&wallet).await {
            Ok(decision) => decision,
            Err(e) => {
                let blocked = match e {
                    Error::SafetyBlocked { .. } => e,
                    other => Error::SafetyBlocked {
                        blocking_value_usd: 0.0,
                        reason: format!("balances could not be verified ({})", other),
                    },
                };
                tracing::warn!(user_id = user_id, error = %blocked, "Export check failed closed");
                audit::record(
                    self.audit.as_ref(),
                    "export_check",
                    user_id,
                    "error",
                    json!({ "error": blocked.to_string() }),
                )
                .await;
                return Err(blocked);
            }
        };

        tracing::info!(
            user_id = user_id,
            allowed = decision.allowed,
            blocking_value_usd = decision.blocking_value_usd,
            liquid_usd = decision.liquid_usd,
            positions_usd = decision.positions_usd,
            "Export check"
        );
        audit::record(
            self.audit.as_ref(),
            "export_check",
            user_id,
            if decision.allowed { "allowed" } else { "blocked" },
            json!({
                "blocking_value_usd": decision.blocking_value_usd,
                "liquid_usd": decision.liquid_usd,
                "positions_usd": decision.positions_usd,
            }),
        )
        .await;

        Ok(decision)
    }

    /// Reveal the stored key, only after a check run right now allows it
    pub async fn export_key(&self, user_id: i64) -> Result<SecretString> {
        let decision = self.can_export(user_id).await?;
        if !decision.allowed {
            return Err(Error::SafetyBlocked {
                blocking_value_usd: decision.blocking_value_usd,
                reason: blocked_reason(&decision),
            });
        }

        let secret = self.keystore.reveal(user_id).await?;
        tracing::warn!(user_id = user_id, "Private key disclosed");
        audit::record(self.audit.as_ref(), "key_disclosed", user_id, "success", json!({})).await;
        Ok(secret)
    }

    /// Transfer every liquid balance above dust from the delegated wallet to
    /// the owner key's address, then re-run the export check
    pub async fn migrate_liquid_funds(&self, user_id: i64) -> Result<MigrationOutcome> {
        let wallet = self.keystore.wallet(user_id).await?;
        if wallet.kind != WalletKind::Delegated {
            return Err(Error::InvalidArgument(
                "Direct wallets are already controlled by the stored key".to_string(),
            ));
        }
        let owner = wallet.owner_address.ok_or_else(|| {
            Error::Wallet(format!("Delegated wallet for user {} has no owner address", user_id))
        })?;

        let liquid: Vec<ProtocolBalance> = self
            .balances
            .try_liquid_balances(wallet.address)
            .await?
            .into_iter()
            .filter(|b| !b.is_zero())
            .collect();

        let mut tx_hash = None;
        if !liquid.is_empty() {
            let calls: Vec<PreparedCall> = liquid.iter().map(|b| transfer_call(b, owner)).collect();

            let receipt = match self.gasless.submit(&wallet, &calls).await {
                Ok(receipt) => receipt,
                Err(e) => {
                    tracing::warn!(user_id = user_id, error = %e, "Migration transfer failed");
                    audit::record(
                        self.audit.as_ref(),
                        "migration",
                        user_id,
                        "failed",
                        json!({ "to": owner, "error": e.to_string() }),
                    )
                    .await;
                    return Err(e);
                }
            };

            self.record_migration(&wallet, &liquid, &receipt.tx_hash, receipt.gas_used)
                .await?;
            tracing::info!(
                user_id = user_id,
                from = %wallet.address,
                to = %owner,
                value_usd = total_value_usd(&liquid),
                tx_hash = %receipt.tx_hash,
                "Migrated liquid funds"
            );
            audit::record(
                self.audit.as_ref(),
                "migration",
                user_id,
                "success",
                json!({
                    "to": owner,
                    "value_usd": total_value_usd(&liquid),
                    "tx_hash": receipt.tx_hash,
                }),
            )
            .await;
            tx_hash = Some(receipt.tx_hash);
        }

        // Whatever the transfer reported, only a fresh read decides
        let decision = self.can_export(user_id).await?;
        let retry_offered = !decision.allowed
            && decision
                .remediation
                .iter()
                .any(|r| matches!(r, Remediation::MigrateLiquidFunds { .. }));

        Ok(MigrationOutcome {
            tx_hash,
            transferred: liquid,
            decision,
            retry_offered,
        })
    }

    async fn evaluate(&self, wallet: &WalletRecord) -> Result<ExportDecision> {
        let report = self.reconciler.reconcile(wallet.user_id).await?;
        if !report.is_fully_verified() {
            let unverified: Vec<&str> = report.unverified.iter().map(|p| p.name()).collect();
            let recorded: f64 = report
                .positions
                .iter()
                .filter(|p| report.unverified.contains(&p.protocol))
                .map(|p| p.current_value)
                .sum();
            return Err(Error::SafetyBlocked {
                blocking_value_usd: recorded,
                reason: format!("could not verify {} balances", unverified.join(", ")),
            });
        }

        let liquid = match wallet.kind {
            WalletKind::Delegated => self.balances.try_liquid_balances(wallet.address).await?,
            // The key controls the address itself
            WalletKind::Direct => Vec::new(),
        };

        // Protocols the reconciler already read this pass
        let mut covered: HashSet<ProtocolKind> = report.live.iter().filter_map(|b| b.protocol()).collect();
        covered.extend(report.removed.iter().map(|r| r.protocol));

        let mut live_positions: Vec<ProtocolBalance> = report.live.clone();
        for &protocol in self.balances.protocols() {
            if covered.contains(&protocol) {
                continue;
            }
            self.balances.throttle().await;
            let reading = self.balances.try_protocol_balance(wallet.address, protocol).await?;
            if !reading.is_zero() {
                tracing::info!(
                    user_id = wallet.user_id,
                    protocol = %protocol,
                    value_usd = reading.value_usd,
                    "Untracked protocol balance counts towards export check"
                );
                live_positions.push(reading);
            }
        }

        let liquid_usd = total_value_usd(&liquid);
        let positions_usd = total_value_usd(&live_positions);
        let blocking_value_usd = liquid_usd + positions_usd;
        let allowed = blocking_value_usd <= self.tolerance_usd;

        let mut remediation = Vec::new();
        if !allowed {
            if liquid_usd > 0.0 {
                if let Some(owner) = wallet.owner_address {
                    remediation.push(Remediation::MigrateLiquidFunds {
                        from: wallet.address,
                        to: owner,
                        value_usd: liquid_usd,
                    });
                }
            }
            if positions_usd > 0.0 {
                remediation.push(Remediation::ExitPositions {
                    protocols: live_positions.iter().filter_map(|b| b.protocol()).collect(),
                    value_usd: positions_usd,
                });
            }
        }

        Ok(ExportDecision {
            user_id: wallet.user_id,
            allowed,
            blocking_value_usd,
            liquid_usd,
            positions_usd,
            positions: report.positions,
            live_positions,
            remediation,
            checked_at: Utc::now(),
        })
    }

    async fn record_migration(
        &self,
        wallet: &WalletRecord,
        moved: &[ProtocolBalance],
        tx_hash: &str,
        gas_used: Option<u64>,
    ) -> Result<()> {
        let symbols: Vec<&str> = moved.iter().map(|b| b.token_symbol.as_str()).collect();
        self.db
            .insert_transaction(&TransactionRecord {
                hash: tx_hash.to_string(),
                user_id: wallet.user_id,
                wallet_address: wallet.address,
                kind: TransactionKind::Transfer,
                token_symbol: symbols.join("+"),
                amount: total_value_usd(moved),
                status: TransactionStatus::Success,
                pool_id: None,
                protocol: None,
                yield_earned: None,
                gas_used,
                created_at: Utc::now(),
            })
            .await
    }
}

fn transfer_call(balance: &ProtocolBalance, to: Address) -> PreparedCall {
    if balance.token == addresses::NATIVE_ETH {
        PreparedCall {
            to,
            data: Default::default(),
            value: balance.raw_units,
        }
    } else {
        transfer(balance.token, to, balance.raw_units)
    }
}

fn blocked_reason(decision: &ExportDecision) -> String {
    match (decision.liquid_usd > 0.0, decision.positions_usd > 0.0) {
        (true, true) => "funds remain in the delegated wallet and in DeFi positions".to_string(),
        (true, false) => "funds remain in the delegated wallet; migrate them first".to_string(),
        (false, true) => "funds remain in DeFi positions; withdraw them first".to_string(),
        (false, false) => "balance above tolerance".to_string(),
    }
}
