//! Position reconciliation against live chain balances
//!
//! Stored positions are a cache. For each protocol a user has records in,
//! the live receipt balance decides: below dust, the records are stale and
//! deleted; otherwise their live valuation is rewritten when it drifted past
//! the tolerance. Cost basis (`amount_invested`, `entry_apy`) is never
//! touched. A protocol whose read fails keeps its records unchanged.

use crate::balances::{BalanceAggregator, ProtocolBalance};
use crate::config::SafetyPolicy;
use crate::protocols::ProtocolKind;
use crate::store::{Database, PositionRecord};
use crate::Result;
use alloy::primitives::Address;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Portfolio totals over surviving positions only
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PortfolioStats {
    pub total_value: f64,
    pub total_invested: f64,
    pub total_pnl: f64,
    pub total_yield_earned: f64,
}

impl PortfolioStats {
    fn from_positions(positions: &[PositionRecord]) -> Self {
        let total_value: f64 = positions.iter().map(|p| p.current_value).sum();
        let total_invested: f64 = positions.iter().map(|p| p.amount_invested).sum();
        Self {
            total_value,
            total_invested,
            total_pnl: total_value - total_invested,
            total_yield_earned: positions.iter().map(|p| p.yield_earned).sum(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub user_id: i64,
    /// Positions that survived, with live valuation applied
    pub positions: Vec<PositionRecord>,
    /// Stale records deleted in this pass
    pub removed: Vec<PositionRecord>,
    /// Records whose valuation was rewritten
    pub updated: usize,
    /// Protocols whose live balance could not be read; their records are
    /// included in `positions` as stored
    pub unverified: Vec<ProtocolKind>,
    /// Live readings used, one per reconciled protocol
    pub live: Vec<ProtocolBalance>,
    pub stats: PortfolioStats,
}

impl ReconcileReport {
    pub fn is_fully_verified(&self) -> bool {
        self.unverified.is_empty()
    }

    /// Value of positions confirmed against the chain in this pass
    pub fn live_value_usd(&self) -> f64 {
        self.live.iter().map(|b| b.value_usd).sum()
    }
}

pub struct PositionReconciler {
    db: Database,
    balances: Arc<BalanceAggregator>,
    tolerance_usd: f64,
}

impl PositionReconciler {
    pub fn new(db: Database, balances: Arc<BalanceAggregator>, policy: &SafetyPolicy) -> Self {
        Self {
            db,
            balances,
            tolerance_usd: policy.reconcile_tolerance_usd,
        }
    }

    pub async fn reconcile(&self, user_id: i64) -> Result<ReconcileReport> {
        let wallet = self.db.get_wallet(user_id).await?;
        let records = self.db.positions_for_user(user_id).await?;

        let Some(wallet) = wallet else {
            // Positions without a wallet cannot be verified
            return Ok(ReconcileReport {
                user_id,
                stats: PortfolioStats::from_positions(&records),
                unverified: distinct_protocols(&records),
                positions: records,
                removed: Vec::new(),
                updated: 0,
                live: Vec::new(),
            });
        };

        self.reconcile_at(user_id, wallet.address, records).await
    }

    async fn reconcile_at(
        &self,
        user_id: i64,
        owner: Address,
        records: Vec<PositionRecord>,
    ) -> Result<ReconcileReport> {
        let mut by_protocol: BTreeMap<ProtocolKind, Vec<PositionRecord>> = BTreeMap::new();
        for record in records {
            by_protocol.entry(record.protocol).or_default().push(record);
        }

        let mut positions = Vec::new();
        let mut removed = Vec::new();
        let mut unverified = Vec::new();
        let mut live_readings = Vec::new();
        let mut updated = 0;

        for (i, (protocol, group)) in by_protocol.into_iter().enumerate() {
            if i > 0 {
                self.balances.throttle().await;
            }

            let live = match self.balances.try_protocol_balance(owner, protocol).await {
                Ok(live) => live,
                Err(e) => {
                    tracing::warn!(
                        user_id = user_id,
                        protocol = %protocol,
                        error = %e,
                        "Live balance unavailable, keeping stored positions"
                    );
                    unverified.push(protocol);
                    positions.extend(group);
                    continue;
                }
            };

            if live.is_zero() {
                for record in group {
                    self.db.delete_position(&record.id).await?;
                    tracing::info!(
                        user_id = user_id,
                        protocol = %protocol,
                        position_id = %record.id,
                        recorded_value = record.current_value,
                        "Removed stale position"
                    );
                    removed.push(record);
                }
                continue;
            }

            for (record, share) in split_live(&group, &live) {
                let mut record = record.clone();
                let drifted = (share.value - record.current_value).abs() > self.tolerance_usd
                    || (share.tokens - record.tokens_owned).abs() > self.tolerance_usd;
                if drifted {
                    self.db
                        .update_position_valuation(&record.id, share.value, share.tokens, record.current_apy)
                        .await?;
                    tracing::debug!(
                        user_id = user_id,
                        protocol = %protocol,
                        position_id = %record.id,
                        old_value = record.current_value,
                        new_value = share.value,
                        "Position valuation synced"
                    );
                    record.current_value = share.value;
                    record.tokens_owned = share.tokens;
                    updated += 1;
                }
                positions.push(record);
            }
            live_readings.push(live);
        }

        let stats = PortfolioStats::from_positions(&positions);
        tracing::info!(
            user_id = user_id,
            positions = positions.len(),
            removed = removed.len(),
            updated = updated,
            unverified = unverified.len(),
            total_value = stats.total_value,
            "Reconciled positions"
        );

        Ok(ReconcileReport {
            user_id,
            positions,
            removed,
            updated,
            unverified,
            live: live_readings,
            stats,
        })
    }
}

struct LiveShare {
    value: f64,
    tokens: f64,
}

/// Split one protocol's live balance across its records in proportion to
/// their recorded value (evenly when nothing is recorded)
fn split_live<'a>(
    group: &'a [PositionRecord],
    live: &ProtocolBalance,
) -> Vec<(&'a PositionRecord, LiveShare)> {
    let recorded: f64 = group.iter().map(|r| r.current_value.max(0.0)).sum();
    let count = group.len() as f64;

    group
        .iter()
        .map(|record| {
            let weight = if recorded > 0.0 {
                record.current_value.max(0.0) / recorded
            } else {
                1.0 / count
            };
            (
                record,
                LiveShare {
                    value: live.value_usd * weight,
                    tokens: live.amount * weight,
                },
            )
        })
        .collect()
}

fn distinct_protocols(records: &[PositionRecord]) -> Vec<ProtocolKind> {
    let mut kinds: Vec<ProtocolKind> = records.iter().map(|r| r.protocol).collect();
    kinds.sort();
    kinds.dedup();
    kinds
}
