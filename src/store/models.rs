//! Persisted records and their row mappings

use crate::protocols::ProtocolKind;
use crate::{Error, Result};
use alloy::primitives::Address;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// How the user's funds are controlled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletKind {
    /// The stored key controls the funds directly
    Direct,
    /// Gasless-provisioned smart wallet; the stored key is only the owner
    Delegated,
}

impl WalletKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WalletKind::Direct => "direct",
            WalletKind::Delegated => "delegated",
        }
    }
}

impl FromStr for WalletKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "direct" => Ok(WalletKind::Direct),
            "delegated" => Ok(WalletKind::Delegated),
            other => Err(Error::InvalidArgument(format!("Unknown wallet kind: {}", other))),
        }
    }
}

/// One wallet per user. `address` holds the funds and never changes.
#[derive(Clone)]
pub struct WalletRecord {
    pub user_id: i64,
    pub address: Address,
    pub kind: WalletKind,
    /// Address of the owner key for delegated wallets
    pub owner_address: Option<Address>,
    pub encrypted_secret: String,
    pub auto_provisioned: bool,
    pub created_at: DateTime<Utc>,
}

impl WalletRecord {
    /// Address the stored key signs for
    pub fn key_address(&self) -> Address {
        self.owner_address.unwrap_or(self.address)
    }
}

impl std::fmt::Debug for WalletRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletRecord")
            .field("user_id", &self.user_id)
            .field("address", &self.address)
            .field("kind", &self.kind)
            .field("owner_address", &self.owner_address)
            .field("encrypted_secret", &"[REDACTED]")
            .field("auto_provisioned", &self.auto_provisioned)
            .finish()
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct WalletRow {
    pub user_id: i64,
    pub address: String,
    pub kind: String,
    pub owner_address: Option<String>,
    pub encrypted_secret: String,
    pub auto_provisioned: bool,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<WalletRow> for WalletRecord {
    type Error = Error;

    fn try_from(row: WalletRow) -> Result<Self> {
        Ok(Self {
            user_id: row.user_id,
            address: parse_address(&row.address)?,
            kind: row.kind.parse()?,
            owner_address: row.owner_address.as_deref().map(parse_address).transpose()?,
            encrypted_secret: row.encrypted_secret,
            auto_provisioned: row.auto_provisioned,
            created_at: row.created_at,
        })
    }
}

/// A tracked yield position. `amount_invested` and `entry_apy` are the cost
/// basis and are never rewritten from live chain data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub id: String,
    pub user_id: i64,
    pub protocol: ProtocolKind,
    pub pool_id: String,
    pub amount_invested: f64,
    pub current_value: f64,
    pub tokens_owned: f64,
    pub entry_apy: f64,
    pub current_apy: f64,
    pub yield_earned: f64,
    pub tx_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PositionRecord {
    /// Record for a freshly confirmed deposit
    pub fn opened(
        user_id: i64,
        protocol: ProtocolKind,
        pool_id: &str,
        amount: f64,
        apy: f64,
        tx_hash: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id,
            protocol,
            pool_id: pool_id.to_string(),
            amount_invested: amount,
            current_value: amount,
            tokens_owned: amount,
            entry_apy: apy,
            current_apy: apy,
            yield_earned: 0.0,
            tx_hash: tx_hash.to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn pnl(&self) -> f64 {
        self.current_value - self.amount_invested
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct PositionRow {
    pub id: String,
    pub user_id: i64,
    pub protocol: String,
    pub pool_id: String,
    pub amount_invested: f64,
    pub current_value: f64,
    pub tokens_owned: f64,
    pub entry_apy: f64,
    pub current_apy: f64,
    pub yield_earned: f64,
    pub tx_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<PositionRow> for PositionRecord {
    type Error = Error;

    fn try_from(row: PositionRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            protocol: row.protocol.parse()?,
            pool_id: row.pool_id,
            amount_invested: row.amount_invested,
            current_value: row.current_value,
            tokens_owned: row.tokens_owned,
            entry_apy: row.entry_apy,
            current_apy: row.current_apy,
            yield_earned: row.yield_earned,
            tx_hash: row.tx_hash,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Deposit,
    Withdraw,
    Zap,
    Harvest,
    Transfer,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Deposit => "deposit",
            TransactionKind::Withdraw => "withdraw",
            TransactionKind::Zap => "zap",
            TransactionKind::Harvest => "harvest",
            TransactionKind::Transfer => "transfer",
        }
    }
}

impl FromStr for TransactionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "deposit" => Ok(TransactionKind::Deposit),
            "withdraw" => Ok(TransactionKind::Withdraw),
            "zap" => Ok(TransactionKind::Zap),
            "harvest" => Ok(TransactionKind::Harvest),
            "transfer" => Ok(TransactionKind::Transfer),
            other => Err(Error::InvalidArgument(format!(
                "Unknown transaction kind: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Success,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Success => "success",
            TransactionStatus::Failed => "failed",
        }
    }
}

impl FromStr for TransactionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "success" => Ok(TransactionStatus::Success),
            "failed" => Ok(TransactionStatus::Failed),
            other => Err(Error::InvalidArgument(format!(
                "Unknown transaction status: {}",
                other
            ))),
        }
    }
}

/// Append-only record of a confirmed on-chain effect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub hash: String,
    pub user_id: i64,
    pub wallet_address: Address,
    pub kind: TransactionKind,
    pub token_symbol: String,
    pub amount: f64,
    pub status: TransactionStatus,
    pub pool_id: Option<String>,
    pub protocol: Option<ProtocolKind>,
    pub yield_earned: Option<f64>,
    pub gas_used: Option<u64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct TransactionRow {
    pub hash: String,
    pub user_id: i64,
    pub wallet_address: String,
    pub kind: String,
    pub token_symbol: String,
    pub amount: f64,
    pub status: String,
    pub pool_id: Option<String>,
    pub protocol: Option<String>,
    pub yield_earned: Option<f64>,
    pub gas_used: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for TransactionRecord {
    type Error = Error;

    fn try_from(row: TransactionRow) -> Result<Self> {
        Ok(Self {
            hash: row.hash,
            user_id: row.user_id,
            wallet_address: parse_address(&row.wallet_address)?,
            kind: row.kind.parse()?,
            token_symbol: row.token_symbol,
            amount: row.amount,
            status: row.status.parse()?,
            pool_id: row.pool_id,
            protocol: row
                .protocol
                .as_deref()
                .map(ProtocolKind::from_str)
                .transpose()?,
            yield_earned: row.yield_earned,
            gas_used: row.gas_used.map(|g| g.max(0) as u64),
            created_at: row.created_at,
        })
    }
}

fn parse_address(raw: &str) -> Result<Address> {
    Address::from_str(raw)
        .map_err(|e| Error::InvalidArgument(format!("Stored address '{}' is invalid: {}", raw, e)))
}
