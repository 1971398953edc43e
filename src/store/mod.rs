//! Local persistence
//!
//! The store is a best-effort cache over chain state: positions can drift
//! and are repaired by the reconciler. Transactions are append-only.

mod migrations;
mod models;

pub use migrations::{Migration, MIGRATIONS};
pub use models::{
    PositionRecord, TransactionKind, TransactionRecord, TransactionStatus, WalletKind,
    WalletRecord,
};

use crate::protocols::ProtocolKind;
use crate::{Error, Result};
use chrono::Utc;
use models::{PositionRow, TransactionRow, WalletRow};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

/// Database connection and queries
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connect to a SQLite database
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(3))
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Private in-memory database with migrations applied
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // A single long-lived connection keeps the in-memory database alive
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Health check
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // ---- wallets ----

    pub async fn insert_wallet(&self, wallet: &WalletRecord) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO wallets (
                user_id, address, kind, owner_address, encrypted_secret,
                auto_provisioned, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(wallet.user_id)
        .bind(wallet.address.to_string())
        .bind(wallet.kind.as_str())
        .bind(wallet.owner_address.map(|a| a.to_string()))
        .bind(&wallet.encrypted_secret)
        .bind(wallet.auto_provisioned)
        .bind(wallet.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(Error::WalletExists(wallet.user_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_wallet(&self, user_id: i64) -> Result<Option<WalletRecord>> {
        let row = sqlx::query_as::<_, WalletRow>(
            r#"
            SELECT user_id, address, kind, owner_address, encrypted_secret,
                   auto_provisioned, created_at
            FROM wallets
            WHERE user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(WalletRecord::try_from).transpose()
    }

    // ---- positions ----

    pub async fn insert_position(&self, position: &PositionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO positions (
                id, user_id, protocol, pool_id, amount_invested, current_value,
                tokens_owned, entry_apy, current_apy, yield_earned, tx_hash,
                created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&position.id)
        .bind(position.user_id)
        .bind(position.protocol.name())
        .bind(&position.pool_id)
        .bind(position.amount_invested)
        .bind(position.current_value)
        .bind(position.tokens_owned)
        .bind(position.entry_apy)
        .bind(position.current_apy)
        .bind(position.yield_earned)
        .bind(&position.tx_hash)
        .bind(position.created_at)
        .bind(position.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn positions_for_user(&self, user_id: i64) -> Result<Vec<PositionRecord>> {
        let rows = sqlx::query_as::<_, PositionRow>(
            r#"
            SELECT id, user_id, protocol, pool_id, amount_invested, current_value,
                   tokens_owned, entry_apy, current_apy, yield_earned, tx_hash,
                   created_at, updated_at
            FROM positions
            WHERE user_id = ?
            ORDER BY created_at ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(PositionRecord::try_from).collect()
    }

    pub async fn positions_for_protocol(
        &self,
        user_id: i64,
        protocol: ProtocolKind,
    ) -> Result<Vec<PositionRecord>> {
        Ok(self
            .positions_for_user(user_id)
            .await?
            .into_iter()
            .filter(|p| p.protocol == protocol)
            .collect())
    }

    /// Overwrite live valuation fields. Cost basis columns are not touched.
    pub async fn update_position_valuation(
        &self,
        id: &str,
        current_value: f64,
        tokens_owned: f64,
        current_apy: f64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE positions
            SET current_value = ?, tokens_owned = ?, current_apy = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(current_value)
        .bind(tokens_owned)
        .bind(current_apy)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Shrink a position after a tracked partial withdrawal
    pub async fn scale_position(
        &self,
        id: &str,
        amount_invested: f64,
        current_value: f64,
        tokens_owned: f64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE positions
            SET amount_invested = ?, current_value = ?, tokens_owned = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(amount_invested)
        .bind(current_value)
        .bind(tokens_owned)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Move harvested yield out of the position's value
    pub async fn record_harvest(&self, id: &str, harvested: f64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE positions
            SET yield_earned = yield_earned + ?,
                current_value = MAX(current_value - ?, 0),
                tokens_owned = MAX(tokens_owned - ?, 0),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(harvested)
        .bind(harvested)
        .bind(harvested)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Local-only delete; never touches chain state
    pub async fn delete_position(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM positions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ---- transactions (append-only) ----

    pub async fn insert_transaction(&self, tx: &TransactionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO transactions (
                hash, user_id, wallet_address, kind, token_symbol, amount, status,
                pool_id, protocol, yield_earned, gas_used, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&tx.hash)
        .bind(tx.user_id)
        .bind(tx.wallet_address.to_string())
        .bind(tx.kind.as_str())
        .bind(&tx.token_symbol)
        .bind(tx.amount)
        .bind(tx.status.as_str())
        .bind(&tx.pool_id)
        .bind(tx.protocol.map(|p| p.name()))
        .bind(tx.yield_earned)
        .bind(tx.gas_used.map(|g| g as i64))
        .bind(tx.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn transactions_for_user(&self, user_id: i64) -> Result<Vec<TransactionRecord>> {
        let rows = sqlx::query_as::<_, TransactionRow>(
            r#"
            SELECT hash, user_id, wallet_address, kind, token_symbol, amount, status,
                   pool_id, protocol, yield_earned, gas_used, created_at
            FROM transactions
            WHERE user_id = ?
            ORDER BY created_at ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TransactionRecord::try_from).collect()
    }

    // ---- execution sessions ----

    pub async fn save_session(&self, user_id: i64, state_json: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO execution_sessions (user_id, state, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT (user_id)
            DO UPDATE SET state = excluded.state, updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(state_json)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn load_session(&self, user_id: i64) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT state FROM execution_sessions WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|r| r.0))
    }

    pub async fn clear_session(&self, user_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM execution_sessions WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
