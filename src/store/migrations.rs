//! Schema migrations
//!
//! Files are applied in filename order, each inside its own transaction, and
//! recorded in `migrations` only after the transaction commits.

use super::Database;
use crate::Result;
use chrono::Utc;

/// An embedded migration file
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub filename: &'static str,
    pub sql: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        filename: "0001_initial.sql",
        sql: include_str!("../../migrations/0001_initial.sql"),
    },
    Migration {
        filename: "0002_execution_sessions.sql",
        sql: include_str!("../../migrations/0002_execution_sessions.sql"),
    },
];

/// Split a migration file into statements. Migration files must not contain
/// semicolons inside string literals or triggers.
fn statements(sql: &str) -> impl Iterator<Item = &str> {
    sql.split(';').map(str::trim).filter(|s| !s.is_empty())
}

impl Database {
    /// Apply all embedded migrations, returning the filenames newly applied
    pub async fn run_migrations(&self) -> Result<Vec<String>> {
        self.apply_migrations(MIGRATIONS).await
    }

    pub async fn apply_migrations(&self, migrations: &[Migration]) -> Result<Vec<String>> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS migrations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                filename TEXT NOT NULL UNIQUE,
                executed_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        let applied = self.applied_migrations().await?;
        let mut pending: Vec<&Migration> = migrations
            .iter()
            .filter(|m| !applied.iter().any(|a| a == m.filename))
            .collect();
        pending.sort_by_key(|m| m.filename);

        let mut newly_applied = Vec::new();
        for migration in pending {
            let mut tx = self.pool.begin().await?;

            for statement in statements(migration.sql) {
                if let Err(e) = sqlx::query(statement).execute(&mut *tx).await {
                    tracing::error!(
                        filename = migration.filename,
                        error = %e,
                        "Migration failed, rolling back"
                    );
                    return Err(e.into());
                }
            }

            sqlx::query("INSERT INTO migrations (filename, executed_at) VALUES (?, ?)")
                .bind(migration.filename)
                .bind(Utc::now())
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            tracing::info!(filename = migration.filename, "Applied migration");
            newly_applied.push(migration.filename.to_string());
        }

        Ok(newly_applied)
    }

    pub async fn applied_migrations(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT filename FROM migrations ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }
}
