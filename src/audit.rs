//! Append-only JSONL audit trail
//!
//! Records export checks, key disclosures, fund migrations and execution
//! outcomes. Entries never contain key material. A failed write is logged
//! and never blocks the audited operation.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Serialize)]
struct AuditEntry<'a> {
    timestamp: DateTime<Utc>,
    event: &'a str,
    user_id: i64,
    status: &'a str,
    details: Value,
}

struct AuditLogWriter {
    path: PathBuf,
}

impl AuditLogWriter {
    fn write(&self, entry: &AuditEntry<'_>) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        let json = serde_json::to_string(entry)?;
        writeln!(file, "{}", json)?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct AuditLog {
    writer: Arc<Mutex<AuditLogWriter>>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            writer: Arc::new(Mutex::new(AuditLogWriter { path: path.into() })),
        }
    }

    pub async fn record(&self, event: &str, user_id: i64, status: &str, details: Value) {
        let entry = AuditEntry {
            timestamp: Utc::now(),
            event,
            user_id,
            status,
            details,
        };

        let writer = self.writer.lock().await;
        if let Err(e) = writer.write(&entry) {
            tracing::warn!(error = %e, event = event, "Failed to write audit log entry");
        }
    }
}

/// Record to an optional audit log
pub(crate) async fn record(
    log: Option<&AuditLog>,
    event: &str,
    user_id: i64,
    status: &str,
    details: Value,
) {
    if let Some(log) = log {
        log.record(event, user_id, status, details).await;
    }
}
