//! Time-boxed "watching for a deposit" sessions
//!
//! One session per user; a new `start` replaces the old one. Expiry is
//! checked when queried, there is no background timer. Expired sessions
//! are dropped by the query that finds them and by every `start`.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DepositMonitoringSession {
    pub user_id: i64,
    pub started_at: DateTime<Utc>,
    pub duration_minutes: i64,
    /// What prompted the watch, e.g. "top_up:aave"
    pub context: String,
}

impl DepositMonitoringSession {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.started_at + Duration::minutes(self.duration_minutes)
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        now - self.started_at <= Duration::minutes(self.duration_minutes)
    }
}

#[derive(Clone, Default)]
pub struct DepositMonitor {
    sessions: Arc<RwLock<HashMap<i64, DepositMonitoringSession>>>,
}

impl DepositMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn start(&self, user_id: i64, context: &str, duration_minutes: i64) {
        self.start_at(user_id, context, duration_minutes, Utc::now()).await;
    }

    pub async fn start_at(
        &self,
        user_id: i64,
        context: &str,
        duration_minutes: i64,
        now: DateTime<Utc>,
    ) {
        let session = DepositMonitoringSession {
            user_id,
            started_at: now,
            duration_minutes,
            context: context.to_string(),
        };
        tracing::debug!(
            user_id = user_id,
            context = context,
            duration_minutes = duration_minutes,
            "Deposit monitoring started"
        );
        let mut sessions = self.sessions.write().await;
        sessions.retain(|_, s| s.is_active_at(now));
        sessions.insert(user_id, session);
    }

    pub async fn is_active(&self, user_id: i64) -> bool {
        self.is_active_at(user_id, Utc::now()).await
    }

    pub async fn is_active_at(&self, user_id: i64, now: DateTime<Utc>) -> bool {
        self.session_at(user_id, now).await.is_some()
    }

    /// Active session, if any
    pub async fn session(&self, user_id: i64) -> Option<DepositMonitoringSession> {
        self.session_at(user_id, Utc::now()).await
    }

    async fn session_at(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Option<DepositMonitoringSession> {
        {
            let sessions = self.sessions.read().await;
            match sessions.get(&user_id) {
                None => return None,
                Some(s) if s.is_active_at(now) => return Some(s.clone()),
                Some(_) => {}
            }
        }

        let mut sessions = self.sessions.write().await;
        // Re-check under the write lock; a concurrent start may have renewed it
        if sessions.get(&user_id).is_some_and(|s| !s.is_active_at(now)) {
            sessions.remove(&user_id);
            tracing::debug!(user_id = user_id, "Deposit monitoring expired");
        }
        sessions.get(&user_id).cloned()
    }

    pub async fn clear(&self, user_id: i64) {
        self.sessions.write().await.remove(&user_id);
    }
}
