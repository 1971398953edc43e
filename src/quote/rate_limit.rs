//! Fixed-window request limiter, one per external quote provider

use crate::{Error, Result};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
struct RateLimitWindow {
    window_started_at: Instant,
    request_count: u32,
}

/// Shared by every caller of one provider. The count is checked and bumped
/// under a single lock so concurrent callers cannot both take the last slot.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    state: Mutex<RateLimitWindow>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            state: Mutex::new(RateLimitWindow {
                window_started_at: Instant::now(),
                request_count: 0,
            }),
        }
    }

    /// Claim one request slot or fail with the time left in the window
    pub async fn try_acquire(&self) -> Result<()> {
        let mut state = self.state.lock().await;

        let elapsed = state.window_started_at.elapsed();
        if elapsed >= self.window {
            state.window_started_at = Instant::now();
            state.request_count = 0;
        }

        if state.request_count >= self.max_requests {
            let remaining = self.window.saturating_sub(state.window_started_at.elapsed());
            return Err(Error::RateLimitExceeded {
                retry_after_ms: remaining.as_millis() as u64,
            });
        }

        state.request_count += 1;
        Ok(())
    }

    /// Requests left in the current window
    pub async fn remaining(&self) -> u32 {
        let state = self.state.lock().await;
        if state.window_started_at.elapsed() >= self.window {
            return self.max_requests;
        }
        self.max_requests.saturating_sub(state.request_count)
    }
}
