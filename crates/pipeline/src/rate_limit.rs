//! Shared requests-per-minute limiter for downstream calls.
//!
//! The budget belongs to the downstream credential, so one limiter is
//! shared by every caller. It keeps the grant times of the last minute
//! (a sliding log): a new grant is issued only while fewer than
//! `per_minute` grants fall inside the trailing 60 seconds, which bounds
//! every rolling window, not just aligned ones.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Lowest accepted requests-per-minute budget.
pub const MIN_PER_MINUTE: u32 = 10;

/// Highest accepted requests-per-minute budget.
pub const MAX_PER_MINUTE: u32 = 10_000;

const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    #[error("Rate limit must be between {MIN_PER_MINUTE} and {MAX_PER_MINUTE} requests/minute, got {0}")]
    InvalidBudget(u32),

    #[error("Acquire cancelled")]
    Cancelled,
}

/// Blocking-acquire limiter over a rolling one-minute window.
#[derive(Debug)]
pub struct RateLimiter {
    per_minute: u32,
    granted: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Create a limiter allowing `per_minute` acquisitions per rolling minute.
    pub fn new(per_minute: u32) -> Result<Self, RateLimitError> {
        if !(MIN_PER_MINUTE..=MAX_PER_MINUTE).contains(&per_minute) {
            return Err(RateLimitError::InvalidBudget(per_minute));
        }
        Ok(Self {
            per_minute,
            granted: Mutex::new(VecDeque::with_capacity(per_minute as usize)),
        })
    }

    /// Wait until a slot is free, then take it.
    ///
    /// Suspends (never spins) until the oldest grant in the window expires.
    /// Returns [`RateLimitError::Cancelled`] if `cancel` fires first; no
    /// slot is consumed in that case.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), RateLimitError> {
        loop {
            if cancel.is_cancelled() {
                return Err(RateLimitError::Cancelled);
            }

            let retry_at = {
                let mut granted = self.granted.lock().await;
                let now = Instant::now();
                while granted
                    .front()
                    .is_some_and(|t| now.duration_since(*t) >= WINDOW)
                {
                    granted.pop_front();
                }

                if granted.len() < self.per_minute as usize {
                    granted.push_back(now);
                    return Ok(());
                }

                match granted.front() {
                    Some(oldest) => *oldest + WINDOW,
                    None => continue,
                }
            };

            tracing::trace!(
                wait_ms = retry_at.saturating_duration_since(Instant::now()).as_millis() as u64,
                "Rate limiter saturated, waiting for a slot",
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(RateLimitError::Cancelled),
                _ = tokio::time::sleep_until(retry_at) => {}
            }
        }
    }
}
