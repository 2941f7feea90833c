use std::time::Duration;

use crate::retry::BackoffConfig;

/// Tunables for the update pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Retries per field write for rate-limited and transient failures
    /// (each bounded separately).
    pub max_retries: u32,
    /// Backoff for transient failures and checkpoint writes.
    pub backoff: BackoffConfig,
    /// Wait applied to a 429 response without a `Retry-After` hint.
    pub default_rate_limit_wait: Duration,
    /// Upper bound on any server-provided `Retry-After` wait.
    pub max_rate_limit_wait: Duration,
    /// Persist counters after this many rows (and always at the end).
    pub checkpoint_every: u32,
    /// Rows fetched from the row source per page.
    pub page_size: i64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: BackoffConfig::default(),
            default_rate_limit_wait: Duration::from_secs(5),
            max_rate_limit_wait: Duration::from_secs(300),
            checkpoint_every: 5,
            page_size: 200,
        }
    }
}
