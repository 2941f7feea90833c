//! Error types for the update pipeline and its collaborators.

use std::time::Duration;

use bulkedit_core::types::DbId;

/// Failure of the durable job store or row source.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("Job {0} not found")]
    JobNotFound(DbId),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Classified outcome of a single downstream field write.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpdateError {
    /// HTTP 429; `retry_after` carries the server hint when present.
    #[error("Rate limited by downstream service")]
    RateLimited { retry_after: Option<Duration> },

    /// Credentials were rejected. Fatal for the whole job.
    #[error("Downstream authorization failed: {0}")]
    Unauthorized(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    /// Network failure, timeout or 5xx.
    #[error("Transient downstream failure: {0}")]
    Transient(String),

    /// Any other refusal (bad value for the field, 4xx).
    #[error("Write rejected: {0}")]
    Rejected(String),
}

/// Conditions that abort a job wholesale.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Downstream credentials rejected: {0}")]
    Unauthorized(String),

    #[error("Failed to read source rows: {0}")]
    Source(#[from] StoreError),
}
