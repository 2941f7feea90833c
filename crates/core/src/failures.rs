//! Row-level failure records stored in a job's `error_details` list.

use serde::{Deserialize, Serialize};

/// Upper bound on the number of failure records kept per job.
///
/// `error_count` stays exact past this point; only the detail list stops
/// growing.
pub const MAX_STORED_FAILURES: usize = 500;

/// Why a single row could not be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Missing record identifier or a cell that failed conversion.
    Validation,
    /// The downstream service does not know the record.
    NotFound,
    /// Rate-limit retries were exhausted.
    RateLimited,
    /// Network/timeout retries were exhausted.
    Transient,
    /// The downstream service refused the write for another reason.
    Rejected,
}

/// One entry in a job's ordered error list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowFailure {
    /// 1-based row number within the job's source rows.
    pub row: i64,
    pub record_id: Option<String>,
    /// Source column whose cell caused the failure, when known.
    pub column: Option<String>,
    pub kind: FailureKind,
    pub message: String,
}

impl RowFailure {
    pub fn new(row: i64, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            row,
            record_id: None,
            column: None,
            kind,
            message: message.into(),
        }
    }

    pub fn with_record(mut self, record_id: impl Into<String>) -> Self {
        self.record_id = Some(record_id.into());
        self
    }

    pub fn with_column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }
}

/// Append `failure` unless the list already holds [`MAX_STORED_FAILURES`].
///
/// Returns `true` if the record was stored.
pub fn push_bounded(list: &mut Vec<RowFailure>, failure: RowFailure) -> bool {
    if list.len() >= MAX_STORED_FAILURES {
        return false;
    }
    list.push(failure);
    true
}
