//! Ordered, restartable access to a job's source rows.

use async_trait::async_trait;
use bulkedit_core::types::DbId;
use bulkedit_db::models::job::RowCells;

use crate::error::StoreError;

/// One source row handed to the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    /// 0-based position within the job's rows.
    pub index: i64,
    pub cells: RowCells,
}

impl SourceRow {
    /// 1-based row number, as reported to users.
    pub fn number(&self) -> i64 {
        self.index + 1
    }

    /// Trimmed cell value, `None` when the column is absent or blank.
    pub fn cell(&self, column: &str) -> Option<&str> {
        self.cells
            .get(column)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

/// Finite, ordered row sequence of a job.
///
/// Reads are by offset so a resumed job can start past the rows it has
/// already processed.
#[async_trait]
pub trait RowSource: Send + Sync {
    /// Fetch up to `limit` rows starting at 0-based `offset`, in order.
    /// An empty result means the sequence is exhausted.
    async fn fetch(
        &self,
        job_id: DbId,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<SourceRow>, StoreError>;
}
