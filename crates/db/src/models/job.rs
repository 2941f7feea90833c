//! Job entity models and DTOs for bulk field-update jobs.

use std::collections::BTreeMap;

use bulkedit_core::failures::RowFailure;
use bulkedit_core::mapping::JobMapping;
use bulkedit_core::types::{DbId, Timestamp};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;

use super::status::JobStatus;

/// Cell values of one source row, keyed by column header.
pub type RowCells = BTreeMap<String, String>;

/// A row from the `jobs` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Job {
    pub id: DbId,
    pub owner_id: DbId,
    pub title: String,
    pub status: JobStatus,
    pub row_source_ref: String,
    pub mapping: Json<JobMapping>,
    pub total_rows: i64,
    pub processed_rows: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub error_details: Json<Vec<RowFailure>>,
    pub failure_reason: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub completed_at: Option<Timestamp>,
}

impl Job {
    /// Snapshot of the job's persisted counters.
    pub fn counters(&self) -> JobCounters {
        JobCounters {
            processed_rows: self.processed_rows,
            success_count: self.success_count,
            error_count: self.error_count,
            error_details: self.error_details.0.clone(),
        }
    }
}

/// Progress counters written on every checkpoint and at finalization.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobCounters {
    pub processed_rows: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub error_details: Vec<RowFailure>,
}

/// A validated submission ready to be persisted as a pending job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub owner_id: DbId,
    pub title: String,
    pub row_source_ref: String,
    pub mapping: JobMapping,
    pub rows: Vec<RowCells>,
}

/// DTO for submitting a new job via `POST /api/v1/jobs`.
#[derive(Debug, Deserialize)]
pub struct SubmitJob {
    pub title: String,
    /// Label of the upload the rows came from (file name, upload id).
    pub row_source_ref: Option<String>,
    /// Header row of the source.
    pub columns: Vec<String>,
    pub mapping: JobMapping,
    pub rows: Vec<RowCells>,
}

/// A stored source row, as returned by `JobRepo::fetch_rows`.
#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub row_index: i64,
    pub cells: Json<RowCells>,
}

/// Query parameters for `GET /api/v1/jobs`.
#[derive(Debug, Deserialize)]
pub struct JobListQuery {
    /// Maximum number of results. Defaults to 50, capped at 100.
    pub limit: Option<i64>,
    /// Number of results to skip. Defaults to 0.
    pub offset: Option<i64>,
}
