//! Transient progress snapshots of a job and the sink they are pushed to.

use async_trait::async_trait;
use bulkedit_core::job_events::MSG_TYPE_PROGRESS;
use bulkedit_core::types::{DbId, Timestamp};
use bulkedit_db::models::job::JobCounters;
use bulkedit_db::models::status::JobStatus;
use serde::Serialize;

/// Percentage of rows processed, absent when the job has no rows.
pub fn progress_percent(processed_rows: i64, total_rows: i64) -> Option<f64> {
    if total_rows > 0 {
        Some(processed_rows as f64 / total_rows as f64 * 100.0)
    } else {
        None
    }
}

/// A non-persisted projection of a job's state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressUpdate {
    pub job_id: DbId,
    pub status: JobStatus,
    pub processed_rows: i64,
    pub total_rows: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    pub timestamp: Timestamp,
}

impl ProgressUpdate {
    pub fn new(
        job_id: DbId,
        status: JobStatus,
        total_rows: i64,
        counters: &JobCounters,
        message: impl Into<String>,
    ) -> Self {
        Self {
            job_id,
            status,
            processed_rows: counters.processed_rows,
            total_rows,
            success_count: counters.success_count,
            error_count: counters.error_count,
            message: message.into(),
            progress: progress_percent(counters.processed_rows, total_rows),
            timestamp: chrono::Utc::now(),
        }
    }

    /// The wire envelope: `{"type": "progress", ...fields}`.
    pub fn to_envelope(&self) -> serde_json::Value {
        #[derive(Serialize)]
        struct Envelope<'a> {
            #[serde(rename = "type")]
            kind: &'static str,
            #[serde(flatten)]
            update: &'a ProgressUpdate,
        }

        serde_json::to_value(Envelope {
            kind: MSG_TYPE_PROGRESS,
            update: self,
        })
        .unwrap_or(serde_json::Value::Null)
    }
}

/// Destination for progress snapshots, addressed by job owner.
///
/// Delivery is best-effort: implementations must not block the pipeline
/// on slow or absent consumers.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn publish(&self, owner_id: DbId, update: ProgressUpdate);
}
