//! Repository for the `jobs` and `job_rows` tables.
//!
//! Every status change is a conditional update on the current status, so
//! two dispatcher processes can never both claim or finalize the same job.

use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use bulkedit_core::types::DbId;

use crate::models::job::{Job, JobCounters, JobListQuery, JobRow, NewJob};
use crate::models::status::JobStatus;

/// Column list for `jobs` queries.
const COLUMNS: &str = "\
    id, owner_id, title, status, row_source_ref, mapping, \
    total_rows, processed_rows, success_count, error_count, \
    error_details, failure_reason, created_at, updated_at, completed_at";

/// Maximum page size for job listing.
const MAX_LIMIT: i64 = 100;

/// Default page size for job listing.
const DEFAULT_LIMIT: i64 = 50;

/// Rows per multi-value INSERT (3 binds each, well under the 65535 limit).
const ROW_INSERT_CHUNK: usize = 1000;

/// Provides persistence operations for bulk update jobs.
pub struct JobRepo;

impl JobRepo {
    /// Persist a new pending job together with its source rows in one
    /// transaction.
    pub async fn insert_with_rows(pool: &PgPool, input: &NewJob) -> Result<Job, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let query = format!(
            "INSERT INTO jobs (owner_id, title, status, row_source_ref, mapping, total_rows) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING {COLUMNS}"
        );
        let job = sqlx::query_as::<_, Job>(&query)
            .bind(input.owner_id)
            .bind(&input.title)
            .bind(JobStatus::Pending)
            .bind(&input.row_source_ref)
            .bind(Json(&input.mapping))
            .bind(input.rows.len() as i64)
            .fetch_one(&mut *tx)
            .await?;

        for (chunk_idx, chunk) in input.rows.chunks(ROW_INSERT_CHUNK).enumerate() {
            let base = (chunk_idx * ROW_INSERT_CHUNK) as i64;
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new("INSERT INTO job_rows (job_id, row_index, cells) ");
            builder.push_values(chunk.iter().enumerate(), |mut b, (i, cells)| {
                b.push_bind(job.id)
                    .push_bind(base + i as i64)
                    .push_bind(Json(cells));
            });
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(job)
    }

    /// Atomically claim the oldest pending job and move it to `processing`.
    ///
    /// `FOR UPDATE SKIP LOCKED` plus the outer `status = 'pending'` guard
    /// make the claim succeed for at most one caller.
    pub async fn claim_next(pool: &PgPool) -> Result<Option<Job>, sqlx::Error> {
        let query = format!(
            "UPDATE jobs \
             SET status = $1, updated_at = NOW() \
             WHERE id = ( \
                 SELECT id FROM jobs \
                 WHERE status = $2 \
                 ORDER BY created_at ASC, id ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) AND status = $2 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(JobStatus::Processing)
            .bind(JobStatus::Pending)
            .fetch_optional(pool)
            .await
    }

    /// Persist progress counters for a job that is still processing.
    ///
    /// Counters never move backwards; a stale checkpoint is ignored.
    /// Returns `true` if the row was updated.
    pub async fn checkpoint(
        pool: &PgPool,
        job_id: DbId,
        counters: &JobCounters,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE jobs \
             SET processed_rows = $2, success_count = $3, error_count = $4, \
                 error_details = $5, updated_at = NOW() \
             WHERE id = $1 AND status = $6 AND processed_rows <= $2",
        )
        .bind(job_id)
        .bind(counters.processed_rows)
        .bind(counters.success_count)
        .bind(counters.error_count)
        .bind(Json(&counters.error_details))
        .bind(JobStatus::Processing)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Mark a processing job as completed with its final counters.
    pub async fn complete(
        pool: &PgPool,
        job_id: DbId,
        counters: &JobCounters,
    ) -> Result<bool, sqlx::Error> {
        Self::finalize(pool, job_id, JobStatus::Completed, counters, None).await
    }

    /// Mark a processing job as failed, keeping the counters reached so far.
    pub async fn fail(
        pool: &PgPool,
        job_id: DbId,
        counters: &JobCounters,
        reason: &str,
    ) -> Result<bool, sqlx::Error> {
        Self::finalize(pool, job_id, JobStatus::Failed, counters, Some(reason)).await
    }

    async fn finalize(
        pool: &PgPool,
        job_id: DbId,
        status: JobStatus,
        counters: &JobCounters,
        reason: Option<&str>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE jobs \
             SET status = $2, processed_rows = $3, success_count = $4, error_count = $5, \
                 error_details = $6, failure_reason = $7, \
                 completed_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status = $8",
        )
        .bind(job_id)
        .bind(status)
        .bind(counters.processed_rows)
        .bind(counters.success_count)
        .bind(counters.error_count)
        .bind(Json(&counters.error_details))
        .bind(reason)
        .bind(JobStatus::Processing)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Restart recovery: move every `processing` job back to `pending`.
    ///
    /// Returns the number of jobs re-queued.
    pub async fn reset_processing(pool: &PgPool) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE jobs SET status = $1, updated_at = NOW() WHERE status = $2",
        )
        .bind(JobStatus::Pending)
        .bind(JobStatus::Processing)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Delete terminal jobs beyond the `keep` most recent, oldest first.
    pub async fn purge_terminal_beyond(pool: &PgPool, keep: i64) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM jobs WHERE id IN ( \
                 SELECT id FROM jobs \
                 WHERE status IN ($1, $2) \
                 ORDER BY completed_at DESC NULLS LAST, id DESC \
                 OFFSET $3 \
             )",
        )
        .bind(JobStatus::Completed)
        .bind(JobStatus::Failed)
        .bind(keep.max(0))
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Find a job by its ID.
    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<Job>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE id = $1");
        sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// List a user's jobs, most recent first.
    pub async fn list_by_owner(
        pool: &PgPool,
        owner_id: DbId,
        params: &JobListQuery,
    ) -> Result<Vec<Job>, sqlx::Error> {
        let (limit, offset) = clamp_page(params);
        let query = format!(
            "SELECT {COLUMNS} FROM jobs \
             WHERE owner_id = $1 \
             ORDER BY created_at DESC, id DESC \
             LIMIT $2 OFFSET $3"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(owner_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await
    }

    /// Fetch up to `limit` source rows starting at 0-based `offset`.
    pub async fn fetch_rows(
        pool: &PgPool,
        job_id: DbId,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<JobRow>, sqlx::Error> {
        sqlx::query_as::<_, JobRow>(
            "SELECT row_index, cells FROM job_rows \
             WHERE job_id = $1 AND row_index >= $2 \
             ORDER BY row_index ASC \
             LIMIT $3",
        )
        .bind(job_id)
        .bind(offset)
        .bind(limit)
        .fetch_all(pool)
        .await
    }
}

/// Apply the default and maximum page size.
pub fn clamp_page(params: &JobListQuery) -> (i64, i64) {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let offset = params.offset.unwrap_or(0).max(0);
    (limit, offset)
}
