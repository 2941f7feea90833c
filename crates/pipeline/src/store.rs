//! Durable job queue the dispatcher and pipeline persist through.

use async_trait::async_trait;
use bulkedit_core::types::DbId;
use bulkedit_db::models::job::{Job, JobCounters, JobListQuery, NewJob};
use bulkedit_db::repositories::JobRepo;
use bulkedit_db::DbPool;

use crate::error::StoreError;
use crate::source::{RowSource, SourceRow};

/// Persistence seam for jobs.
///
/// Status-changing operations are conditional: `claim_next` only takes a
/// pending job, and `checkpoint`/`complete`/`fail` only touch a job that
/// is still processing. They return `false` when the guard did not match.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new pending job with its rows.
    async fn insert(&self, job: NewJob) -> Result<Job, StoreError>;

    /// Claim the oldest pending job, moving it to `processing`.
    async fn claim_next(&self) -> Result<Option<Job>, StoreError>;

    async fn checkpoint(&self, job_id: DbId, counters: &JobCounters) -> Result<bool, StoreError>;

    async fn complete(&self, job_id: DbId, counters: &JobCounters) -> Result<bool, StoreError>;

    async fn fail(
        &self,
        job_id: DbId,
        counters: &JobCounters,
        reason: &str,
    ) -> Result<bool, StoreError>;

    /// Re-queue every `processing` job. Only valid while no dispatcher is
    /// running.
    async fn reset_processing(&self) -> Result<u64, StoreError>;

    /// Delete terminal jobs beyond the `keep` most recently finished.
    async fn purge_terminal_beyond(&self, keep: i64) -> Result<u64, StoreError>;

    async fn find(&self, job_id: DbId) -> Result<Option<Job>, StoreError>;

    async fn list_by_owner(
        &self,
        owner_id: DbId,
        params: &JobListQuery,
    ) -> Result<Vec<Job>, StoreError>;
}

/// Postgres-backed store; also serves as the row source.
#[derive(Clone)]
pub struct PgJobStore {
    pool: DbPool,
}

impl PgJobStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: NewJob) -> Result<Job, StoreError> {
        Ok(JobRepo::insert_with_rows(&self.pool, &job).await?)
    }

    async fn claim_next(&self) -> Result<Option<Job>, StoreError> {
        Ok(JobRepo::claim_next(&self.pool).await?)
    }

    async fn checkpoint(&self, job_id: DbId, counters: &JobCounters) -> Result<bool, StoreError> {
        Ok(JobRepo::checkpoint(&self.pool, job_id, counters).await?)
    }

    async fn complete(&self, job_id: DbId, counters: &JobCounters) -> Result<bool, StoreError> {
        Ok(JobRepo::complete(&self.pool, job_id, counters).await?)
    }

    async fn fail(
        &self,
        job_id: DbId,
        counters: &JobCounters,
        reason: &str,
    ) -> Result<bool, StoreError> {
        Ok(JobRepo::fail(&self.pool, job_id, counters, reason).await?)
    }

    async fn reset_processing(&self) -> Result<u64, StoreError> {
        Ok(JobRepo::reset_processing(&self.pool).await?)
    }

    async fn purge_terminal_beyond(&self, keep: i64) -> Result<u64, StoreError> {
        Ok(JobRepo::purge_terminal_beyond(&self.pool, keep).await?)
    }

    async fn find(&self, job_id: DbId) -> Result<Option<Job>, StoreError> {
        Ok(JobRepo::find_by_id(&self.pool, job_id).await?)
    }

    async fn list_by_owner(
        &self,
        owner_id: DbId,
        params: &JobListQuery,
    ) -> Result<Vec<Job>, StoreError> {
        Ok(JobRepo::list_by_owner(&self.pool, owner_id, params).await?)
    }
}

#[async_trait]
impl RowSource for PgJobStore {
    async fn fetch(
        &self,
        job_id: DbId,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<SourceRow>, StoreError> {
        let rows = JobRepo::fetch_rows(&self.pool, job_id, offset, limit).await?;
        Ok(rows
            .into_iter()
            .map(|r| SourceRow {
                index: r.row_index,
                cells: r.cells.0,
            })
            .collect())
    }
}
