//! In-memory [`JobStore`] and [`RowSource`] with the same conditional
//! semantics as the Postgres store. Test-only.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use bulkedit_core::types::DbId;
use bulkedit_db::models::job::{Job, JobCounters, JobListQuery, NewJob, RowCells};
use bulkedit_db::models::status::JobStatus;
use bulkedit_db::repositories::job_repo::clamp_page;
use sqlx::types::Json;

use crate::error::StoreError;
use crate::source::{RowSource, SourceRow};
use crate::store::JobStore;

#[derive(Default)]
struct Inner {
    next_id: DbId,
    jobs: BTreeMap<DbId, Job>,
    rows: BTreeMap<DbId, Vec<RowCells>>,
    /// Number of upcoming checkpoint calls that fail.
    failing_checkpoints: u32,
    checkpoint_calls: u32,
    /// Number of upcoming row fetches that fail.
    failing_fetches: u32,
    fetch_calls: u32,
    unavailable: bool,
}

#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<Inner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current stored state of a job.
    pub fn job(&self, id: DbId) -> Option<Job> {
        self.lock().jobs.get(&id).cloned()
    }

    /// Make the next `n` checkpoint writes return an error.
    pub fn fail_next_checkpoints(&self, n: u32) {
        self.lock().failing_checkpoints = n;
    }

    /// Total checkpoint calls received, failed ones included.
    pub fn checkpoint_calls(&self) -> u32 {
        self.lock().checkpoint_calls
    }

    /// Make the next `n` row fetches return an error.
    pub fn fail_next_fetches(&self, n: u32) {
        self.lock().failing_fetches = n;
    }

    /// Total row fetches received, failed ones included.
    pub fn fetch_calls(&self) -> u32 {
        self.lock().fetch_calls
    }

    /// Make every operation fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Force a job into `status`, bypassing transition guards.
    pub fn force_status(&self, id: DbId, status: JobStatus) {
        if let Some(job) = self.lock().jobs.get_mut(&id) {
            job.status = status;
        }
    }

    fn guard(inner: &Inner) -> Result<(), StoreError> {
        if inner.unavailable {
            Err(StoreError::Unavailable("memory store switched off".into()))
        } else {
            Ok(())
        }
    }

    fn finalize(
        &self,
        job_id: DbId,
        status: JobStatus,
        counters: &JobCounters,
        reason: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        Self::guard(&inner)?;
        let Some(job) = inner.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if !job.status.can_transition_to(status) {
            return Ok(false);
        }
        apply_counters(job, counters);
        job.status = status;
        job.failure_reason = reason.map(str::to_string);
        let now = chrono::Utc::now();
        job.completed_at = Some(now);
        job.updated_at = now;
        Ok(true)
    }
}

fn apply_counters(job: &mut Job, counters: &JobCounters) {
    job.processed_rows = counters.processed_rows;
    job.success_count = counters.success_count;
    job.error_count = counters.error_count;
    job.error_details = Json(counters.error_details.clone());
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, input: NewJob) -> Result<Job, StoreError> {
        let mut inner = self.lock();
        Self::guard(&inner)?;
        inner.next_id += 1;
        let id = inner.next_id;
        let now = chrono::Utc::now();
        let job = Job {
            id,
            owner_id: input.owner_id,
            title: input.title,
            status: JobStatus::Pending,
            row_source_ref: input.row_source_ref,
            mapping: Json(input.mapping),
            total_rows: input.rows.len() as i64,
            processed_rows: 0,
            success_count: 0,
            error_count: 0,
            error_details: Json(Vec::new()),
            failure_reason: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        inner.jobs.insert(id, job.clone());
        inner.rows.insert(id, input.rows);
        Ok(job)
    }

    async fn claim_next(&self) -> Result<Option<Job>, StoreError> {
        let mut inner = self.lock();
        Self::guard(&inner)?;
        let next = inner
            .jobs
            .values_mut()
            .filter(|j| j.status.can_transition_to(JobStatus::Processing))
            .min_by_key(|j| (j.created_at, j.id));
        Ok(next.map(|job| {
            job.status = JobStatus::Processing;
            job.updated_at = chrono::Utc::now();
            job.clone()
        }))
    }

    async fn checkpoint(&self, job_id: DbId, counters: &JobCounters) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        inner.checkpoint_calls += 1;
        Self::guard(&inner)?;
        if inner.failing_checkpoints > 0 {
            inner.failing_checkpoints -= 1;
            return Err(StoreError::Unavailable("injected checkpoint failure".into()));
        }
        match inner.jobs.get_mut(&job_id) {
            Some(job)
                if job.status == JobStatus::Processing
                    && job.processed_rows <= counters.processed_rows =>
            {
                apply_counters(job, counters);
                job.updated_at = chrono::Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(&self, job_id: DbId, counters: &JobCounters) -> Result<bool, StoreError> {
        self.finalize(job_id, JobStatus::Completed, counters, None)
    }

    async fn fail(
        &self,
        job_id: DbId,
        counters: &JobCounters,
        reason: &str,
    ) -> Result<bool, StoreError> {
        self.finalize(job_id, JobStatus::Failed, counters, Some(reason))
    }

    async fn reset_processing(&self) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        Self::guard(&inner)?;
        let mut count = 0;
        for job in inner.jobs.values_mut() {
            if job.status.can_transition_to(JobStatus::Pending) {
                job.status = JobStatus::Pending;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn purge_terminal_beyond(&self, keep: i64) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        Self::guard(&inner)?;
        let mut terminal: Vec<&Job> = inner.jobs.values().filter(|j| j.status.is_terminal()).collect();
        terminal.sort_by(|a, b| (b.completed_at, b.id).cmp(&(a.completed_at, a.id)));
        let doomed: Vec<DbId> = terminal
            .into_iter()
            .skip(keep.max(0) as usize)
            .map(|j| j.id)
            .collect();
        for id in &doomed {
            inner.jobs.remove(id);
            inner.rows.remove(id);
        }
        Ok(doomed.len() as u64)
    }

    async fn find(&self, job_id: DbId) -> Result<Option<Job>, StoreError> {
        let inner = self.lock();
        Self::guard(&inner)?;
        Ok(inner.jobs.get(&job_id).cloned())
    }

    async fn list_by_owner(
        &self,
        owner_id: DbId,
        params: &JobListQuery,
    ) -> Result<Vec<Job>, StoreError> {
        let inner = self.lock();
        Self::guard(&inner)?;
        let (limit, offset) = clamp_page(params);
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.owner_id == owner_id)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(jobs
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }
}

#[async_trait]
impl RowSource for MemoryJobStore {
    async fn fetch(
        &self,
        job_id: DbId,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<SourceRow>, StoreError> {
        let mut inner = self.lock();
        inner.fetch_calls += 1;
        Self::guard(&inner)?;
        if inner.failing_fetches > 0 {
            inner.failing_fetches -= 1;
            return Err(StoreError::Unavailable("pool timed out".into()));
        }
        let rows = inner.rows.get(&job_id).ok_or(StoreError::JobNotFound(job_id))?;
        Ok(rows
            .iter()
            .enumerate()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .map(|(i, cells)| SourceRow {
                index: i as i64,
                cells: cells.clone(),
            })
            .collect())
    }
}
