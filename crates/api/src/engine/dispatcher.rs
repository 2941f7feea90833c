//! Background job dispatcher.
//!
//! A single long-lived Tokio task claims the oldest pending job through the
//! store's conditional claim and runs it to the end before claiming the
//! next, so at most one job is processing at a time and jobs finish in
//! submission order. When the queue is empty the loop waits for an enqueue
//! notification, falling back to polling every `poll_interval`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bulkedit_core::mapping::{validate_submission, InvalidJob};
use bulkedit_core::types::DbId;
use bulkedit_db::models::job::{Job, JobListQuery, NewJob, SubmitJob};
use bulkedit_db::models::status::JobStatus;
use bulkedit_pipeline::{JobStore, ProgressSink, ProgressUpdate, RunOutcome, StoreError, UpdatePipeline};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Failure reason stored on a job stopped through [`JobDispatcher::cancel_job`].
pub const CANCELLED_BY_USER: &str = "Cancelled by user";

/// Default `row_source_ref` for submissions that do not name their upload.
const DEFAULT_ROW_SOURCE: &str = "inline";

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Invalid(#[from] InvalidJob),

    #[error("Job {0} not found")]
    NotFound(DbId),

    #[error("{0}")]
    Forbidden(String),

    #[error("Job {0} is not being processed")]
    NotActive(DbId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

struct ActiveJob {
    job_id: DbId,
    cancel: CancellationToken,
}

pub struct JobDispatcher {
    store: Arc<dyn JobStore>,
    pipeline: Arc<UpdatePipeline>,
    progress: Arc<dyn ProgressSink>,
    wake: Notify,
    poll_interval: Duration,
    active: Mutex<Option<ActiveJob>>,
    started: AtomicBool,
}

impl JobDispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        pipeline: Arc<UpdatePipeline>,
        progress: Arc<dyn ProgressSink>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            pipeline,
            progress,
            wake: Notify::new(),
            poll_interval,
            active: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    fn active(&self) -> MutexGuard<'_, Option<ActiveJob>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Validate and persist a submission as a pending job, then wake the
    /// dispatch loop.
    pub async fn enqueue(&self, owner_id: DbId, input: SubmitJob) -> Result<Job, DispatchError> {
        validate_submission(&input.title, &input.columns, &input.mapping, input.rows.len())?;

        let row_source_ref = input
            .row_source_ref
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| DEFAULT_ROW_SOURCE.to_string());

        let job = self
            .store
            .insert(NewJob {
                owner_id,
                title: input.title.trim().to_string(),
                row_source_ref,
                mapping: input.mapping,
                rows: input.rows,
            })
            .await?;

        tracing::info!(
            job_id = job.id,
            user_id = owner_id,
            total_rows = job.total_rows,
            "Job enqueued",
        );
        self.wake.notify_one();
        Ok(job)
    }

    /// Re-queue jobs left processing by a previous run.
    ///
    /// Call once at startup, before [`start`](Self::start); a running loop
    /// owns its processing job, so this is a no-op afterwards.
    pub async fn resume_pending_jobs(&self) -> Result<u64, DispatchError> {
        if self.started.load(Ordering::SeqCst) {
            tracing::warn!("Dispatcher already running, skipping processing-job recovery");
            return Ok(0);
        }
        let reset = self.store.reset_processing().await?;
        if reset > 0 {
            tracing::info!(count = reset, "Re-queued jobs interrupted by a previous run");
        }
        Ok(reset)
    }

    /// Spawn the dispatch loop. Returns `None` if it is already running.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::warn!("Job dispatcher already started");
            return None;
        }
        let dispatcher = Arc::clone(self);
        Some(tokio::spawn(async move { dispatcher.run(shutdown).await }))
    }

    async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Job dispatcher started",
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.store.claim_next().await {
                Ok(Some(job)) => self.run_job(job, &shutdown).await,
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = self.wake.notified() => {}
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to claim next job");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        }

        tracing::info!("Job dispatcher shutting down");
    }

    /// Run one claimed job and finalize it from the pipeline outcome.
    async fn run_job(&self, job: Job, shutdown: &CancellationToken) {
        let cancel = shutdown.child_token();
        *self.active() = Some(ActiveJob {
            job_id: job.id,
            cancel: cancel.clone(),
        });

        tracing::info!(job_id = job.id, user_id = job.owner_id, title = %job.title, "Job claimed");
        self.progress
            .publish(
                job.owner_id,
                ProgressUpdate::new(
                    job.id,
                    JobStatus::Processing,
                    job.total_rows,
                    &job.counters(),
                    "Processing started",
                ),
            )
            .await;

        let run = self.pipeline.process(&job, &cancel).await;
        *self.active() = None;

        let counters = run.counters;
        let (status, message, finalized) = match run.outcome {
            RunOutcome::Completed => {
                let message = format!(
                    "Completed: {} of {} rows updated, {} failed",
                    counters.success_count, job.total_rows, counters.error_count
                );
                (
                    JobStatus::Completed,
                    message,
                    self.store.complete(job.id, &counters).await,
                )
            }
            RunOutcome::Cancelled if shutdown.is_cancelled() => {
                tracing::info!(
                    job_id = job.id,
                    processed_rows = counters.processed_rows,
                    "Job interrupted by shutdown, left processing for resume",
                );
                return;
            }
            RunOutcome::Cancelled => (
                JobStatus::Failed,
                CANCELLED_BY_USER.to_string(),
                self.store.fail(job.id, &counters, CANCELLED_BY_USER).await,
            ),
            RunOutcome::Aborted(e) => {
                let reason = e.to_string();
                tracing::error!(job_id = job.id, error = %reason, "Job aborted");
                let finalized = self.store.fail(job.id, &counters, &reason).await;
                (JobStatus::Failed, reason, finalized)
            }
        };

        match finalized {
            Ok(true) => {
                tracing::info!(
                    job_id = job.id,
                    status = %status,
                    processed_rows = counters.processed_rows,
                    success_count = counters.success_count,
                    error_count = counters.error_count,
                    "Job finished",
                );
                self.progress
                    .publish(
                        job.owner_id,
                        ProgressUpdate::new(job.id, status, job.total_rows, &counters, message),
                    )
                    .await;
            }
            Ok(false) => {
                tracing::warn!(job_id = job.id, status = %status, "Job was no longer processing, result discarded");
            }
            Err(e) => {
                // The job stays processing and is re-queued on the next start.
                tracing::error!(job_id = job.id, status = %status, error = %e, "Failed to finalize job");
            }
        }
    }

    /// Request cooperative cancellation of the caller's active job.
    pub async fn cancel_job(&self, job_id: DbId, user_id: DbId) -> Result<(), DispatchError> {
        self.get_job(job_id, user_id).await?;

        match self.active().as_ref() {
            Some(active) if active.job_id == job_id => {
                active.cancel.cancel();
                tracing::info!(job_id, user_id, "Job cancellation requested");
                Ok(())
            }
            _ => Err(DispatchError::NotActive(job_id)),
        }
    }

    /// Id of the job currently being processed by this dispatcher.
    pub fn active_job_id(&self) -> Option<DbId> {
        self.active().as_ref().map(|a| a.job_id)
    }

    /// A job owned by `user_id`.
    pub async fn get_job(&self, job_id: DbId, user_id: DbId) -> Result<Job, DispatchError> {
        let job = self
            .store
            .find(job_id)
            .await?
            .ok_or(DispatchError::NotFound(job_id))?;
        if job.owner_id != user_id {
            return Err(DispatchError::Forbidden(format!(
                "Job {job_id} belongs to another user"
            )));
        }
        Ok(job)
    }

    /// The caller's jobs, most recent first.
    pub async fn list_jobs(&self, owner_id: DbId, params: &JobListQuery) -> Result<Vec<Job>, DispatchError> {
        Ok(self.store.list_by_owner(owner_id, params).await?)
    }
}
