//! Row-by-row transform-and-write engine for a single job.
//!
//! Rows are processed strictly in source order. For each row the record
//! id is read, every non-blank mapped cell is converted, and the writes
//! go through the shared [`RateLimiter`] to the [`RecordUpdater`]. Row
//! level failures are recorded and skipped; only rejected credentials or
//! a row source that stays unreadable through its retries abort the job.
//!
//! The pipeline never changes job status. It checkpoints counters while
//! the job is `processing` and returns a [`PipelineRun`] the dispatcher
//! finalizes.

use std::sync::Arc;
use std::time::Duration;

use bulkedit_core::failures::{push_bounded, FailureKind, RowFailure};
use bulkedit_core::fields::ParseOptions;
use bulkedit_core::mapping::JobMapping;
use bulkedit_core::types::DbId;
use bulkedit_db::models::job::{Job, JobCounters};
use bulkedit_db::models::status::JobStatus;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, StoreError, UpdateError};
use crate::progress::{ProgressSink, ProgressUpdate};
use crate::rate_limit::RateLimiter;
use crate::resolver::FieldResolver;
use crate::retry::{next_delay, sleep_or_cancel};
use crate::source::{RowSource, SourceRow};
use crate::store::JobStore;
use crate::updater::{FieldWrite, RecordUpdater};

/// Attempts per checkpoint write before processing continues in memory.
const CHECKPOINT_ATTEMPTS: u32 = 3;

/// How a pipeline run ended.
#[derive(Debug)]
pub enum RunOutcome {
    /// Every row was processed (row-level failures included).
    Completed,
    /// The cancellation token fired; the remaining rows were not touched.
    Cancelled,
    /// A job-level fault stopped processing.
    Aborted(PipelineError),
}

/// Final counters and outcome of one [`UpdatePipeline::process`] call.
#[derive(Debug)]
pub struct PipelineRun {
    pub counters: JobCounters,
    pub outcome: RunOutcome,
}

enum RowResult {
    Applied,
    Failed(RowFailure),
    Cancelled,
    Unauthorized(String),
}

enum WriteFailure {
    Cancelled,
    Update(UpdateError),
}

enum FetchFailure {
    Cancelled,
    Source(StoreError),
}

/// The update pipeline and its collaborators.
pub struct UpdatePipeline {
    store: Arc<dyn JobStore>,
    rows: Arc<dyn RowSource>,
    resolver: Arc<dyn FieldResolver>,
    updater: Arc<dyn RecordUpdater>,
    limiter: Arc<RateLimiter>,
    progress: Arc<dyn ProgressSink>,
    config: PipelineConfig,
}

impl UpdatePipeline {
    pub fn new(
        store: Arc<dyn JobStore>,
        rows: Arc<dyn RowSource>,
        resolver: Arc<dyn FieldResolver>,
        updater: Arc<dyn RecordUpdater>,
        limiter: Arc<RateLimiter>,
        progress: Arc<dyn ProgressSink>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            rows,
            resolver,
            updater,
            limiter,
            progress,
            config,
        }
    }

    /// Process a claimed job from its last checkpoint to the end.
    ///
    /// Counters start from the job's persisted values, so a re-claimed job
    /// resumes at `processed_rows` with its earlier failures kept.
    pub async fn process(&self, job: &Job, cancel: &CancellationToken) -> PipelineRun {
        let mapping = &job.mapping.0;
        let opts = mapping.parse_options();
        let mut counters = job.counters();
        let mut unsaved_rows: u32 = 0;

        tracing::info!(
            job_id = job.id,
            total_rows = job.total_rows,
            resume_from = counters.processed_rows,
            "Pipeline started",
        );

        let outcome = 'rows: loop {
            if counters.processed_rows >= job.total_rows {
                break RunOutcome::Completed;
            }
            if cancel.is_cancelled() {
                break RunOutcome::Cancelled;
            }

            let page = match self.fetch_page(job.id, counters.processed_rows, cancel).await {
                Ok(page) if page.is_empty() => break RunOutcome::Completed,
                Ok(page) => page,
                Err(FetchFailure::Cancelled) => break RunOutcome::Cancelled,
                Err(FetchFailure::Source(e)) => break RunOutcome::Aborted(e.into()),
            };

            for row in &page {
                if cancel.is_cancelled() {
                    break 'rows RunOutcome::Cancelled;
                }

                let message = match self.process_row(mapping, &opts, row, cancel).await {
                    RowResult::Applied => {
                        counters.success_count += 1;
                        format!("Updated row {} of {}", row.number(), job.total_rows)
                    }
                    RowResult::Failed(failure) => {
                        tracing::debug!(
                            job_id = job.id,
                            row = failure.row,
                            kind = ?failure.kind,
                            error = %failure.message,
                            "Row failed",
                        );
                        counters.error_count += 1;
                        let message = format!(
                            "Row {} of {} failed: {}",
                            row.number(),
                            job.total_rows,
                            failure.message
                        );
                        push_bounded(&mut counters.error_details, failure);
                        message
                    }
                    RowResult::Cancelled => break 'rows RunOutcome::Cancelled,
                    RowResult::Unauthorized(msg) => {
                        break 'rows RunOutcome::Aborted(PipelineError::Unauthorized(msg))
                    }
                };

                counters.processed_rows += 1;
                unsaved_rows += 1;

                self.progress
                    .publish(
                        job.owner_id,
                        ProgressUpdate::new(
                            job.id,
                            JobStatus::Processing,
                            job.total_rows,
                            &counters,
                            message,
                        ),
                    )
                    .await;

                if unsaved_rows >= self.config.checkpoint_every.max(1) {
                    self.checkpoint(job.id, &counters).await;
                    unsaved_rows = 0;
                }

                if counters.processed_rows >= job.total_rows {
                    break;
                }
            }
        };

        if unsaved_rows > 0 {
            self.checkpoint(job.id, &counters).await;
        }

        tracing::info!(
            job_id = job.id,
            processed_rows = counters.processed_rows,
            success_count = counters.success_count,
            error_count = counters.error_count,
            outcome = ?outcome,
            "Pipeline finished",
        );

        PipelineRun { counters, outcome }
    }

    /// Read the page of rows starting at `offset`.
    ///
    /// Store failures get `max_retries` extra attempts with backoff; rows
    /// that no longer exist are reported at once.
    async fn fetch_page(
        &self,
        job_id: DbId,
        offset: i64,
        cancel: &CancellationToken,
    ) -> Result<Vec<SourceRow>, FetchFailure> {
        let mut retries = 0;
        let mut delay = self.config.backoff.initial_delay;

        loop {
            match self.rows.fetch(job_id, offset, self.config.page_size).await {
                Ok(page) => return Ok(page),
                Err(e @ StoreError::JobNotFound(_)) => return Err(FetchFailure::Source(e)),
                Err(e) if retries < self.config.max_retries => {
                    retries += 1;
                    tracing::warn!(
                        job_id,
                        offset,
                        attempt = retries,
                        wait_ms = delay.as_millis() as u64,
                        error = %e,
                        "Row fetch failed, retrying",
                    );
                }
                Err(e) => return Err(FetchFailure::Source(e)),
            }

            if !sleep_or_cancel(delay, cancel).await {
                return Err(FetchFailure::Cancelled);
            }
            delay = next_delay(delay, &self.config.backoff);
        }
    }

    async fn process_row(
        &self,
        mapping: &JobMapping,
        opts: &ParseOptions,
        row: &SourceRow,
        cancel: &CancellationToken,
    ) -> RowResult {
        let number = row.number();

        let Some(record_id) = row.cell(&mapping.id_column) else {
            return RowResult::Failed(
                RowFailure::new(number, FailureKind::Validation, "Missing record identifier")
                    .with_column(&mapping.id_column),
            );
        };

        // Convert every cell before writing any, so a bad cell leaves the
        // record untouched.
        let mut writes = Vec::with_capacity(mapping.columns.len());
        for column in &mapping.columns {
            let Some(raw) = row.cell(&column.column) else {
                continue;
            };
            match self.resolver.resolve(column, raw, opts) {
                Ok(value) => writes.push((
                    column.column.as_str(),
                    FieldWrite {
                        field_id: column.field_id.clone(),
                        value,
                    },
                )),
                Err(e) => {
                    return RowResult::Failed(
                        RowFailure::new(number, FailureKind::Validation, e.to_string())
                            .with_record(record_id)
                            .with_column(&column.column),
                    )
                }
            }
        }

        for (column, write) in &writes {
            match self.apply_write(record_id, write, cancel).await {
                Ok(()) => {}
                Err(WriteFailure::Cancelled) => return RowResult::Cancelled,
                Err(WriteFailure::Update(UpdateError::Unauthorized(msg))) => {
                    tracing::error!(row = number, record_id, error = %msg, "Downstream rejected credentials");
                    return RowResult::Unauthorized(msg);
                }
                Err(WriteFailure::Update(e)) => {
                    return RowResult::Failed(
                        RowFailure::new(number, failure_kind(&e), e.to_string())
                            .with_record(record_id)
                            .with_column(*column),
                    )
                }
            }
        }

        RowResult::Applied
    }

    /// One field write with rate limiting and bounded retries.
    ///
    /// Rate-limited and transient failures each get `max_retries` extra
    /// attempts; every other outcome is returned as-is.
    async fn apply_write(
        &self,
        record_id: &str,
        write: &FieldWrite,
        cancel: &CancellationToken,
    ) -> Result<(), WriteFailure> {
        let max_retries = self.config.max_retries;
        let mut rate_limited_retries = 0;
        let mut transient_retries = 0;
        let mut delay = self.config.backoff.initial_delay;

        loop {
            self.limiter
                .acquire(cancel)
                .await
                .map_err(|_| WriteFailure::Cancelled)?;

            let wait = match self.updater.update_field(record_id, write).await {
                Ok(()) => return Ok(()),
                Err(UpdateError::RateLimited { retry_after }) if rate_limited_retries < max_retries => {
                    rate_limited_retries += 1;
                    let wait = self.rate_limit_wait(retry_after);
                    tracing::warn!(
                        record_id,
                        field_id = %write.field_id,
                        attempt = rate_limited_retries,
                        wait_ms = wait.as_millis() as u64,
                        "Downstream rate limited, retrying",
                    );
                    wait
                }
                Err(UpdateError::Transient(msg)) if transient_retries < max_retries => {
                    transient_retries += 1;
                    let wait = delay;
                    delay = next_delay(delay, &self.config.backoff);
                    tracing::warn!(
                        record_id,
                        field_id = %write.field_id,
                        attempt = transient_retries,
                        wait_ms = wait.as_millis() as u64,
                        error = %msg,
                        "Transient downstream failure, retrying",
                    );
                    wait
                }
                Err(e) => return Err(WriteFailure::Update(e)),
            };

            if !sleep_or_cancel(wait, cancel).await {
                return Err(WriteFailure::Cancelled);
            }
        }
    }

    fn rate_limit_wait(&self, hint: Option<Duration>) -> Duration {
        hint.unwrap_or(self.config.default_rate_limit_wait)
            .min(self.config.max_rate_limit_wait)
    }

    /// Persist counters, retrying with backoff.
    ///
    /// A checkpoint that keeps failing is logged and dropped; processing
    /// continues with the in-memory counters.
    async fn checkpoint(&self, job_id: DbId, counters: &JobCounters) -> bool {
        let mut delay = self.config.backoff.initial_delay;

        for attempt in 1..=CHECKPOINT_ATTEMPTS {
            match self.store.checkpoint(job_id, counters).await {
                Ok(true) => return true,
                Ok(false) => {
                    tracing::warn!(job_id, "Checkpoint skipped, job is no longer processing");
                    return false;
                }
                Err(e) if attempt < CHECKPOINT_ATTEMPTS => {
                    tracing::warn!(job_id, attempt, error = %e, "Checkpoint failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = next_delay(delay, &self.config.backoff);
                }
                Err(e) => {
                    tracing::error!(
                        job_id,
                        processed_rows = counters.processed_rows,
                        error = %e,
                        "Checkpoint failed, continuing in memory",
                    );
                }
            }
        }
        false
    }
}

fn failure_kind(error: &UpdateError) -> FailureKind {
    match error {
        UpdateError::RateLimited { .. } => FailureKind::RateLimited,
        UpdateError::NotFound(_) => FailureKind::NotFound,
        UpdateError::Transient(_) => FailureKind::Transient,
        UpdateError::Rejected(_) | UpdateError::Unauthorized(_) => FailureKind::Rejected,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use bulkedit_core::fields::{FieldSpec, FieldValue};
    use bulkedit_core::mapping::ColumnMapping;
    use bulkedit_db::models::job::{NewJob, RowCells};

    use super::*;
    use crate::memory::MemoryJobStore;
    use crate::resolver::MappingResolver;

    type Responder = Box<dyn Fn(&str, usize) -> Result<(), UpdateError> + Send + Sync>;

    /// Records every write; `respond(record_id, nth_call_for_record)`
    /// decides the outcome.
    struct FakeUpdater {
        calls: Mutex<Vec<(String, FieldWrite)>>,
        respond: Responder,
    }

    impl FakeUpdater {
        fn new(respond: impl Fn(&str, usize) -> Result<(), UpdateError> + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                respond: Box::new(respond),
            })
        }

        fn ok() -> Arc<Self> {
            Self::new(|_, _| Ok(()))
        }

        fn records(&self) -> Vec<String> {
            let mut ids: Vec<String> = Vec::new();
            for (id, _) in self.calls.lock().unwrap().iter() {
                if ids.last() != Some(id) {
                    ids.push(id.clone());
                }
            }
            ids
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl RecordUpdater for FakeUpdater {
        async fn update_field(&self, record_id: &str, write: &FieldWrite) -> Result<(), UpdateError> {
            let nth = {
                let mut calls = self.calls.lock().unwrap();
                let nth = calls.iter().filter(|(id, _)| id == record_id).count();
                calls.push((record_id.to_string(), write.clone()));
                nth
            };
            (self.respond)(record_id, nth)
        }
    }

    #[derive(Default)]
    struct RecordingProgress {
        updates: Mutex<Vec<(DbId, ProgressUpdate)>>,
    }

    #[async_trait]
    impl ProgressSink for RecordingProgress {
        async fn publish(&self, owner_id: DbId, update: ProgressUpdate) {
            self.updates.lock().unwrap().push((owner_id, update));
        }
    }

    struct Harness {
        store: Arc<MemoryJobStore>,
        updater: Arc<FakeUpdater>,
        progress: Arc<RecordingProgress>,
        pipeline: UpdatePipeline,
    }

    fn harness(updater: Arc<FakeUpdater>) -> Harness {
        harness_with(updater, PipelineConfig::default())
    }

    fn harness_with(updater: Arc<FakeUpdater>, config: PipelineConfig) -> Harness {
        let store = Arc::new(MemoryJobStore::new());
        let progress = Arc::new(RecordingProgress::default());
        let pipeline = UpdatePipeline::new(
            store.clone(),
            store.clone(),
            Arc::new(MappingResolver),
            updater.clone(),
            Arc::new(RateLimiter::new(10_000).unwrap()),
            progress.clone(),
            config,
        );
        Harness {
            store,
            updater,
            progress,
            pipeline,
        }
    }

    fn mapping() -> JobMapping {
        JobMapping {
            id_column: "Task ID".into(),
            columns: vec![
                ColumnMapping {
                    column: "Notes".into(),
                    field_id: "fld-notes".into(),
                    field: FieldSpec::Text,
                },
                ColumnMapping {
                    column: "Estimate".into(),
                    field_id: "fld-estimate".into(),
                    field: FieldSpec::Numeric,
                },
            ],
            locale: Default::default(),
            date_order: Default::default(),
        }
    }

    /// Row `n` (1-based) targets record `rec-n`.
    fn row(n: usize) -> RowCells {
        RowCells::from([
            ("Task ID".to_string(), format!("rec-{n}")),
            ("Notes".to_string(), format!("note {n}")),
            ("Estimate".to_string(), format!("{n}.5")),
        ])
    }

    fn rows(count: usize) -> Vec<RowCells> {
        (1..=count).map(row).collect()
    }

    async fn claimed_job(store: &MemoryJobStore, rows: Vec<RowCells>) -> Job {
        store
            .insert(NewJob {
                owner_id: 42,
                title: "Bulk edit".into(),
                row_source_ref: "tasks.xlsx".into(),
                mapping: mapping(),
                rows,
            })
            .await
            .unwrap();
        store.claim_next().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn not_found_rows_are_recorded_and_job_completes() {
        let h = harness(FakeUpdater::new(|id, _| match id {
            "rec-9" | "rec-10" => Err(UpdateError::NotFound(format!("{id} does not exist"))),
            _ => Ok(()),
        }));
        let job = claimed_job(&h.store, rows(10)).await;

        let run = h.pipeline.process(&job, &CancellationToken::new()).await;

        assert_matches!(run.outcome, RunOutcome::Completed);
        assert_eq!(run.counters.processed_rows, 10);
        assert_eq!(run.counters.success_count, 8);
        assert_eq!(run.counters.error_count, 2);
        let failed: Vec<i64> = run.counters.error_details.iter().map(|f| f.row).collect();
        assert_eq!(failed, vec![9, 10]);
        assert!(run
            .counters
            .error_details
            .iter()
            .all(|f| f.kind == FailureKind::NotFound));

        let stored = h.store.job(job.id).unwrap();
        assert_eq!(stored.processed_rows, 10);
        assert_eq!(stored.success_count, 8);
        assert_eq!(stored.error_count, 2);
    }

    #[tokio::test]
    async fn authorization_failure_aborts_remaining_rows() {
        let h = harness(FakeUpdater::new(|id, _| match id {
            "rec-3" => Err(UpdateError::Unauthorized("401 Unauthorized".into())),
            _ => Ok(()),
        }));
        let job = claimed_job(&h.store, rows(10)).await;

        let run = h.pipeline.process(&job, &CancellationToken::new()).await;

        assert_matches!(run.outcome, RunOutcome::Aborted(PipelineError::Unauthorized(_)));
        assert_eq!(run.counters.processed_rows, 2);
        assert_eq!(run.counters.success_count, 2);
        assert_eq!(run.counters.error_count, 0);
        assert_eq!(h.updater.records(), vec!["rec-1", "rec-2", "rec-3"]);
        assert_eq!(h.store.job(job.id).unwrap().processed_rows, 2);
    }

    #[tokio::test]
    async fn conversion_failure_skips_the_row_without_writes() {
        let h = harness(FakeUpdater::ok());
        let mut input = rows(3);
        input[1].insert("Estimate".into(), "about three".into());
        let job = claimed_job(&h.store, input).await;

        let run = h.pipeline.process(&job, &CancellationToken::new()).await;

        assert_matches!(run.outcome, RunOutcome::Completed);
        assert_eq!(run.counters.success_count, 2);
        assert_eq!(run.counters.error_count, 1);
        let failure = &run.counters.error_details[0];
        assert_eq!(failure.row, 2);
        assert_eq!(failure.kind, FailureKind::Validation);
        assert_eq!(failure.record_id.as_deref(), Some("rec-2"));
        assert_eq!(failure.column.as_deref(), Some("Estimate"));
        assert_eq!(h.updater.records(), vec!["rec-1", "rec-3"]);
    }

    #[tokio::test]
    async fn missing_record_id_is_a_validation_failure() {
        let h = harness(FakeUpdater::ok());
        let mut input = rows(2);
        input[0].insert("Task ID".into(), "   ".into());
        let job = claimed_job(&h.store, input).await;

        let run = h.pipeline.process(&job, &CancellationToken::new()).await;

        assert_eq!(run.counters.processed_rows, 2);
        assert_eq!(run.counters.error_count, 1);
        assert_eq!(run.counters.error_details[0].kind, FailureKind::Validation);
        assert_eq!(run.counters.error_details[0].column.as_deref(), Some("Task ID"));
        assert_eq!(h.updater.records(), vec!["rec-2"]);
    }

    #[tokio::test]
    async fn blank_cells_are_not_written() {
        let h = harness(FakeUpdater::ok());
        let mut input = rows(1);
        input[0].insert("Notes".into(), "".into());
        let job = claimed_job(&h.store, input).await;

        let run = h.pipeline.process(&job, &CancellationToken::new()).await;

        assert_eq!(run.counters.success_count, 1);
        let calls = h.updater.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1.field_id, "fld-estimate");
        assert_eq!(calls[0].1.value, FieldValue::Numeric(1.5));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_write_waits_for_the_hint_and_retries() {
        let h = harness(FakeUpdater::new(|id, nth| match (id, nth) {
            ("rec-1", 0) => Err(UpdateError::RateLimited {
                retry_after: Some(Duration::from_secs(12)),
            }),
            _ => Ok(()),
        }));
        let job = claimed_job(&h.store, rows(1)).await;
        let start = tokio::time::Instant::now();

        let run = h.pipeline.process(&job, &CancellationToken::new()).await;

        assert_eq!(run.counters.success_count, 1);
        assert_eq!(h.updater.call_count(), 3);
        assert!(start.elapsed() >= Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_transient_retries_fail_the_row() {
        let h = harness(FakeUpdater::new(|id, _| match id {
            "rec-2" => Err(UpdateError::Transient("connection reset".into())),
            _ => Ok(()),
        }));
        let job = claimed_job(&h.store, rows(3)).await;

        let run = h.pipeline.process(&job, &CancellationToken::new()).await;

        assert_matches!(run.outcome, RunOutcome::Completed);
        assert_eq!(run.counters.success_count, 2);
        assert_eq!(run.counters.error_details[0].kind, FailureKind::Transient);
        let attempts = h
            .updater
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == "rec-2")
            .count();
        // First write of the row: initial attempt plus `max_retries`.
        assert_eq!(attempts, 1 + PipelineConfig::default().max_retries as usize);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_rate_limit_retries_fail_the_row() {
        let h = harness(FakeUpdater::new(|id, _| match id {
            "rec-1" => Err(UpdateError::RateLimited { retry_after: None }),
            _ => Ok(()),
        }));
        let job = claimed_job(&h.store, rows(2)).await;

        let run = h.pipeline.process(&job, &CancellationToken::new()).await;

        assert_eq!(run.counters.processed_rows, 2);
        assert_eq!(run.counters.error_details[0].row, 1);
        assert_eq!(run.counters.error_details[0].kind, FailureKind::RateLimited);
    }

    #[tokio::test]
    async fn cancellation_stops_between_rows() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        // Cancel during the last write of row 4.
        let h = harness(FakeUpdater::new(move |id, nth| {
            if id == "rec-4" && nth == 1 {
                trigger.cancel();
            }
            Ok(())
        }));
        let job = claimed_job(&h.store, rows(10)).await;

        let run = h.pipeline.process(&job, &cancel).await;

        assert_matches!(run.outcome, RunOutcome::Cancelled);
        assert_eq!(run.counters.processed_rows, 4);
        assert_eq!(h.updater.records(), vec!["rec-1", "rec-2", "rec-3", "rec-4"]);
        // Partial counters are checkpointed on the way out.
        assert_eq!(h.store.job(job.id).unwrap().processed_rows, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_a_retry_wait() {
        let cancel = CancellationToken::new();
        let h = harness(FakeUpdater::new(|_, _| {
            Err(UpdateError::RateLimited {
                retry_after: Some(Duration::from_secs(120)),
            })
        }));
        let job = claimed_job(&h.store, rows(2)).await;

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                cancel.cancel();
            })
        };
        let run = h.pipeline.process(&job, &cancel).await;
        canceller.await.unwrap();

        assert_matches!(run.outcome, RunOutcome::Cancelled);
        assert_eq!(run.counters.processed_rows, 0);
    }

    #[tokio::test]
    async fn reclaimed_job_resumes_from_checkpoint() {
        let h = harness(FakeUpdater::ok());
        let job = claimed_job(&h.store, rows(10)).await;
        let earlier = JobCounters {
            processed_rows: 4,
            success_count: 3,
            error_count: 1,
            error_details: vec![RowFailure::new(2, FailureKind::NotFound, "gone")],
        };
        assert!(h.store.checkpoint(job.id, &earlier).await.unwrap());
        let job = h.store.job(job.id).unwrap();

        let run = h.pipeline.process(&job, &CancellationToken::new()).await;

        assert_eq!(
            h.updater.records(),
            (5..=10).map(|n| format!("rec-{n}")).collect::<Vec<_>>()
        );
        assert_eq!(run.counters.processed_rows, 10);
        assert_eq!(run.counters.success_count, 9);
        assert_eq!(run.counters.error_count, 1);
        assert_eq!(run.counters.error_details[0].row, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_row_fetch_is_retried() {
        let h = harness(FakeUpdater::ok());
        let job = claimed_job(&h.store, rows(3)).await;
        h.store.fail_next_fetches(1);

        let run = h.pipeline.process(&job, &CancellationToken::new()).await;

        assert_matches!(run.outcome, RunOutcome::Completed);
        assert_eq!(run.counters.processed_rows, 3);
        assert_eq!(run.counters.success_count, 3);
        assert_eq!(h.store.fetch_calls(), 2);
        assert_eq!(h.updater.records(), vec!["rec-1", "rec-2", "rec-3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn row_source_that_stays_down_aborts_the_job() {
        let h = harness(FakeUpdater::ok());
        let job = claimed_job(&h.store, rows(3)).await;
        h.store.fail_next_fetches(u32::MAX);

        let run = h.pipeline.process(&job, &CancellationToken::new()).await;

        assert_matches!(run.outcome, RunOutcome::Aborted(PipelineError::Source(_)));
        assert_eq!(run.counters.processed_rows, 0);
        assert_eq!(
            h.store.fetch_calls(),
            1 + PipelineConfig::default().max_retries
        );
        assert_eq!(h.updater.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_a_fetch_retry_wait() {
        let h = harness(FakeUpdater::ok());
        let job = claimed_job(&h.store, rows(3)).await;
        h.store.fail_next_fetches(u32::MAX);
        let cancel = CancellationToken::new();

        // Fires inside the first 500ms backoff.
        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                cancel.cancel();
            })
        };
        let run = h.pipeline.process(&job, &cancel).await;
        canceller.await.unwrap();

        assert_matches!(run.outcome, RunOutcome::Cancelled);
        assert_eq!(h.store.fetch_calls(), 1);
    }

    #[tokio::test]
    async fn progress_is_monotonic_and_addressed_to_owner() {
        let h = harness(FakeUpdater::ok());
        let job = claimed_job(&h.store, rows(7)).await;

        h.pipeline.process(&job, &CancellationToken::new()).await;

        let updates = h.progress.updates.lock().unwrap();
        assert_eq!(updates.len(), 7);
        assert!(updates.iter().all(|(owner, _)| *owner == 42));
        let processed: Vec<i64> = updates.iter().map(|(_, u)| u.processed_rows).collect();
        assert_eq!(processed, (1..=7).collect::<Vec<_>>());
        for (_, u) in updates.iter() {
            assert_eq!(u.success_count + u.error_count, u.processed_rows);
            assert_eq!(u.progress, Some(u.processed_rows as f64 / 7.0 * 100.0));
        }
    }

    #[tokio::test]
    async fn checkpoints_follow_the_configured_cadence() {
        let h = harness(FakeUpdater::ok());
        let job = claimed_job(&h.store, rows(12)).await;

        h.pipeline.process(&job, &CancellationToken::new()).await;

        // Rows 5 and 10, then the remainder at the end.
        assert_eq!(h.store.checkpoint_calls(), 3);
        assert_eq!(h.store.job(job.id).unwrap().processed_rows, 12);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_checkpoints_do_not_stop_processing() {
        let h = harness(FakeUpdater::ok());
        let job = claimed_job(&h.store, rows(10)).await;
        h.store.fail_next_checkpoints(CHECKPOINT_ATTEMPTS);

        let run = h.pipeline.process(&job, &CancellationToken::new()).await;

        assert_matches!(run.outcome, RunOutcome::Completed);
        assert_eq!(run.counters.processed_rows, 10);
        // Three failed attempts at row 5, one success at row 10.
        assert_eq!(h.store.checkpoint_calls(), CHECKPOINT_ATTEMPTS + 1);
        assert_eq!(h.store.job(job.id).unwrap().processed_rows, 10);
    }

    #[tokio::test]
    async fn stored_failures_are_capped_but_counts_stay_exact() {
        let config = PipelineConfig {
            checkpoint_every: 100,
            ..Default::default()
        };
        let h = harness_with(FakeUpdater::ok(), config);
        let input: Vec<RowCells> = (0..505).map(|_| RowCells::new()).collect();
        let job = claimed_job(&h.store, input).await;

        let run = h.pipeline.process(&job, &CancellationToken::new()).await;

        assert_eq!(run.counters.processed_rows, 505);
        assert_eq!(run.counters.error_count, 505);
        assert_eq!(
            run.counters.error_details.len(),
            bulkedit_core::failures::MAX_STORED_FAILURES
        );
        assert_eq!(h.updater.call_count(), 0);
    }
}
