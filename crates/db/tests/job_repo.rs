//! Integration tests for `JobRepo` against a real Postgres database.
//!
//! Run with `DATABASE_URL` pointing at a disposable database:
//! `cargo test -p bulkedit-db -- --ignored`.

use bulkedit_core::fields::{DateOrder, FieldSpec, NumberLocale};
use bulkedit_core::mapping::{ColumnMapping, JobMapping};
use bulkedit_db::models::job::{JobCounters, JobListQuery, NewJob, RowCells};
use bulkedit_db::models::status::JobStatus;
use bulkedit_db::repositories::JobRepo;
use sqlx::PgPool;

fn new_job(owner_id: i64, title: &str, rows: usize) -> NewJob {
    NewJob {
        owner_id,
        title: title.to_string(),
        row_source_ref: "upload.xlsx".to_string(),
        mapping: JobMapping {
            id_column: "Task ID".into(),
            columns: vec![ColumnMapping {
                column: "Notes".into(),
                field_id: "fld-notes".into(),
                field: FieldSpec::Text,
            }],
            locale: NumberLocale::En,
            date_order: DateOrder::Mdy,
        },
        rows: (0..rows)
            .map(|i| {
                RowCells::from([
                    ("Task ID".to_string(), format!("task-{i}")),
                    ("Notes".to_string(), format!("note {i}")),
                ])
            })
            .collect(),
    }
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn insert_persists_pending_job_and_rows(pool: PgPool) {
    let job = JobRepo::insert_with_rows(&pool, &new_job(1, "a", 3)).await.unwrap();

    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.total_rows, 3);
    assert_eq!(job.processed_rows, 0);

    let rows = JobRepo::fetch_rows(&pool, job.id, 1, 10).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].row_index, 1);
    assert_eq!(rows[0].cells.0["Task ID"], "task-1");
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn claim_next_is_fifo_and_exclusive(pool: PgPool) {
    let a = JobRepo::insert_with_rows(&pool, &new_job(1, "a", 1)).await.unwrap();
    let b = JobRepo::insert_with_rows(&pool, &new_job(1, "b", 1)).await.unwrap();

    let first = JobRepo::claim_next(&pool).await.unwrap().unwrap();
    assert_eq!(first.id, a.id);
    assert_eq!(first.status, JobStatus::Processing);

    let second = JobRepo::claim_next(&pool).await.unwrap().unwrap();
    assert_eq!(second.id, b.id);

    assert!(JobRepo::claim_next(&pool).await.unwrap().is_none());
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn checkpoint_and_finalize_only_apply_while_processing(pool: PgPool) {
    let job = JobRepo::insert_with_rows(&pool, &new_job(1, "a", 4)).await.unwrap();

    let counters = JobCounters {
        processed_rows: 2,
        success_count: 2,
        ..Default::default()
    };
    // Not claimed yet: nothing is written.
    assert!(!JobRepo::checkpoint(&pool, job.id, &counters).await.unwrap());

    JobRepo::claim_next(&pool).await.unwrap().unwrap();
    assert!(JobRepo::checkpoint(&pool, job.id, &counters).await.unwrap());

    let stale = JobCounters {
        processed_rows: 1,
        success_count: 1,
        ..Default::default()
    };
    assert!(!JobRepo::checkpoint(&pool, job.id, &stale).await.unwrap());

    let done = JobCounters {
        processed_rows: 4,
        success_count: 3,
        error_count: 1,
        ..Default::default()
    };
    assert!(JobRepo::complete(&pool, job.id, &done).await.unwrap());
    assert!(!JobRepo::fail(&pool, job.id, &done, "late").await.unwrap());

    let stored = JobRepo::find_by_id(&pool, job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert_eq!(stored.processed_rows, 4);
    assert!(stored.completed_at.is_some());
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn reset_processing_requeues_interrupted_jobs(pool: PgPool) {
    let job = JobRepo::insert_with_rows(&pool, &new_job(1, "a", 1)).await.unwrap();
    JobRepo::claim_next(&pool).await.unwrap().unwrap();

    assert_eq!(JobRepo::reset_processing(&pool).await.unwrap(), 1);

    let stored = JobRepo::find_by_id(&pool, job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Pending);
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn purge_keeps_most_recent_terminal_jobs(pool: PgPool) {
    let mut ids = Vec::new();
    for i in 0..3 {
        let job = JobRepo::insert_with_rows(&pool, &new_job(1, &format!("j{i}"), 1))
            .await
            .unwrap();
        JobRepo::claim_next(&pool).await.unwrap().unwrap();
        let counters = JobCounters {
            processed_rows: 1,
            success_count: 1,
            ..Default::default()
        };
        JobRepo::complete(&pool, job.id, &counters).await.unwrap();
        ids.push(job.id);
    }
    let pending = JobRepo::insert_with_rows(&pool, &new_job(1, "pending", 1))
        .await
        .unwrap();

    assert_eq!(JobRepo::purge_terminal_beyond(&pool, 2).await.unwrap(), 1);

    assert!(JobRepo::find_by_id(&pool, ids[0]).await.unwrap().is_none());
    assert!(JobRepo::find_by_id(&pool, ids[2]).await.unwrap().is_some());
    assert!(JobRepo::find_by_id(&pool, pending.id).await.unwrap().is_some());
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn list_by_owner_is_most_recent_first(pool: PgPool) {
    let a = JobRepo::insert_with_rows(&pool, &new_job(7, "a", 1)).await.unwrap();
    let b = JobRepo::insert_with_rows(&pool, &new_job(7, "b", 1)).await.unwrap();
    JobRepo::insert_with_rows(&pool, &new_job(8, "other", 1)).await.unwrap();

    let q = JobListQuery { limit: None, offset: None };
    let jobs = JobRepo::list_by_owner(&pool, 7, &q).await.unwrap();

    let ids: Vec<i64> = jobs.iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![b.id, a.id]);
}
