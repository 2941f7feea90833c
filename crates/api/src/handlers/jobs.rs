//! Handlers for the `/jobs` resource.
//!
//! All endpoints require authentication via [`AuthUser`]; callers only
//! ever see their own jobs.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use bulkedit_core::types::DbId;
use bulkedit_db::models::job::{JobListQuery, SubmitJob};

use crate::error::AppResult;
use crate::middleware::auth::AuthUser;
use crate::response::DataResponse;
use crate::state::AppState;

/// POST /api/v1/jobs
///
/// Validate and queue a bulk update job. Returns 201 with the pending job.
pub async fn submit_job(
    auth: AuthUser,
    State(state): State<AppState>,
    Json(input): Json<SubmitJob>,
) -> AppResult<impl IntoResponse> {
    let job = state.dispatcher.enqueue(auth.user_id, input).await?;
    Ok((StatusCode::CREATED, Json(DataResponse { data: job })))
}

/// GET /api/v1/jobs
pub async fn list_jobs(
    auth: AuthUser,
    State(state): State<AppState>,
    Query(params): Query<JobListQuery>,
) -> AppResult<impl IntoResponse> {
    let jobs = state.dispatcher.list_jobs(auth.user_id, &params).await?;
    Ok(Json(DataResponse { data: jobs }))
}

/// GET /api/v1/jobs/{id}
pub async fn get_job(
    auth: AuthUser,
    State(state): State<AppState>,
    Path(job_id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    let job = state.dispatcher.get_job(job_id, auth.user_id).await?;
    Ok(Json(DataResponse { data: job }))
}

/// POST /api/v1/jobs/{id}/cancel
///
/// Cancellation is cooperative: 202 means the running job was asked to
/// stop; it is finalized as failed once the current row is done.
pub async fn cancel_job(
    auth: AuthUser,
    State(state): State<AppState>,
    Path(job_id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    state.dispatcher.cancel_job(job_id, auth.user_id).await?;
    Ok(StatusCode::ACCEPTED)
}
