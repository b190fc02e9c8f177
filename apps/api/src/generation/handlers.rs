//! Axum route handlers for the generation API.
//!
//! Handlers never wait on generation: start returns once the record exists,
//! status and result are plain reads of the store.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use crate::errors::AppError;
use crate::generation::job::{
    GenerationStatus, JobKey, JobKind, ResultResponse, StartResponse, StatusResponse,
};
use crate::state::AppState;

fn parse_key(job_kind: &str, subject_id: String) -> Result<JobKey, AppError> {
    let job_kind = JobKind::parse(job_kind).ok_or_else(|| {
        AppError::Validation(format!(
            "unknown job kind '{job_kind}' (expected one of: {})",
            JobKind::ALL.map(|k| k.as_str()).join(", ")
        ))
    })?;
    let key = JobKey::new(subject_id, job_kind);
    key.validate().map_err(AppError::Validation)?;
    Ok(key)
}

/// POST /generate/:job_kind/:subject_id
///
/// Starts a new attempt, or joins the one already in flight. Always 202.
pub async fn handle_start(
    State(state): State<AppState>,
    Path((job_kind, subject_id)): Path<(String, String)>,
) -> Result<(StatusCode, Json<StartResponse>), AppError> {
    let key = parse_key(&job_kind, subject_id)?;
    let outcome = state.worker.start(&key).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(StartResponse {
            generation_id: outcome.job.generation_id,
            status: outcome.job.status.into(),
            joined: outcome.joined,
            updated_at: outcome.job.updated_at,
        }),
    ))
}

/// GET /generate/:job_kind/:subject_id/status
pub async fn handle_status(
    State(state): State<AppState>,
    Path((job_kind, subject_id)): Path<(String, String)>,
) -> Result<Json<StatusResponse>, AppError> {
    let key = parse_key(&job_kind, subject_id)?;
    let status = match state.worker.store().get_status(&key).await? {
        Some(job) => StatusResponse::from(&job),
        None => StatusResponse::not_found(),
    };
    Ok(Json(status))
}

/// GET /generate/:job_kind/:subject_id/result
///
/// 404 when nothing was ever generated, 409 while the latest attempt is not completed.
pub async fn handle_result(
    State(state): State<AppState>,
    Path((job_kind, subject_id)): Path<(String, String)>,
) -> Result<Json<ResultResponse>, AppError> {
    let key = parse_key(&job_kind, subject_id)?;
    let job = state
        .worker
        .store()
        .get_status(&key)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("No generation found for {key}")))?;

    match (job.status, job.result) {
        (GenerationStatus::Completed, Some(result)) => Ok(Json(ResultResponse {
            generation_id: job.generation_id,
            job_kind: job.job_kind,
            result,
            updated_at: job.updated_at,
        })),
        (status, _) => Err(AppError::Conflict(format!(
            "Generation {} for {key} is {status}",
            job.generation_id
        ))),
    }
}
