//! Job endpoints: create/enqueue, list, cancel, retry, logs, artifacts

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use bucketd_core::events::EventType;
use bucketd_core::models::{CreateJobInput, Job, JobStatus};
use bucketd_core::repo;
use bucketd_jobs::types::{self, TYPE_DIRECT_UPLOAD};

use crate::error::ApiError;
use crate::{resolve_profile, AppState};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(
            serde_json::from_value::<JobStatus>(json!(raw))
                .map_err(|_| ApiError::bad_request(format!("unknown status: {}", raw)))?,
        ),
    };
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    let jobs = repo::list_jobs(&state.pool, status, limit).await?;
    Ok(Json(json!({ "jobs": jobs })))
}

pub async fn queue_stats(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!(state.manager.queue_stats()))
}

pub async fn fetch(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let job = repo::get_job(&state.pool, id).await?;
    Ok(Json(json!({ "job": job })))
}

/// POST /api/jobs — validate, persist, announce, enqueue
pub async fn create(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(input): Json<CreateJobInput>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let profile = resolve_profile(&state, &headers).await?;

    if !state.manager.is_supported_job_type(&input.job_type) {
        return Err(ApiError::bad_request(format!(
            "unsupported job type: {}",
            input.job_type
        )));
    }
    if input.job_type == TYPE_DIRECT_UPLOAD {
        // Synthetic records are produced by upload commits only.
        return Err(ApiError::bad_request(
            "transfer.direct.upload jobs are created by upload commits",
        ));
    }

    let payload = types::normalize_payload(&input.job_type, &input.payload)?;
    types::check_exclusivity(&state.pool, profile.id, &input.job_type, &payload).await?;

    let job = repo::insert_job(
        &state.pool,
        Uuid::new_v4(),
        profile.id,
        &input.job_type,
        &payload,
    )
    .await?;
    state.hub.publish(
        EventType::JobCreated,
        Some(job.id),
        serde_json::to_value(&job).unwrap_or_default(),
    );

    let job = enqueue_or_fail(&state, job).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "job": job }))))
}

pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let outcome = state.manager.cancel(id).await?;
    Ok(Json(json!({ "outcome": outcome })))
}

/// POST /api/jobs/{id}/retry — user-driven retry. Replays the stored
/// (already canonical) payload through a fresh validation pass into a new
/// job.
pub async fn retry(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let prior = repo::get_job(&state.pool, id).await?;
    if !prior.status.is_terminal() {
        return Err(ApiError::conflict("job is not terminal; cancel it first"));
    }
    if prior.job_type == TYPE_DIRECT_UPLOAD {
        return Err(ApiError::bad_request("direct upload records cannot be retried"));
    }

    let payload = types::normalize_payload(&prior.job_type, &prior.payload)?;
    types::check_exclusivity(&state.pool, prior.profile_id, &prior.job_type, &payload).await?;

    let job = repo::insert_job(
        &state.pool,
        Uuid::new_v4(),
        prior.profile_id,
        &prior.job_type,
        &payload,
    )
    .await?;
    state.hub.publish(
        EventType::JobCreated,
        Some(job.id),
        serde_json::to_value(&job).unwrap_or_default(),
    );

    let job = enqueue_or_fail(&state, job).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "job": job, "retriedFrom": id }))))
}

/// Queue saturation is never swallowed: the row is marked failed, the
/// completion event pairs with the creation event, and the caller gets a
/// 429 with a Retry-After hint.
async fn enqueue_or_fail(state: &AppState, job: Job) -> Result<Job, ApiError> {
    match state.manager.enqueue(job.id) {
        Ok(()) => Ok(job),
        Err(e) => {
            tracing::warn!("Enqueue of job {} failed: {}", job.id, e);
            let _ = repo::mark_job_terminal(
                &state.pool,
                job.id,
                JobStatus::Failed,
                Some("job queue is full; try again later"),
                Some("job_queue_full"),
            )
            .await;
            if let Ok(failed) = repo::get_job(&state.pool, job.id).await {
                state.hub.publish(
                    EventType::JobCompleted,
                    Some(failed.id),
                    serde_json::to_value(&failed).unwrap_or_default(),
                );
            }
            Err(ApiError::queue_full())
        }
    }
}

pub async fn log(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    repo::get_job(&state.pool, id).await?;
    let path = state.config.job_log_path(id);
    let body = tokio::fs::read_to_string(&path)
        .await
        .map_err(|_| ApiError::not_found("no log captured for this job"))?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response())
}

pub async fn artifact(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    repo::get_job(&state.pool, id).await?;
    let path = state.config.artifact_path(id);
    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("no artifact for this job"))?;

    let disposition = format!("attachment; filename=\"{}.zip\"", id);
    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}
