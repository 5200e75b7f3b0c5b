//! Profile CRUD and the connectivity probe
//!
//! Deleting a profile cascades: running jobs are canceled, job rows with
//! their logs and artifacts are purged, upload sessions (and their upstream
//! multiparts) are torn down, and the index slice is dropped, before the
//! profile row itself goes.

use axum::extract::{Path, State};
use axum::response::Json;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use bucketd_core::repo;
use bucketd_jobs::retention;

use crate::error::ApiError;
use crate::AppState;

pub async fn list(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let profiles = repo::list_profiles(&state.pool).await?;
    Ok(Json(json!({ "profiles": profiles })))
}

pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(input): Json<bucketd_core::models::CreateProfileInput>,
) -> Result<Json<Value>, ApiError> {
    let profile = repo::create_profile(&state.pool, &input).await?;
    tracing::info!("Created profile {} ({})", profile.name, profile.id);
    Ok(Json(json!({ "profile": profile })))
}

pub async fn fetch(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let profile = repo::get_profile(&state.pool, id).await?;
    Ok(Json(json!({ "profile": profile })))
}

pub async fn update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(input): Json<bucketd_core::models::UpdateProfileInput>,
) -> Result<Json<Value>, ApiError> {
    let profile = repo::update_profile(&state.pool, id, &input).await?;
    Ok(Json(json!({ "profile": profile })))
}

pub async fn delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    // Existence check up front so the cascade can't half-run on a bad id.
    repo::get_profile(&state.pool, id).await?;

    for job_id in repo::list_active_job_ids_for_profile(&state.pool, id).await? {
        if let Err(e) = state.manager.cancel(job_id).await {
            tracing::warn!("Cascade cancel of job {} failed: {}", job_id, e);
        }
    }

    state
        .uploads
        .purge_profile_sessions(id)
        .await
        .map_err(ApiError::from)?;
    let purged = retention::purge_profile_jobs(&state.pool, &state.config, id).await?;
    repo::clear_index_for_profile(&state.pool, id).await?;
    repo::delete_profile_row(&state.pool, id).await?;

    tracing::info!("Deleted profile {} ({} jobs purged)", id, purged.len());
    Ok(Json(json!({ "deleted": true, "jobsPurged": purged.len() })))
}

/// POST /api/profiles/{id}/test — in-band engine probe of the remote
pub async fn test_connectivity(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let profile = repo::get_profile(&state.pool, id).await?;
    let details = state.manager.test_connectivity(&profile).await?;
    Ok(Json(details))
}
