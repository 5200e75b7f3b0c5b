//! Upload session endpoints
//!
//! Bodies arrive either as multipart/form-data (one field per file, the
//! field's filename is its session-relative path) or as a raw body tagged
//! with the chunk headers:
//! `X-Upload-Relative-Path`, `X-Upload-Chunk-Index`, `X-Upload-Chunk-Total`,
//! `X-Upload-Chunk-Size`, `X-Upload-File-Size`.
//! Replies carry `X-Upload-Skipped` with the count of parts rejected as
//! unsafe paths.

use axum::extract::{FromRequest, Multipart, Path, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use bucketd_uploads::multipart::{CompletedPartInput, PresignRequest};
use bucketd_uploads::{CommitManifest, CreateSessionInput, UploadError};

use crate::error::ApiError;
use crate::{resolve_profile, AppState};

const H_RELATIVE_PATH: &str = "x-upload-relative-path";
const H_CHUNK_INDEX: &str = "x-upload-chunk-index";
const H_CHUNK_TOTAL: &str = "x-upload-chunk-total";
const H_CHUNK_SIZE: &str = "x-upload-chunk-size";
const H_FILE_SIZE: &str = "x-upload-file-size";
const H_SKIPPED: &str = "x-upload-skipped";

pub async fn create_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(input): Json<CreateSessionInput>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let profile = resolve_profile(&state, &headers).await?;
    let session = state.uploads.create_session(&profile, input).await?;
    Ok((StatusCode::CREATED, Json(json!({ "session": session }))))
}

pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    state.uploads.delete_session(id).await?;
    Ok(Json(json!({ "deleted": true })))
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)?
        .to_str()
        .ok()
        .and_then(|v| v.parse().ok())
}

/// POST /api/uploads/{id}/files — multipart form or raw chunked body
pub async fn ingest(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    request: Request,
) -> Result<Response, ApiError> {
    let headers = request.headers().clone();
    let is_form = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with("multipart/form-data"))
        .unwrap_or(false);

    let (accepted, skipped) = if is_form {
        ingest_form(&state, id, request).await?
    } else {
        ingest_raw(&state, id, &headers, request).await?
    };

    let mut response =
        Json(json!({ "accepted": accepted, "skipped": skipped })).into_response();
    if let Ok(value) = skipped.to_string().parse() {
        response.headers_mut().insert(H_SKIPPED, value);
    }
    Ok(response)
}

async fn ingest_form(
    state: &AppState,
    id: Uuid,
    request: Request,
) -> Result<(u32, u32), ApiError> {
    let mut form = Multipart::from_request(request, &())
        .await
        .map_err(|e| ApiError::bad_request(format!("bad multipart body: {}", e)))?;

    let mut accepted = 0u32;
    let mut skipped = 0u32;
    while let Some(field) = form
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("bad multipart field: {}", e)))?
    {
        let rel_path = field
            .file_name()
            .or_else(|| field.name())
            .unwrap_or_default()
            .to_string();
        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(format!("failed to read field body: {}", e)))?;

        match state.uploads.ingest_file(id, &rel_path, data).await {
            Ok(()) => accepted += 1,
            Err(UploadError::InvalidPath(reason)) => {
                tracing::warn!("Skipping unsafe upload path {:?}: {}", rel_path, reason);
                skipped += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok((accepted, skipped))
}

async fn ingest_raw(
    state: &AppState,
    id: Uuid,
    headers: &HeaderMap,
    request: Request,
) -> Result<(u32, u32), ApiError> {
    let rel_path = headers
        .get(H_RELATIVE_PATH)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::bad_request("X-Upload-Relative-Path header is required"))?
        .to_string();

    let data = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .map_err(|e| ApiError::bad_request(format!("failed to read body: {}", e)))?;

    let chunk_index = header_u64(headers, H_CHUNK_INDEX);
    let chunk_total = header_u64(headers, H_CHUNK_TOTAL);

    let result = match (chunk_index, chunk_total) {
        (Some(index), Some(total)) => {
            let chunk_size = header_u64(headers, H_CHUNK_SIZE).unwrap_or(data.len() as u64);
            let file_size = header_u64(headers, H_FILE_SIZE).unwrap_or(0);
            state
                .uploads
                .ingest_chunk(
                    id,
                    &rel_path,
                    index as u32,
                    total as u32,
                    chunk_size as i64,
                    file_size as i64,
                    data,
                )
                .await
        }
        _ => state.uploads.ingest_file(id, &rel_path, data).await,
    };

    match result {
        Ok(()) => Ok((1, 0)),
        Err(UploadError::InvalidPath(reason)) => {
            tracing::warn!("Skipping unsafe upload path {:?}: {}", rel_path, reason);
            Ok((0, 1))
        }
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Deserialize)]
pub struct ChunkStateQuery {
    pub path: String,
    pub total: u32,
    #[serde(rename = "chunkSize")]
    pub chunk_size: u64,
    #[serde(rename = "fileSize")]
    pub file_size: u64,
}

pub async fn chunk_state(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<ChunkStateQuery>,
) -> Result<Json<Value>, ApiError> {
    let present = state
        .uploads
        .chunk_state(id, &query.path, query.total, query.chunk_size, query.file_size)
        .await?;
    Ok(Json(json!({ "path": query.path, "present": present })))
}

pub async fn presign(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<PresignRequest>,
) -> Result<Json<Value>, ApiError> {
    let response = state.uploads.presign(id, request).await?;
    Ok(Json(json!(response)))
}

#[derive(Debug, Deserialize)]
pub struct MultipartActionInput {
    pub path: String,
    #[serde(default)]
    pub parts: Vec<CompletedPartInput>,
}

pub async fn complete_multipart(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(input): Json<MultipartActionInput>,
) -> Result<Json<Value>, ApiError> {
    state
        .uploads
        .complete_multipart(id, &input.path, input.parts)
        .await?;
    Ok(Json(json!({ "completed": true })))
}

pub async fn abort_multipart(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(input): Json<MultipartActionInput>,
) -> Result<Json<Value>, ApiError> {
    state.uploads.abort_multipart(id, &input.path).await?;
    Ok(Json(json!({ "aborted": true })))
}

pub async fn commit(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    manifest: Option<Json<CommitManifest>>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let manifest = manifest.map(|Json(m)| m).unwrap_or_default();
    let outcome = state.uploads.commit(id, manifest).await?;
    Ok((StatusCode::ACCEPTED, Json(json!(outcome))))
}
