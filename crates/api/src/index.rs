//! Object index search and summary
//!
//! Searching a bucket that has never been indexed is a contract failure
//! (`not_indexed`), never a silent fallback to live listing.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use bucketd_core::models::IndexQuery;
use bucketd_core::repo;

use crate::error::ApiError;
use crate::{resolve_profile, AppState};

fn not_indexed(bucket: &str) -> ApiError {
    ApiError::new(
        StatusCode::NOT_FOUND,
        "not_indexed",
        format!("bucket '{}' has not been indexed; run an index job first", bucket),
    )
}

pub async fn search(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
    headers: HeaderMap,
    Query(query): Query<IndexQuery>,
) -> Result<Json<Value>, ApiError> {
    let profile = resolve_profile(&state, &headers).await?;

    if !repo::bucket_is_indexed(&state.pool, profile.id, &bucket).await? {
        return Err(not_indexed(&bucket));
    }

    let (entries, next_cursor) = repo::search_index(&state.pool, profile.id, &bucket, &query).await?;
    Ok(Json(json!({
        "bucket": bucket,
        "entries": entries,
        "nextCursor": next_cursor,
    })))
}

#[derive(Debug, Deserialize)]
pub struct SummaryQuery {
    #[serde(default)]
    pub samples: Option<i64>,
}

pub async fn summary(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
    headers: HeaderMap,
    Query(query): Query<SummaryQuery>,
) -> Result<Json<Value>, ApiError> {
    let profile = resolve_profile(&state, &headers).await?;

    if !repo::bucket_is_indexed(&state.pool, profile.id, &bucket).await? {
        return Err(not_indexed(&bucket));
    }

    let summary = repo::index_summary(&state.pool, profile.id, &bucket).await?;
    let samples = match query.samples {
        Some(n) if n > 0 => {
            repo::index_samples(&state.pool, profile.id, &bucket, n.min(100)).await?
        }
        _ => Vec::new(),
    };

    Ok(Json(json!({
        "bucket": bucket,
        "objects": summary.objects,
        "totalSize": summary.total_size,
        "lastIndexedAt": summary.last_indexed_at,
        "samples": samples,
    })))
}
