//! Paginated remote listing, delegated to the engine's JSON output

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use bucketd_engine::{ListEntry, RemoteContext};

use crate::error::ApiError;
use crate::{resolve_profile, AppState};

const DEFAULT_MAX_KEYS: usize = 1000;

#[derive(Debug, Deserialize)]
pub struct ListObjectsQuery {
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default, rename = "maxKeys")]
    pub max_keys: Option<usize>,
    #[serde(default, rename = "continuationToken")]
    pub continuation_token: Option<String>,
}

pub async fn list_objects(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
    headers: HeaderMap,
    Query(query): Query<ListObjectsQuery>,
) -> Result<Json<Value>, ApiError> {
    let profile = resolve_profile(&state, &headers).await?;
    if bucket.trim().is_empty() {
        return Err(ApiError::bad_request("bucket is required"));
    }
    let prefix = query
        .prefix
        .as_deref()
        .unwrap_or("")
        .trim_start_matches('/');
    let max_keys = query.max_keys.unwrap_or(DEFAULT_MAX_KEYS).clamp(1, 10_000);

    let rc = RemoteContext::prepare(&state.config.engine_tmp_root(), &profile)?;
    let page = bucketd_engine::listing::list_page(
        &state.engine,
        rc,
        &bucket,
        prefix,
        query.continuation_token.as_deref(),
        max_keys,
    )
    .await?;

    let entries: Vec<Value> = page
        .entries
        .iter()
        .map(|entry| match entry {
            ListEntry::Prefix(p) => json!({ "type": "prefix", "prefix": p }),
            ListEntry::Object(o) => json!({
                "type": "object",
                "key": o.key,
                "size": o.size,
                "etag": o.etag,
                "lastModified": o.last_modified,
            }),
        })
        .collect();

    Ok(Json(json!({
        "bucket": bucket,
        "prefix": prefix,
        "entries": entries,
        "isTruncated": page.is_truncated,
        "nextContinuationToken": page.next_token,
    })))
}
