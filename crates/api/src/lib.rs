//! HTTP+JSON surface for bucketd
//!
//! Routing, request identity (the `X-Profile-Id` header), the realtime
//! endpoints, and the error envelope live here; all business logic is in
//! the core/jobs/uploads/engine crates.

pub mod error;
pub mod events;
pub mod index;
pub mod jobs;
pub mod listing;
pub mod middleware;
pub mod profiles;
pub mod uploads;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::HeaderMap;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use bucketd_core::config::AppConfig;
use bucketd_core::events::EventHub;
use bucketd_core::models::Profile;
use bucketd_core::repo;
use bucketd_engine::Engine;
use bucketd_jobs::JobManager;
use bucketd_uploads::UploadService;

use crate::error::ApiError;

/// Header carrying the per-request profile identity
pub const PROFILE_HEADER: &str = "x-profile-id";

pub struct AppState {
    pub pool: sqlx::SqlitePool,
    pub config: AppConfig,
    pub hub: Arc<EventHub>,
    pub manager: Arc<JobManager>,
    pub uploads: Arc<UploadService>,
    pub engine: Engine,
    pub upload_gate: Arc<Semaphore>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let upload_routes = Router::new()
        .route("/api/uploads", post(uploads::create_session))
        .route(
            "/api/uploads/{id}",
            axum::routing::delete(uploads::delete_session),
        )
        .route("/api/uploads/{id}/files", post(uploads::ingest))
        .route("/api/uploads/{id}/chunk-state", get(uploads::chunk_state))
        .route("/api/uploads/{id}/presign", post(uploads::presign))
        .route(
            "/api/uploads/{id}/multipart/complete",
            post(uploads::complete_multipart),
        )
        .route(
            "/api/uploads/{id}/multipart/abort",
            post(uploads::abort_multipart),
        )
        .route("/api/uploads/{id}/commit", post(uploads::commit))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::upload_gate,
        ))
        .layer(DefaultBodyLimit::disable());

    Router::new()
        .route("/api/meta", get(meta))
        .route("/api/profiles", get(profiles::list).post(profiles::create))
        .route(
            "/api/profiles/{id}",
            get(profiles::fetch)
                .put(profiles::update)
                .delete(profiles::delete),
        )
        .route("/api/profiles/{id}/test", post(profiles::test_connectivity))
        .route("/api/jobs", get(jobs::list).post(jobs::create))
        .route("/api/jobs/queue/stats", get(jobs::queue_stats))
        .route("/api/jobs/{id}", get(jobs::fetch))
        .route("/api/jobs/{id}/cancel", post(jobs::cancel))
        .route("/api/jobs/{id}/retry", post(jobs::retry))
        .route("/api/jobs/{id}/log", get(jobs::log))
        .route("/api/jobs/{id}/artifact", get(jobs::artifact))
        .route("/api/buckets/{bucket}/objects", get(listing::list_objects))
        .route("/api/index/{bucket}/search", get(index::search))
        .route("/api/index/{bucket}/summary", get(index::summary))
        .route("/api/events/sse", get(events::sse))
        .route("/api/events/ws", get(events::ws))
        .merge(upload_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Parse the profile header. Operations that need no profile skip this.
pub(crate) fn require_profile_id(headers: &HeaderMap) -> Result<Uuid, ApiError> {
    let raw = headers
        .get(PROFILE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::bad_request("X-Profile-Id header is required"))?;
    Uuid::parse_str(raw)
        .map_err(|_| ApiError::bad_request("X-Profile-Id header is not a valid UUID"))
}

/// Resolve the request's profile to its stored credentials.
pub(crate) async fn resolve_profile(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Profile, ApiError> {
    let profile_id = require_profile_id(headers)?;
    repo::get_profile(&state.pool, profile_id)
        .await
        .map_err(|_| ApiError::not_found("profile not found"))
}

/// GET /api/meta — daemon, engine, and store health
async fn meta(State(state): State<Arc<AppState>>) -> Json<Value> {
    let engine = match state.engine.verify_version().await {
        Ok(version) => json!({ "binary": state.engine.binary(), "version": version, "ok": true }),
        Err(e) => json!({ "binary": state.engine.binary(), "ok": false, "error": e.to_string() }),
    };

    // Store ping is bounded so a wedged database can't hang the probe.
    let store_ok = tokio::time::timeout(
        Duration::from_secs(2),
        sqlx::query("SELECT 1").execute(&state.pool),
    )
    .await
    .map(|r| r.is_ok())
    .unwrap_or(false);

    Json(json!({
        "name": "bucketd",
        "version": env!("CARGO_PKG_VERSION"),
        "engine": engine,
        "store": { "ok": store_ok },
        "queue": state.manager.queue_stats(),
    }))
}
