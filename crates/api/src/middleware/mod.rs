//! API middleware
//!
//! The upload concurrency gate bounds how many requests may hold an upload
//! slot at once. Over-budget callers get a rate-limited reply with a
//! `Retry-After` hint instead of queuing behind the semaphore.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;

use crate::error::ApiError;
use crate::AppState;

pub async fn upload_gate(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    match state.upload_gate.clone().try_acquire_owned() {
        Ok(_permit) => {
            // The permit is held for the duration of the request.
            next.run(request).await
        }
        Err(_) => {
            tracing::warn!("Upload concurrency gate saturated");
            ApiError::rate_limited("too many concurrent upload requests").into_response()
        }
    }
}
