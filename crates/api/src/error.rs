//! API error envelope
//!
//! Every failure reply carries an endpoint-specific code plus, when the
//! endpoint code maps deterministically onto the closed taxonomy, the
//! normalized `{ code, retryable }` pair. Rate-limited replies always carry
//! a `Retry-After` hint.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use bucketd_core::errors::{classify, NormalizedCode, DEFAULT_RETRY_AFTER_SECS};
use bucketd_core::repo::RepoError;
use bucketd_engine::EngineError;
use bucketd_jobs::ValidationError;
use bucketd_uploads::UploadError;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub normalized: Option<NormalizedCode>,
    pub retry_after: Option<u32>,
    pub details: Option<Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
            normalized: None,
            retry_after: None,
            details: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
            .with_normalized(NormalizedCode::NotFound)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "conflict", message)
            .with_normalized(NormalizedCode::Conflict)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }

    pub fn queue_full() -> Self {
        Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            "job_queue_full",
            "job queue is full; try again later",
        )
        .with_normalized(NormalizedCode::RateLimited)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, "rate_limited", message)
            .with_normalized(NormalizedCode::RateLimited)
    }

    pub fn with_normalized(mut self, code: NormalizedCode) -> Self {
        self.normalized = Some(code);
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut error = json!({
            "code": self.code,
            "message": self.message,
        });
        if let Some(normalized) = self.normalized {
            error["normalizedError"] = json!({
                "code": normalized.as_str(),
                "retryable": normalized.retryable(),
            });
        }
        if let Some(details) = self.details {
            error["details"] = details;
        }

        let mut response = (self.status, Json(json!({ "error": error }))).into_response();

        // rate_limited replies carry a conservative Retry-After when the
        // upstream did not provide one.
        let retry_after = self.retry_after.or_else(|| {
            (self.normalized == Some(NormalizedCode::RateLimited))
                .then_some(DEFAULT_RETRY_AFTER_SECS)
        });
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<RepoError> for ApiError {
    fn from(e: RepoError) -> Self {
        match e {
            RepoError::NotFound => ApiError::not_found("resource not found"),
            RepoError::Conflict(msg) => ApiError::conflict(msg),
            RepoError::InvalidInput(msg) => ApiError::bad_request(msg),
            RepoError::Database(e) => {
                tracing::error!("Database error: {}", e);
                ApiError::internal("database error")
            }
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        match e {
            ValidationError::UnsupportedType(tag) => {
                ApiError::bad_request(format!("unsupported job type: {}", tag))
            }
            ValidationError::IndexJobActive => ApiError::conflict(e.to_string()),
            ValidationError::Database(e) => e.into(),
            other => ApiError::bad_request(other.to_string()),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        let message = e.to_string();
        match &e {
            EngineError::Missing { .. } => {
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "engine_missing", message)
                    .with_normalized(NormalizedCode::InvalidConfig)
            }
            EngineError::Incompatible { .. } => ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "engine_incompatible",
                message,
            )
            .with_normalized(NormalizedCode::InvalidConfig),
            EngineError::Canceled => {
                ApiError::new(StatusCode::BAD_GATEWAY, "canceled", message)
                    .with_normalized(NormalizedCode::Canceled)
            }
            _ => ApiError::new(StatusCode::BAD_GATEWAY, "engine_error", message)
                .with_normalized(e.normalized()),
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(e: UploadError) -> Self {
        match e {
            UploadError::NotFound => ApiError::not_found("upload session not found"),
            UploadError::Expired => {
                ApiError::new(StatusCode::GONE, "expired", "upload session expired")
            }
            UploadError::TooLarge => ApiError::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                "too_large",
                "session byte budget exceeded",
            ),
            UploadError::WrongMode { expected } => {
                ApiError::bad_request(format!("operation requires {} mode", expected))
            }
            UploadError::InvalidPath(msg) | UploadError::InvalidRequest(msg) => {
                ApiError::bad_request(msg)
            }
            UploadError::UnsupportedProvider(p) => ApiError::bad_request(format!(
                "presigned and multipart uploads require an S3-compatible profile (got {})",
                p
            )),
            UploadError::Conflict(msg) => ApiError::conflict(msg),
            UploadError::QueueFull => ApiError::queue_full(),
            UploadError::Upstream(msg) => {
                let normalized = classify(&msg, "");
                ApiError::new(StatusCode::BAD_GATEWAY, "upstream_error", msg)
                    .with_normalized(normalized)
            }
            UploadError::Engine(e) => e.into(),
            UploadError::Repo(e) => e.into(),
            UploadError::Io(e) => {
                tracing::error!("Upload IO error: {}", e);
                ApiError::internal("upload IO error")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_full_is_429_with_retry_hint() {
        let err = ApiError::queue_full();
        assert_eq!(err.status, StatusCode::TOO_MANY_REQUESTS);
        let response = err.into_response();
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            &HeaderValue::from_static("2")
        );
    }

    #[test]
    fn upload_errors_map_to_expected_statuses() {
        let cases: Vec<(UploadError, StatusCode, &str)> = vec![
            (UploadError::NotFound, StatusCode::NOT_FOUND, "not_found"),
            (UploadError::Expired, StatusCode::GONE, "expired"),
            (UploadError::TooLarge, StatusCode::PAYLOAD_TOO_LARGE, "too_large"),
            (UploadError::QueueFull, StatusCode::TOO_MANY_REQUESTS, "job_queue_full"),
        ];
        for (error, status, code) in cases {
            let api: ApiError = error.into();
            assert_eq!(api.status, status);
            assert_eq!(api.code, code);
        }
    }

    #[test]
    fn upstream_errors_carry_a_classification() {
        let api: ApiError = UploadError::Upstream("AccessDenied: nope".into()).into();
        assert_eq!(api.normalized, Some(NormalizedCode::AccessDenied));
    }
}
