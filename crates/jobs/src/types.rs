//! Job type catalog and payload validation
//!
//! The type set is closed; unknown tags are rejected at creation. Each type
//! has a payload normalizer that trims whitespace, strips leading slashes
//! from keys, rejects NUL and wildcards, and coerces the payload to its
//! canonical form before it is persisted. Retry replays the stored payload
//! but re-validates it.

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use bucketd_core::repo::{self, RepoError};

pub const TYPE_SYNC_LOCAL_TO_REMOTE: &str = "transfer.sync.local_to_remote";
pub const TYPE_SYNC_REMOTE_TO_LOCAL: &str = "transfer.sync.remote_to_local";
pub const TYPE_SYNC_STAGING_TO_REMOTE: &str = "transfer.sync.staging_to_remote";
pub const TYPE_DELETE_PREFIX: &str = "transfer.delete.prefix";
pub const TYPE_COPY_OBJECT: &str = "transfer.copy.object";
pub const TYPE_COPY_BATCH: &str = "transfer.copy.batch";
pub const TYPE_COPY_PREFIX: &str = "transfer.copy.prefix";
pub const TYPE_MOVE_OBJECT: &str = "transfer.move.object";
pub const TYPE_MOVE_BATCH: &str = "transfer.move.batch";
pub const TYPE_MOVE_PREFIX: &str = "transfer.move.prefix";
pub const TYPE_ZIP_PREFIX: &str = "remote.zip.prefix";
pub const TYPE_ZIP_OBJECTS: &str = "remote.zip.objects";
pub const TYPE_DELETE_OBJECTS: &str = "remote.delete.objects";
pub const TYPE_INDEX_OBJECTS: &str = "remote.index.objects";
pub const TYPE_DIRECT_UPLOAD: &str = "transfer.direct.upload";

pub const SUPPORTED_JOB_TYPES: &[&str] = &[
    TYPE_SYNC_LOCAL_TO_REMOTE,
    TYPE_SYNC_REMOTE_TO_LOCAL,
    TYPE_SYNC_STAGING_TO_REMOTE,
    TYPE_DELETE_PREFIX,
    TYPE_COPY_OBJECT,
    TYPE_COPY_BATCH,
    TYPE_COPY_PREFIX,
    TYPE_MOVE_OBJECT,
    TYPE_MOVE_BATCH,
    TYPE_MOVE_PREFIX,
    TYPE_ZIP_PREFIX,
    TYPE_ZIP_OBJECTS,
    TYPE_DELETE_OBJECTS,
    TYPE_INDEX_OBJECTS,
    TYPE_DIRECT_UPLOAD,
];

/// Batch copy/move item limit
pub const COPY_BATCH_MAX: usize = 5_000;
/// Zip-objects key list limit
pub const ZIP_OBJECTS_MAX: usize = 10_000;
/// Batch delete limit; above this callers must use a prefix-delete job
pub const DELETE_OBJECTS_MAX: usize = 50_000;
/// Offending keys echoed on a partial batch failure
pub const PARTIAL_FAILURE_ECHO_MAX: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("unsupported job type: {0}")]
    UnsupportedType(String),
    #[error("invalid payload: {0}")]
    Invalid(String),
    #[error("{0}")]
    Limit(String),
    #[error("an index job is already queued or running for this bucket")]
    IndexJobActive,
    #[error("database error: {0}")]
    Database(#[from] RepoError),
}

pub fn is_supported_job_type(tag: &str) -> bool {
    SUPPORTED_JOB_TYPES.contains(&tag)
}

// ==================== Payloads ====================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncPayload {
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    /// Local directory (or staging directory for staging sync)
    pub local_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletePrefixPayload {
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default, rename = "allowUnsafePrefix")]
    pub allow_unsafe_prefix: bool,
    #[serde(default, rename = "deleteAll")]
    pub delete_all: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyObjectPayload {
    pub bucket: String,
    pub key: String,
    #[serde(rename = "destBucket")]
    pub dest_bucket: String,
    #[serde(rename = "destKey")]
    pub dest_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyBatchPayload {
    pub bucket: String,
    pub keys: Vec<String>,
    #[serde(rename = "destBucket")]
    pub dest_bucket: String,
    #[serde(default, rename = "destPrefix")]
    pub dest_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyPrefixPayload {
    pub bucket: String,
    pub prefix: String,
    #[serde(rename = "destBucket")]
    pub dest_bucket: String,
    #[serde(rename = "destPrefix")]
    pub dest_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZipPrefixPayload {
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZipObjectsPayload {
    pub bucket: String,
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteObjectsPayload {
    pub bucket: String,
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexObjectsPayload {
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default, rename = "fullReindex")]
    pub full_reindex: bool,
}

/// Synthetic terminal job recorded for completed direct/presigned uploads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectUploadPayload {
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub files: u64,
    #[serde(default)]
    pub bytes: u64,
    #[serde(default)]
    pub label: Option<String>,
}

// ==================== Normalization ====================

fn reject_forbidden(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.contains('\0') {
        return Err(ValidationError::Invalid(format!(
            "{} must not contain NUL",
            field
        )));
    }
    if value.contains('*') || value.contains('?') {
        return Err(ValidationError::Invalid(format!(
            "{} must not contain wildcards",
            field
        )));
    }
    Ok(())
}

fn normalize_bucket(bucket: &str) -> Result<String, ValidationError> {
    let bucket = bucket.trim();
    if bucket.is_empty() {
        return Err(ValidationError::Invalid("bucket is required".into()));
    }
    reject_forbidden("bucket", bucket)?;
    if bucket.contains('/') {
        return Err(ValidationError::Invalid(
            "bucket must not contain '/'".into(),
        ));
    }
    Ok(bucket.to_string())
}

fn normalize_key(field: &str, key: &str) -> Result<String, ValidationError> {
    let key = key.trim().trim_start_matches('/');
    reject_forbidden(field, key)?;
    Ok(key.to_string())
}

fn normalize_nonempty_key(field: &str, key: &str) -> Result<String, ValidationError> {
    let key = normalize_key(field, key)?;
    if key.is_empty() {
        return Err(ValidationError::Invalid(format!("{} is required", field)));
    }
    Ok(key)
}

fn normalize_keys(field: &str, keys: &[String], max: usize) -> Result<Vec<String>, ValidationError> {
    if keys.is_empty() {
        return Err(ValidationError::Invalid(format!("{} is empty", field)));
    }
    if keys.len() > max {
        return Err(ValidationError::Limit(format!(
            "{} exceeds the limit of {} items",
            field, max
        )));
    }
    keys.iter()
        .map(|k| normalize_nonempty_key(field, k))
        .collect()
}

fn parse<T: serde::de::DeserializeOwned>(
    payload: &serde_json::Value,
) -> Result<T, ValidationError> {
    serde_json::from_value(payload.clone())
        .map_err(|e| ValidationError::Invalid(e.to_string()))
}

fn to_value<T: Serialize>(payload: &T) -> serde_json::Value {
    serde_json::to_value(payload).unwrap_or(serde_json::Value::Null)
}

/// Prefix copy/move destination must not live under the source when the
/// buckets match; syncing a tree into its own descendant never terminates.
fn check_prefix_nesting(p: &CopyPrefixPayload) -> Result<(), ValidationError> {
    if p.bucket == p.dest_bucket && p.dest_prefix.starts_with(&p.prefix) {
        return Err(ValidationError::Invalid(
            "destination prefix must not be a descendant of the source prefix".into(),
        ));
    }
    Ok(())
}

/// Validate and canonicalize a payload for its type. Returns the canonical
/// JSON persisted on the job row.
pub fn normalize_payload(
    job_type: &str,
    payload: &serde_json::Value,
) -> Result<serde_json::Value, ValidationError> {
    match job_type {
        TYPE_SYNC_LOCAL_TO_REMOTE | TYPE_SYNC_REMOTE_TO_LOCAL | TYPE_SYNC_STAGING_TO_REMOTE => {
            let mut p: SyncPayload = parse(payload)?;
            p.bucket = normalize_bucket(&p.bucket)?;
            p.prefix = normalize_key("prefix", &p.prefix)?;
            p.local_path = p.local_path.trim().to_string();
            if p.local_path.is_empty() {
                return Err(ValidationError::Invalid("local path is required".into()));
            }
            reject_forbidden("local path", &p.local_path)?;
            Ok(to_value(&p))
        }
        TYPE_DELETE_PREFIX => {
            let mut p: DeletePrefixPayload = parse(payload)?;
            p.bucket = normalize_bucket(&p.bucket)?;
            p.prefix = normalize_key("prefix", &p.prefix)?;
            if p.prefix.is_empty() {
                if !p.delete_all {
                    return Err(ValidationError::Invalid(
                        "empty prefix requires deleteAll=true".into(),
                    ));
                }
            } else if !p.prefix.ends_with('/') && !p.allow_unsafe_prefix {
                return Err(ValidationError::Invalid(
                    "prefix must end with '/' unless allowUnsafePrefix=true".into(),
                ));
            }
            Ok(to_value(&p))
        }
        TYPE_COPY_OBJECT | TYPE_MOVE_OBJECT => {
            let mut p: CopyObjectPayload = parse(payload)?;
            p.bucket = normalize_bucket(&p.bucket)?;
            p.key = normalize_nonempty_key("key", &p.key)?;
            p.dest_bucket = normalize_bucket(&p.dest_bucket)?;
            p.dest_key = normalize_nonempty_key("destKey", &p.dest_key)?;
            if p.bucket == p.dest_bucket && p.key == p.dest_key {
                return Err(ValidationError::Invalid(
                    "source and destination are the same object".into(),
                ));
            }
            Ok(to_value(&p))
        }
        TYPE_COPY_BATCH | TYPE_MOVE_BATCH => {
            let mut p: CopyBatchPayload = parse(payload)?;
            p.bucket = normalize_bucket(&p.bucket)?;
            p.dest_bucket = normalize_bucket(&p.dest_bucket)?;
            p.dest_prefix = normalize_key("destPrefix", &p.dest_prefix)?;
            p.keys = normalize_keys("keys", &p.keys, COPY_BATCH_MAX)?;
            Ok(to_value(&p))
        }
        TYPE_COPY_PREFIX | TYPE_MOVE_PREFIX => {
            let mut p: CopyPrefixPayload = parse(payload)?;
            p.bucket = normalize_bucket(&p.bucket)?;
            p.dest_bucket = normalize_bucket(&p.dest_bucket)?;
            p.prefix = normalize_nonempty_key("prefix", &p.prefix)?;
            p.dest_prefix = normalize_nonempty_key("destPrefix", &p.dest_prefix)?;
            for (field, value) in [("prefix", &p.prefix), ("destPrefix", &p.dest_prefix)] {
                if !value.ends_with('/') {
                    return Err(ValidationError::Invalid(format!(
                        "{} must end with '/'",
                        field
                    )));
                }
            }
            check_prefix_nesting(&p)?;
            Ok(to_value(&p))
        }
        TYPE_ZIP_PREFIX => {
            let mut p: ZipPrefixPayload = parse(payload)?;
            p.bucket = normalize_bucket(&p.bucket)?;
            p.prefix = normalize_key("prefix", &p.prefix)?;
            Ok(to_value(&p))
        }
        TYPE_ZIP_OBJECTS => {
            let mut p: ZipObjectsPayload = parse(payload)?;
            p.bucket = normalize_bucket(&p.bucket)?;
            p.keys = normalize_keys("keys", &p.keys, ZIP_OBJECTS_MAX)?;
            Ok(to_value(&p))
        }
        TYPE_DELETE_OBJECTS => {
            let mut p: DeleteObjectsPayload = parse(payload)?;
            p.bucket = normalize_bucket(&p.bucket)?;
            p.keys = normalize_keys("keys", &p.keys, DELETE_OBJECTS_MAX)?;
            Ok(to_value(&p))
        }
        TYPE_INDEX_OBJECTS => {
            let mut p: IndexObjectsPayload = parse(payload)?;
            p.bucket = normalize_bucket(&p.bucket)?;
            p.prefix = normalize_key("prefix", &p.prefix)?;
            Ok(to_value(&p))
        }
        TYPE_DIRECT_UPLOAD => {
            let mut p: DirectUploadPayload = parse(payload)?;
            p.bucket = normalize_bucket(&p.bucket)?;
            p.prefix = normalize_key("prefix", &p.prefix)?;
            Ok(to_value(&p))
        }
        other => Err(ValidationError::UnsupportedType(other.to_string())),
    }
}

/// Cross-row checks that need the store: at most one index job per
/// (profile, bucket) may be in flight.
pub async fn check_exclusivity(
    pool: &SqlitePool,
    profile_id: Uuid,
    job_type: &str,
    payload: &serde_json::Value,
) -> Result<(), ValidationError> {
    if job_type == TYPE_INDEX_OBJECTS {
        let bucket = payload
            .get("bucket")
            .and_then(|b| b.as_str())
            .unwrap_or_default();
        if repo::has_active_index_job(pool, profile_id, bucket).await? {
            return Err(ValidationError::IndexJobActive);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_tags_are_rejected() {
        assert!(!is_supported_job_type("transfer.teleport"));
        assert!(matches!(
            normalize_payload("transfer.teleport", &json!({})),
            Err(ValidationError::UnsupportedType(_))
        ));
    }

    #[test]
    fn sync_payload_is_canonicalized() {
        let normalized = normalize_payload(
            TYPE_SYNC_LOCAL_TO_REMOTE,
            &json!({ "bucket": " photos ", "prefix": "/albums/2024", "local_path": " /home/u/pics " }),
        )
        .unwrap();
        assert_eq!(normalized["bucket"], "photos");
        assert_eq!(normalized["prefix"], "albums/2024");
        assert_eq!(normalized["local_path"], "/home/u/pics");
    }

    #[test]
    fn nul_and_wildcards_are_rejected() {
        for prefix in ["a\0b", "a*b", "a?b"] {
            let err = normalize_payload(
                TYPE_ZIP_PREFIX,
                &json!({ "bucket": "b", "prefix": prefix }),
            );
            assert!(err.is_err(), "{:?} must be rejected", prefix);
        }
    }

    #[test]
    fn delete_prefix_safety_rules() {
        // Bare prefix without trailing slash: rejected.
        assert!(normalize_payload(
            TYPE_DELETE_PREFIX,
            &json!({ "bucket": "b", "prefix": "photos" })
        )
        .is_err());
        // Same prefix with the explicit unsafe flag: accepted.
        assert!(normalize_payload(
            TYPE_DELETE_PREFIX,
            &json!({ "bucket": "b", "prefix": "photos", "allowUnsafePrefix": true })
        )
        .is_ok());
        // Empty prefix requires deleteAll.
        assert!(normalize_payload(
            TYPE_DELETE_PREFIX,
            &json!({ "bucket": "b", "prefix": "" })
        )
        .is_err());
        assert!(normalize_payload(
            TYPE_DELETE_PREFIX,
            &json!({ "bucket": "b", "prefix": "", "deleteAll": true })
        )
        .is_ok());
    }

    #[test]
    fn batch_limits_are_enforced() {
        let too_many: Vec<String> = (0..=COPY_BATCH_MAX).map(|i| format!("k{}", i)).collect();
        assert!(matches!(
            normalize_payload(
                TYPE_COPY_BATCH,
                &json!({ "bucket": "b", "destBucket": "c", "keys": too_many })
            ),
            Err(ValidationError::Limit(_))
        ));

        let too_many: Vec<String> = (0..=ZIP_OBJECTS_MAX).map(|i| format!("k{}", i)).collect();
        assert!(matches!(
            normalize_payload(TYPE_ZIP_OBJECTS, &json!({ "bucket": "b", "keys": too_many })),
            Err(ValidationError::Limit(_))
        ));
    }

    #[test]
    fn prefix_copy_rejects_nested_destination() {
        let err = normalize_payload(
            TYPE_COPY_PREFIX,
            &json!({
                "bucket": "b", "prefix": "a/",
                "destBucket": "b", "destPrefix": "a/sub/"
            }),
        );
        assert!(err.is_err());

        // Different bucket: nesting is fine.
        assert!(normalize_payload(
            TYPE_COPY_PREFIX,
            &json!({
                "bucket": "b", "prefix": "a/",
                "destBucket": "c", "destPrefix": "a/sub/"
            }),
        )
        .is_ok());

        // Prefixes must end with '/'.
        assert!(normalize_payload(
            TYPE_COPY_PREFIX,
            &json!({
                "bucket": "b", "prefix": "a",
                "destBucket": "c", "destPrefix": "d/"
            }),
        )
        .is_err());
    }

    #[test]
    fn copy_object_rejects_self_copy() {
        assert!(normalize_payload(
            TYPE_COPY_OBJECT,
            &json!({ "bucket": "b", "key": "k", "destBucket": "b", "destKey": "k" }),
        )
        .is_err());
    }

    #[tokio::test]
    async fn index_exclusivity_checks_active_jobs() {
        let pool = bucketd_core::db::memory_pool().await.unwrap();
        let profile_id = Uuid::new_v4();
        let payload = normalize_payload(
            TYPE_INDEX_OBJECTS,
            &json!({ "bucket": "b", "fullReindex": true }),
        )
        .unwrap();

        check_exclusivity(&pool, profile_id, TYPE_INDEX_OBJECTS, &payload)
            .await
            .unwrap();

        repo::insert_job(&pool, Uuid::new_v4(), profile_id, TYPE_INDEX_OBJECTS, &payload)
            .await
            .unwrap();
        assert!(matches!(
            check_exclusivity(&pool, profile_id, TYPE_INDEX_OBJECTS, &payload).await,
            Err(ValidationError::IndexJobActive)
        ));
    }
}
