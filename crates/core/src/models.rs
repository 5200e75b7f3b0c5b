use serde::{Deserialize, Serialize};
use sqlx::types::chrono::{DateTime, Utc};
use uuid::Uuid;

// ==================== Profile ====================

/// Storage provider families the transfer engine understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum StorageProvider {
    S3,
    Azure,
    Gcs,
    Oci,
}

impl std::str::FromStr for StorageProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "s3" => Ok(StorageProvider::S3),
            "azure" => Ok(StorageProvider::Azure),
            "gcs" => Ok(StorageProvider::Gcs),
            "oci" => Ok(StorageProvider::Oci),
            _ => Err(format!(
                "Invalid provider: {}. Use 's3', 'azure', 'gcs', or 'oci'",
                s
            )),
        }
    }
}

impl std::fmt::Display for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageProvider::S3 => write!(f, "s3"),
            StorageProvider::Azure => write!(f, "azure"),
            StorageProvider::Gcs => write!(f, "gcs"),
            StorageProvider::Oci => write!(f, "oci"),
        }
    }
}

/// A named, credentialed configuration for one remote storage account
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Profile {
    pub id: Uuid,
    pub name: String,
    pub provider: StorageProvider,
    pub endpoint: Option<String>,
    pub region: Option<String>,
    #[serde(skip_serializing)]
    pub access_key: Option<String>,
    #[serde(skip_serializing)]
    pub secret_key: Option<String>,
    #[serde(skip_serializing)]
    pub session_token: Option<String>,
    pub tls_ca_pem: Option<String>,
    pub tls_client_cert_pem: Option<String>,
    #[serde(skip_serializing)]
    pub tls_client_key_pem: Option<String>,
    pub path_style: bool,
    pub preserve_leading_slash: bool,
    pub skip_verify: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreateProfileInput {
    pub name: String,
    pub provider: StorageProvider,
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub session_token: Option<String>,
    pub tls_ca_pem: Option<String>,
    pub tls_client_cert_pem: Option<String>,
    pub tls_client_key_pem: Option<String>,
    #[serde(default)]
    pub path_style: bool,
    #[serde(default)]
    pub preserve_leading_slash: bool,
    #[serde(default)]
    pub skip_verify: bool,
}

#[derive(Debug, Deserialize)]
pub struct UpdateProfileInput {
    pub name: Option<String>,
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub session_token: Option<String>,
    pub tls_ca_pem: Option<String>,
    pub tls_client_cert_pem: Option<String>,
    pub tls_client_key_pem: Option<String>,
    pub path_style: Option<bool>,
    pub preserve_leading_slash: Option<bool>,
    pub skip_verify: Option<bool>,
}

// ==================== Job ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted unit of background work of a known type
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Job {
    pub id: Uuid,
    pub profile_id: Uuid,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub bytes_done: i64,
    pub bytes_total: i64,
    pub objects_done: i64,
    pub objects_total: i64,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct CreateJobInput {
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Progress counters pushed by a running worker
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct JobProgress {
    pub bytes_done: i64,
    pub bytes_total: i64,
    pub objects_done: i64,
    pub objects_total: i64,
}

// ==================== Upload session ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum UploadMode {
    Staging,
    Direct,
    Presigned,
}

impl std::str::FromStr for UploadMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "staging" => Ok(UploadMode::Staging),
            "direct" => Ok(UploadMode::Direct),
            "presigned" => Ok(UploadMode::Presigned),
            _ => Err(format!(
                "Invalid upload mode: {}. Use 'staging', 'direct', or 'presigned'",
                s
            )),
        }
    }
}

impl std::fmt::Display for UploadMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UploadMode::Staging => write!(f, "staging"),
            UploadMode::Direct => write!(f, "direct"),
            UploadMode::Presigned => write!(f, "presigned"),
        }
    }
}

/// Short-lived container aggregating file bodies before commit
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UploadSession {
    pub id: Uuid,
    pub profile_id: Uuid,
    pub bucket: String,
    pub key_prefix: String,
    pub mode: UploadMode,
    pub staging_dir: Option<String>,
    pub bytes_accepted: i64,
    /// 0 means unlimited
    pub max_bytes: i64,
    pub ttl_secs: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Upstream multipart bookkeeping, one row per (session, path)
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MultipartUpload {
    pub session_id: Uuid,
    pub rel_path: String,
    pub bucket: String,
    pub object_key: String,
    pub upload_id: String,
    pub part_size: i64,
    pub file_size: i64,
    pub created_at: DateTime<Utc>,
}

// ==================== Object index ====================

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ObjectIndexEntry {
    pub profile_id: Uuid,
    pub bucket: String,
    pub object_key: String,
    pub size: i64,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub indexed_at: DateTime<Utc>,
}

/// Search filters for the object index
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IndexQuery {
    #[serde(default, rename = "keyPrefix")]
    pub key_prefix: Option<String>,
    #[serde(default)]
    pub extension: Option<String>,
    #[serde(default, rename = "minSize")]
    pub min_size: Option<i64>,
    #[serde(default, rename = "maxSize")]
    pub max_size: Option<i64>,
    #[serde(default, rename = "modifiedAfter")]
    pub modified_after: Option<DateTime<Utc>>,
    #[serde(default, rename = "modifiedBefore")]
    pub modified_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_round_trips_through_strings() {
        for s in ["s3", "azure", "gcs", "oci"] {
            let p: StorageProvider = s.parse().unwrap();
            assert_eq!(p.to_string(), s);
        }
        assert!("ftp".parse::<StorageProvider>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Canceled.is_terminal());
    }

    #[test]
    fn session_expiry_uses_expires_at() {
        let now = Utc::now();
        let session = UploadSession {
            id: Uuid::new_v4(),
            profile_id: Uuid::new_v4(),
            bucket: "b".into(),
            key_prefix: String::new(),
            mode: UploadMode::Staging,
            staging_dir: None,
            bytes_accepted: 0,
            max_bytes: 0,
            ttl_secs: 60,
            created_at: now,
            expires_at: now + chrono::Duration::seconds(60),
        };
        assert!(!session.is_expired(now));
        assert!(session.is_expired(now + chrono::Duration::seconds(61)));
    }
}
