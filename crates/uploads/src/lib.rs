//! Upload session subsystem
//!
//! Three upload modes with one commit contract: after a successful commit,
//! the session's files are (or are being made) present in the target bucket.
//!
//! - **staging**: bodies land under a per-session directory; commit creates
//!   a staging→remote sync job.
//! - **direct**: bodies stream through the engine straight to the remote;
//!   chunked bodies can ride upstream multipart (S3-compatible only).
//! - **presigned**: the server only mints upstream-signed URLs; commit
//!   verifies that no multipart is left unfinalized.

pub mod multipart;
mod direct;
mod s3;
pub mod staging;

use std::sync::Arc;
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use bucketd_core::config::AppConfig;
use bucketd_core::events::{EventHub, EventType};
use bucketd_core::models::{Job, Profile, StorageProvider, UploadMode, UploadSession};
use bucketd_core::repo::{self, RepoError};
use bucketd_engine::{Engine, EngineError};
use bucketd_jobs::manager::{EnqueueError, JobManager};
use bucketd_jobs::types::{
    DirectUploadPayload, SyncPayload, TYPE_DIRECT_UPLOAD, TYPE_SYNC_STAGING_TO_REMOTE,
};

/// Manifest items echoed back on commit before truncation kicks in
pub const MANIFEST_ECHO_MAX: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("upload session not found")]
    NotFound,
    #[error("upload session expired")]
    Expired,
    #[error("operation requires {expected} mode")]
    WrongMode { expected: &'static str },
    #[error("session byte budget exceeded")]
    TooLarge,
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("presigned and multipart uploads require an S3-compatible profile (got {0})")]
    UnsupportedProvider(StorageProvider),
    #[error("{0}")]
    Conflict(String),
    #[error("job queue is full; try again later")]
    QueueFull,
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("database error: {0}")]
    Repo(RepoError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<RepoError> for UploadError {
    fn from(e: RepoError) -> Self {
        match e {
            RepoError::NotFound => UploadError::NotFound,
            RepoError::Conflict(msg) => UploadError::Conflict(msg),
            other => UploadError::Repo(other),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionInput {
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    pub mode: UploadMode,
    #[serde(default, rename = "maxBytes")]
    pub max_bytes: Option<i64>,
    #[serde(default, rename = "ttlSecs")]
    pub ttl_secs: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CommitManifest {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default, rename = "rootName")]
    pub root_name: Option<String>,
    #[serde(default, rename = "rootKind")]
    pub root_kind: Option<String>,
    #[serde(default, rename = "totalFiles")]
    pub total_files: Option<u64>,
    #[serde(default, rename = "totalBytes")]
    pub total_bytes: Option<u64>,
    #[serde(default)]
    pub items: Vec<ManifestItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestItem {
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Serialize)]
pub struct ManifestEcho {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(rename = "rootName", skip_serializing_if = "Option::is_none")]
    pub root_name: Option<String>,
    #[serde(rename = "rootKind", skip_serializing_if = "Option::is_none")]
    pub root_kind: Option<String>,
    #[serde(rename = "totalFiles")]
    pub total_files: u64,
    #[serde(rename = "totalBytes")]
    pub total_bytes: u64,
    pub items: Vec<ManifestItem>,
    #[serde(rename = "itemsTruncated")]
    pub items_truncated: bool,
}

#[derive(Debug, Serialize)]
pub struct CommitOutcome {
    pub job: Job,
    pub manifest: ManifestEcho,
}

/// Owns upload sessions end to end: creation, ingest, multipart
/// bookkeeping, commit, deletion, and the TTL sweep.
pub struct UploadService {
    pub(crate) pool: SqlitePool,
    pub(crate) hub: Arc<EventHub>,
    pub(crate) manager: Arc<JobManager>,
    pub(crate) engine: Engine,
    pub(crate) config: AppConfig,
}

impl UploadService {
    pub fn new(
        pool: SqlitePool,
        hub: Arc<EventHub>,
        manager: Arc<JobManager>,
        engine: Engine,
        config: AppConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            hub,
            manager,
            engine,
            config,
        })
    }

    // ==================== Session lifecycle ====================

    pub async fn create_session(
        &self,
        profile: &Profile,
        input: CreateSessionInput,
    ) -> Result<UploadSession, UploadError> {
        let bucket = input.bucket.trim();
        if bucket.is_empty() || bucket.contains('/') || bucket.contains('\0') {
            return Err(UploadError::InvalidRequest("invalid bucket".into()));
        }
        let prefix = input.prefix.trim().trim_start_matches('/').to_string();
        if prefix.contains('\0') {
            return Err(UploadError::InvalidRequest("invalid prefix".into()));
        }
        if matches!(input.mode, UploadMode::Presigned)
            && profile.provider != StorageProvider::S3
        {
            return Err(UploadError::UnsupportedProvider(profile.provider));
        }

        let id = Uuid::new_v4();
        let staging_dir = match input.mode {
            UploadMode::Staging => {
                let dir = self.config.staging_dir(id);
                tokio::fs::create_dir_all(&dir).await?;
                Some(dir.display().to_string())
            }
            _ => None,
        };

        let max_bytes = input.max_bytes.unwrap_or(self.config.upload_max_bytes).max(0);
        let ttl_secs = input
            .ttl_secs
            .unwrap_or(self.config.upload_session_ttl_secs)
            .max(1);

        let session = repo::insert_session(
            &self.pool,
            id,
            profile.id,
            bucket,
            &prefix,
            input.mode,
            staging_dir.as_deref(),
            max_bytes,
            ttl_secs,
        )
        .await?;
        info!(
            "Created {} upload session {} for bucket {}",
            session.mode, session.id, session.bucket
        );
        Ok(session)
    }

    /// Load a session, enforcing its TTL. Every consuming operation goes
    /// through here.
    pub async fn load_live_session(&self, id: Uuid) -> Result<UploadSession, UploadError> {
        let session = repo::get_session(&self.pool, id).await?;
        if session.is_expired(Utc::now()) {
            return Err(UploadError::Expired);
        }
        Ok(session)
    }

    /// Best-effort teardown: abort surviving multiparts upstream, drop their
    /// records, remove the staging tree, remove the row.
    pub async fn delete_session(&self, id: Uuid) -> Result<(), UploadError> {
        let session = repo::get_session(&self.pool, id).await?;
        self.teardown(&session).await;
        if !repo::delete_session_row(&self.pool, id).await? {
            return Err(UploadError::NotFound);
        }
        info!("Deleted upload session {}", id);
        Ok(())
    }

    async fn teardown(&self, session: &UploadSession) {
        match repo::list_session_multiparts(&self.pool, session.id).await {
            Ok(records) if !records.is_empty() => {
                let client = repo::get_profile(&self.pool, session.profile_id)
                    .await
                    .ok()
                    .and_then(|p| s3::client_for(&p).ok());
                for record in records {
                    if let Some(client) = &client {
                        if let Err(e) = s3::abort_multipart(
                            client,
                            &record.bucket,
                            &record.object_key,
                            &record.upload_id,
                        )
                        .await
                        {
                            warn!(
                                "Failed to abort multipart {} for session {}: {}",
                                record.upload_id, session.id, e
                            );
                        }
                    }
                    let _ = repo::delete_multipart(&self.pool, session.id, &record.rel_path).await;
                }
            }
            Ok(_) => {}
            Err(e) => error!("Failed to list multiparts for session {}: {}", session.id, e),
        }

        if let Some(dir) = &session.staging_dir {
            let path = std::path::Path::new(dir);
            if AppConfig::path_is_under(&self.config.staging_root(), path) {
                if let Err(e) = tokio::fs::remove_dir_all(path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!("Failed to remove staging dir {}: {}", dir, e);
                    }
                }
            }
        }
    }

    /// Drop sessions whose TTL has lapsed.
    pub async fn sweep_expired(&self) -> Result<usize, UploadError> {
        let expired = repo::list_expired_sessions(&self.pool, Utc::now()).await?;
        let count = expired.len();
        for session in expired {
            self.teardown(&session).await;
            let _ = repo::delete_session_row(&self.pool, session.id).await;
        }
        if count > 0 {
            info!("Swept {} expired upload sessions", count);
        }
        Ok(count)
    }

    pub async fn run_session_sweeper(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(
            self.config.sweep_interval_secs,
        ));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = interval.tick() => {}
            }
            if let Err(e) = self.sweep_expired().await {
                error!("Upload session sweep failed: {}", e);
            }
        }
    }

    /// Profile-deletion cascade: remove every session the profile owns.
    pub async fn purge_profile_sessions(&self, profile_id: Uuid) -> Result<(), UploadError> {
        for session in repo::list_sessions_for_profile(&self.pool, profile_id).await? {
            self.teardown(&session).await;
            let _ = repo::delete_session_row(&self.pool, session.id).await;
        }
        Ok(())
    }

    // ==================== Ingest ====================

    /// Accept one whole file body.
    pub async fn ingest_file(
        &self,
        session_id: Uuid,
        rel_path: &str,
        data: Bytes,
    ) -> Result<(), UploadError> {
        let session = self.load_live_session(session_id).await?;
        let rel_path = staging::sanitize_rel_path(rel_path)?;
        self.reserve_bytes(&session, data.len() as i64).await?;

        let result = match session.mode {
            UploadMode::Staging => {
                let dir = self.staging_dir_of(&session)?;
                staging::write_file(&dir, &rel_path, &data).await
            }
            UploadMode::Direct => {
                let profile = repo::get_profile(&self.pool, session.profile_id).await?;
                let key = multipart::object_key(&session, &rel_path);
                direct::rcat(
                    &self.engine,
                    &self.config.engine_tmp_root(),
                    &profile,
                    &session.bucket,
                    &key,
                    &data,
                )
                .await
            }
            UploadMode::Presigned => Err(UploadError::WrongMode {
                expected: "staging or direct",
            }),
        };

        if result.is_err() {
            let _ = repo::subtract_session_bytes(&self.pool, session.id, data.len() as i64).await;
        }
        result
    }

    /// Accept one numbered chunk of a file.
    #[allow(clippy::too_many_arguments)]
    pub async fn ingest_chunk(
        &self,
        session_id: Uuid,
        rel_path: &str,
        chunk_index: u32,
        chunk_total: u32,
        chunk_size: i64,
        file_size: i64,
        data: Bytes,
    ) -> Result<(), UploadError> {
        let session = self.load_live_session(session_id).await?;
        let rel_path = staging::sanitize_rel_path(rel_path)?;
        self.reserve_bytes(&session, data.len() as i64).await?;

        let result = match session.mode {
            UploadMode::Staging => {
                let dir = self.staging_dir_of(&session)?;
                staging::write_chunk(&dir, &rel_path, chunk_index, chunk_total, &data)
                    .await
                    .map(|_| ())
            }
            UploadMode::Direct => {
                self.upload_part_assist(
                    &session, &rel_path, chunk_index, chunk_size, file_size, data.clone(),
                )
                .await
            }
            UploadMode::Presigned => Err(UploadError::WrongMode {
                expected: "staging or direct",
            }),
        };

        if result.is_err() {
            let _ = repo::subtract_session_bytes(&self.pool, session.id, data.len() as i64).await;
        }
        result
    }

    /// Chunk indices already held for (session, path): server-local for
    /// staging, via the upstream part listing for direct multipart.
    pub async fn chunk_state(
        &self,
        session_id: Uuid,
        rel_path: &str,
        chunk_total: u32,
        chunk_size: u64,
        file_size: u64,
    ) -> Result<Vec<u32>, UploadError> {
        let session = self.load_live_session(session_id).await?;
        let rel_path = staging::sanitize_rel_path(rel_path)?;
        match session.mode {
            UploadMode::Staging => {
                let dir = self.staging_dir_of(&session)?;
                staging::present_chunks(&dir, &rel_path, chunk_total, chunk_size, file_size)
            }
            UploadMode::Direct | UploadMode::Presigned => {
                self.upstream_chunk_state(&session, &rel_path, chunk_total, chunk_size, file_size)
                    .await
            }
        }
    }

    async fn reserve_bytes(
        &self,
        session: &UploadSession,
        delta: i64,
    ) -> Result<(), UploadError> {
        if !repo::add_session_bytes(&self.pool, session.id, delta).await? {
            return Err(UploadError::TooLarge);
        }
        Ok(())
    }

    fn staging_dir_of(&self, session: &UploadSession) -> Result<std::path::PathBuf, UploadError> {
        session
            .staging_dir
            .as_deref()
            .map(std::path::PathBuf::from)
            .ok_or(UploadError::WrongMode {
                expected: "staging",
            })
    }

    // ==================== Commit ====================

    /// Commit the session: claim it (exactly one committer wins), then
    /// produce the job whose success means the files are in the bucket.
    pub async fn commit(
        &self,
        session_id: Uuid,
        manifest: CommitManifest,
    ) -> Result<CommitOutcome, UploadError> {
        let session = self.load_live_session(session_id).await?;

        if session.mode == UploadMode::Presigned {
            let leftovers = repo::list_session_multiparts(&self.pool, session.id).await?;
            if !leftovers.is_empty() {
                return Err(UploadError::Conflict(format!(
                    "{} multipart uploads are not finalized",
                    leftovers.len()
                )));
            }
        }

        // The session row is the commit token: the racing loser sees it gone.
        if !repo::delete_session_row(&self.pool, session.id).await? {
            return Err(UploadError::Conflict(
                "session already committed or deleted".into(),
            ));
        }

        let job = match session.mode {
            UploadMode::Staging => self.commit_staging(&session).await?,
            UploadMode::Direct => {
                self.finalize_direct_multiparts(&session).await?;
                self.record_direct_upload(&session, &manifest).await?
            }
            UploadMode::Presigned => self.record_direct_upload(&session, &manifest).await?,
        };

        let total_files = manifest
            .total_files
            .unwrap_or(manifest.items.len() as u64);
        let total_bytes = manifest
            .total_bytes
            .unwrap_or(session.bytes_accepted.max(0) as u64);
        let items_truncated = manifest.items.len() > MANIFEST_ECHO_MAX;
        let mut items = manifest.items;
        items.truncate(MANIFEST_ECHO_MAX);

        Ok(CommitOutcome {
            job,
            manifest: ManifestEcho {
                label: manifest.label,
                root_name: manifest.root_name,
                root_kind: manifest.root_kind,
                total_files,
                total_bytes,
                items,
                items_truncated,
            },
        })
    }

    async fn commit_staging(&self, session: &UploadSession) -> Result<Job, UploadError> {
        let staging_dir = session
            .staging_dir
            .clone()
            .ok_or(UploadError::WrongMode {
                expected: "staging",
            })?;
        let payload = serde_json::to_value(SyncPayload {
            bucket: session.bucket.clone(),
            prefix: session.key_prefix.clone(),
            local_path: staging_dir,
        })
        .unwrap_or_default();

        let job_id = Uuid::new_v4();
        let job = repo::insert_job(
            &self.pool,
            job_id,
            session.profile_id,
            TYPE_SYNC_STAGING_TO_REMOTE,
            &payload,
        )
        .await?;
        self.hub.publish(
            EventType::JobCreated,
            Some(job_id),
            serde_json::to_value(&job).unwrap_or_default(),
        );

        match self.manager.enqueue(job_id) {
            Ok(()) => Ok(job),
            Err(EnqueueError::QueueFull) | Err(EnqueueError::Closed) => {
                // Keep the row as the audit trail; the completion event lets
                // the UI reconcile.
                let _ = repo::mark_job_terminal(
                    &self.pool,
                    job_id,
                    bucketd_core::models::JobStatus::Failed,
                    Some("job queue is full; try again later"),
                    Some("job_queue_full"),
                )
                .await;
                if let Ok(job) = repo::get_job(&self.pool, job_id).await {
                    self.hub.publish(
                        EventType::JobCompleted,
                        Some(job_id),
                        serde_json::to_value(&job).unwrap_or_default(),
                    );
                }
                Err(UploadError::QueueFull)
            }
        }
    }

    /// Direct-mode commit finalizes any server-assisted multiparts in place.
    async fn finalize_direct_multiparts(
        &self,
        session: &UploadSession,
    ) -> Result<(), UploadError> {
        let records = repo::list_session_multiparts(&self.pool, session.id).await?;
        if records.is_empty() {
            return Ok(());
        }
        let profile = repo::get_profile(&self.pool, session.profile_id).await?;
        let client = s3::client_for(&profile)?;
        for record in records {
            let parts: Vec<(i32, String)> =
                s3::list_parts(&client, &record.bucket, &record.object_key, &record.upload_id)
                    .await?
                    .into_iter()
                    .map(|(number, _size, etag)| (number, etag))
                    .collect();
            s3::complete_multipart(
                &client,
                &record.bucket,
                &record.object_key,
                &record.upload_id,
                &parts,
            )
            .await?;
            repo::delete_multipart(&self.pool, session.id, &record.rel_path).await?;
        }
        Ok(())
    }

    /// Synthetic terminal job recording a completed direct/presigned upload.
    /// Publishes exactly one completion event.
    async fn record_direct_upload(
        &self,
        session: &UploadSession,
        manifest: &CommitManifest,
    ) -> Result<Job, UploadError> {
        let payload = serde_json::to_value(DirectUploadPayload {
            bucket: session.bucket.clone(),
            prefix: session.key_prefix.clone(),
            files: manifest.total_files.unwrap_or(manifest.items.len() as u64),
            bytes: manifest
                .total_bytes
                .unwrap_or(session.bytes_accepted.max(0) as u64),
            label: manifest.label.clone(),
        })
        .unwrap_or_default();

        let job = repo::insert_completed_job(
            &self.pool,
            Uuid::new_v4(),
            session.profile_id,
            TYPE_DIRECT_UPLOAD,
            &payload,
            session.bytes_accepted.max(0),
            manifest.total_files.unwrap_or(manifest.items.len() as u64) as i64,
        )
        .await?;
        self.hub.publish(
            EventType::JobCompleted,
            Some(job.id),
            serde_json::to_value(&job).unwrap_or_default(),
        );
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bucketd_core::db::memory_pool;
    use bucketd_core::models::CreateProfileInput;

    async fn service() -> (Arc<UploadService>, SqlitePool, Profile, tempfile::TempDir) {
        let pool = memory_pool().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::from_env();
        config.data_root = dir.path().to_path_buf();
        config.upload_max_bytes = 0;
        config.ensure_layout().unwrap();

        let hub = Arc::new(EventHub::new(64, 64));
        let engine = Engine::new("rclone", "1.60.0", config.engine_tmp_root()).unwrap();
        let manager = JobManager::new(pool.clone(), hub.clone(), engine.clone(), config.clone());
        let service = UploadService::new(pool.clone(), hub, manager, engine, config);

        let profile = repo::create_profile(
            &pool,
            &CreateProfileInput {
                name: "p".into(),
                provider: StorageProvider::S3,
                endpoint: Some("http://127.0.0.1:9000".into()),
                region: Some("us-east-1".into()),
                access_key: Some("ak".into()),
                secret_key: Some("sk".into()),
                session_token: None,
                tls_ca_pem: None,
                tls_client_cert_pem: None,
                tls_client_key_pem: None,
                path_style: true,
                preserve_leading_slash: false,
                skip_verify: false,
            },
        )
        .await
        .unwrap();
        (service, pool, profile, dir)
    }

    fn staging_input(max_bytes: Option<i64>) -> CreateSessionInput {
        CreateSessionInput {
            bucket: "b".into(),
            prefix: "in/".into(),
            mode: UploadMode::Staging,
            max_bytes,
            ttl_secs: Some(60),
        }
    }

    #[tokio::test]
    async fn staging_session_allocates_a_directory_under_the_data_root() {
        let (service, _pool, profile, _dir) = service().await;
        let session = service
            .create_session(&profile, staging_input(None))
            .await
            .unwrap();
        let staging = session.staging_dir.clone().unwrap();
        assert!(std::path::Path::new(&staging).is_dir());
        assert!(AppConfig::path_is_under(
            &service.config.staging_root(),
            std::path::Path::new(&staging)
        ));
    }

    #[tokio::test]
    async fn over_budget_body_is_rejected_with_no_partial_file() {
        let (service, pool, profile, _dir) = service().await;
        let session = service
            .create_session(&profile, staging_input(Some(1024)))
            .await
            .unwrap();

        let body = Bytes::from(vec![0u8; 2000]);
        let err = service
            .ingest_file(session.id, "big.bin", body)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::TooLarge));

        // Accounting unchanged, nothing on disk.
        let row = repo::get_session(&pool, session.id).await.unwrap();
        assert_eq!(row.bytes_accepted, 0);
        let staging = session.staging_dir.unwrap();
        assert!(!std::path::Path::new(&staging).join("big.bin").exists());
    }

    #[tokio::test]
    async fn chunked_staging_upload_assembles_out_of_order() {
        let (service, _pool, profile, _dir) = service().await;
        let session = service
            .create_session(&profile, staging_input(None))
            .await
            .unwrap();

        for (index, body) in [(2u32, &b"CC"[..]), (0, &b"AA"[..]), (1, &b"BB"[..])] {
            service
                .ingest_chunk(session.id, "a/b.txt", index, 3, 2, 6, Bytes::from(body))
                .await
                .unwrap();
        }

        let staging = std::path::PathBuf::from(session.staging_dir.unwrap());
        assert_eq!(std::fs::read(staging.join("a/b.txt")).unwrap(), b"AABBCC");
        assert!(!staging.join(".chunks/a/b.txt").exists());
    }

    #[tokio::test]
    async fn expired_sessions_are_rejected_and_swept() {
        let (service, pool, profile, _dir) = service().await;
        let session = service
            .create_session(&profile, staging_input(None))
            .await
            .unwrap();

        // Force-expire the row.
        sqlx::query("UPDATE upload_sessions SET expires_at = ? WHERE id = ?")
            .bind(Utc::now() - chrono::Duration::seconds(5))
            .bind(session.id)
            .execute(&pool)
            .await
            .unwrap();

        let err = service
            .ingest_file(session.id, "x.txt", Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Expired));

        assert_eq!(service.sweep_expired().await.unwrap(), 1);
        assert!(matches!(
            repo::get_session(&pool, session.id).await,
            Err(RepoError::NotFound)
        ));
        let staging = session.staging_dir.unwrap();
        assert!(!std::path::Path::new(&staging).exists());
    }

    #[tokio::test]
    async fn staging_commit_creates_the_sync_job_and_claims_the_session() {
        let (service, pool, profile, _dir) = service().await;
        let session = service
            .create_session(&profile, staging_input(None))
            .await
            .unwrap();
        service
            .ingest_file(session.id, "a.txt", Bytes::from_static(b"hello"))
            .await
            .unwrap();

        let outcome = service
            .commit(session.id, CommitManifest::default())
            .await
            .unwrap();
        assert_eq!(outcome.job.job_type, TYPE_SYNC_STAGING_TO_REMOTE);
        assert_eq!(outcome.job.status, bucketd_core::models::JobStatus::Queued);
        assert_eq!(outcome.job.payload["bucket"], "b");

        // Second commit loses the claim.
        let err = service
            .commit(session.id, CommitManifest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::NotFound | UploadError::Conflict(_)));

        // Exactly one job row exists.
        let jobs = repo::list_jobs(&pool, None, 10).await.unwrap();
        assert_eq!(jobs.len(), 1);
    }

    #[tokio::test]
    async fn commit_manifest_echo_truncates_at_200_items() {
        let (service, _pool, profile, _dir) = service().await;
        let session = service
            .create_session(
                &profile,
                CreateSessionInput {
                    bucket: "b".into(),
                    prefix: String::new(),
                    mode: UploadMode::Presigned,
                    max_bytes: None,
                    ttl_secs: Some(60),
                },
            )
            .await
            .unwrap();

        let manifest = CommitManifest {
            items: (0..250)
                .map(|i| ManifestItem {
                    path: format!("f{}.bin", i),
                    size: 1,
                })
                .collect(),
            ..Default::default()
        };
        let outcome = service.commit(session.id, manifest).await.unwrap();
        assert_eq!(outcome.manifest.items.len(), MANIFEST_ECHO_MAX);
        assert!(outcome.manifest.items_truncated);
        assert_eq!(outcome.manifest.total_files, 250);
        // Synthetic job is born succeeded.
        assert_eq!(
            outcome.job.status,
            bucketd_core::models::JobStatus::Succeeded
        );
        assert_eq!(outcome.job.job_type, TYPE_DIRECT_UPLOAD);
    }

    #[tokio::test]
    async fn unsafe_paths_are_rejected() {
        let (service, _pool, profile, _dir) = service().await;
        let session = service
            .create_session(&profile, staging_input(None))
            .await
            .unwrap();
        for bad in ["../escape.txt", "/abs.txt", "a/../../b", ""] {
            let err = service
                .ingest_file(session.id, bad, Bytes::from_static(b"x"))
                .await
                .unwrap_err();
            assert!(
                matches!(err, UploadError::InvalidPath(_)),
                "{:?} must be rejected",
                bad
            );
        }
    }
}
