//! Presigned URLs and upstream multipart bookkeeping
//!
//! At most one upstream multipart upload is active per (session, path). A
//! retry with a different chunk geometry aborts the old upload, drops the
//! record, and starts fresh.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use bucketd_core::models::{MultipartUpload, UploadSession};
use bucketd_core::repo;

use crate::{s3, UploadError, UploadService};

/// Minimum upstream part size (S3 contract)
pub const MIN_PART_SIZE: i64 = 5 * 1024 * 1024;
/// Maximum number of parts per multipart upload
pub const MAX_PARTS: i64 = 10_000;

#[derive(Debug, Deserialize)]
pub struct PresignRequest {
    pub path: String,
    #[serde(rename = "fileSize")]
    pub file_size: i64,
    /// Omitted for single-PUT presigning
    #[serde(default, rename = "partSize")]
    pub part_size: Option<i64>,
    #[serde(default, rename = "expiresSecs")]
    pub expires_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct PartUrl {
    #[serde(rename = "partNumber")]
    pub part_number: i32,
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct PresignResponse {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(rename = "uploadId", skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,
    #[serde(rename = "partSize", skip_serializing_if = "Option::is_none")]
    pub part_size: Option<i64>,
    #[serde(rename = "partUrls", skip_serializing_if = "Vec::is_empty")]
    pub part_urls: Vec<PartUrl>,
}

#[derive(Debug, Deserialize)]
pub struct CompletedPartInput {
    #[serde(rename = "partNumber")]
    pub part_number: i32,
    pub etag: String,
}

impl UploadService {
    /// Mint a presigned single-PUT URL or a per-part URL set.
    pub async fn presign(
        &self,
        session_id: Uuid,
        request: PresignRequest,
    ) -> Result<PresignResponse, UploadError> {
        let session = self.load_live_session(session_id).await?;
        let rel_path = crate::staging::sanitize_rel_path(&request.path)?;
        let profile = repo::get_profile(&self.pool, session.profile_id).await?;
        let client = s3::client_for(&profile)?;
        let key = object_key(&session, &rel_path);
        let expires = request.expires_secs.unwrap_or(s3::PRESIGN_EXPIRES_SECS);

        let Some(part_size) = request.part_size else {
            let url = s3::presign_put(&client, &session.bucket, &key, expires).await?;
            return Ok(PresignResponse {
                key,
                url: Some(url),
                upload_id: None,
                part_size: None,
                part_urls: Vec::new(),
            });
        };

        if part_size < MIN_PART_SIZE {
            return Err(UploadError::InvalidRequest(format!(
                "part size must be at least {} bytes",
                MIN_PART_SIZE
            )));
        }
        let part_count = part_size_count(request.file_size, part_size)?;
        if part_count < 2 {
            return Err(UploadError::InvalidRequest(
                "multipart requires at least 2 parts; presign without partSize instead".into(),
            ));
        }

        let record = self
            .ensure_multipart(&session, &rel_path, &key, part_size, request.file_size)
            .await?;

        let mut part_urls = Vec::with_capacity(part_count as usize);
        for part_number in 1..=part_count as i32 {
            let url = s3::presign_upload_part(
                &client,
                &session.bucket,
                &key,
                &record.upload_id,
                part_number,
                expires,
            )
            .await?;
            part_urls.push(PartUrl { part_number, url });
        }

        Ok(PresignResponse {
            key,
            url: None,
            upload_id: Some(record.upload_id),
            part_size: Some(part_size),
            part_urls,
        })
    }

    /// Upload one chunk through the server as an upstream part (direct-mode
    /// multipart assist).
    pub(crate) async fn upload_part_assist(
        &self,
        session: &UploadSession,
        rel_path: &str,
        chunk_index: u32,
        chunk_size: i64,
        file_size: i64,
        data: bytes::Bytes,
    ) -> Result<(), UploadError> {
        let profile = repo::get_profile(&self.pool, session.profile_id).await?;
        let client = s3::client_for(&profile)?;
        let key = object_key(session, rel_path);
        let record = self
            .ensure_multipart(session, rel_path, &key, chunk_size, file_size)
            .await?;
        s3::upload_part(
            &client,
            &session.bucket,
            &key,
            &record.upload_id,
            chunk_index as i32 + 1,
            data,
        )
        .await?;
        Ok(())
    }

    /// Find-or-create the multipart record for (session, path).
    ///
    /// A geometry mismatch against an existing record aborts the upstream
    /// upload, drops the record, and starts over.
    async fn ensure_multipart(
        &self,
        session: &UploadSession,
        rel_path: &str,
        key: &str,
        part_size: i64,
        file_size: i64,
    ) -> Result<MultipartUpload, UploadError> {
        if let Some(existing) = repo::get_multipart(&self.pool, session.id, rel_path).await? {
            if existing.part_size == part_size && existing.file_size == file_size {
                return Ok(existing);
            }
            warn!(
                "Chunk geometry changed for {} (was {}x{}, now {}x{}); restarting multipart",
                rel_path, existing.part_size, existing.file_size, part_size, file_size
            );
            let profile = repo::get_profile(&self.pool, session.profile_id).await?;
            if let Ok(client) = s3::client_for(&profile) {
                let _ = s3::abort_multipart(
                    &client,
                    &existing.bucket,
                    &existing.object_key,
                    &existing.upload_id,
                )
                .await;
            }
            repo::delete_multipart(&self.pool, session.id, rel_path).await?;
        }

        let profile = repo::get_profile(&self.pool, session.profile_id).await?;
        let client = s3::client_for(&profile)?;
        let upload_id = s3::create_multipart(&client, &session.bucket, key).await?;
        let record = repo::insert_multipart(
            &self.pool,
            session.id,
            rel_path,
            &session.bucket,
            key,
            &upload_id,
            part_size,
            file_size,
        )
        .await?;
        info!(
            "Started multipart upload {} for session {} path {}",
            upload_id, session.id, rel_path
        );
        Ok(record)
    }

    /// Finalize the upstream multipart for (session, path).
    ///
    /// When the caller supplies no part list (server-assisted chunks), the
    /// upstream's own part listing is used.
    pub async fn complete_multipart(
        &self,
        session_id: Uuid,
        path: &str,
        parts: Vec<CompletedPartInput>,
    ) -> Result<(), UploadError> {
        let session = self.load_live_session(session_id).await?;
        let rel_path = crate::staging::sanitize_rel_path(path)?;
        let record = repo::get_multipart(&self.pool, session.id, &rel_path)
            .await?
            .ok_or(UploadError::NotFound)?;
        let profile = repo::get_profile(&self.pool, session.profile_id).await?;
        let client = s3::client_for(&profile)?;

        let mut completed: Vec<(i32, String)> = if parts.is_empty() {
            s3::list_parts(&client, &record.bucket, &record.object_key, &record.upload_id)
                .await?
                .into_iter()
                .map(|(number, _size, etag)| (number, etag))
                .collect()
        } else {
            parts.into_iter().map(|p| (p.part_number, p.etag)).collect()
        };
        completed.sort_by_key(|(number, _)| *number);
        if completed.is_empty() {
            return Err(UploadError::InvalidRequest(
                "no parts to complete".into(),
            ));
        }

        s3::complete_multipart(
            &client,
            &record.bucket,
            &record.object_key,
            &record.upload_id,
            &completed,
        )
        .await?;
        repo::delete_multipart(&self.pool, session.id, &rel_path).await?;
        Ok(())
    }

    /// Abort and forget the upstream multipart for (session, path).
    pub async fn abort_multipart(&self, session_id: Uuid, path: &str) -> Result<(), UploadError> {
        let session = self.load_live_session(session_id).await?;
        let rel_path = crate::staging::sanitize_rel_path(path)?;
        let record = repo::get_multipart(&self.pool, session.id, &rel_path)
            .await?
            .ok_or(UploadError::NotFound)?;
        let profile = repo::get_profile(&self.pool, session.profile_id).await?;
        let client = s3::client_for(&profile)?;
        s3::abort_multipart(&client, &record.bucket, &record.object_key, &record.upload_id)
            .await?;
        repo::delete_multipart(&self.pool, session.id, &rel_path).await?;
        Ok(())
    }

    /// Part indices the upstream already holds with the expected size.
    pub(crate) async fn upstream_chunk_state(
        &self,
        session: &UploadSession,
        rel_path: &str,
        chunk_total: u32,
        chunk_size: u64,
        file_size: u64,
    ) -> Result<Vec<u32>, UploadError> {
        let Some(record) = repo::get_multipart(&self.pool, session.id, rel_path).await? else {
            return Ok(Vec::new());
        };
        let profile = repo::get_profile(&self.pool, session.profile_id).await?;
        let client = s3::client_for(&profile)?;
        let parts =
            s3::list_parts(&client, &record.bucket, &record.object_key, &record.upload_id).await?;

        let mut present = Vec::new();
        for (part_number, size, _etag) in parts {
            if part_number < 1 || part_number as u32 > chunk_total {
                continue;
            }
            let index = part_number as u32 - 1;
            let expected =
                crate::staging::expected_chunk_size(index, chunk_total, chunk_size, file_size);
            if size as u64 == expected {
                present.push(index);
            }
        }
        present.sort_unstable();
        Ok(present)
    }
}

/// Object key for a session-relative path: the session prefix joined with
/// the sanitized path.
pub(crate) fn object_key(session: &UploadSession, rel_path: &str) -> String {
    let prefix = session.key_prefix.trim_end_matches('/');
    if prefix.is_empty() {
        rel_path.to_string()
    } else {
        format!("{}/{}", prefix, rel_path)
    }
}

/// Number of parts the (file_size, part_size) geometry produces, bounded by
/// the upstream part limit.
fn part_size_count(file_size: i64, part_size: i64) -> Result<i64, UploadError> {
    if file_size <= 0 {
        return Err(UploadError::InvalidRequest("fileSize is required".into()));
    }
    let count = (file_size + part_size - 1) / part_size;
    if count > MAX_PARTS {
        return Err(UploadError::InvalidRequest(format!(
            "part size produces {} parts; the limit is {}",
            count, MAX_PARTS
        )));
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bucketd_core::models::UploadMode;
    use chrono::Utc;

    fn session(prefix: &str) -> UploadSession {
        UploadSession {
            id: Uuid::new_v4(),
            profile_id: Uuid::new_v4(),
            bucket: "b".into(),
            key_prefix: prefix.into(),
            mode: UploadMode::Presigned,
            staging_dir: None,
            bytes_accepted: 0,
            max_bytes: 0,
            ttl_secs: 60,
            created_at: Utc::now(),
            expires_at: Utc::now(),
        }
    }

    #[test]
    fn object_keys_nest_under_the_session_prefix() {
        assert_eq!(object_key(&session(""), "a/b.txt"), "a/b.txt");
        assert_eq!(object_key(&session("in/"), "a/b.txt"), "in/a/b.txt");
        assert_eq!(object_key(&session("in"), "a/b.txt"), "in/a/b.txt");
    }

    #[test]
    fn part_count_geometry() {
        assert_eq!(part_size_count(10 << 20, 5 << 20).unwrap(), 2);
        assert_eq!(part_size_count((10 << 20) + 1, 5 << 20).unwrap(), 3);
        // Over the part limit.
        assert!(part_size_count((MAX_PARTS + 1) * MIN_PART_SIZE, MIN_PART_SIZE).is_err());
        assert!(part_size_count(0, MIN_PART_SIZE).is_err());
    }
}
