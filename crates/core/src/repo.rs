//! Repository layer
//!
//! All SQL for the embedded store lives in this module. Mutating queries are
//! scoped with conditional WHERE clauses so state transitions are enforced at
//! the data layer (a lost race surfaces as `rows_affected() == 0`, never as a
//! double transition).

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::models::{
    CreateProfileInput, IndexQuery, Job, JobProgress, JobStatus, MultipartUpload,
    ObjectIndexEntry, Profile, UpdateProfileInput, UploadMode, UploadSession,
};

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("Resource not found")]
    NotFound,
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

// ==================== Profiles ====================

pub async fn create_profile(
    pool: &SqlitePool,
    input: &CreateProfileInput,
) -> Result<Profile, RepoError> {
    if input.name.trim().is_empty() {
        return Err(RepoError::InvalidInput("Profile name is required".into()));
    }

    let now = Utc::now();
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO profiles (
            id, name, provider, endpoint, region, access_key, secret_key,
            session_token, tls_ca_pem, tls_client_cert_pem, tls_client_key_pem,
            path_style, preserve_leading_slash, skip_verify, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(id)
    .bind(input.name.trim())
    .bind(input.provider)
    .bind(&input.endpoint)
    .bind(&input.region)
    .bind(&input.access_key)
    .bind(&input.secret_key)
    .bind(&input.session_token)
    .bind(&input.tls_ca_pem)
    .bind(&input.tls_client_cert_pem)
    .bind(&input.tls_client_key_pem)
    .bind(input.path_style)
    .bind(input.preserve_leading_slash)
    .bind(input.skip_verify)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    get_profile(pool, id).await
}

pub async fn get_profile(pool: &SqlitePool, id: Uuid) -> Result<Profile, RepoError> {
    sqlx::query_as::<_, Profile>("SELECT * FROM profiles WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(RepoError::NotFound)
}

pub async fn list_profiles(pool: &SqlitePool) -> Result<Vec<Profile>, RepoError> {
    Ok(
        sqlx::query_as::<_, Profile>("SELECT * FROM profiles ORDER BY name ASC")
            .fetch_all(pool)
            .await?,
    )
}

pub async fn update_profile(
    pool: &SqlitePool,
    id: Uuid,
    input: &UpdateProfileInput,
) -> Result<Profile, RepoError> {
    let existing = get_profile(pool, id).await?;

    let name = input.name.clone().unwrap_or(existing.name);
    if name.trim().is_empty() {
        return Err(RepoError::InvalidInput("Profile name is required".into()));
    }

    sqlx::query(
        r#"
        UPDATE profiles SET
            name = ?, endpoint = ?, region = ?, access_key = ?, secret_key = ?,
            session_token = ?, tls_ca_pem = ?, tls_client_cert_pem = ?,
            tls_client_key_pem = ?, path_style = ?, preserve_leading_slash = ?,
            skip_verify = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(name.trim())
    .bind(input.endpoint.clone().or(existing.endpoint))
    .bind(input.region.clone().or(existing.region))
    .bind(input.access_key.clone().or(existing.access_key))
    .bind(input.secret_key.clone().or(existing.secret_key))
    .bind(input.session_token.clone().or(existing.session_token))
    .bind(input.tls_ca_pem.clone().or(existing.tls_ca_pem))
    .bind(input.tls_client_cert_pem.clone().or(existing.tls_client_cert_pem))
    .bind(input.tls_client_key_pem.clone().or(existing.tls_client_key_pem))
    .bind(input.path_style.unwrap_or(existing.path_style))
    .bind(
        input
            .preserve_leading_slash
            .unwrap_or(existing.preserve_leading_slash),
    )
    .bind(input.skip_verify.unwrap_or(existing.skip_verify))
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;

    get_profile(pool, id).await
}

pub async fn delete_profile_row(pool: &SqlitePool, id: Uuid) -> Result<(), RepoError> {
    let result = sqlx::query("DELETE FROM profiles WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        Err(RepoError::NotFound)
    } else {
        Ok(())
    }
}

// ==================== Jobs ====================

pub async fn insert_job(
    pool: &SqlitePool,
    id: Uuid,
    profile_id: Uuid,
    job_type: &str,
    payload: &serde_json::Value,
) -> Result<Job, RepoError> {
    sqlx::query(
        r#"
        INSERT INTO jobs (id, profile_id, job_type, payload, status, created_at)
        VALUES (?, ?, ?, ?, 'queued', ?)
        "#,
    )
    .bind(id)
    .bind(profile_id)
    .bind(job_type)
    .bind(payload)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    get_job(pool, id).await
}

/// Insert a job born terminal. Used for synthetic direct-upload records
/// that never pass through the queue.
pub async fn insert_completed_job(
    pool: &SqlitePool,
    id: Uuid,
    profile_id: Uuid,
    job_type: &str,
    payload: &serde_json::Value,
    bytes_total: i64,
    objects_total: i64,
) -> Result<Job, RepoError> {
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO jobs (
            id, profile_id, job_type, payload, status,
            bytes_done, bytes_total, objects_done, objects_total,
            created_at, started_at, finished_at
        ) VALUES (?, ?, ?, ?, 'succeeded', ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(id)
    .bind(profile_id)
    .bind(job_type)
    .bind(payload)
    .bind(bytes_total)
    .bind(bytes_total)
    .bind(objects_total)
    .bind(objects_total)
    .bind(now)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    get_job(pool, id).await
}

pub async fn get_job(pool: &SqlitePool, id: Uuid) -> Result<Job, RepoError> {
    sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(RepoError::NotFound)
}

pub async fn list_jobs(
    pool: &SqlitePool,
    status: Option<JobStatus>,
    limit: i64,
) -> Result<Vec<Job>, RepoError> {
    let jobs = match status {
        Some(s) => {
            sqlx::query_as::<_, Job>(
                "SELECT * FROM jobs WHERE status = ? ORDER BY created_at DESC LIMIT ?",
            )
            .bind(s)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, Job>("SELECT * FROM jobs ORDER BY created_at DESC LIMIT ?")
                .bind(limit)
                .fetch_all(pool)
                .await?
        }
    };
    Ok(jobs)
}

/// queued -> running. Returns false when the job was no longer queued
/// (canceled before pickup, typically).
pub async fn mark_job_running(pool: &SqlitePool, id: Uuid) -> Result<bool, RepoError> {
    let result = sqlx::query(
        "UPDATE jobs SET status = 'running', started_at = ? WHERE id = ? AND status = 'queued'",
    )
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// queued -> canceled, without ever having run. Returns false when the job
/// already left the queued state.
pub async fn cancel_queued_job(pool: &SqlitePool, id: Uuid) -> Result<bool, RepoError> {
    let result = sqlx::query(
        r#"
        UPDATE jobs SET status = 'canceled', error_code = 'canceled', finished_at = ?
        WHERE id = ? AND status = 'queued'
        "#,
    )
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Transition into a terminal status. Guarded so each job reaches a terminal
/// state exactly once.
pub async fn mark_job_terminal(
    pool: &SqlitePool,
    id: Uuid,
    status: JobStatus,
    error_message: Option<&str>,
    error_code: Option<&str>,
) -> Result<bool, RepoError> {
    if !status.is_terminal() {
        return Err(RepoError::InvalidInput(format!(
            "{} is not a terminal status",
            status
        )));
    }
    let result = sqlx::query(
        r#"
        UPDATE jobs SET status = ?, error_message = ?, error_code = ?, finished_at = ?
        WHERE id = ? AND status IN ('queued', 'running')
        "#,
    )
    .bind(status)
    .bind(error_message)
    .bind(error_code)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn update_job_progress(
    pool: &SqlitePool,
    id: Uuid,
    progress: JobProgress,
) -> Result<(), RepoError> {
    sqlx::query(
        r#"
        UPDATE jobs SET bytes_done = ?, bytes_total = ?, objects_done = ?, objects_total = ?
        WHERE id = ? AND status = 'running'
        "#,
    )
    .bind(progress.bytes_done)
    .bind(progress.bytes_total)
    .bind(progress.objects_done)
    .bind(progress.objects_total)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Terminal jobs whose finish timestamp predates the cutoff.
pub async fn list_purgeable_jobs(
    pool: &SqlitePool,
    cutoff: DateTime<Utc>,
) -> Result<Vec<Uuid>, RepoError> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        r#"
        SELECT id FROM jobs
        WHERE status IN ('succeeded', 'failed', 'canceled') AND finished_at < ?
        "#,
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

pub async fn delete_jobs(pool: &SqlitePool, ids: &[Uuid]) -> Result<u64, RepoError> {
    let mut deleted = 0;
    for id in ids {
        let result = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await?;
        deleted += result.rows_affected();
    }
    Ok(deleted)
}

pub async fn list_job_ids_for_profile(
    pool: &SqlitePool,
    profile_id: Uuid,
) -> Result<Vec<Uuid>, RepoError> {
    let rows: Vec<(Uuid,)> = sqlx::query_as("SELECT id FROM jobs WHERE profile_id = ?")
        .bind(profile_id)
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

pub async fn list_active_job_ids_for_profile(
    pool: &SqlitePool,
    profile_id: Uuid,
) -> Result<Vec<Uuid>, RepoError> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT id FROM jobs WHERE profile_id = ? AND status IN ('queued', 'running')",
    )
    .bind(profile_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// At most one index job per (profile, bucket) may be queued or running.
pub async fn has_active_index_job(
    pool: &SqlitePool,
    profile_id: Uuid,
    bucket: &str,
) -> Result<bool, RepoError> {
    let row: (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*) FROM jobs
        WHERE profile_id = ?
          AND job_type = 'remote.index.objects'
          AND status IN ('queued', 'running')
          AND json_extract(payload, '$.bucket') = ?
        "#,
    )
    .bind(profile_id)
    .bind(bucket)
    .fetch_one(pool)
    .await?;
    Ok(row.0 > 0)
}

// ==================== Upload sessions ====================

#[allow(clippy::too_many_arguments)]
pub async fn insert_session(
    pool: &SqlitePool,
    id: Uuid,
    profile_id: Uuid,
    bucket: &str,
    key_prefix: &str,
    mode: UploadMode,
    staging_dir: Option<&str>,
    max_bytes: i64,
    ttl_secs: i64,
) -> Result<UploadSession, RepoError> {
    let now = Utc::now();
    let expires_at = now + chrono::Duration::seconds(ttl_secs);
    sqlx::query(
        r#"
        INSERT INTO upload_sessions (
            id, profile_id, bucket, key_prefix, mode, staging_dir,
            bytes_accepted, max_bytes, ttl_secs, created_at, expires_at
        ) VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?)
        "#,
    )
    .bind(id)
    .bind(profile_id)
    .bind(bucket)
    .bind(key_prefix)
    .bind(mode)
    .bind(staging_dir)
    .bind(max_bytes)
    .bind(ttl_secs)
    .bind(now)
    .bind(expires_at)
    .execute(pool)
    .await?;

    get_session(pool, id).await
}

pub async fn get_session(pool: &SqlitePool, id: Uuid) -> Result<UploadSession, RepoError> {
    sqlx::query_as::<_, UploadSession>("SELECT * FROM upload_sessions WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(RepoError::NotFound)
}

/// Atomically account `delta` bytes against the session budget.
/// Returns false when the budget would be exceeded (row untouched).
pub async fn add_session_bytes(
    pool: &SqlitePool,
    id: Uuid,
    delta: i64,
) -> Result<bool, RepoError> {
    let result = sqlx::query(
        r#"
        UPDATE upload_sessions SET bytes_accepted = bytes_accepted + ?1
        WHERE id = ?2 AND (max_bytes = 0 OR bytes_accepted + ?1 <= max_bytes)
        "#,
    )
    .bind(delta)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Roll back byte accounting after a failed write. Floors at zero.
pub async fn subtract_session_bytes(
    pool: &SqlitePool,
    id: Uuid,
    delta: i64,
) -> Result<(), RepoError> {
    sqlx::query(
        "UPDATE upload_sessions SET bytes_accepted = MAX(0, bytes_accepted - ?) WHERE id = ?",
    )
    .bind(delta)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Remove the session row. Returns false when the row was already gone,
/// which lets racing commits claim the session exactly once.
pub async fn delete_session_row(pool: &SqlitePool, id: Uuid) -> Result<bool, RepoError> {
    let result = sqlx::query("DELETE FROM upload_sessions WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn list_expired_sessions(
    pool: &SqlitePool,
    now: DateTime<Utc>,
) -> Result<Vec<UploadSession>, RepoError> {
    Ok(
        sqlx::query_as::<_, UploadSession>("SELECT * FROM upload_sessions WHERE expires_at < ?")
            .bind(now)
            .fetch_all(pool)
            .await?,
    )
}

pub async fn list_sessions_for_profile(
    pool: &SqlitePool,
    profile_id: Uuid,
) -> Result<Vec<UploadSession>, RepoError> {
    Ok(sqlx::query_as::<_, UploadSession>(
        "SELECT * FROM upload_sessions WHERE profile_id = ?",
    )
    .bind(profile_id)
    .fetch_all(pool)
    .await?)
}

// ==================== Multipart bookkeeping ====================

#[allow(clippy::too_many_arguments)]
pub async fn insert_multipart(
    pool: &SqlitePool,
    session_id: Uuid,
    rel_path: &str,
    bucket: &str,
    object_key: &str,
    upload_id: &str,
    part_size: i64,
    file_size: i64,
) -> Result<MultipartUpload, RepoError> {
    let result = sqlx::query(
        r#"
        INSERT INTO multipart_uploads (
            session_id, rel_path, bucket, object_key, upload_id,
            part_size, file_size, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(session_id)
    .bind(rel_path)
    .bind(bucket)
    .bind(object_key)
    .bind(upload_id)
    .bind(part_size)
    .bind(file_size)
    .bind(Utc::now())
    .execute(pool)
    .await;

    match result {
        Ok(_) => get_multipart(pool, session_id, rel_path)
            .await?
            .ok_or(RepoError::NotFound),
        Err(e) if is_unique_violation(&e) => Err(RepoError::Conflict(format!(
            "multipart upload already active for {}",
            rel_path
        ))),
        Err(e) => Err(e.into()),
    }
}

pub async fn get_multipart(
    pool: &SqlitePool,
    session_id: Uuid,
    rel_path: &str,
) -> Result<Option<MultipartUpload>, RepoError> {
    Ok(sqlx::query_as::<_, MultipartUpload>(
        "SELECT * FROM multipart_uploads WHERE session_id = ? AND rel_path = ?",
    )
    .bind(session_id)
    .bind(rel_path)
    .fetch_optional(pool)
    .await?)
}

pub async fn delete_multipart(
    pool: &SqlitePool,
    session_id: Uuid,
    rel_path: &str,
) -> Result<bool, RepoError> {
    let result =
        sqlx::query("DELETE FROM multipart_uploads WHERE session_id = ? AND rel_path = ?")
            .bind(session_id)
            .bind(rel_path)
            .execute(pool)
            .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn list_session_multiparts(
    pool: &SqlitePool,
    session_id: Uuid,
) -> Result<Vec<MultipartUpload>, RepoError> {
    Ok(sqlx::query_as::<_, MultipartUpload>(
        "SELECT * FROM multipart_uploads WHERE session_id = ? ORDER BY rel_path",
    )
    .bind(session_id)
    .fetch_all(pool)
    .await?)
}

// ==================== Object index ====================

pub async fn upsert_index_entry(
    pool: &SqlitePool,
    entry: &ObjectIndexEntry,
) -> Result<(), RepoError> {
    sqlx::query(
        r#"
        INSERT INTO object_index (
            profile_id, bucket, object_key, size, etag, last_modified, indexed_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (profile_id, bucket, object_key) DO UPDATE SET
            size = excluded.size,
            etag = excluded.etag,
            last_modified = excluded.last_modified,
            indexed_at = excluded.indexed_at
        "#,
    )
    .bind(entry.profile_id)
    .bind(&entry.bucket)
    .bind(&entry.object_key)
    .bind(entry.size)
    .bind(&entry.etag)
    .bind(entry.last_modified)
    .bind(entry.indexed_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Remove prior entries for the (profile, bucket), optionally limited to a
/// key prefix. Used by full re-index runs.
pub async fn clear_index(
    pool: &SqlitePool,
    profile_id: Uuid,
    bucket: &str,
    prefix: Option<&str>,
) -> Result<u64, RepoError> {
    let result = match prefix {
        Some(p) if !p.is_empty() => {
            sqlx::query(
                r#"
                DELETE FROM object_index
                WHERE profile_id = ? AND bucket = ? AND object_key LIKE ? ESCAPE '\'
                "#,
            )
            .bind(profile_id)
            .bind(bucket)
            .bind(format!("{}%", like_escape(p)))
            .execute(pool)
            .await?
        }
        _ => {
            sqlx::query("DELETE FROM object_index WHERE profile_id = ? AND bucket = ?")
                .bind(profile_id)
                .bind(bucket)
                .execute(pool)
                .await?
        }
    };
    Ok(result.rows_affected())
}

pub async fn clear_index_for_profile(
    pool: &SqlitePool,
    profile_id: Uuid,
) -> Result<u64, RepoError> {
    let result = sqlx::query("DELETE FROM object_index WHERE profile_id = ?")
        .bind(profile_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Presence of at least one entry marks the bucket as indexed.
pub async fn bucket_is_indexed(
    pool: &SqlitePool,
    profile_id: Uuid,
    bucket: &str,
) -> Result<bool, RepoError> {
    let row: (i64,) = sqlx::query_as(
        "SELECT EXISTS (SELECT 1 FROM object_index WHERE profile_id = ? AND bucket = ?)",
    )
    .bind(profile_id)
    .bind(bucket)
    .fetch_one(pool)
    .await?;
    Ok(row.0 != 0)
}

/// Cursor-paged index search. Returns up to `limit` entries plus the cursor
/// for the next page when more remain.
pub async fn search_index(
    pool: &SqlitePool,
    profile_id: Uuid,
    bucket: &str,
    query: &IndexQuery,
) -> Result<(Vec<ObjectIndexEntry>, Option<String>), RepoError> {
    let limit = query.limit.unwrap_or(100).clamp(1, 1000) as i64;

    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT profile_id, bucket, object_key, size, etag, last_modified, indexed_at \
         FROM object_index WHERE profile_id = ",
    );
    qb.push_bind(profile_id);
    qb.push(" AND bucket = ").push_bind(bucket);

    if let Some(prefix) = query.key_prefix.as_deref().filter(|p| !p.is_empty()) {
        qb.push(" AND object_key LIKE ")
            .push_bind(format!("{}%", like_escape(prefix)))
            .push(" ESCAPE '\\'");
    }
    if let Some(ext) = query.extension.as_deref().filter(|e| !e.is_empty()) {
        let ext = ext.trim_start_matches('.');
        qb.push(" AND object_key LIKE ")
            .push_bind(format!("%.{}", like_escape(ext)))
            .push(" ESCAPE '\\'");
    }
    if let Some(min) = query.min_size {
        qb.push(" AND size >= ").push_bind(min);
    }
    if let Some(max) = query.max_size {
        qb.push(" AND size <= ").push_bind(max);
    }
    if let Some(after) = query.modified_after {
        qb.push(" AND last_modified >= ").push_bind(after);
    }
    if let Some(before) = query.modified_before {
        qb.push(" AND last_modified <= ").push_bind(before);
    }
    if let Some(cursor) = query.cursor.as_deref().filter(|c| !c.is_empty()) {
        qb.push(" AND object_key > ").push_bind(cursor.to_string());
    }
    qb.push(" ORDER BY object_key ASC LIMIT ").push_bind(limit + 1);

    let mut entries: Vec<ObjectIndexEntry> =
        qb.build_query_as().fetch_all(pool).await?;

    let next_cursor = if entries.len() as i64 > limit {
        entries.truncate(limit as usize);
        entries.last().map(|e| e.object_key.clone())
    } else {
        None
    };
    Ok((entries, next_cursor))
}

/// Totals for the (profile, bucket) slice of the index.
pub struct IndexSummary {
    pub objects: i64,
    pub total_size: i64,
    pub last_indexed_at: Option<DateTime<Utc>>,
}

pub async fn index_summary(
    pool: &SqlitePool,
    profile_id: Uuid,
    bucket: &str,
) -> Result<IndexSummary, RepoError> {
    let row: (i64, i64, Option<DateTime<Utc>>) = sqlx::query_as(
        r#"
        SELECT COUNT(*), COALESCE(SUM(size), 0), MAX(indexed_at)
        FROM object_index WHERE profile_id = ? AND bucket = ?
        "#,
    )
    .bind(profile_id)
    .bind(bucket)
    .fetch_one(pool)
    .await?;
    Ok(IndexSummary {
        objects: row.0,
        total_size: row.1,
        last_indexed_at: row.2,
    })
}

pub async fn index_samples(
    pool: &SqlitePool,
    profile_id: Uuid,
    bucket: &str,
    limit: i64,
) -> Result<Vec<ObjectIndexEntry>, RepoError> {
    Ok(sqlx::query_as::<_, ObjectIndexEntry>(
        r#"
        SELECT * FROM object_index
        WHERE profile_id = ? AND bucket = ?
        ORDER BY size DESC LIMIT ?
        "#,
    )
    .bind(profile_id)
    .bind(bucket)
    .bind(limit)
    .fetch_all(pool)
    .await?)
}

/// Escape LIKE wildcards so user input is matched literally.
fn like_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;
    use crate::models::StorageProvider;
    use serde_json::json;

    fn profile_input(name: &str) -> CreateProfileInput {
        CreateProfileInput {
            name: name.to_string(),
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
        }
    }

    async fn seed_job(pool: &SqlitePool) -> (Uuid, Uuid) {
        let profile = create_profile(pool, &profile_input("test")).await.unwrap();
        let job_id = Uuid::new_v4();
        insert_job(pool, job_id, profile.id, "transfer.sync.local_to_remote", &json!({}))
            .await
            .unwrap();
        (profile.id, job_id)
    }

    #[tokio::test]
    async fn profile_crud_round_trip() {
        let pool = memory_pool().await.unwrap();
        let created = create_profile(&pool, &profile_input("minio")).await.unwrap();
        assert_eq!(created.name, "minio");
        assert_eq!(created.provider, StorageProvider::S3);
        assert!(created.path_style);

        let updated = update_profile(
            &pool,
            created.id,
            &UpdateProfileInput {
                name: Some("minio-2".into()),
                endpoint: None,
                region: None,
                access_key: None,
                secret_key: None,
                session_token: None,
                tls_ca_pem: None,
                tls_client_cert_pem: None,
                tls_client_key_pem: None,
                path_style: None,
                preserve_leading_slash: None,
                skip_verify: Some(true),
            },
        )
        .await
        .unwrap();
        assert_eq!(updated.name, "minio-2");
        assert!(updated.skip_verify);
        // Untouched fields survive the partial update.
        assert_eq!(updated.endpoint.as_deref(), Some("http://127.0.0.1:9000"));

        delete_profile_row(&pool, created.id).await.unwrap();
        assert!(matches!(
            get_profile(&pool, created.id).await,
            Err(RepoError::NotFound)
        ));
    }

    #[tokio::test]
    async fn job_status_transitions_are_guarded() {
        let pool = memory_pool().await.unwrap();
        let (_pid, job_id) = seed_job(&pool).await;

        assert!(mark_job_running(&pool, job_id).await.unwrap());
        // A second pickup of the same job must lose the race.
        assert!(!mark_job_running(&pool, job_id).await.unwrap());

        assert!(mark_job_terminal(&pool, job_id, JobStatus::Succeeded, None, None)
            .await
            .unwrap());
        // Terminal exactly once.
        assert!(!mark_job_terminal(&pool, job_id, JobStatus::Failed, None, None)
            .await
            .unwrap());

        let job = get_job(&pool, job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert!(job.finished_at.is_some());
    }

    #[tokio::test]
    async fn cancel_queued_sets_canceled_code() {
        let pool = memory_pool().await.unwrap();
        let (_pid, job_id) = seed_job(&pool).await;

        assert!(cancel_queued_job(&pool, job_id).await.unwrap());
        // Idempotent: a second cancel is a no-op.
        assert!(!cancel_queued_job(&pool, job_id).await.unwrap());

        let job = get_job(&pool, job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Canceled);
        assert_eq!(job.error_code.as_deref(), Some("canceled"));
        assert!(job.started_at.is_none());
    }

    #[tokio::test]
    async fn session_byte_budget_is_atomic() {
        let pool = memory_pool().await.unwrap();
        let profile = create_profile(&pool, &profile_input("p")).await.unwrap();
        let session = insert_session(
            &pool,
            Uuid::new_v4(),
            profile.id,
            "bucket",
            "",
            UploadMode::Staging,
            Some("/tmp/x"),
            1024,
            60,
        )
        .await
        .unwrap();

        assert!(add_session_bytes(&pool, session.id, 1000).await.unwrap());
        // 1000 + 2000 > 1024: rejected, accounting unchanged.
        assert!(!add_session_bytes(&pool, session.id, 2000).await.unwrap());
        let s = get_session(&pool, session.id).await.unwrap();
        assert_eq!(s.bytes_accepted, 1000);

        subtract_session_bytes(&pool, session.id, 600).await.unwrap();
        let s = get_session(&pool, session.id).await.unwrap();
        assert_eq!(s.bytes_accepted, 400);
    }

    #[tokio::test]
    async fn multipart_record_is_unique_per_session_path() {
        let pool = memory_pool().await.unwrap();
        let profile = create_profile(&pool, &profile_input("p")).await.unwrap();
        let session_id = Uuid::new_v4();
        insert_session(
            &pool, session_id, profile.id, "b", "", UploadMode::Presigned, None, 0, 60,
        )
        .await
        .unwrap();

        insert_multipart(&pool, session_id, "a/b.bin", "b", "pre/a/b.bin", "up-1", 5 << 20, 100 << 20)
            .await
            .unwrap();
        let dup = insert_multipart(
            &pool, session_id, "a/b.bin", "b", "pre/a/b.bin", "up-2", 5 << 20, 100 << 20,
        )
        .await;
        assert!(matches!(dup, Err(RepoError::Conflict(_))));

        assert!(delete_multipart(&pool, session_id, "a/b.bin").await.unwrap());
        assert!(!delete_multipart(&pool, session_id, "a/b.bin").await.unwrap());
    }

    #[tokio::test]
    async fn index_upsert_replaces_atomically() {
        let pool = memory_pool().await.unwrap();
        let profile_id = Uuid::new_v4();
        let mut entry = ObjectIndexEntry {
            profile_id,
            bucket: "b".into(),
            object_key: "photos/cat.jpg".into(),
            size: 100,
            etag: Some("v1".into()),
            last_modified: Some(Utc::now()),
            indexed_at: Utc::now(),
        };
        upsert_index_entry(&pool, &entry).await.unwrap();
        entry.size = 200;
        entry.etag = Some("v2".into());
        upsert_index_entry(&pool, &entry).await.unwrap();

        let summary = index_summary(&pool, profile_id, "b").await.unwrap();
        assert_eq!(summary.objects, 1);
        assert_eq!(summary.total_size, 200);
        assert!(bucket_is_indexed(&pool, profile_id, "b").await.unwrap());
        assert!(!bucket_is_indexed(&pool, profile_id, "other").await.unwrap());
    }

    #[tokio::test]
    async fn index_search_filters_and_pages() {
        let pool = memory_pool().await.unwrap();
        let profile_id = Uuid::new_v4();
        let now = Utc::now();
        for (key, size) in [
            ("docs/a.pdf", 10),
            ("docs/b.pdf", 2000),
            ("docs/c.txt", 30),
            ("photos/d.jpg", 40),
        ] {
            upsert_index_entry(
                &pool,
                &ObjectIndexEntry {
                    profile_id,
                    bucket: "b".into(),
                    object_key: key.into(),
                    size,
                    etag: None,
                    last_modified: Some(now),
                    indexed_at: now,
                },
            )
            .await
            .unwrap();
        }

        // Prefix filter
        let (hits, _) = search_index(
            &pool,
            profile_id,
            "b",
            &IndexQuery {
                key_prefix: Some("docs/".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(hits.len(), 3);

        // Extension + size range
        let (hits, _) = search_index(
            &pool,
            profile_id,
            "b",
            &IndexQuery {
                extension: Some("pdf".into()),
                min_size: Some(100),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].object_key, "docs/b.pdf");

        // Cursor paging: page size 2, then resume.
        let (page1, cursor) = search_index(
            &pool,
            profile_id,
            "b",
            &IndexQuery {
                limit: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(page1.len(), 2);
        let cursor = cursor.expect("more pages remain");
        let (page2, cursor2) = search_index(
            &pool,
            profile_id,
            "b",
            &IndexQuery {
                limit: Some(2),
                cursor: Some(cursor),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(page2.len(), 2);
        assert!(cursor2.is_none());
        let all: Vec<_> = page1.iter().chain(&page2).map(|e| e.object_key.clone()).collect();
        assert_eq!(all, vec!["docs/a.pdf", "docs/b.pdf", "docs/c.txt", "photos/d.jpg"]);
    }

    #[test]
    fn like_escape_makes_wildcards_literal() {
        assert_eq!(like_escape("a%b_c"), "a\\%b\\_c");
        assert_eq!(like_escape("back\\slash"), "back\\\\slash");
    }
}
