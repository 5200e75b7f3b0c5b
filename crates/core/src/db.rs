//! Embedded sqlite pool and schema bootstrap

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use tracing::info;

/// Full schema, applied idempotently at startup.
///
/// Uuid columns are BLOB (sqlx encodes `uuid::Uuid` as a 16-byte blob),
/// timestamps are RFC3339 TEXT.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS profiles (
    id                      BLOB PRIMARY KEY,
    name                    TEXT NOT NULL,
    provider                TEXT NOT NULL,
    endpoint                TEXT,
    region                  TEXT,
    access_key              TEXT,
    secret_key              TEXT,
    session_token           TEXT,
    tls_ca_pem              TEXT,
    tls_client_cert_pem     TEXT,
    tls_client_key_pem      TEXT,
    path_style              BOOLEAN NOT NULL DEFAULT FALSE,
    preserve_leading_slash  BOOLEAN NOT NULL DEFAULT FALSE,
    skip_verify             BOOLEAN NOT NULL DEFAULT FALSE,
    created_at              TEXT NOT NULL,
    updated_at              TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS jobs (
    id              BLOB PRIMARY KEY,
    profile_id      BLOB NOT NULL,
    job_type        TEXT NOT NULL,
    payload         TEXT NOT NULL,
    status          TEXT NOT NULL,
    bytes_done      INTEGER NOT NULL DEFAULT 0,
    bytes_total     INTEGER NOT NULL DEFAULT 0,
    objects_done    INTEGER NOT NULL DEFAULT 0,
    objects_total   INTEGER NOT NULL DEFAULT 0,
    error_message   TEXT,
    error_code      TEXT,
    created_at      TEXT NOT NULL,
    started_at      TEXT,
    finished_at     TEXT
);
CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs (status);
CREATE INDEX IF NOT EXISTS idx_jobs_profile ON jobs (profile_id);
CREATE INDEX IF NOT EXISTS idx_jobs_finished ON jobs (finished_at);

CREATE TABLE IF NOT EXISTS upload_sessions (
    id              BLOB PRIMARY KEY,
    profile_id      BLOB NOT NULL,
    bucket          TEXT NOT NULL,
    key_prefix      TEXT NOT NULL DEFAULT '',
    mode            TEXT NOT NULL,
    staging_dir     TEXT,
    bytes_accepted  INTEGER NOT NULL DEFAULT 0,
    max_bytes       INTEGER NOT NULL DEFAULT 0,
    ttl_secs        INTEGER NOT NULL,
    created_at      TEXT NOT NULL,
    expires_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sessions_expires ON upload_sessions (expires_at);

CREATE TABLE IF NOT EXISTS multipart_uploads (
    session_id  BLOB NOT NULL,
    rel_path    TEXT NOT NULL,
    bucket      TEXT NOT NULL,
    object_key  TEXT NOT NULL,
    upload_id   TEXT NOT NULL,
    part_size   INTEGER NOT NULL,
    file_size   INTEGER NOT NULL,
    created_at  TEXT NOT NULL,
    PRIMARY KEY (session_id, rel_path)
);

CREATE TABLE IF NOT EXISTS object_index (
    profile_id    BLOB NOT NULL,
    bucket        TEXT NOT NULL,
    object_key    TEXT NOT NULL,
    size          INTEGER NOT NULL DEFAULT 0,
    etag          TEXT,
    last_modified TEXT,
    indexed_at    TEXT NOT NULL,
    PRIMARY KEY (profile_id, bucket, object_key)
);
CREATE INDEX IF NOT EXISTS idx_object_index_key ON object_index (profile_id, bucket, object_key);
"#;

/// Open (creating if missing) the database file and apply the schema
pub async fn init_pool(path: &Path) -> Result<SqlitePool, sqlx::Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;

    apply_schema(&pool).await?;
    info!("Database ready at {}", path.display());
    Ok(pool)
}

pub async fn apply_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    Ok(())
}

/// In-memory pool for tests. A single connection, otherwise every pooled
/// connection would open its own private ':memory:' database.
pub async fn memory_pool() -> Result<SqlitePool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    apply_schema(&pool).await?;
    Ok(pool)
}
