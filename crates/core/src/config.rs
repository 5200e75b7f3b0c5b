//! Daemon configuration loaded from environment variables
//!
//! Every tunable has a sensible default so `bucketd` starts with no
//! environment at all. Paths under the data root follow a fixed layout:
//!
//! ```text
//! <root>/staging/<sessionId>/...       staging session trees
//! <root>/logs/jobs/<jobId>.log         per-job captured stdout+stderr
//! <root>/artifacts/jobs/<jobId>.zip    zip-job output
//! <root>/tmp/engine/*.conf             short-lived engine configs
//! ```

use std::path::{Path, PathBuf};
use uuid::Uuid;

const DEFAULT_LISTEN: &str = "127.0.0.1:7440";
const DEFAULT_JOB_CONCURRENCY: usize = 2;
const DEFAULT_JOB_QUEUE_CAPACITY: usize = 64;
const DEFAULT_JOB_RETENTION_DAYS: i64 = 14;
const DEFAULT_JOB_LOG_RETENTION_DAYS: i64 = 7;
const DEFAULT_JOB_LOG_MAX_BYTES: u64 = 2 * 1024 * 1024;
const DEFAULT_UPLOAD_SESSION_TTL_SECS: i64 = 86_400;
const DEFAULT_UPLOAD_MAX_CONCURRENT: usize = 8;
const DEFAULT_EVENT_BACKLOG: usize = 512;
const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;
const DEFAULT_ENGINE_BINARY: &str = "rclone";
const DEFAULT_ENGINE_MIN_VERSION: &str = "1.60.0";
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 3600;

/// Daemon-wide configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_root: PathBuf,
    pub db_path: PathBuf,
    pub listen: String,
    pub job_concurrency: usize,
    pub job_queue_capacity: usize,
    pub job_retention_days: i64,
    pub job_log_retention_days: i64,
    pub job_log_max_bytes: u64,
    pub upload_session_ttl_secs: i64,
    /// 0 means unlimited
    pub upload_max_bytes: i64,
    pub upload_max_concurrent_requests: usize,
    pub event_backlog: usize,
    pub subscriber_buffer: usize,
    pub engine_binary: String,
    pub engine_min_version: String,
    pub sweep_interval_secs: u64,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl AppConfig {
    /// Load configuration from `BUCKETD_*` environment variables
    pub fn from_env() -> Self {
        let data_root = std::env::var("BUCKETD_DATA_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));

        let db_path = std::env::var("BUCKETD_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_root.join("bucketd.db"));

        Self {
            data_root,
            db_path,
            listen: std::env::var("BUCKETD_LISTEN").unwrap_or_else(|_| DEFAULT_LISTEN.to_string()),
            job_concurrency: env_parse("BUCKETD_JOB_CONCURRENCY", DEFAULT_JOB_CONCURRENCY).max(1),
            job_queue_capacity: env_parse("BUCKETD_JOB_QUEUE_CAPACITY", DEFAULT_JOB_QUEUE_CAPACITY)
                .max(1),
            job_retention_days: env_parse("BUCKETD_JOB_RETENTION_DAYS", DEFAULT_JOB_RETENTION_DAYS),
            job_log_retention_days: env_parse(
                "BUCKETD_JOB_LOG_RETENTION_DAYS",
                DEFAULT_JOB_LOG_RETENTION_DAYS,
            ),
            job_log_max_bytes: env_parse("BUCKETD_JOB_LOG_MAX_BYTES", DEFAULT_JOB_LOG_MAX_BYTES),
            upload_session_ttl_secs: env_parse(
                "BUCKETD_UPLOAD_SESSION_TTL_SECS",
                DEFAULT_UPLOAD_SESSION_TTL_SECS,
            ),
            upload_max_bytes: env_parse("BUCKETD_UPLOAD_MAX_BYTES", 0),
            upload_max_concurrent_requests: env_parse(
                "BUCKETD_UPLOAD_MAX_CONCURRENT_REQUESTS",
                DEFAULT_UPLOAD_MAX_CONCURRENT,
            )
            .max(1),
            event_backlog: env_parse("BUCKETD_EVENT_BACKLOG", DEFAULT_EVENT_BACKLOG).max(1),
            subscriber_buffer: env_parse("BUCKETD_SUBSCRIBER_BUFFER", DEFAULT_SUBSCRIBER_BUFFER)
                .max(1),
            engine_binary: std::env::var("BUCKETD_ENGINE_BINARY")
                .unwrap_or_else(|_| DEFAULT_ENGINE_BINARY.to_string()),
            engine_min_version: std::env::var("BUCKETD_ENGINE_MIN_VERSION")
                .unwrap_or_else(|_| DEFAULT_ENGINE_MIN_VERSION.to_string()),
            sweep_interval_secs: env_parse("BUCKETD_SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL_SECS),
        }
    }

    /// Create the data root directory tree
    pub fn ensure_layout(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.staging_root())?;
        std::fs::create_dir_all(self.job_log_root())?;
        std::fs::create_dir_all(self.artifact_root())?;
        std::fs::create_dir_all(self.engine_tmp_root())?;
        Ok(())
    }

    pub fn staging_root(&self) -> PathBuf {
        self.data_root.join("staging")
    }

    pub fn staging_dir(&self, session_id: Uuid) -> PathBuf {
        self.staging_root().join(session_id.to_string())
    }

    pub fn job_log_root(&self) -> PathBuf {
        self.data_root.join("logs").join("jobs")
    }

    pub fn job_log_path(&self, job_id: Uuid) -> PathBuf {
        self.job_log_root().join(format!("{}.log", job_id))
    }

    pub fn artifact_root(&self) -> PathBuf {
        self.data_root.join("artifacts").join("jobs")
    }

    pub fn artifact_path(&self, job_id: Uuid) -> PathBuf {
        self.artifact_root().join(format!("{}.zip", job_id))
    }

    pub fn engine_tmp_root(&self) -> PathBuf {
        self.data_root.join("tmp").join("engine")
    }

    /// True when `path` resolves underneath `root` once both are canonicalized.
    /// The candidate's parent is canonicalized when the leaf does not exist yet.
    pub fn path_is_under(root: &Path, path: &Path) -> bool {
        let canon_root = match root.canonicalize() {
            Ok(p) => p,
            Err(_) => return false,
        };
        let canon = if path.exists() {
            path.canonicalize()
        } else {
            match (path.parent(), path.file_name()) {
                (Some(parent), Some(name)) => parent.canonicalize().map(|p| p.join(name)),
                _ => return false,
            }
        };
        match canon {
            Ok(p) => p.starts_with(&canon_root),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_env() {
        let cfg = AppConfig::from_env();
        assert!(cfg.job_concurrency >= 1);
        assert!(cfg.job_queue_capacity >= 1);
        assert_eq!(cfg.engine_binary, "rclone");
    }

    #[test]
    fn layout_paths_are_nested_under_root() {
        let cfg = AppConfig {
            data_root: PathBuf::from("/srv/bucketd"),
            db_path: PathBuf::from("/srv/bucketd/bucketd.db"),
            listen: DEFAULT_LISTEN.into(),
            job_concurrency: 2,
            job_queue_capacity: 64,
            job_retention_days: 14,
            job_log_retention_days: 7,
            job_log_max_bytes: 1024,
            upload_session_ttl_secs: 60,
            upload_max_bytes: 0,
            upload_max_concurrent_requests: 8,
            event_backlog: 16,
            subscriber_buffer: 16,
            engine_binary: "rclone".into(),
            engine_min_version: "1.60.0".into(),
            sweep_interval_secs: 3600,
        };
        let id = Uuid::new_v4();
        assert!(cfg.job_log_path(id).starts_with("/srv/bucketd/logs/jobs"));
        assert!(cfg.artifact_path(id).starts_with("/srv/bucketd/artifacts/jobs"));
        assert!(cfg.staging_dir(id).starts_with("/srv/bucketd/staging"));
    }

    #[test]
    fn path_containment_rejects_escape() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("staging");
        std::fs::create_dir_all(&root).unwrap();
        assert!(AppConfig::path_is_under(&root, &root.join("a/b.txt")) == false);
        std::fs::create_dir_all(root.join("a")).unwrap();
        assert!(AppConfig::path_is_under(&root, &root.join("a/b.txt")));
        assert!(!AppConfig::path_is_under(&root, &tmp.path().join("outside.txt")));
    }
}
