//! Retention sweeper
//!
//! Periodically purges terminal jobs older than the retention window, along
//! with their log files and artifacts, and separately trims job logs on a
//! shorter window. Purged ids are announced with a `jobs.deleted` event.

use chrono::{Duration, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use bucketd_core::config::AppConfig;
use bucketd_core::events::{EventHub, EventType};
use bucketd_core::repo::{self, RepoError};

pub async fn run_sweeper(
    pool: SqlitePool,
    hub: Arc<EventHub>,
    config: AppConfig,
    shutdown: CancellationToken,
) {
    let mut interval =
        tokio::time::interval(std::time::Duration::from_secs(config.sweep_interval_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = interval.tick() => {}
        }
        if let Err(e) = sweep_once(&pool, &hub, &config).await {
            error!("Retention sweep failed: {}", e);
        }
    }
}

/// One sweep pass: purge expired jobs, then trim logs on the log-only window.
pub async fn sweep_once(
    pool: &SqlitePool,
    hub: &EventHub,
    config: &AppConfig,
) -> Result<(), RepoError> {
    let job_cutoff = Utc::now() - Duration::days(config.job_retention_days);
    let purged = purge_jobs(pool, config, job_cutoff).await?;
    if !purged.is_empty() {
        info!("Retention sweep purged {} jobs", purged.len());
        hub.publish(
            EventType::JobsDeleted,
            None,
            serde_json::json!({ "ids": purged }),
        );
    }

    // Logs age out faster than job rows.
    if config.job_log_retention_days < config.job_retention_days {
        let log_cutoff = Utc::now() - Duration::days(config.job_log_retention_days);
        for id in repo::list_purgeable_jobs(pool, log_cutoff).await? {
            remove_if_exists(&config.job_log_path(id));
        }
    }
    Ok(())
}

async fn purge_jobs(
    pool: &SqlitePool,
    config: &AppConfig,
    cutoff: chrono::DateTime<Utc>,
) -> Result<Vec<Uuid>, RepoError> {
    let ids = repo::list_purgeable_jobs(pool, cutoff).await?;
    if ids.is_empty() {
        return Ok(ids);
    }
    for id in &ids {
        remove_if_exists(&config.job_log_path(*id));
        remove_if_exists(&config.artifact_path(*id));
    }
    repo::delete_jobs(pool, &ids).await?;
    Ok(ids)
}

/// Delete every job (and its artifacts) belonging to a profile. Used by the
/// profile-deletion cascade; no retention window applies.
pub async fn purge_profile_jobs(
    pool: &SqlitePool,
    config: &AppConfig,
    profile_id: Uuid,
) -> Result<Vec<Uuid>, RepoError> {
    let ids = repo::list_job_ids_for_profile(pool, profile_id).await?;
    for id in &ids {
        remove_if_exists(&config.job_log_path(*id));
        remove_if_exists(&config.artifact_path(*id));
    }
    repo::delete_jobs(pool, &ids).await?;
    Ok(ids)
}

fn remove_if_exists(path: &std::path::Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            error!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bucketd_core::db::memory_pool;
    use bucketd_core::events::EventHub;
    use bucketd_core::models::{CreateProfileInput, JobStatus, StorageProvider};
    use serde_json::json;

    fn test_config(root: &std::path::Path) -> AppConfig {
        let mut config = AppConfig::from_env();
        config.data_root = root.to_path_buf();
        config.job_retention_days = 0;
        config.job_log_retention_days = 0;
        config
    }

    #[tokio::test]
    async fn terminal_jobs_past_the_window_are_purged_with_artifacts() {
        let pool = memory_pool().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        config.ensure_layout().unwrap();
        let hub = EventHub::new(16, 16);

        let profile = repo::create_profile(
            &pool,
            &CreateProfileInput {
                name: "p".into(),
                provider: StorageProvider::S3,
                endpoint: None,
                region: None,
                access_key: None,
                secret_key: None,
                session_token: None,
                tls_ca_pem: None,
                tls_client_cert_pem: None,
                tls_client_key_pem: None,
                path_style: false,
                preserve_leading_slash: false,
                skip_verify: false,
            },
        )
        .await
        .unwrap();

        // One finished job with a log and artifact, one still queued.
        let done = Uuid::new_v4();
        repo::insert_job(&pool, done, profile.id, "remote.zip.prefix", &json!({"bucket":"b"}))
            .await
            .unwrap();
        repo::mark_job_running(&pool, done).await.unwrap();
        repo::mark_job_terminal(&pool, done, JobStatus::Succeeded, None, None)
            .await
            .unwrap();
        std::fs::write(config.job_log_path(done), "log").unwrap();
        std::fs::write(config.artifact_path(done), "zip").unwrap();

        let queued = Uuid::new_v4();
        repo::insert_job(&pool, queued, profile.id, "remote.zip.prefix", &json!({"bucket":"b"}))
            .await
            .unwrap();

        // Zero-day retention: anything finished before "now" is eligible.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        sweep_once(&pool, &hub, &config).await.unwrap();

        assert!(matches!(
            repo::get_job(&pool, done).await,
            Err(RepoError::NotFound)
        ));
        assert!(!config.job_log_path(done).exists());
        assert!(!config.artifact_path(done).exists());
        // Non-terminal jobs survive.
        assert!(repo::get_job(&pool, queued).await.is_ok());

        // The purge announced its ids.
        let (replay, _rx) = hub.subscribe(0, false);
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].event_type, EventType::JobsDeleted);
    }
}
