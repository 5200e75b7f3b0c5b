//! Queue ownership, cancellation registry, and the worker pool entry point

use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use bucketd_core::config::AppConfig;
use bucketd_core::events::{EventHub, EventType};
use bucketd_core::models::{JobStatus, Profile};
use bucketd_core::repo::{self, RepoError};
use bucketd_engine::{Engine, EngineError, RemoteContext};

use crate::types::is_supported_job_type;
use crate::worker;

#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("job queue is full; try again later")]
    QueueFull,
    #[error("job manager is shutting down")]
    Closed,
}

/// Outcome of a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CancelOutcome {
    /// Running worker was signaled; termination is asynchronous
    Signaled,
    /// Queued (or orphaned) job transitioned straight to canceled
    Canceled,
    /// Job already terminal; nothing to do
    Noop,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueStats {
    pub depth: usize,
    pub capacity: usize,
}

pub struct JobManager {
    pub(crate) pool: SqlitePool,
    pub(crate) hub: Arc<EventHub>,
    pub(crate) engine: Engine,
    pub(crate) config: AppConfig,
    queue_tx: mpsc::Sender<Uuid>,
    queue_rx: Mutex<Option<mpsc::Receiver<Uuid>>>,
    depth: AtomicUsize,
    cancels: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl JobManager {
    pub fn new(
        pool: SqlitePool,
        hub: Arc<EventHub>,
        engine: Engine,
        config: AppConfig,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(config.job_queue_capacity);
        Arc::new(Self {
            pool,
            hub,
            engine,
            config,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            depth: AtomicUsize::new(0),
            cancels: Mutex::new(HashMap::new()),
        })
    }

    pub fn is_supported_job_type(&self, tag: &str) -> bool {
        is_supported_job_type(tag)
    }

    /// Hand a persisted job id to the queue. Non-blocking; the caller owns
    /// the persisted row on failure (marks it failed or rolls it back).
    pub fn enqueue(&self, job_id: Uuid) -> Result<(), EnqueueError> {
        match self.queue_tx.try_send(job_id) {
            Ok(()) => {
                self.depth.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(EnqueueError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(EnqueueError::Closed),
        }
    }

    pub fn queue_stats(&self) -> QueueStats {
        QueueStats {
            depth: self.depth.load(Ordering::Relaxed),
            capacity: self.config.job_queue_capacity,
        }
    }

    /// Idempotent cancellation.
    ///
    /// Running jobs get their cancellation scope fired and terminate through
    /// the owning worker. Queued jobs transition directly. Terminal jobs are
    /// left alone.
    pub async fn cancel(&self, job_id: Uuid) -> Result<CancelOutcome, RepoError> {
        let token = self.cancels.lock().unwrap_or_else(|p| p.into_inner()).get(&job_id).cloned();
        if let Some(token) = token {
            token.cancel();
            info!("Signaled cancellation for running job {}", job_id);
            return Ok(CancelOutcome::Signaled);
        }

        if repo::cancel_queued_job(&self.pool, job_id).await? {
            let job = repo::get_job(&self.pool, job_id).await?;
            self.hub.publish(
                EventType::JobCompleted,
                Some(job_id),
                serde_json::to_value(&job).unwrap_or_default(),
            );
            return Ok(CancelOutcome::Canceled);
        }

        let job = repo::get_job(&self.pool, job_id).await?;
        if job.status.is_terminal() {
            return Ok(CancelOutcome::Noop);
        }

        // Running row without a registered scope: an orphan from an unclean
        // shutdown. Close it out directly.
        warn!("Canceling orphaned running job {}", job_id);
        if repo::mark_job_terminal(&self.pool, job_id, JobStatus::Canceled, None, Some("canceled"))
            .await?
        {
            let job = repo::get_job(&self.pool, job_id).await?;
            self.hub.publish(
                EventType::JobCompleted,
                Some(job_id),
                serde_json::to_value(&job).unwrap_or_default(),
            );
        }
        Ok(CancelOutcome::Canceled)
    }

    /// Synchronous in-band probe: resolve the profile, verify the engine,
    /// and stat the remote root.
    pub async fn test_connectivity(
        &self,
        profile: &Profile,
    ) -> Result<serde_json::Value, EngineError> {
        let engine_version = self.engine.verify_version().await?;
        let ctx = RemoteContext::prepare(&self.config.engine_tmp_root(), profile)?;
        let cancel = CancellationToken::new();
        let output = self
            .engine
            .run_capture(&ctx, &["lsjson", "--stat", "target:"], &cancel)
            .await?;

        let details: serde_json::Value =
            serde_json::from_str(output.stdout.trim()).unwrap_or(serde_json::Value::Null);
        Ok(serde_json::json!({
            "ok": true,
            "engineVersion": engine_version,
            "details": details,
        }))
    }

    /// Dispatch loop. Spawns the worker pool and blocks until the shutdown
    /// signal fires and in-flight jobs settle.
    pub async fn run(self: &Arc<Self>, shutdown: CancellationToken) {
        let rx = self
            .queue_rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        let Some(rx) = rx else {
            warn!("Job manager run() called twice; ignoring");
            return;
        };

        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let mut workers = JoinSet::new();
        for worker_id in 0..self.config.job_concurrency {
            workers.spawn(worker::worker_loop(
                self.clone(),
                rx.clone(),
                shutdown.clone(),
                worker_id,
            ));
        }
        info!(
            "Job manager running with {} workers, queue capacity {}",
            self.config.job_concurrency, self.config.job_queue_capacity
        );

        while workers.join_next().await.is_some() {}
        info!("Job manager stopped");
    }

    pub(crate) fn note_dequeued(&self) {
        self.depth.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn register_cancel(&self, job_id: Uuid) -> CancellationToken {
        let token = CancellationToken::new();
        self.cancels
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(job_id, token.clone());
        token
    }

    pub(crate) fn unregister_cancel(&self, job_id: Uuid) {
        self.cancels
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bucketd_core::db::memory_pool;
    use bucketd_core::models::{CreateProfileInput, StorageProvider};
    use serde_json::json;

    async fn manager_with(capacity: usize) -> (Arc<JobManager>, SqlitePool) {
        let pool = memory_pool().await.unwrap();
        let hub = Arc::new(EventHub::new(64, 64));
        let mut config = test_config();
        config.job_queue_capacity = capacity;
        let engine = Engine::new("rclone", "1.60.0", config.engine_tmp_root()).unwrap();
        let manager = JobManager::new(pool.clone(), hub, engine, config);
        (manager, pool)
    }

    fn test_config() -> AppConfig {
        let mut config = AppConfig::from_env();
        config.data_root = std::env::temp_dir().join("bucketd-manager-tests");
        config.job_queue_capacity = 4;
        config
    }

    async fn seed_job(pool: &SqlitePool) -> Uuid {
        let profile = repo::create_profile(
            pool,
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
        let id = Uuid::new_v4();
        repo::insert_job(pool, id, profile.id, "remote.zip.prefix", &json!({"bucket":"b"}))
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn enqueue_reports_queue_full_at_capacity() {
        let (manager, _pool) = manager_with(1).await;
        manager.enqueue(Uuid::new_v4()).unwrap();
        assert!(matches!(
            manager.enqueue(Uuid::new_v4()),
            Err(EnqueueError::QueueFull)
        ));
        let stats = manager.queue_stats();
        assert_eq!(stats.depth, 1);
        assert_eq!(stats.capacity, 1);
    }

    #[tokio::test]
    async fn cancel_of_queued_job_is_direct_and_idempotent() {
        let (manager, pool) = manager_with(4).await;
        let job_id = seed_job(&pool).await;

        assert_eq!(manager.cancel(job_id).await.unwrap(), CancelOutcome::Canceled);
        // Second cancel: terminal, no-op.
        assert_eq!(manager.cancel(job_id).await.unwrap(), CancelOutcome::Noop);

        let job = repo::get_job(&pool, job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Canceled);
        assert_eq!(job.error_code.as_deref(), Some("canceled"));
    }

    #[tokio::test]
    async fn cancel_of_running_job_fires_the_scope() {
        let (manager, pool) = manager_with(4).await;
        let job_id = seed_job(&pool).await;
        repo::mark_job_running(&pool, job_id).await.unwrap();
        let token = manager.register_cancel(job_id);

        assert_eq!(manager.cancel(job_id).await.unwrap(), CancelOutcome::Signaled);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn supported_type_check_is_closed_set() {
        let (manager, _pool) = manager_with(4).await;
        assert!(manager.is_supported_job_type("transfer.sync.local_to_remote"));
        assert!(!manager.is_supported_job_type("transfer.everything"));
    }
}
