//! Worker loop: claim a queued id, run it, finalize exactly once

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use bucketd_core::events::{EventHub, EventType};
use bucketd_core::models::{JobProgress, JobStatus};
use bucketd_core::repo::{self, RepoError};
use sqlx::SqlitePool;

use crate::handlers::{self, JobContext};
use crate::joblog::JobLogWriter;
use crate::manager::JobManager;

/// Progress events are throttled to this interval while a job runs.
pub(crate) const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

pub(crate) async fn worker_loop(
    manager: Arc<JobManager>,
    rx: Arc<Mutex<mpsc::Receiver<Uuid>>>,
    shutdown: CancellationToken,
    worker_id: usize,
) {
    loop {
        let job_id = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = shutdown.cancelled() => return,
                id = rx.recv() => match id {
                    Some(id) => id,
                    None => return,
                },
            }
        };
        manager.note_dequeued();

        if let Err(e) = process_job(&manager, job_id).await {
            error!("Worker {}: job {} infrastructure error: {}", worker_id, job_id, e);
        }
    }
}

async fn process_job(manager: &Arc<JobManager>, job_id: Uuid) -> Result<(), RepoError> {
    if !repo::mark_job_running(&manager.pool, job_id).await? {
        // Canceled (or purged) between enqueue and pickup.
        debug!("Job {} no longer queued; skipping", job_id);
        return Ok(());
    }
    let job = repo::get_job(&manager.pool, job_id).await?;
    info!("Job {} started ({})", job_id, job.job_type);

    let cancel = manager.register_cancel(job_id);
    let mut log = match JobLogWriter::create(
        &manager.config.job_log_path(job_id),
        manager.config.job_log_max_bytes,
    )
    .await
    {
        Ok(log) => log,
        Err(e) => {
            manager.unregister_cancel(job_id);
            finalize(
                manager,
                job_id,
                JobStatus::Failed,
                Some(&format!("failed to open job log: {}", e)),
                Some("unknown"),
            )
            .await?;
            return Ok(());
        }
    };

    let mut progress = ProgressSink::new(manager.pool.clone(), manager.hub.clone(), job_id);

    let result = match repo::get_profile(&manager.pool, job.profile_id).await {
        Ok(profile) => {
            let ctx = JobContext {
                pool: manager.pool.clone(),
                hub: manager.hub.clone(),
                engine: manager.engine.clone(),
                config: manager.config.clone(),
                profile,
                job: job.clone(),
                cancel: cancel.clone(),
            };
            handlers::execute(&ctx, &mut log, &mut progress).await
        }
        Err(RepoError::NotFound) => Err(handlers::JobError::Invalid(
            "profile no longer exists".into(),
        )),
        Err(e) => Err(e.into()),
    };

    manager.unregister_cancel(job_id);
    progress.flush_now().await;
    let _ = log.flush().await;

    let (status, message, code) = match &result {
        Ok(()) => (JobStatus::Succeeded, None, None),
        Err(e) => {
            let (status, message, code) = e.outcome();
            (status, Some(message), Some(code))
        }
    };
    finalize(manager, job_id, status, message.as_deref(), code.as_deref()).await?;
    Ok(())
}

async fn finalize(
    manager: &Arc<JobManager>,
    job_id: Uuid,
    status: JobStatus,
    message: Option<&str>,
    code: Option<&str>,
) -> Result<(), RepoError> {
    if repo::mark_job_terminal(&manager.pool, job_id, status, message, code).await? {
        let job = repo::get_job(&manager.pool, job_id).await?;
        info!("Job {} finished: {}", job_id, job.status);
        manager.hub.publish(
            EventType::JobCompleted,
            Some(job_id),
            serde_json::to_value(&job).unwrap_or_default(),
        );
    }
    Ok(())
}

/// Throttled progress writer: persists counters and publishes `job.progress`
/// at most every [`PROGRESS_INTERVAL`] while the job runs.
pub struct ProgressSink {
    pool: SqlitePool,
    hub: Arc<EventHub>,
    job_id: Uuid,
    latest: JobProgress,
    last_emit: Option<Instant>,
    dirty: bool,
}

impl ProgressSink {
    pub fn new(pool: SqlitePool, hub: Arc<EventHub>, job_id: Uuid) -> Self {
        Self {
            pool,
            hub,
            job_id,
            latest: JobProgress::default(),
            last_emit: None,
            dirty: false,
        }
    }

    pub fn latest(&self) -> JobProgress {
        self.latest
    }

    pub async fn update(&mut self, progress: JobProgress) {
        self.latest = progress;
        self.dirty = true;
        let due = self
            .last_emit
            .map(|t| t.elapsed() >= PROGRESS_INTERVAL)
            .unwrap_or(true);
        if due {
            self.emit().await;
        }
    }

    /// Force out the latest counters, regardless of throttling.
    pub async fn flush_now(&mut self) {
        if self.dirty {
            self.emit().await;
        }
    }

    async fn emit(&mut self) {
        self.last_emit = Some(Instant::now());
        self.dirty = false;
        if let Err(e) = repo::update_job_progress(&self.pool, self.job_id, self.latest).await {
            error!("Failed to persist progress for job {}: {}", self.job_id, e);
        }
        self.hub.publish(
            EventType::JobProgress,
            Some(self.job_id),
            serde_json::json!({
                "bytesDone": self.latest.bytes_done,
                "bytesTotal": self.latest.bytes_total,
                "objectsDone": self.latest.objects_done,
                "objectsTotal": self.latest.objects_total,
            }),
        );
    }
}
