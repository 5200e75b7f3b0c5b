//! Per-type job execution
//!
//! Each handler drives the transfer engine (or the store, for index jobs)
//! under the job's cancellation scope, writes captured output to the job
//! log, and reports progress through the throttled sink.

mod copy;
mod delete;
mod index;
mod sync;
mod zip_archive;

use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use bucketd_core::config::AppConfig;
use bucketd_core::errors::{classify, NormalizedCode};
use bucketd_core::events::{EventHub, EventType};
use bucketd_core::models::{Job, JobProgress, JobStatus, Profile};
use bucketd_core::repo::RepoError;
use bucketd_engine::{Engine, EngineChild, EngineError};
use sqlx::SqlitePool;

use crate::joblog::JobLogWriter;
use crate::types::{self, PARTIAL_FAILURE_ECHO_MAX};
use crate::worker::ProgressSink;

/// Everything a handler needs for one job run
pub struct JobContext {
    pub pool: SqlitePool,
    pub hub: Arc<EventHub>,
    pub engine: Engine,
    pub config: AppConfig,
    pub profile: Profile,
    pub job: Job,
    pub cancel: CancellationToken,
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Invalid(String),
    #[error("{failed_count} of {total} operations failed")]
    Partial {
        failed_count: usize,
        total: usize,
        /// Bounded echo of offending keys
        failed_keys: Vec<String>,
    },
    #[error("operation canceled")]
    Canceled,
}

impl JobError {
    /// Terminal (status, message, code) for this failure.
    pub fn outcome(&self) -> (JobStatus, String, String) {
        match self {
            JobError::Canceled | JobError::Engine(EngineError::Canceled) => (
                JobStatus::Canceled,
                "operation canceled".into(),
                NormalizedCode::Canceled.as_str().into(),
            ),
            JobError::Engine(e) => {
                let code = match e {
                    EngineError::Missing { .. } | EngineError::Incompatible { .. } => {
                        e.code().to_string()
                    }
                    _ => e.normalized().as_str().to_string(),
                };
                (JobStatus::Failed, e.to_string(), code)
            }
            JobError::Partial {
                failed_count,
                total,
                failed_keys,
            } => (
                JobStatus::Failed,
                format!(
                    "{} of {} operations failed (first failures: {})",
                    failed_count,
                    total,
                    failed_keys.join(", ")
                ),
                "partial_failure".into(),
            ),
            other => {
                let message = other.to_string();
                let code = classify(&message, "").as_str().to_string();
                (JobStatus::Failed, message, code)
            }
        }
    }
}

/// Dispatch a job to its handler by type tag.
pub async fn execute(
    ctx: &JobContext,
    log: &mut JobLogWriter,
    progress: &mut ProgressSink,
) -> Result<(), JobError> {
    match ctx.job.job_type.as_str() {
        types::TYPE_SYNC_LOCAL_TO_REMOTE
        | types::TYPE_SYNC_REMOTE_TO_LOCAL
        | types::TYPE_SYNC_STAGING_TO_REMOTE => sync::run(ctx, log, progress).await,
        types::TYPE_DELETE_PREFIX => delete::run_prefix(ctx, log, progress).await,
        types::TYPE_DELETE_OBJECTS => delete::run_objects(ctx, log, progress).await,
        types::TYPE_COPY_OBJECT | types::TYPE_MOVE_OBJECT => {
            copy::run_object(ctx, log, progress).await
        }
        types::TYPE_COPY_BATCH | types::TYPE_MOVE_BATCH => {
            copy::run_batch(ctx, log, progress).await
        }
        types::TYPE_COPY_PREFIX | types::TYPE_MOVE_PREFIX => {
            copy::run_prefix(ctx, log, progress).await
        }
        types::TYPE_ZIP_PREFIX | types::TYPE_ZIP_OBJECTS => {
            zip_archive::run(ctx, log, progress).await
        }
        types::TYPE_INDEX_OBJECTS => index::run(ctx, log, progress).await,
        // Synthetic direct-upload jobs are created terminal and never reach
        // a worker; seeing one here means the queue was fed a bad id.
        types::TYPE_DIRECT_UPLOAD => Ok(()),
        other => Err(JobError::Invalid(format!("unsupported job type: {}", other))),
    }
}

pub(crate) fn parse_payload<T: serde::de::DeserializeOwned>(job: &Job) -> Result<T, JobError> {
    serde_json::from_value(job.payload.clone())
        .map_err(|e| JobError::Invalid(format!("stored payload is invalid: {}", e)))
}

/// One line of engine output, tagged by stream.
pub(crate) enum EngineLine {
    Out(String),
    Err(String),
}

/// Engine stats emitted on stderr when running with `--use-json-log`.
/// Returns updated progress counters when the line carries a stats block.
pub(crate) fn parse_stats_line(line: &str) -> Option<JobProgress> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    let stats = value.get("stats")?;
    Some(JobProgress {
        bytes_done: stats.get("bytes").and_then(|v| v.as_i64()).unwrap_or(0),
        bytes_total: stats.get("totalBytes").and_then(|v| v.as_i64()).unwrap_or(0),
        objects_done: stats.get("transfers").and_then(|v| v.as_i64()).unwrap_or(0),
        objects_total: stats
            .get("totalTransfers")
            .and_then(|v| v.as_i64())
            .unwrap_or(0),
    })
}

/// Flags appended to streaming transfer invocations so progress can be read
/// off the stderr log stream.
pub(crate) const STATS_ARGS: &[&str] = &[
    "--use-json-log",
    "--stats",
    "1s",
    "--stats-log-level",
    "NOTICE",
];

/// Drive a streaming engine invocation to completion.
///
/// Interleaves stdout+stderr into the job log (publishing `log.line` events),
/// feeds stats lines into the progress sink, and honors the cancellation
/// scope by killing the subprocess. Returns the captured stderr tail for
/// classification on non-zero exit.
pub(crate) async fn pump_engine(
    mut child: EngineChild,
    ctx: &JobContext,
    log: &mut JobLogWriter,
    progress: &mut ProgressSink,
) -> Result<(), JobError> {
    let (line_tx, mut line_rx) = mpsc::channel::<EngineLine>(64);

    if let Some(stdout) = child.stdout() {
        let tx = line_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(EngineLine::Out(line)).await.is_err() {
                    break;
                }
            }
        });
    }
    if let Some(stderr) = child.stderr() {
        let tx = line_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(EngineLine::Err(line)).await.is_err() {
                    break;
                }
            }
        });
    }
    drop(line_tx);

    let mut stderr_tail: Vec<String> = Vec::new();
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                child.kill().await;
                return Err(JobError::Canceled);
            }
            line = line_rx.recv() => {
                let Some(line) = line else { break };
                let text = match &line {
                    EngineLine::Out(l) | EngineLine::Err(l) => l.as_str(),
                };
                let _ = log.write_line(text).await;
                publish_log_line(&ctx.hub, ctx.job.id, text);
                if let EngineLine::Err(l) = &line {
                    if let Some(p) = parse_stats_line(l) {
                        progress.update(p).await;
                    }
                    if stderr_tail.len() == 32 {
                        stderr_tail.remove(0);
                    }
                    stderr_tail.push(l.clone());
                }
            }
        }
    }

    let status = child.wait().await?;
    if status.success() {
        Ok(())
    } else {
        Err(JobError::Engine(EngineError::Exit {
            code: status.code().unwrap_or(-1),
            stderr: stderr_tail.join("\n"),
        }))
    }
}

/// Launch a recursive listing and stream its entries through a bounded
/// channel. The spawned task owns the subprocess: dropping the receiver
/// kills the engine; a non-zero exit surfaces from the join handle.
pub(crate) fn spawn_listing(
    engine: Engine,
    rc: bucketd_engine::RemoteContext,
    args: Vec<String>,
) -> (
    mpsc::Receiver<bucketd_engine::ListEntry>,
    tokio::task::JoinHandle<Result<(), JobError>>,
) {
    use tokio::io::AsyncReadExt;

    let (tx, rx) = mpsc::channel(256);
    let handle = tokio::spawn(async move {
        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        let mut child = engine.start(rc, &arg_refs, false)?;
        let stdout = child
            .stdout()
            .ok_or_else(|| JobError::Invalid("engine stdout not captured".into()))?;
        let stderr = child.stderr();
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut buf).await;
            }
            buf
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut receiver_gone = false;
        while let Some(line) = lines.next_line().await.map_err(EngineError::Io)? {
            if let Some(parsed) = bucketd_engine::listing::parse_entry_line(&line) {
                if tx.send(parsed?).await.is_err() {
                    receiver_gone = true;
                    break;
                }
            }
        }

        if receiver_gone {
            child.kill().await;
            stderr_task.abort();
            return Ok(());
        }
        let status = child.wait().await?;
        if status.success() {
            Ok(())
        } else {
            Err(JobError::Engine(EngineError::Exit {
                code: status.code().unwrap_or(-1),
                stderr: stderr_task.await.unwrap_or_default(),
            }))
        }
    });
    (rx, handle)
}

pub(crate) fn publish_log_line(hub: &EventHub, job_id: Uuid, line: &str) {
    hub.publish(
        EventType::LogLine,
        Some(job_id),
        serde_json::json!({ "line": line }),
    );
}

/// Trim a failed-keys list to the bounded echo size.
pub(crate) fn bounded_failures(mut failed: Vec<String>) -> Vec<String> {
    failed.truncate(PARTIAL_FAILURE_ECHO_MAX);
    failed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_lines_become_progress() {
        let line = r#"{"level":"notice","msg":"stats","stats":{"bytes":1024,"totalBytes":4096,"transfers":2,"totalTransfers":8}}"#;
        let p = parse_stats_line(line).unwrap();
        assert_eq!(p.bytes_done, 1024);
        assert_eq!(p.bytes_total, 4096);
        assert_eq!(p.objects_done, 2);
        assert_eq!(p.objects_total, 8);

        assert!(parse_stats_line("plain text output").is_none());
        assert!(parse_stats_line(r#"{"level":"info","msg":"no stats"}"#).is_none());
    }

    #[test]
    fn partial_failure_outcome_is_bounded_and_coded() {
        let failed_keys: Vec<String> = (0..30).map(|i| format!("k{}", i)).collect();
        let err = JobError::Partial {
            failed_count: 30,
            total: 100,
            failed_keys: bounded_failures(failed_keys),
        };
        let (status, message, code) = err.outcome();
        assert_eq!(status, JobStatus::Failed);
        assert_eq!(code, "partial_failure");
        // 20 keys echoed at most.
        assert_eq!(message.matches("k").count(), 20);
    }

    #[test]
    fn canceled_outcome_has_canceled_code() {
        let (status, _msg, code) = JobError::Canceled.outcome();
        assert_eq!(status, JobStatus::Canceled);
        assert_eq!(code, "canceled");
    }

    #[test]
    fn engine_missing_keeps_its_distinct_code() {
        let err = JobError::Engine(EngineError::Missing {
            binary: "rclone".into(),
        });
        let (_status, _msg, code) = err.outcome();
        assert_eq!(code, "engine_missing");
    }
}
