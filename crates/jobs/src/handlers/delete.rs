//! Prefix purge and bounded batch delete

use bucketd_core::models::JobProgress;
use bucketd_engine::RemoteContext;
use tracing::warn;

use crate::handlers::{
    bounded_failures, parse_payload, publish_log_line, pump_engine, JobContext, JobError,
    STATS_ARGS,
};
use crate::joblog::JobLogWriter;
use crate::types::{DeleteObjectsPayload, DeletePrefixPayload};
use crate::worker::ProgressSink;

/// `transfer.delete.prefix`: purge a whole prefix subtree (or, with
/// deleteAll, every object in the bucket).
pub(crate) async fn run_prefix(
    ctx: &JobContext,
    log: &mut JobLogWriter,
    progress: &mut ProgressSink,
) -> Result<(), JobError> {
    let payload: DeletePrefixPayload = parse_payload(&ctx.job)?;
    let rc = RemoteContext::prepare(&ctx.config.engine_tmp_root(), &ctx.profile)?;

    let spec = RemoteContext::remote_spec(&payload.bucket, payload.prefix.trim_end_matches('/'));
    // An empty prefix deletes the bucket's contents but must keep the bucket.
    let mut args = if payload.prefix.is_empty() {
        vec!["delete", spec.as_str()]
    } else {
        vec!["purge", spec.as_str()]
    };
    args.extend_from_slice(STATS_ARGS);

    let child = ctx.engine.start(rc, &args, false)?;
    pump_engine(child, ctx, log, progress).await
}

/// `remote.delete.objects`: delete an explicit key list, reporting partial
/// failures with a bounded echo of offending keys.
pub(crate) async fn run_objects(
    ctx: &JobContext,
    log: &mut JobLogWriter,
    progress: &mut ProgressSink,
) -> Result<(), JobError> {
    let payload: DeleteObjectsPayload = parse_payload(&ctx.job)?;
    let rc = RemoteContext::prepare(&ctx.config.engine_tmp_root(), &ctx.profile)?;

    let total = payload.keys.len();
    let mut failed: Vec<String> = Vec::new();

    for (i, key) in payload.keys.iter().enumerate() {
        if ctx.cancel.is_cancelled() {
            return Err(JobError::Canceled);
        }
        let spec = RemoteContext::remote_spec(&payload.bucket, key);
        match ctx
            .engine
            .run_capture(&rc, &["deletefile", &spec], &ctx.cancel)
            .await
        {
            Ok(_) => {
                let line = format!("deleted {}", key);
                let _ = log.write_line(&line).await;
                publish_log_line(&ctx.hub, ctx.job.id, &line);
            }
            Err(bucketd_engine::EngineError::Canceled) => return Err(JobError::Canceled),
            Err(e) => {
                warn!("Job {}: delete of {} failed: {}", ctx.job.id, key, e);
                let line = format!("delete failed for {}: {}", key, e);
                let _ = log.write_line(&line).await;
                publish_log_line(&ctx.hub, ctx.job.id, &line);
                failed.push(key.clone());
            }
        }
        progress
            .update(JobProgress {
                objects_done: (i + 1) as i64,
                objects_total: total as i64,
                ..progress.latest()
            })
            .await;
    }

    if failed.is_empty() {
        Ok(())
    } else {
        Err(JobError::Partial {
            failed_count: failed.len(),
            total,
            failed_keys: bounded_failures(failed),
        })
    }
}
