//! Copy and move jobs: single object, bounded batch, and prefix variants

use bucketd_core::models::JobProgress;
use bucketd_engine::RemoteContext;
use tracing::warn;

use crate::handlers::{
    bounded_failures, parse_payload, publish_log_line, pump_engine, JobContext, JobError,
    STATS_ARGS,
};
use crate::joblog::JobLogWriter;
use crate::types::{CopyBatchPayload, CopyObjectPayload, CopyPrefixPayload};
use crate::worker::ProgressSink;

fn is_move(job_type: &str) -> bool {
    job_type.starts_with("transfer.move.")
}

pub(crate) async fn run_object(
    ctx: &JobContext,
    log: &mut JobLogWriter,
    _progress: &mut ProgressSink,
) -> Result<(), JobError> {
    let payload: CopyObjectPayload = parse_payload(&ctx.job)?;
    let rc = RemoteContext::prepare(&ctx.config.engine_tmp_root(), &ctx.profile)?;

    let verb = if is_move(&ctx.job.job_type) {
        "moveto"
    } else {
        "copyto"
    };
    let src = RemoteContext::remote_spec(&payload.bucket, &payload.key);
    let dst = RemoteContext::remote_spec(&payload.dest_bucket, &payload.dest_key);

    let output = ctx
        .engine
        .run_capture(&rc, &[verb, &src, &dst], &ctx.cancel)
        .await?;
    for line in output.stderr.lines().chain(output.stdout.lines()) {
        let _ = log.write_line(line).await;
        publish_log_line(&ctx.hub, ctx.job.id, line);
    }
    Ok(())
}

pub(crate) async fn run_batch(
    ctx: &JobContext,
    log: &mut JobLogWriter,
    progress: &mut ProgressSink,
) -> Result<(), JobError> {
    let payload: CopyBatchPayload = parse_payload(&ctx.job)?;
    let rc = RemoteContext::prepare(&ctx.config.engine_tmp_root(), &ctx.profile)?;

    let verb = if is_move(&ctx.job.job_type) {
        "moveto"
    } else {
        "copyto"
    };
    let total = payload.keys.len();
    let mut failed: Vec<String> = Vec::new();

    for (i, key) in payload.keys.iter().enumerate() {
        if ctx.cancel.is_cancelled() {
            return Err(JobError::Canceled);
        }
        let dest_key = join_key(&payload.dest_prefix, key);
        let src = RemoteContext::remote_spec(&payload.bucket, key);
        let dst = RemoteContext::remote_spec(&payload.dest_bucket, &dest_key);

        match ctx.engine.run_capture(&rc, &[verb, &src, &dst], &ctx.cancel).await {
            Ok(_) => {
                let line = format!("{} {} -> {}", verb, key, dest_key);
                let _ = log.write_line(&line).await;
                publish_log_line(&ctx.hub, ctx.job.id, &line);
            }
            Err(bucketd_engine::EngineError::Canceled) => return Err(JobError::Canceled),
            Err(e) => {
                warn!("Job {}: {} of {} failed: {}", ctx.job.id, verb, key, e);
                let line = format!("{} failed for {}: {}", verb, key, e);
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

pub(crate) async fn run_prefix(
    ctx: &JobContext,
    log: &mut JobLogWriter,
    progress: &mut ProgressSink,
) -> Result<(), JobError> {
    let payload: CopyPrefixPayload = parse_payload(&ctx.job)?;
    let rc = RemoteContext::prepare(&ctx.config.engine_tmp_root(), &ctx.profile)?;

    let verb = if is_move(&ctx.job.job_type) {
        "move"
    } else {
        "copy"
    };
    let src = RemoteContext::remote_spec(&payload.bucket, payload.prefix.trim_end_matches('/'));
    let dst = RemoteContext::remote_spec(
        &payload.dest_bucket,
        payload.dest_prefix.trim_end_matches('/'),
    );

    let mut args = vec![verb, src.as_str(), dst.as_str()];
    args.extend_from_slice(STATS_ARGS);

    let child = ctx.engine.start(rc, &args, false)?;
    pump_engine(child, ctx, log, progress).await
}

/// Join a destination prefix and a source key, keeping the source's own
/// path structure under the new prefix.
fn join_key(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}/{}", prefix.trim_end_matches('/'), key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dest_keys_nest_under_the_prefix() {
        assert_eq!(join_key("", "a/b.txt"), "a/b.txt");
        assert_eq!(join_key("backup/", "a/b.txt"), "backup/a/b.txt");
        assert_eq!(join_key("backup", "a/b.txt"), "backup/a/b.txt");
    }

    #[test]
    fn verb_selection_follows_the_type_tag() {
        assert!(is_move("transfer.move.batch"));
        assert!(!is_move("transfer.copy.batch"));
    }
}
