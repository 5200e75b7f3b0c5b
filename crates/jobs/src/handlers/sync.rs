//! One-way directory sync jobs
//!
//! local→remote, remote→local, and staging→remote all reduce to one engine
//! `sync` invocation; only the source/destination pair differs.

use std::path::Path;
use tracing::warn;

use bucketd_core::config::AppConfig;
use bucketd_engine::RemoteContext;

use crate::handlers::{parse_payload, pump_engine, JobContext, JobError, STATS_ARGS};
use crate::joblog::JobLogWriter;
use crate::types::{SyncPayload, TYPE_SYNC_REMOTE_TO_LOCAL, TYPE_SYNC_STAGING_TO_REMOTE};
use crate::worker::ProgressSink;

pub(crate) async fn run(
    ctx: &JobContext,
    log: &mut JobLogWriter,
    progress: &mut ProgressSink,
) -> Result<(), JobError> {
    let payload: SyncPayload = parse_payload(&ctx.job)?;
    let remote = RemoteContext::remote_spec(&payload.bucket, payload.prefix.trim_end_matches('/'));

    let (source, dest) = if ctx.job.job_type == TYPE_SYNC_REMOTE_TO_LOCAL {
        (remote, payload.local_path.clone())
    } else {
        (payload.local_path.clone(), remote)
    };

    let rc = RemoteContext::prepare(&ctx.config.engine_tmp_root(), &ctx.profile)?;
    let mut args = vec!["sync", source.as_str(), dest.as_str()];
    args.extend_from_slice(STATS_ARGS);

    let child = ctx.engine.start(rc, &args, false)?;
    pump_engine(child, ctx, log, progress).await?;

    // A committed staging tree has served its purpose once synced.
    if ctx.job.job_type == TYPE_SYNC_STAGING_TO_REMOTE {
        let staging = Path::new(&payload.local_path);
        if AppConfig::path_is_under(&ctx.config.staging_root(), staging) {
            if let Err(e) = tokio::fs::remove_dir_all(staging).await {
                warn!(
                    "Job {}: failed to remove staging dir {}: {}",
                    ctx.job.id, payload.local_path, e
                );
            }
        }
    }
    Ok(())
}
