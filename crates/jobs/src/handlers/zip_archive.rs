//! Zip jobs: stream remote objects into a single zip artifact
//!
//! The zip writer is synchronous, so it runs on a blocking thread fed
//! through a bounded channel while the async side streams each object's
//! bytes off the engine's stdout.

use std::io::Write;
use std::path::PathBuf;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

use bucketd_core::models::JobProgress;
use bucketd_engine::{EngineError, ListEntry, RemoteContext};

use crate::handlers::{
    parse_payload, publish_log_line, spawn_listing, JobContext, JobError,
};
use crate::joblog::JobLogWriter;
use crate::types::{ZipObjectsPayload, ZipPrefixPayload, TYPE_ZIP_PREFIX};
use crate::worker::ProgressSink;

const READ_BUF_SIZE: usize = 64 * 1024;

enum ZipMsg {
    StartEntry(String),
    Chunk(Vec<u8>),
}

pub(crate) async fn run(
    ctx: &JobContext,
    log: &mut JobLogWriter,
    progress: &mut ProgressSink,
) -> Result<(), JobError> {
    // (entry name inside the archive, full object key)
    let (bucket, entries) = if ctx.job.job_type == TYPE_ZIP_PREFIX {
        let payload: ZipPrefixPayload = parse_payload(&ctx.job)?;
        let keys = collect_prefix_keys(ctx, &payload.bucket, &payload.prefix).await?;
        (payload.bucket, keys)
    } else {
        let payload: ZipObjectsPayload = parse_payload(&ctx.job)?;
        let entries = payload
            .keys
            .iter()
            .map(|k| (k.clone(), k.clone()))
            .collect();
        (payload.bucket, entries)
    };

    let artifact = ctx.config.artifact_path(ctx.job.id);
    if let Some(parent) = artifact.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let (tx, rx) = mpsc::channel::<ZipMsg>(8);
    let writer = tokio::task::spawn_blocking({
        let artifact = artifact.clone();
        move || write_zip(rx, artifact)
    });

    let total = entries.len() as i64;
    let mut bytes_done: i64 = 0;

    let result = async {
        for (done, (entry_name, key)) in entries.into_iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                return Err(JobError::Canceled);
            }
            if tx.send(ZipMsg::StartEntry(entry_name.clone())).await.is_err() {
                return Err(JobError::Invalid("zip writer stopped early".into()));
            }

            let rc = RemoteContext::prepare(&ctx.config.engine_tmp_root(), &ctx.profile)?;
            let spec = RemoteContext::remote_spec(&bucket, &key);
            let mut child = ctx.engine.start(rc, &["cat", &spec], false)?;
            let mut stdout = child
                .stdout()
                .ok_or_else(|| JobError::Invalid("engine stdout not captured".into()))?;

            let mut buf = vec![0u8; READ_BUF_SIZE];
            loop {
                let n = tokio::select! {
                    _ = ctx.cancel.cancelled() => {
                        child.kill().await;
                        return Err(JobError::Canceled);
                    }
                    n = stdout.read(&mut buf) => n?,
                };
                if n == 0 {
                    break;
                }
                bytes_done += n as i64;
                if tx.send(ZipMsg::Chunk(buf[..n].to_vec())).await.is_err() {
                    return Err(JobError::Invalid("zip writer stopped early".into()));
                }
            }

            let status = child.wait().await?;
            if !status.success() {
                return Err(JobError::Engine(EngineError::Exit {
                    code: status.code().unwrap_or(-1),
                    stderr: format!("cat failed for {}", key),
                }));
            }

            let line = format!("archived {}", key);
            let _ = log.write_line(&line).await;
            publish_log_line(&ctx.hub, ctx.job.id, &line);
            progress
                .update(JobProgress {
                    bytes_done,
                    objects_done: (done + 1) as i64,
                    objects_total: total,
                    ..progress.latest()
                })
                .await;
        }
        Ok(())
    }
    .await;

    drop(tx);
    let write_result = writer
        .await
        .map_err(|e| JobError::Invalid(format!("zip writer panicked: {}", e)))?;

    match (result, write_result) {
        (Ok(()), Ok(())) => Ok(()),
        (Err(e), _) | (Ok(()), Err(e)) => {
            // A failed job leaves no partial artifact behind.
            let _ = tokio::fs::remove_file(&artifact).await;
            Err(e)
        }
    }
}

fn write_zip(mut rx: mpsc::Receiver<ZipMsg>, path: PathBuf) -> Result<(), JobError> {
    let file = std::fs::File::create(&path)?;
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .large_file(true);

    while let Some(msg) = rx.blocking_recv() {
        match msg {
            ZipMsg::StartEntry(name) => {
                zip.start_file(name, options)
                    .map_err(|e| JobError::Invalid(format!("zip entry failed: {}", e)))?;
            }
            ZipMsg::Chunk(chunk) => {
                zip.write_all(&chunk)?;
            }
        }
    }
    zip.finish()
        .map_err(|e| JobError::Invalid(format!("zip finalize failed: {}", e)))?;
    Ok(())
}

/// Recursive listing of the prefix, returning (archive entry name, full key)
/// pairs. Entry names are relative to the prefix so the archive root is the
/// zipped folder itself.
async fn collect_prefix_keys(
    ctx: &JobContext,
    bucket: &str,
    prefix: &str,
) -> Result<Vec<(String, String)>, JobError> {
    let rc = RemoteContext::prepare(&ctx.config.engine_tmp_root(), &ctx.profile)?;
    let spec = RemoteContext::remote_spec(bucket, prefix.trim_end_matches('/'));
    let args: Vec<String> = ["lsjson", "-R", "--files-only", spec.as_str()]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let (mut entries, listing) = spawn_listing(ctx.engine.clone(), rc, args);

    let clean_prefix = prefix.trim_end_matches('/');
    let mut keys = Vec::new();
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                drop(entries);
                let _ = listing.await;
                return Err(JobError::Canceled);
            }
            entry = entries.recv() => {
                let Some(entry) = entry else { break };
                if let ListEntry::Object(meta) = entry {
                    let full = if clean_prefix.is_empty() {
                        meta.key.clone()
                    } else {
                        format!("{}/{}", clean_prefix, meta.key)
                    };
                    keys.push((meta.key, full));
                }
            }
        }
    }
    listing
        .await
        .map_err(|e| JobError::Invalid(format!("listing task failed: {}", e)))??;
    Ok(keys)
}
