//! `remote.index.objects`: walk a bucket (optionally under a prefix) and
//! mirror its objects into the searchable index.

use chrono::Utc;

use bucketd_core::models::{JobProgress, ObjectIndexEntry};
use bucketd_core::repo;
use bucketd_engine::{ListEntry, RemoteContext};

use crate::handlers::{parse_payload, publish_log_line, spawn_listing, JobContext, JobError};
use crate::joblog::JobLogWriter;
use crate::types::IndexObjectsPayload;
use crate::worker::ProgressSink;

pub(crate) async fn run(
    ctx: &JobContext,
    log: &mut JobLogWriter,
    progress: &mut ProgressSink,
) -> Result<(), JobError> {
    let payload: IndexObjectsPayload = parse_payload(&ctx.job)?;

    if payload.full_reindex {
        let cleared =
            repo::clear_index(&ctx.pool, ctx.profile.id, &payload.bucket, None).await?;
        let line = format!("cleared {} prior index entries", cleared);
        let _ = log.write_line(&line).await;
        publish_log_line(&ctx.hub, ctx.job.id, &line);
    }

    let rc = RemoteContext::prepare(&ctx.config.engine_tmp_root(), &ctx.profile)?;
    let spec = RemoteContext::remote_spec(&payload.bucket, payload.prefix.trim_end_matches('/'));
    let args: Vec<String> = ["lsjson", "-R", "--files-only", spec.as_str()]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let (mut entries, listing) = spawn_listing(ctx.engine.clone(), rc, args);

    let mut indexed: i64 = 0;
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                drop(entries);
                let _ = listing.await;
                return Err(JobError::Canceled);
            }
            entry = entries.recv() => {
                let Some(entry) = entry else { break };
                let ListEntry::Object(meta) = entry else { continue };
                let entry = ObjectIndexEntry {
                    profile_id: ctx.profile.id,
                    bucket: payload.bucket.clone(),
                    object_key: full_key(&payload.prefix, &meta.key),
                    size: meta.size,
                    etag: meta.etag,
                    last_modified: meta.last_modified,
                    indexed_at: Utc::now(),
                };
                repo::upsert_index_entry(&ctx.pool, &entry).await?;
                indexed += 1;
                progress.update(JobProgress {
                    objects_done: indexed,
                    ..progress.latest()
                }).await;
            }
        }
    }

    listing
        .await
        .map_err(|e| JobError::Invalid(format!("listing task failed: {}", e)))??;

    let line = format!("indexed {} objects", indexed);
    let _ = log.write_line(&line).await;
    publish_log_line(&ctx.hub, ctx.job.id, &line);
    Ok(())
}

/// Listing paths are relative to the listed prefix; the index stores full
/// object keys.
fn full_key(prefix: &str, rel: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        rel.to_string()
    } else {
        format!("{}/{}", prefix, rel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_are_rooted_under_the_prefix() {
        assert_eq!(full_key("", "a/b.txt"), "a/b.txt");
        assert_eq!(full_key("photos/", "a/b.txt"), "photos/a/b.txt");
        assert_eq!(full_key("photos", "a/b.txt"), "photos/a/b.txt");
    }
}
