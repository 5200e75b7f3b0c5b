//! Staging-mode file materialization
//!
//! Files land under the session's staging directory, either whole or as
//! numbered chunks under `<sessionDir>/.chunks/<path>/part-NNNNNN`. Every
//! write goes to a `.tmp` sibling first and is renamed into place; the
//! assembler runs once all parts are present, guarded by an exclusive-create
//! lockfile stamped `pid:unix-timestamp` (stale locks are broken after ten
//! minutes, covering unclean shutdowns).

use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use bucketd_core::config::AppConfig;

use crate::UploadError;

const CHUNKS_DIR: &str = ".chunks";
const LOCK_FILE: &str = ".assembling";
const STALE_LOCK_SECS: i64 = 600;

/// Validate and normalize a client-supplied relative path.
///
/// Backslashes become forward slashes; empty paths, `.`/`..` segments,
/// leading slashes, and NUL are rejected.
pub fn sanitize_rel_path(raw: &str) -> Result<String, UploadError> {
    let normalized = raw.replace('\\', "/");
    let trimmed = normalized.trim();
    if trimmed.is_empty() {
        return Err(UploadError::InvalidPath("path is empty".into()));
    }
    if trimmed.contains('\0') {
        return Err(UploadError::InvalidPath("path contains NUL".into()));
    }
    if trimmed.starts_with('/') {
        return Err(UploadError::InvalidPath(
            "path must be relative (no leading slash)".into(),
        ));
    }
    for segment in trimmed.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(UploadError::InvalidPath(format!(
                "path segment '{}' is not allowed",
                segment
            )));
        }
    }
    Ok(trimmed.to_string())
}

/// Resolve `rel_path` under the staging dir, refusing symlink escapes.
fn resolve_under(staging_dir: &Path, rel_path: &str) -> Result<PathBuf, UploadError> {
    let dest = staging_dir.join(rel_path);
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if !AppConfig::path_is_under(staging_dir, &dest) {
        return Err(UploadError::InvalidPath(format!(
            "path '{}' escapes the session directory",
            rel_path
        )));
    }
    Ok(dest)
}

/// Write a whole file body: `.tmp` sibling first, then atomic rename.
/// The temp file is unlinked on error.
pub async fn write_file(
    staging_dir: &Path,
    rel_path: &str,
    data: &[u8],
) -> Result<(), UploadError> {
    let dest = resolve_under(staging_dir, rel_path)?;
    write_atomic(&dest, data).await
}

async fn write_atomic(dest: &Path, data: &[u8]) -> Result<(), UploadError> {
    let tmp = sibling_tmp(dest);
    let result = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&tmp, dest).await?;
        Ok(())
    }
    .await;
    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    result
}

fn sibling_tmp(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "part".into());
    name.push_str(".tmp");
    dest.with_file_name(name)
}

fn chunk_dir(staging_dir: &Path, rel_path: &str) -> PathBuf {
    staging_dir.join(CHUNKS_DIR).join(rel_path)
}

fn part_name(index: u32) -> String {
    format!("part-{:06}", index)
}

/// Store one chunk of a file. Returns true when this write completed the
/// set and the file was assembled.
pub async fn write_chunk(
    staging_dir: &Path,
    rel_path: &str,
    chunk_index: u32,
    chunk_total: u32,
    data: &[u8],
) -> Result<bool, UploadError> {
    if chunk_total == 0 || chunk_index >= chunk_total {
        return Err(UploadError::InvalidPath(format!(
            "chunk index {} out of range (total {})",
            chunk_index, chunk_total
        )));
    }
    let dir = chunk_dir(staging_dir, rel_path);
    std::fs::create_dir_all(&dir)?;
    if !AppConfig::path_is_under(staging_dir, &dir) {
        return Err(UploadError::InvalidPath(format!(
            "path '{}' escapes the session directory",
            rel_path
        )));
    }

    write_atomic(&dir.join(part_name(chunk_index)), data).await?;

    if !all_parts_present(&dir, chunk_total) {
        return Ok(false);
    }
    assemble(staging_dir, rel_path, chunk_total).await
}

fn all_parts_present(dir: &Path, chunk_total: u32) -> bool {
    (0..chunk_total).all(|i| dir.join(part_name(i)).is_file())
}

/// Chunk indices already present on disk. Parts whose size does not match
/// the expected layout for (chunk_size, file_size) are stale retries and
/// are discarded.
pub fn present_chunks(
    staging_dir: &Path,
    rel_path: &str,
    chunk_total: u32,
    chunk_size: u64,
    file_size: u64,
) -> Result<Vec<u32>, UploadError> {
    let dir = chunk_dir(staging_dir, rel_path);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut present = Vec::new();
    for index in 0..chunk_total {
        let path = dir.join(part_name(index));
        let Ok(meta) = std::fs::metadata(&path) else {
            continue;
        };
        let expected = expected_chunk_size(index, chunk_total, chunk_size, file_size);
        if meta.len() == expected {
            present.push(index);
        } else {
            debug!(
                "Discarding stale chunk {} of {} ({} bytes, expected {})",
                index,
                rel_path,
                meta.len(),
                expected
            );
            let _ = std::fs::remove_file(&path);
        }
    }
    Ok(present)
}

pub fn expected_chunk_size(index: u32, chunk_total: u32, chunk_size: u64, file_size: u64) -> u64 {
    if index + 1 < chunk_total {
        chunk_size
    } else {
        file_size.saturating_sub(chunk_size * (chunk_total as u64 - 1))
    }
}

/// Concatenate all parts into the final file, in index order, then remove
/// the chunk directory. Exclusive-create of the lockfile prevents double
/// assembly when two requests observe the completed set at once.
async fn assemble(
    staging_dir: &Path,
    rel_path: &str,
    chunk_total: u32,
) -> Result<bool, UploadError> {
    let dir = chunk_dir(staging_dir, rel_path);
    let lock = dir.join(LOCK_FILE);

    match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&lock)
    {
        Ok(mut f) => {
            use std::io::Write as _;
            let _ = write!(f, "{}:{}", std::process::id(), chrono::Utc::now().timestamp());
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            if lock_is_stale(&lock) {
                warn!("Breaking stale assembly lock for {}", rel_path);
                let _ = std::fs::remove_file(&lock);
                return Box::pin(assemble(staging_dir, rel_path, chunk_total)).await;
            }
            // Another request is assembling; let it finish.
            return Ok(false);
        }
        Err(e) => return Err(e.into()),
    }

    let dest = resolve_under(staging_dir, rel_path)?;
    let tmp = sibling_tmp(&dest);
    let result = async {
        let mut out = tokio::fs::File::create(&tmp).await?;
        for index in 0..chunk_total {
            let part = tokio::fs::read(dir.join(part_name(index))).await?;
            out.write_all(&part).await?;
        }
        out.flush().await?;
        drop(out);
        tokio::fs::rename(&tmp, &dest).await?;
        Ok::<(), UploadError>(())
    }
    .await;

    match result {
        Ok(()) => {
            tokio::fs::remove_dir_all(&dir).await?;
            debug!("Assembled {} from {} chunks", rel_path, chunk_total);
            Ok(true)
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&tmp).await;
            let _ = std::fs::remove_file(&lock);
            Err(e)
        }
    }
}

/// A lock is stale when its embedded timestamp is older than ten minutes
/// (or unreadable, which only an unclean shutdown produces).
fn lock_is_stale(lock: &Path) -> bool {
    let Ok(body) = std::fs::read_to_string(lock) else {
        return true;
    };
    let stamped = body
        .rsplit(':')
        .next()
        .and_then(|t| t.trim().parse::<i64>().ok());
    match stamped {
        Some(ts) => chrono::Utc::now().timestamp() - ts > STALE_LOCK_SECS,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_sanitized() {
        assert_eq!(sanitize_rel_path("a/b.txt").unwrap(), "a/b.txt");
        assert_eq!(sanitize_rel_path("a\\b.txt").unwrap(), "a/b.txt");
        for bad in ["", ".", "..", "/abs", "a/../b", "a//b", "a\0b"] {
            assert!(sanitize_rel_path(bad).is_err(), "{:?} must be rejected", bad);
        }
    }

    #[tokio::test]
    async fn whole_file_write_is_atomic() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a/b.txt", b"hello").await.unwrap();
        assert_eq!(std::fs::read(dir.path().join("a/b.txt")).unwrap(), b"hello");
        // No temp residue.
        assert!(!dir.path().join("a/b.txt.tmp").exists());
    }

    #[tokio::test]
    async fn chunks_assemble_in_index_order_even_out_of_arrival_order() {
        let dir = tempfile::tempdir().unwrap();

        // Arrival order 2, 0, 1 — assembly fires on the final write.
        assert!(!write_chunk(dir.path(), "a/b.txt", 2, 3, b"CC").await.unwrap());
        assert!(!write_chunk(dir.path(), "a/b.txt", 0, 3, b"AA").await.unwrap());
        assert!(write_chunk(dir.path(), "a/b.txt", 1, 3, b"BB").await.unwrap());

        let body = std::fs::read(dir.path().join("a/b.txt")).unwrap();
        assert_eq!(body, b"AABBCC");
        // Chunk directory is gone after assembly.
        assert!(!dir.path().join(".chunks/a/b.txt").exists());
    }

    #[tokio::test]
    async fn chunk_state_reports_present_and_discards_stale() {
        let dir = tempfile::tempdir().unwrap();
        write_chunk(dir.path(), "f.bin", 0, 3, &[0u8; 10]).await.unwrap();
        write_chunk(dir.path(), "f.bin", 2, 3, &[0u8; 4]).await.unwrap();

        // chunk_size 10, file_size 24 -> parts 10, 10, 4.
        let present = present_chunks(dir.path(), "f.bin", 3, 10, 24).unwrap();
        assert_eq!(present, vec![0, 2]);

        // A retry with a different chunk geometry invalidates old parts.
        let present = present_chunks(dir.path(), "f.bin", 3, 8, 20).unwrap();
        assert!(present.is_empty());
        assert!(!dir.path().join(".chunks/f.bin/part-000000").exists());
    }

    #[tokio::test]
    async fn held_lock_defers_assembly_and_stale_lock_breaks() {
        let dir = tempfile::tempdir().unwrap();
        let chunk_d = dir.path().join(".chunks/f.bin");
        std::fs::create_dir_all(&chunk_d).unwrap();

        // Fresh lock held by "another request": assembly defers.
        std::fs::write(
            chunk_d.join(".assembling"),
            format!("{}:{}", std::process::id(), chrono::Utc::now().timestamp()),
        )
        .unwrap();
        assert!(!write_chunk(dir.path(), "f.bin", 0, 1, b"X").await.unwrap());
        assert!(!dir.path().join("f.bin").exists());

        // Stale lock: broken and assembly proceeds.
        std::fs::write(chunk_d.join(".assembling"), "999:12345").unwrap();
        assert!(write_chunk(dir.path(), "f.bin", 0, 1, b"X").await.unwrap());
        assert_eq!(std::fs::read(dir.path().join("f.bin")).unwrap(), b"X");
    }

    #[test]
    fn last_chunk_size_is_the_remainder() {
        assert_eq!(expected_chunk_size(0, 3, 10, 24), 10);
        assert_eq!(expected_chunk_size(2, 3, 10, 24), 4);
        assert_eq!(expected_chunk_size(0, 1, 10, 7), 7);
    }
}
