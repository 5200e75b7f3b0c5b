//! Per-job log capture
//!
//! Engine stdout and stderr are interleaved line-wise into
//! `<root>/logs/jobs/<jobId>.log`. The writer enforces a soft byte cap:
//! once exceeded, further bytes are discarded and a single truncation
//! marker is appended.

use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

pub struct JobLogWriter {
    file: File,
    cap: u64,
    written: u64,
    truncated: bool,
}

impl JobLogWriter {
    pub async fn create(path: &Path, cap: u64) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            file,
            cap,
            written: 0,
            truncated: false,
        })
    }

    /// Append one line. Returns true when the line was written, false when
    /// it fell past the cap.
    pub async fn write_line(&mut self, line: &str) -> std::io::Result<bool> {
        if self.truncated {
            return Ok(false);
        }
        let len = line.len() as u64 + 1;
        if self.written + len > self.cap {
            self.truncated = true;
            let marker = format!("log truncated at {} bytes\n", self.written);
            self.file.write_all(marker.as_bytes()).await?;
            self.file.flush().await?;
            return Ok(false);
        }
        self.file.write_all(line.as_bytes()).await?;
        self.file.write_all(b"\n").await?;
        self.written += len;
        Ok(true)
    }

    pub async fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush().await
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lines_append_until_the_cap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.log");
        let mut log = JobLogWriter::create(&path, 20).await.unwrap();

        assert!(log.write_line("123456789").await.unwrap()); // 10 bytes
        assert!(log.write_line("123456789").await.unwrap()); // 20 bytes
        // Over the cap: discarded, marker appended once.
        assert!(!log.write_line("x").await.unwrap());
        assert!(!log.write_line("y").await.unwrap());
        assert!(log.truncated());
        log.flush().await.unwrap();

        let body = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            body,
            "123456789\n123456789\nlog truncated at 20 bytes\n"
        );
    }

    #[tokio::test]
    async fn parent_directory_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/jobs/abc.log");
        let mut log = JobLogWriter::create(&path, 1024).await.unwrap();
        log.write_line("hello").await.unwrap();
        log.flush().await.unwrap();
        assert!(path.exists());
    }
}
