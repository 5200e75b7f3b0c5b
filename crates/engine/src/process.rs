//! Engine subprocess supervision
//!
//! Two launch shapes: `run_capture` for one-shot commands (full stdout/stderr
//! captured) and `start` for streaming invocations (listing, cat/rcat piping).
//! Every child is spawned with kill-on-drop so cancellation and early page
//! termination reduce to dropping the handle.

use semver::Version;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::remote::RemoteContext;
use crate::EngineError;

/// Captured result of a one-shot engine invocation
#[derive(Debug)]
pub struct EngineOutput {
    pub stdout: String,
    pub stderr: String,
    pub code: i32,
}

/// Handle to the external transfer engine binary
#[derive(Debug, Clone)]
pub struct Engine {
    binary: String,
    min_version: Version,
    tmp_root: PathBuf,
}

impl Engine {
    pub fn new(binary: &str, min_version: &str, tmp_root: PathBuf) -> Result<Self, EngineError> {
        let min_version = Version::parse(min_version)
            .map_err(|e| EngineError::Parse(format!("invalid minimum version: {}", e)))?;
        Ok(Self {
            binary: binary.to_string(),
            min_version,
            tmp_root,
        })
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    pub fn tmp_root(&self) -> &PathBuf {
        &self.tmp_root
    }

    /// Run `<binary> version` and enforce the minimum version gate.
    /// Returns the detected version string.
    pub async fn verify_version(&self) -> Result<String, EngineError> {
        let output = Command::new(&self.binary)
            .arg("version")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| self.map_spawn_error(e))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let found = parse_version_line(&stdout)
            .ok_or_else(|| EngineError::Parse(format!("unrecognized version output: {}", stdout)))?;

        if found < self.min_version {
            return Err(EngineError::Incompatible {
                found: found.to_string(),
                minimum: self.min_version.to_string(),
            });
        }
        Ok(found.to_string())
    }

    fn command(&self, ctx: &RemoteContext, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--config").arg(&ctx.config_path);
        cmd.args(args);
        cmd.args(&ctx.extra_args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }

    /// One-shot invocation with full output capture. Non-zero exits and
    /// cancellation surface as errors; the child is killed when canceled.
    pub async fn run_capture(
        &self,
        ctx: &RemoteContext,
        args: &[&str],
        cancel: &CancellationToken,
    ) -> Result<EngineOutput, EngineError> {
        debug!("engine run: {} {:?}", self.binary, args);
        let child = self
            .command(ctx, args)
            .spawn()
            .map_err(|e| self.map_spawn_error(e))?;

        let wait = child.wait_with_output();
        tokio::pin!(wait);

        let output = tokio::select! {
            out = &mut wait => out?,
            _ = cancel.cancelled() => {
                // Dropping the pinned future drops the child; kill-on-drop
                // reaps the subprocess.
                return Err(EngineError::Canceled);
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let code = output.status.code().unwrap_or(-1);

        if output.status.success() {
            Ok(EngineOutput {
                stdout,
                stderr,
                code,
            })
        } else {
            Err(EngineError::Exit { code, stderr })
        }
    }

    /// Launch a streaming invocation. The returned handle owns the remote
    /// context; its temp files are unlinked when `wait()` returns (or on
    /// drop).
    pub fn start(
        &self,
        ctx: RemoteContext,
        args: &[&str],
        pipe_stdin: bool,
    ) -> Result<EngineChild, EngineError> {
        debug!("engine start: {} {:?}", self.binary, args);
        let mut cmd = self.command(&ctx, args);
        if pipe_stdin {
            cmd.stdin(Stdio::piped());
        }
        let child = cmd.spawn().map_err(|e| self.map_spawn_error(e))?;
        Ok(EngineChild {
            child,
            ctx: Some(ctx),
        })
    }

    fn map_spawn_error(&self, e: std::io::Error) -> EngineError {
        if e.kind() == std::io::ErrorKind::NotFound {
            EngineError::Missing {
                binary: self.binary.clone(),
            }
        } else {
            EngineError::Spawn(e.to_string())
        }
    }
}

/// A live engine subprocess plus the temp config backing it
pub struct EngineChild {
    child: Child,
    ctx: Option<RemoteContext>,
}

impl EngineChild {
    pub fn stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    pub fn stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    /// Wait for exit and unlink the invocation's temp files.
    pub async fn wait(&mut self) -> Result<std::process::ExitStatus, EngineError> {
        let status = self.child.wait().await?;
        if let Some(ctx) = self.ctx.take() {
            ctx.cleanup();
        }
        Ok(status)
    }

    /// Kill the subprocess and reap it.
    pub async fn kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            if e.kind() != std::io::ErrorKind::InvalidInput {
                warn!("Failed to kill engine subprocess: {}", e);
            }
        }
        let _ = self.child.wait().await;
        if let Some(ctx) = self.ctx.take() {
            ctx.cleanup();
        }
    }
}

/// Pull `X.Y.Z` out of a `<name> vX.Y.Z` version banner.
fn parse_version_line(stdout: &str) -> Option<Version> {
    let first = stdout.lines().next()?;
    first
        .split_whitespace()
        .filter_map(|tok| Version::parse(tok.trim_start_matches('v')).ok())
        .next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_banner_parses() {
        let v = parse_version_line("rclone v1.66.0\n- os/version: debian").unwrap();
        assert_eq!(v, Version::new(1, 66, 0));
        assert!(parse_version_line("garbage output").is_none());
    }

    #[test]
    fn minimum_version_gate() {
        let engine = Engine::new("rclone", "1.60.0", PathBuf::from("/tmp")).unwrap();
        let found = parse_version_line("rclone v1.59.2").unwrap();
        assert!(found < engine.min_version);
        let found = parse_version_line("rclone v1.66.0").unwrap();
        assert!(found >= engine.min_version);
    }

    #[tokio::test]
    async fn missing_binary_is_a_distinct_failure() {
        let engine = Engine::new(
            "definitely-not-a-real-binary-7440",
            "1.60.0",
            PathBuf::from("/tmp"),
        )
        .unwrap();
        match engine.verify_version().await {
            Err(EngineError::Missing { binary }) => {
                assert_eq!(binary, "definitely-not-a-real-binary-7440")
            }
            other => panic!("expected Missing, got {:?}", other.map(|_| ())),
        }
    }
}
