//! Transfer engine adapter
//!
//! bucketd does not speak any storage provider's wire protocol itself. All
//! data-plane work is delegated to an external engine binary (an rclone-
//! compatible CLI): sync, copy, delete, streaming cat/rcat, and structured
//! JSON listing. This crate prepares per-invocation credentials config,
//! launches and supervises the subprocess, and parses its listing output.

pub mod listing;
pub mod process;
pub mod remote;

pub use listing::{ContinuationToken, ListEntry, ListPage, ObjectMeta};
pub use process::{Engine, EngineChild, EngineOutput};
pub use remote::RemoteContext;

use bucketd_core::errors::{classify, NormalizedCode};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("transfer engine binary '{binary}' was not found; install it and ensure it is on PATH")]
    Missing { binary: String },
    #[error("transfer engine version {found} is older than the required minimum {minimum}")]
    Incompatible { found: String, minimum: String },
    #[error("failed to launch transfer engine: {0}")]
    Spawn(String),
    #[error("transfer engine exited with status {code}: {stderr}")]
    Exit { code: i32, stderr: String },
    #[error("operation canceled")]
    Canceled,
    #[error("failed to parse engine output: {0}")]
    Parse(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Endpoint-level code persisted on failed jobs.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Missing { .. } => "engine_missing",
            EngineError::Incompatible { .. } => "engine_incompatible",
            EngineError::Canceled => "canceled",
            _ => "engine_error",
        }
    }

    /// Classified normalized code for the failure.
    pub fn normalized(&self) -> NormalizedCode {
        match self {
            EngineError::Missing { .. } | EngineError::Incompatible { .. } => {
                NormalizedCode::InvalidConfig
            }
            EngineError::Canceled => NormalizedCode::Canceled,
            EngineError::Exit { stderr, .. } => classify(&self.to_string(), stderr),
            other => classify(&other.to_string(), ""),
        }
    }
}
