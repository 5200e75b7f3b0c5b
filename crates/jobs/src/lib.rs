//! Job manager
//!
//! Owns the bounded work queue, the fixed worker pool, per-job cancellation
//! scopes, log capture, and the retention sweeper. Workers share nothing
//! except the persistence layer and the event hub.

pub mod handlers;
pub mod joblog;
pub mod manager;
pub mod retention;
pub mod types;
mod worker;

pub use manager::{CancelOutcome, EnqueueError, JobManager, QueueStats};
pub use types::{is_supported_job_type, normalize_payload, ValidationError};
