//! Core domain layer for bucketd
//!
//! Shared between every other crate in the workspace:
//! - configuration loaded from environment variables
//! - model structs mapped onto the embedded sqlite store
//! - the repository layer (all SQL lives here)
//! - the in-process event hub
//! - the normalized error taxonomy

pub mod config;
pub mod db;
pub mod errors;
pub mod events;
pub mod models;
pub mod repo;
