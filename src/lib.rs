//! attach-cache - content-addressed upload cache
//!
//! Resolves local files to the identifiers a remote AI service assigned
//! them, per destination, uploading each distinct content at most once and
//! reconciling when the remote forgets a file.

pub mod activity;
pub mod cache;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod remote;
pub mod ui;

pub use coordinator::{Resolution, UploadCoordinator};
pub use error::{CacheError, CacheResult};
