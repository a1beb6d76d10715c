//! Backup Archiver Library
//!
//! Packs configured source directories into one compressed archive per run,
//! using an external 7-Zip binary when present and a constant-memory ZIP
//! writer otherwise, and records every run in a JSON manifest.

pub mod archive;
pub mod config;
pub mod executor;
pub mod fs;
pub mod progress;
pub mod utils;

// Re-export commonly used types
pub use config::{BackupJob, Config};
pub use executor::{BackupExecutor, BackupOutcome};
pub use utils::errors::{ArchiverError, Result};
