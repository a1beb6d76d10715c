//! Error taxonomy for the backup archiver.
//!
//! Components report typed failures; only the executor decides which of them
//! end a run and what status the manifest records.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArchiverError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cannot open source {}: {source}", .path.display())]
    SourceAccess {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Nothing to back up: the sources contain no files")]
    NothingToBackUp,

    #[error(
        "Insufficient space at {}: {required} bytes required, {available} bytes available",
        .path.display()
    )]
    InsufficientSpace {
        path: PathBuf,
        required: u64,
        available: u64,
    },

    #[error("Output already exists: {}", .0.display())]
    OutputExists(PathBuf),

    #[error("Failed to launch {}: {source}", .binary.display())]
    ExternalToolLaunch {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("External compressor exited with {status}{}", tail_suffix(.output_tail))]
    ExternalTool {
        status: String,
        output_tail: Vec<String>,
    },

    #[error("Failed to write manifest {}: {source}", .path.display())]
    ManifestPersist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ArchiverError {
    /// Short machine-readable label, used in logs and failure events.
    pub fn kind(&self) -> &'static str {
        match self {
            ArchiverError::Config(_) => "configuration",
            ArchiverError::SourceAccess { .. } => "source_access",
            ArchiverError::NothingToBackUp => "nothing_to_back_up",
            ArchiverError::InsufficientSpace { .. } => "insufficient_space",
            ArchiverError::OutputExists(_) => "output_exists",
            ArchiverError::ExternalToolLaunch { .. } | ArchiverError::ExternalTool { .. } => {
                "external_tool"
            }
            ArchiverError::ManifestPersist { .. } => "manifest_persist",
            ArchiverError::Archive(_) => "archive",
            ArchiverError::Io(_) => "io",
            ArchiverError::Serialization(_) => "serialization",
            ArchiverError::Task(_) => "task",
        }
    }
}

fn tail_suffix(lines: &[String]) -> String {
    if lines.is_empty() {
        String::new()
    } else {
        format!(": {}", lines.join(" | "))
    }
}

pub type Result<T> = std::result::Result<T, ArchiverError>;
