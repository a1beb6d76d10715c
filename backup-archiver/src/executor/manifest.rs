//! Manifest sidecar written next to each archive.
//!
//! Serialized as `<archive file name>.manifest.json`, once per run, after the
//! archive step has concluded either way.

use crate::archive::{ArchiveFormat, ArchiveResult};
use crate::config::BackupJob;
use crate::fs::walker::WalkTotals;
use crate::utils::errors::{ArchiverError, Result};
use chrono::{DateTime, Local, SecondsFormat};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Suffix appended to the archive file name
pub const MANIFEST_SUFFIX: &str = ".manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestStatus {
    /// Archive exists and `output_size_bytes` is its size on disk
    Ok,
    /// No promise about the archive
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestTotals {
    pub files: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelSetting {
    pub level: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub output: String,
    pub created_at: String,
    pub preferred_format: ArchiveFormat,
    /// Absent when the run failed before compression started
    pub used_format: Option<ArchiveFormat>,
    pub sources: Vec<String>,
    pub excluded: Vec<String>,
    pub totals: ManifestTotals,
    pub zip: LevelSetting,
    pub archive: LevelSetting,
    pub threads_hint: usize,
    pub status: ManifestStatus,
    pub elapsed_seconds: f64,
    pub output_size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Run facts the manifest is built from
pub struct ManifestInputs<'a> {
    pub output: &'a Path,
    pub created_at: DateTime<Local>,
    pub totals: WalkTotals,
    pub outcome: std::result::Result<&'a ArchiveResult, &'a ArchiverError>,
    /// Format of the strategy that started executing, if any
    pub used_format: Option<ArchiveFormat>,
    /// Run time up to the point of failure; ignored on success
    pub elapsed: Duration,
}

impl Manifest {
    /// Build the manifest document. Pure: touches neither disk nor clock.
    pub fn synthesize(job: &BackupJob, inputs: &ManifestInputs<'_>) -> Self {
        let (status, used_format, elapsed, output_size_bytes, error) = match inputs.outcome {
            Ok(result) => (
                ManifestStatus::Ok,
                Some(result.format),
                result.elapsed,
                Some(result.output_size_bytes),
                None,
            ),
            Err(e) => (
                ManifestStatus::Failed,
                inputs.used_format,
                inputs.elapsed,
                None,
                Some(e.to_string()),
            ),
        };

        Manifest {
            output: inputs.output.display().to_string(),
            created_at: inputs.created_at.to_rfc3339_opts(SecondsFormat::Secs, false),
            preferred_format: job.preferred_format(),
            used_format,
            sources: job.sources().iter().map(|p| p.display().to_string()).collect(),
            excluded: job.exclude_dirs().iter().map(|p| p.display().to_string()).collect(),
            totals: ManifestTotals {
                files: inputs.totals.files,
                bytes: inputs.totals.bytes,
            },
            zip: LevelSetting {
                level: job.zip_level(),
            },
            archive: LevelSetting {
                level: job.archive_level(),
            },
            threads_hint: job.threads_hint(),
            status,
            elapsed_seconds: round_centis(elapsed),
            output_size_bytes,
            error,
        }
    }

    /// Write the manifest as pretty UTF-8 JSON. Never replaces an existing file.
    pub fn persist(&self, path: &Path) -> Result<()> {
        let persist_err = |source: std::io::Error| ArchiverError::ManifestPersist {
            path: path.to_path_buf(),
            source,
        };

        let json = serde_json::to_vec_pretty(self)?;
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(persist_err)?;
        file.write_all(&json).map_err(persist_err)?;
        file.write_all(b"\n").map_err(persist_err)?;
        file.sync_all().map_err(persist_err)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read(path)?;
        Ok(serde_json::from_slice(&content)?)
    }
}

/// `<archive>.manifest.json`
pub fn manifest_path(archive: &Path) -> PathBuf {
    let mut name = archive.as_os_str().to_os_string();
    name.push(MANIFEST_SUFFIX);
    PathBuf::from(name)
}

fn round_centis(elapsed: Duration) -> f64 {
    (elapsed.as_secs_f64() * 100.0).round() / 100.0
}
