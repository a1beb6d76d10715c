//! Configuration management for the backup archiver.
//!
//! Loads configuration from a TOML file with environment variable overrides
//! and validates it into an immutable [`BackupJob`].

use crate::archive::ArchiveFormat;
use crate::utils::errors::{ArchiverError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Prefix for environment overrides, e.g. `BACKUP_ARCHIVER__BACKUP__ZIP_LEVEL=9`
pub const ENV_PREFIX: &str = "BACKUP_ARCHIVER";

/// Highest compression level accepted for either format
pub const MAX_LEVEL: u8 = 9;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub backup: BackupConfig,

    #[serde(default)]
    pub compressor: CompressorConfig,

    #[serde(default)]
    pub space: SpaceConfig,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Directories (or single files) to back up
    pub sources: Vec<PathBuf>,

    /// Directories whose whole subtree is left out
    #[serde(default)]
    pub exclude_dirs: Vec<PathBuf>,

    /// Where archives and manifests are written
    pub output_dir: PathBuf,

    /// zip or 7z
    #[serde(default)]
    pub preferred_format: ArchiveFormat,

    /// Deflate level (0-9)
    #[serde(default = "default_zip_level")]
    pub zip_level: u8,

    /// LZMA2 level (0-9)
    #[serde(default = "default_archive_level")]
    pub archive_level: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressorConfig {
    /// Look for the external 7-Zip binary at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Explicit binary location, probed before the well-known paths
    #[serde(default)]
    pub binary: Option<PathBuf>,

    /// Thread count handed to the compressor (default: CPUs - 1)
    #[serde(default)]
    pub threads: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpaceConfig {
    /// Multiplier applied to the uncompressed total before the free-space check
    #[serde(default = "default_safety_margin")]
    pub safety_margin: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_zip_level() -> u8 {
    6
}

fn default_archive_level() -> u8 {
    7
}

fn default_true() -> bool {
    true
}

fn default_safety_margin() -> f64 {
    1.05
}

fn default_log_level() -> String {
    "info".to_string()
}

/// One thread is left free for the rest of the system.
pub fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .saturating_sub(1)
        .max(1)
}

impl Default for CompressorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            binary: None,
            threads: None,
        }
    }
}

impl Default for SpaceConfig {
    fn default() -> Self {
        Self {
            safety_margin: default_safety_margin(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::for_sources(Vec::new(), PathBuf::from("backups"))
    }
}

impl Config {
    /// Load configuration from a TOML file, then apply `BACKUP_ARCHIVER__*` overrides
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Parse configuration from TOML text without environment overrides
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Render the effective configuration as TOML
    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Configuration with default levels for the given sources
    pub fn for_sources(sources: Vec<PathBuf>, output_dir: PathBuf) -> Self {
        Config {
            backup: BackupConfig {
                sources,
                exclude_dirs: Vec::new(),
                output_dir,
                preferred_format: ArchiveFormat::default(),
                zip_level: default_zip_level(),
                archive_level: default_archive_level(),
            },
            compressor: CompressorConfig::default(),
            space: SpaceConfig::default(),
            log: LogConfig::default(),
        }
    }

    /// Validate into an immutable job. Creates the output directory when missing.
    pub fn into_job(self) -> Result<BackupJob> {
        let backup = self.backup;

        if backup.sources.is_empty() {
            return Err(ArchiverError::Config("no source paths configured".to_string()));
        }
        check_level("zip_level", backup.zip_level)?;
        check_level("archive_level", backup.archive_level)?;

        let margin = self.space.safety_margin;
        if !margin.is_finite() || margin < 1.0 {
            return Err(ArchiverError::Config(format!(
                "space.safety_margin must be a finite number >= 1.0, got {}",
                margin
            )));
        }

        let mut canonical_sources = Vec::with_capacity(backup.sources.len());
        for source in &backup.sources {
            let resolved = std::fs::canonicalize(source).map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ArchiverError::Config(format!(
                    "source path does not exist: {}",
                    source.display()
                )),
                _ => ArchiverError::SourceAccess {
                    path: source.clone(),
                    source: e,
                },
            })?;
            canonical_sources.push(resolved);
        }
        let sources = drop_nested_sources(canonical_sources);

        let exclude_dirs = backup
            .exclude_dirs
            .iter()
            .map(|p| resolve_lenient(p))
            .collect::<Result<Vec<_>>>()?;

        std::fs::create_dir_all(&backup.output_dir).map_err(|e| {
            ArchiverError::Config(format!(
                "cannot create output directory {}: {}",
                backup.output_dir.display(),
                e
            ))
        })?;
        let output_dir = std::fs::canonicalize(&backup.output_dir)?;

        let threads_hint = self.compressor.threads.unwrap_or_else(default_threads).max(1);

        Ok(BackupJob {
            sources,
            exclude_dirs,
            output_dir,
            preferred_format: backup.preferred_format,
            zip_level: backup.zip_level,
            archive_level: backup.archive_level,
            threads_hint,
            space_safety_margin: margin,
            compressor: self.compressor,
        })
    }
}

fn check_level(name: &str, level: u8) -> Result<()> {
    if level > MAX_LEVEL {
        return Err(ArchiverError::Config(format!(
            "{} must be between 0 and {}, got {}",
            name, MAX_LEVEL, level
        )));
    }
    Ok(())
}

/// Canonicalize when the path exists, otherwise make it absolute as written.
fn resolve_lenient(path: &Path) -> Result<PathBuf> {
    match std::fs::canonicalize(path) {
        Ok(p) => Ok(p),
        Err(_) if path.is_absolute() => Ok(path.to_path_buf()),
        Err(_) => Ok(std::env::current_dir()?.join(path)),
    }
}

/// A source inside another source would be archived twice; keep the outer one.
fn drop_nested_sources(sources: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut kept: Vec<PathBuf> = Vec::with_capacity(sources.len());
    for (idx, source) in sources.iter().enumerate() {
        let nested_in = sources.iter().enumerate().find(|(other_idx, other)| {
            *other_idx != idx
                && source.starts_with(other)
                && (source != *other || *other_idx < idx)
        });
        match nested_in {
            Some((_, outer)) => warn!(
                "Source {} is already covered by {}, skipping",
                source.display(),
                outer.display()
            ),
            None => kept.push(source.clone()),
        }
    }
    kept
}

/// Validated, immutable description of one backup run.
///
/// Shared read-only by every stage; build it with [`Config::into_job`].
#[derive(Debug, Clone, Serialize)]
pub struct BackupJob {
    sources: Vec<PathBuf>,
    exclude_dirs: Vec<PathBuf>,
    output_dir: PathBuf,
    preferred_format: ArchiveFormat,
    zip_level: u8,
    archive_level: u8,
    threads_hint: usize,
    space_safety_margin: f64,
    compressor: CompressorConfig,
}

impl BackupJob {
    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }

    pub fn exclude_dirs(&self) -> &[PathBuf] {
        &self.exclude_dirs
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn preferred_format(&self) -> ArchiveFormat {
        self.preferred_format
    }

    pub fn zip_level(&self) -> u8 {
        self.zip_level
    }

    pub fn archive_level(&self) -> u8 {
        self.archive_level
    }

    /// Compression level for the format that is actually produced
    pub fn level_for(&self, format: ArchiveFormat) -> u8 {
        match format {
            ArchiveFormat::Zip => self.zip_level,
            ArchiveFormat::SevenZip => self.archive_level,
        }
    }

    pub fn threads_hint(&self) -> usize {
        self.threads_hint
    }

    pub fn space_safety_margin(&self) -> f64 {
        self.space_safety_margin
    }

    pub fn compressor(&self) -> &CompressorConfig {
        &self.compressor
    }
}
