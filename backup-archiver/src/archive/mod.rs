//! Archive strategies: external 7-Zip (ZIP or 7z) and the in-process ZIP
//! fallback.
//!
//! The set is closed. One compressor probe per run picks the variant; once
//! execution starts there is no switching, and a failing external tool is a
//! hard error rather than a trigger for the fallback.

pub mod external;
pub mod locator;
pub mod native;

pub use external::{ExternalCompressor, ExternalMode, ListfileCharset};
pub use locator::CompressorLocator;
pub use native::NativeZipArchiver;

use crate::fs::walker::FileEntry;
use crate::progress::ObserverSet;
use crate::utils::errors::{ArchiverError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Container format of the produced archive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArchiveFormat {
    #[default]
    #[serde(rename = "zip")]
    Zip,
    #[serde(rename = "7z", alias = "archive")]
    SevenZip,
}

impl ArchiveFormat {
    /// File extension, also the value recorded in manifests
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::SevenZip => "7z",
        }
    }
}

impl std::fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ArchiveFormat {
    type Err = ArchiverError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "zip" => Ok(ArchiveFormat::Zip),
            "7z" | "archive" => Ok(ArchiveFormat::SevenZip),
            other => Err(ArchiverError::Config(format!(
                "unknown archive format '{}' (expected zip or 7z)",
                other
            ))),
        }
    }
}

/// Outcome of one successful strategy execution
#[derive(Debug, Clone)]
pub struct ArchiveResult {
    pub format: ArchiveFormat,
    pub strategy: &'static str,
    pub output: PathBuf,
    pub elapsed: Duration,
    pub output_size_bytes: u64,
}

#[derive(Debug, Clone)]
pub enum ArchiveStrategy {
    /// 7-Zip in ZIP/Deflate mode, multi-threaded
    ExternalZip(ExternalCompressor),
    /// 7-Zip in 7z/LZMA2 mode
    ExternalArchive(ExternalCompressor),
    /// In-process streaming ZIP writer
    NativeFallback(NativeZipArchiver),
}

impl ArchiveStrategy {
    /// Pick the strategy from the probe result. Without a compressor the
    /// native fallback is used whatever the preferred format.
    pub fn select(preferred: ArchiveFormat, compressor: Option<PathBuf>) -> Self {
        match (compressor, preferred) {
            (Some(binary), ArchiveFormat::Zip) => {
                ArchiveStrategy::ExternalZip(ExternalCompressor::new(binary))
            }
            (Some(binary), ArchiveFormat::SevenZip) => {
                ArchiveStrategy::ExternalArchive(ExternalCompressor::new(binary))
            }
            (None, _) => ArchiveStrategy::NativeFallback(NativeZipArchiver::new()),
        }
    }

    /// Whether this strategy can run on this machine
    pub fn probe(&self) -> bool {
        match self {
            ArchiveStrategy::ExternalZip(c) | ArchiveStrategy::ExternalArchive(c) => {
                c.is_available()
            }
            ArchiveStrategy::NativeFallback(_) => true,
        }
    }

    pub fn format(&self) -> ArchiveFormat {
        match self {
            ArchiveStrategy::ExternalZip(_) | ArchiveStrategy::NativeFallback(_) => {
                ArchiveFormat::Zip
            }
            ArchiveStrategy::ExternalArchive(_) => ArchiveFormat::SevenZip,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ArchiveStrategy::ExternalZip(_) => "7z-zip",
            ArchiveStrategy::ExternalArchive(_) => "7z-7z",
            ArchiveStrategy::NativeFallback(_) => "native-zip",
        }
    }

    /// Compress `entries` into a new archive at `output`.
    ///
    /// `output` must not exist yet. On failure any partial archive is
    /// removed before the error is returned.
    pub async fn execute(
        &self,
        entries: Vec<FileEntry>,
        output: &Path,
        level: u8,
        threads: usize,
        observers: &ObserverSet,
    ) -> Result<ArchiveResult> {
        if output.exists() {
            return Err(ArchiverError::OutputExists(output.to_path_buf()));
        }

        let started = Instant::now();
        info!("Executing {} strategy -> {}", self.name(), output.display());

        let outcome = match self {
            ArchiveStrategy::ExternalZip(compressor) => {
                compressor
                    .compress(ExternalMode::ZipDeflate, &entries, output, level, threads, observers)
                    .await
            }
            ArchiveStrategy::ExternalArchive(compressor) => {
                compressor
                    .compress(ExternalMode::SevenZipLzma2, &entries, output, level, threads, observers)
                    .await
            }
            ArchiveStrategy::NativeFallback(archiver) => {
                let archiver = archiver.clone();
                let output = output.to_path_buf();
                let observers = observers.clone();
                tokio::task::spawn_blocking(move || {
                    archiver
                        .write_archive(&entries, &output, level, &observers)
                        .map(|_| ())
                })
                .await
                .map_err(ArchiverError::from)
                .and_then(|r| r)
            }
        };

        if let Err(e) = outcome {
            remove_partial_output(output);
            return Err(e);
        }

        let output_size_bytes = std::fs::metadata(output)?.len();
        Ok(ArchiveResult {
            format: self.format(),
            strategy: self.name(),
            output: output.to_path_buf(),
            elapsed: started.elapsed(),
            output_size_bytes,
        })
    }
}

fn remove_partial_output(output: &Path) {
    if output.exists() {
        match std::fs::remove_file(output) {
            Ok(()) => info!("Removed partial archive {}", output.display()),
            Err(e) => warn!("Could not remove partial archive {}: {}", output.display(), e),
        }
    }
}
