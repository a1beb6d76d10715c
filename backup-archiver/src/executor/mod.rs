//! Backup executor - Orchestrates one backup run.
//!
//! Stages run strictly in sequence:
//! - compressor probe and strategy selection
//! - file system walk
//! - free-space preflight
//! - archive creation
//! - manifest synthesis
//!
//! The executor is the only place that decides whether a failure ends the
//! run, and the only writer of the manifest status. A manifest is attempted
//! even when a stage fails.

pub mod manifest;

use crate::archive::{ArchiveFormat, ArchiveResult, ArchiveStrategy, CompressorLocator};
use crate::config::{BackupJob, Config};
use crate::fs::space::{DiskSpaceProbe, SpaceChecker, SpaceProbe};
use crate::fs::walker::{collect_walk, SourceWalker, WalkTotals, WalkWarning};
use crate::progress::{ObserverSet, Phase, PipelineEvent, ProgressObserver};
use crate::utils::errors::{ArchiverError, Result};
use chrono::{DateTime, Local};
use manifest::{manifest_path, Manifest, ManifestInputs};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{error, info, warn};

/// Fixed prefix of archive file names
pub const ARCHIVE_PREFIX: &str = "backup";

/// `<prefix>_<YYYY-MM-DDTHH-MM-SS>.<ext>`; no colons, so the name is valid
/// on Windows too
pub fn archive_file_name(prefix: &str, started_at: &DateTime<Local>, format: ArchiveFormat) -> String {
    format!(
        "{}_{}.{}",
        prefix,
        started_at.format("%Y-%m-%dT%H-%M-%S"),
        format.extension()
    )
}

/// Successful run
#[derive(Debug)]
pub struct BackupOutcome {
    pub archive: ArchiveResult,
    pub manifest: Manifest,
    pub manifest_path: PathBuf,
    /// False when the manifest could not be written; the archive still stands
    pub manifest_written: bool,
    pub totals: WalkTotals,
    pub warnings: Vec<WalkWarning>,
}

/// Facts gathered so far, kept for the manifest if a stage fails
struct RunProgress {
    phase: Phase,
    totals: WalkTotals,
    used_format: Option<ArchiveFormat>,
    warnings: Vec<WalkWarning>,
}

/// Main backup executor
pub struct BackupExecutor {
    job: Arc<BackupJob>,
    locator: CompressorLocator,
    space_probe: Arc<dyn SpaceProbe>,
    observers: ObserverSet,
}

impl BackupExecutor {
    /// Executor with the system compressor locator and the real disk probe
    pub fn new(job: BackupJob) -> Self {
        let locator = CompressorLocator::from_settings(job.compressor());
        Self {
            job: Arc::new(job),
            locator,
            space_probe: Arc::new(DiskSpaceProbe),
            observers: ObserverSet::new(),
        }
    }

    /// Validate the configuration and build an executor for it
    pub fn from_config(config: Config) -> Result<Self> {
        Ok(Self::new(config.into_job()?))
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn with_locator(mut self, locator: CompressorLocator) -> Self {
        self.locator = locator;
        self
    }

    pub fn with_space_probe(mut self, probe: Arc<dyn SpaceProbe>) -> Self {
        self.space_probe = probe;
        self
    }

    /// Execute the backup job
    pub async fn execute(&self) -> Result<BackupOutcome> {
        let started_at = Local::now();
        let run_clock = Instant::now();

        // Probed once; the choice does not change for the rest of the run
        let strategy = ArchiveStrategy::select(self.job.preferred_format(), self.locator.locate());
        let output = self.job.output_dir().join(archive_file_name(
            ARCHIVE_PREFIX,
            &started_at,
            strategy.format(),
        ));

        info!(
            "Starting backup run: {} source(s), strategy {}",
            self.job.sources().len(),
            strategy.name()
        );
        self.observers.notify(&PipelineEvent::RunStarted {
            output: output.display().to_string(),
            preferred_format: self.job.preferred_format().to_string(),
            strategy: strategy.name().to_string(),
        });

        let mut progress = RunProgress {
            phase: Phase::Walking,
            totals: WalkTotals::default(),
            used_format: None,
            warnings: Vec::new(),
        };
        let result = self.run_stages(&strategy, &output, &mut progress).await;

        self.observers.notify(&PipelineEvent::PhaseChanged(Phase::Finalizing));
        let manifest = Manifest::synthesize(
            &self.job,
            &ManifestInputs {
                output: &output,
                created_at: started_at,
                totals: progress.totals,
                outcome: result.as_ref(),
                used_format: progress.used_format,
                elapsed: run_clock.elapsed(),
            },
        );
        let manifest_path = manifest_path(&output);
        let manifest_written = match manifest.persist(&manifest_path) {
            Ok(()) => {
                info!("[manifest] Written {}", manifest_path.display());
                true
            }
            Err(e) => {
                error!("[manifest] {}", e);
                false
            }
        };

        match result {
            Ok(archive) => {
                self.observers.notify(&PipelineEvent::RunCompleted {
                    output: archive.output.display().to_string(),
                    manifest: manifest_path.display().to_string(),
                    files: progress.totals.files,
                    bytes: progress.totals.bytes,
                    size_bytes: archive.output_size_bytes,
                    elapsed_secs: archive.elapsed.as_secs_f64(),
                });
                Ok(BackupOutcome {
                    archive,
                    manifest,
                    manifest_path,
                    manifest_written,
                    totals: progress.totals,
                    warnings: progress.warnings,
                })
            }
            Err(e) => {
                self.observers.notify(&PipelineEvent::RunFailed {
                    phase: progress.phase,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn run_stages(
        &self,
        strategy: &ArchiveStrategy,
        output: &Path,
        progress: &mut RunProgress,
    ) -> Result<ArchiveResult> {
        self.enter(progress, Phase::Walking);
        let partial = Arc::new(Mutex::new(WalkTotals::default()));
        let walk = {
            let sources = self.job.sources().to_vec();
            let exclusions = self.job.exclude_dirs().to_vec();
            let observers = self.observers.clone();
            let partial = Arc::clone(&partial);
            tokio::task::spawn_blocking(move || {
                let walker = SourceWalker::new(&sources, &exclusions);
                collect_walk(walker, &observers, |totals| {
                    if let Ok(mut slot) = partial.lock() {
                        *slot = totals;
                    }
                })
            })
            .await?
        };
        progress.totals = partial.lock().map(|t| *t).unwrap_or_default();
        let walk = walk?;
        progress.totals = walk.totals;
        progress.warnings = walk.warnings.clone();

        if !walk.warnings.is_empty() {
            warn!("[walk] {} entries skipped", walk.warnings.len());
        }
        self.observers.notify(&PipelineEvent::EnumerationProgress {
            files: walk.totals.files,
            bytes: walk.totals.bytes,
        });
        if walk.totals.files == 0 {
            return Err(ArchiverError::NothingToBackUp);
        }

        self.enter(progress, Phase::CheckingSpace);
        let checker = SpaceChecker::new(Arc::clone(&self.space_probe), self.job.space_safety_margin());
        let report = checker.check(walk.totals.bytes, self.job.output_dir())?;
        self.observers.notify(&PipelineEvent::SpaceChecked {
            required: report.required,
            available: report.available,
        });

        self.enter(progress, Phase::Compressing);
        let format = strategy.format();
        progress.used_format = Some(format);
        self.observers.notify(&PipelineEvent::CompressionStarted {
            strategy: strategy.name().to_string(),
            format: format.to_string(),
            files: walk.totals.files,
            bytes: walk.totals.bytes,
        });

        let result = strategy
            .execute(
                walk.entries,
                output,
                self.job.level_for(format),
                self.job.threads_hint(),
                &self.observers,
            )
            .await?;

        self.observers.notify(&PipelineEvent::CompressionFinished {
            output: result.output.display().to_string(),
            size_bytes: result.output_size_bytes,
            elapsed_secs: result.elapsed.as_secs_f64(),
        });
        Ok(result)
    }

    fn enter(&self, progress: &mut RunProgress, phase: Phase) {
        progress.phase = phase;
        self.observers.notify(&PipelineEvent::PhaseChanged(phase));
    }
}
