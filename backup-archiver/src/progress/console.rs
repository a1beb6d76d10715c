//! Renders pipeline events as timestamped log lines tagged by phase.

use super::format::{format_bytes, format_speed};
use super::{Phase, PipelineEvent, ProgressObserver};
use tracing::{error, info, warn};

/// Operator-facing observer writing through `tracing`
#[derive(Debug, Default, Clone)]
pub struct ConsoleObserver;

impl ConsoleObserver {
    pub fn new() -> Self {
        Self
    }
}

impl ProgressObserver for ConsoleObserver {
    fn on_event(&self, event: &PipelineEvent) -> anyhow::Result<()> {
        match event {
            PipelineEvent::RunStarted {
                output,
                preferred_format,
                strategy,
            } => {
                info!(
                    "Starting backup (preferred: {}, strategy: {}) -> {}",
                    preferred_format, strategy, output
                );
            }
            PipelineEvent::PhaseChanged(phase) => {
                info!("[{}] {}", phase.tag(), phase_title(*phase));
            }
            PipelineEvent::EnumerationProgress { files, bytes } => {
                info!("[walk] {} files queued ({})", files, format_bytes(*bytes));
            }
            PipelineEvent::WalkWarning { path, reason } => {
                warn!("[walk] Skipping {}: {}", path, reason);
            }
            PipelineEvent::SpaceChecked { required, available } => {
                info!(
                    "[space] Required (worst case): {} | Free: {}",
                    format_bytes(*required),
                    format_bytes(*available)
                );
            }
            PipelineEvent::CompressionStarted {
                strategy,
                format,
                files,
                bytes,
            } => {
                info!(
                    "[compress] {} -> .{}: {} files, {}",
                    strategy,
                    format,
                    files,
                    format_bytes(*bytes)
                );
            }
            PipelineEvent::CompressionProgress(p) => {
                info!(
                    "[compress] {:.1}% ({}/{} files, {}, {})",
                    p.percent(),
                    p.files_done,
                    p.total_files,
                    format_bytes(p.bytes_done),
                    format_speed(p.bytes_per_second)
                );
            }
            PipelineEvent::EntrySkipped { path, reason } => {
                warn!("[compress] Skipping {}: {}", path, reason);
            }
            PipelineEvent::CompressionFinished {
                output,
                size_bytes,
                elapsed_secs,
            } => {
                info!(
                    "[compress] OK in {:.1}s: {} ({})",
                    elapsed_secs,
                    output,
                    format_bytes(*size_bytes)
                );
            }
            PipelineEvent::RunCompleted {
                output,
                manifest,
                files,
                bytes,
                size_bytes,
                elapsed_secs,
            } => {
                info!("{}", "=".repeat(60));
                info!("Archive: {}", output);
                info!(
                    "Final size: {} (source ~{} in {} files)",
                    format_bytes(*size_bytes),
                    format_bytes(*bytes),
                    files
                );
                info!("Manifest: {}", manifest);
                info!("Duration: {:.1}s", elapsed_secs);
                info!("{}", "=".repeat(60));
            }
            PipelineEvent::RunFailed { phase, error: err } => {
                error!("[{}] Backup failed: {}", phase.tag(), err);
            }
        }
        Ok(())
    }
}

fn phase_title(phase: Phase) -> &'static str {
    match phase {
        Phase::Walking => "Enumerating source files",
        Phase::CheckingSpace => "Checking free space",
        Phase::Compressing => "Compressing",
        Phase::Finalizing => "Writing manifest",
    }
}
