//! Backup Archiver - Main entry point
//!
//! Runs one backup job and exits.

use anyhow::Result;
use backup_archiver::archive::ArchiveFormat;
use backup_archiver::progress::{format_bytes, format_duration, ConsoleObserver};
use backup_archiver::{config::Config, utils, BackupExecutor};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

/// Exit code for a failed run
const EXIT_FAILURE: u8 = 2;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Source directory to back up (replaces configured sources, repeatable)
    #[arg(short, long = "source", value_name = "DIR")]
    sources: Vec<PathBuf>,

    /// Directory to leave out (added to configured exclusions, repeatable)
    #[arg(short, long = "exclude", value_name = "DIR")]
    excludes: Vec<PathBuf>,

    /// Output directory (overrides config)
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Preferred archive format: zip or 7z (overrides config)
    #[arg(short, long)]
    format: Option<ArchiveFormat>,

    /// Never use the external compressor
    #[arg(long)]
    no_external: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if !self.sources.is_empty() {
            config.backup.sources = self.sources.clone();
        }
        config.backup.exclude_dirs.extend(self.excludes.iter().cloned());
        if let Some(output) = &self.output {
            config.backup.output_dir = output.clone();
        }
        if let Some(format) = self.format {
            config.backup.preferred_format = format;
        }
        if self.no_external {
            config.compressor.enabled = false;
        }
        if let Some(level) = &self.log_level {
            config.log.level = level.clone();
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // The subscriber may not be up yet when setup itself failed
            if tracing::dispatcher::has_been_set() {
                tracing::error!("Backup failed: {:#}", e);
            } else {
                eprintln!("Backup failed: {:#}", e);
            }
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)?
    } else {
        Config::default()
    };
    args.apply(&mut config);

    if args.print_config {
        print!("{}", config.to_toml_string()?);
        return Ok(());
    }

    // Initialize logging
    utils::logger::init(&config.log.level)?;

    tracing::info!("Starting backup-archiver v{}", env!("CARGO_PKG_VERSION"));

    let executor = BackupExecutor::from_config(config)?.with_observer(Arc::new(ConsoleObserver::new()));
    let outcome = executor.execute().await?;

    tracing::info!(
        "Backup complete: {} ({}, {} files, {} in {})",
        outcome.archive.output.display(),
        format_bytes(outcome.archive.output_size_bytes),
        outcome.totals.files,
        format_bytes(outcome.totals.bytes),
        format_duration(outcome.archive.elapsed)
    );
    if !outcome.manifest_written {
        tracing::warn!("Manifest {} was not written", outcome.manifest_path.display());
    }

    Ok(())
}
