//! External 7-Zip invocation.
//!
//! The included files are passed through a listfile (`@file`). The process's
//! stdout and stderr are drained on their own tasks while we wait on the
//! exit status, so the tool never blocks on a full pipe.

use crate::fs::walker::FileEntry;
use crate::progress::{CompressionProgressPayload, ObserverSet, PipelineEvent, ThroughputMeter};
use crate::utils::errors::{ArchiverError, Result};
use std::collections::VecDeque;
use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Lines of tool output kept for error reports
const OUTPUT_TAIL_LINES: usize = 20;

/// Read size for the tool's output streams
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Longest output segment kept whole; longer runs are split
const MAX_SEGMENT_BYTES: usize = 16 * 1024;

/// 7-Zip's complaint when it cannot decode the listfile
const LISTFILE_REJECTED_MARKER: &str = "Incorrect item in listfile";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalMode {
    /// `-tzip -mm=Deflate`
    ZipDeflate,
    /// `-t7z -m0=LZMA2`, solid
    SevenZipLzma2,
}

/// Encoding of the listfile, announced to 7-Zip with `-scs`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListfileCharset {
    Utf8,
    Utf16Le,
}

impl ListfileCharset {
    pub fn flag(&self) -> &'static str {
        match self {
            ListfileCharset::Utf8 => "-scsUTF-8",
            ListfileCharset::Utf16Le => "-scsUTF-16LE",
        }
    }

    /// One listfile line for `path`, newline included
    fn encode_line(&self, path: &Path) -> Vec<u8> {
        match self {
            ListfileCharset::Utf8 => {
                let mut line = path_bytes(path);
                line.push(b'\n');
                line
            }
            ListfileCharset::Utf16Le => format!("{}\n", path.to_string_lossy())
                .encode_utf16()
                .flat_map(u16::to_le_bytes)
                .collect(),
        }
    }
}

/// Raw path bytes; names that are not valid UTF-8 reach 7-Zip unchanged
#[cfg(unix)]
fn path_bytes(path: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    path.as_os_str().as_bytes().to_vec()
}

#[cfg(not(unix))]
fn path_bytes(path: &Path) -> Vec<u8> {
    path.to_string_lossy().into_owned().into_bytes()
}

/// Listfile location for an archive: `<archive>.list.txt`
pub fn listfile_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_os_string();
    name.push(".list.txt");
    PathBuf::from(name)
}

/// Write one absolute path per line, in walk order
pub fn write_listfile(path: &Path, entries: &[FileEntry], charset: ListfileCharset) -> std::io::Result<()> {
    let file = std::fs::File::create(path)?;
    let mut writer = std::io::BufWriter::new(file);
    for entry in entries {
        writer.write_all(&charset.encode_line(&entry.path))?;
    }
    writer.flush()
}

/// Command-line arguments for one 7-Zip run
pub fn build_args(
    mode: ExternalMode,
    output: &Path,
    listfile: &Path,
    charset: ListfileCharset,
    level: u8,
    threads: usize,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["a".into()];
    match mode {
        ExternalMode::ZipDeflate => {
            args.push("-tzip".into());
            args.push(format!("-mx={}", level).into());
            args.push("-mm=Deflate".into());
            args.push(format!("-mmt={}", threads).into());
        }
        ExternalMode::SevenZipLzma2 => {
            args.push("-t7z".into());
            args.push("-m0=LZMA2".into());
            args.push(format!("-mx={}", level).into());
            args.push(format!("-mmt={}", threads).into());
            args.push("-ms=on".into());
        }
    }
    args.push(charset.flag().into());
    args.push("-spf2".into());
    // Progress percentages on stdout
    args.push("-bsp1".into());
    args.push(output.as_os_str().to_os_string());

    let mut list_arg = OsString::from("@");
    list_arg.push(listfile.as_os_str());
    args.push(list_arg);
    args
}

/// What a finished run of the tool left behind
#[derive(Debug)]
struct RunOutcome {
    status: ExitStatus,
    output_tail: Vec<String>,
    listfile_rejected: bool,
}

/// Output collected from one stream
#[derive(Debug, Default)]
struct Drained {
    tail: VecDeque<String>,
    listfile_rejected: bool,
}

impl Drained {
    /// Handle one output segment. Progress markers go to the reporter;
    /// everything else is logged and kept in the tail.
    fn take_segment(&mut self, pending: &mut Vec<u8>, name: &str, progress: Option<&mut ProgressReporter>) {
        if pending.is_empty() {
            return;
        }
        let text = String::from_utf8_lossy(&pending[..]).trim().to_string();
        pending.clear();
        if text.is_empty() {
            return;
        }

        if let Some(reporter) = progress {
            if let Some(marker) = ProgressMarker::parse(&text) {
                reporter.report(marker);
                return;
            }
        }

        debug!("7z {}: {}", name, text);
        if text.contains(LISTFILE_REJECTED_MARKER) {
            self.listfile_rejected = true;
        }
        if self.tail.len() == OUTPUT_TAIL_LINES {
            self.tail.pop_front();
        }
        self.tail.push_back(text);
    }
}

/// One `-bsp1` progress update, e.g. `42% 17 + Documents/report.pdf`
#[derive(Debug, Clone, PartialEq, Eq)]
struct ProgressMarker {
    percent: u8,
    files_done: Option<u64>,
    current_file: Option<String>,
}

impl ProgressMarker {
    fn parse(text: &str) -> Option<Self> {
        let (head, rest) = text.split_once('%')?;
        let percent: u8 = head.trim().parse().ok().filter(|p| *p <= 100)?;
        let files_done = rest.split_whitespace().next().and_then(|t| t.parse().ok());
        let current_file = rest
            .split_once(" + ")
            .map(|(_, file)| file.trim().to_string())
            .filter(|file| !file.is_empty());

        Some(Self {
            percent,
            files_done,
            current_file,
        })
    }
}

/// Turns progress markers into [`PipelineEvent::CompressionProgress`] events
struct ProgressReporter {
    observers: ObserverSet,
    total_files: u64,
    total_bytes: u64,
    meter: ThroughputMeter,
    last_percent: Option<u8>,
}

impl ProgressReporter {
    fn new(observers: &ObserverSet, entries: &[FileEntry]) -> Self {
        Self {
            observers: observers.clone(),
            total_files: entries.len() as u64,
            total_bytes: entries.iter().map(|e| e.size).sum(),
            meter: ThroughputMeter::new(),
            last_percent: None,
        }
    }

    fn report(&mut self, marker: ProgressMarker) {
        // 7-Zip repeats the same percentage while it works on one file
        if self.last_percent == Some(marker.percent) {
            return;
        }
        self.last_percent = Some(marker.percent);

        let percent = u128::from(marker.percent);
        let bytes_done = (u128::from(self.total_bytes) * percent / 100) as u64;
        let files_done = marker
            .files_done
            .unwrap_or((u128::from(self.total_files) * percent / 100) as u64)
            .min(self.total_files);

        self.observers
            .notify(&PipelineEvent::CompressionProgress(CompressionProgressPayload {
                files_done,
                bytes_done,
                total_files: self.total_files,
                total_bytes: self.total_bytes,
                bytes_per_second: self.meter.sample(bytes_done),
                current_file: marker.current_file,
            }));
    }
}

#[derive(Debug, Clone)]
pub struct ExternalCompressor {
    binary: PathBuf,
}

impl ExternalCompressor {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }

    pub fn is_available(&self) -> bool {
        self.binary.is_file()
    }

    /// Create `output` from `entries`. A UTF-8 listfile is tried first; if
    /// 7-Zip rejects it, the run is repeated once with a UTF-16LE listfile.
    ///
    /// Percentages reported by 7-Zip are forwarded to `observers`.
    pub async fn compress(
        &self,
        mode: ExternalMode,
        entries: &[FileEntry],
        output: &Path,
        level: u8,
        threads: usize,
        observers: &ObserverSet,
    ) -> Result<()> {
        let settings = RunSettings {
            mode,
            level,
            threads,
            observers,
        };
        let first = self
            .attempt(&settings, entries, output, ListfileCharset::Utf8)
            .await?;

        let outcome = if !first.status.success() && first.listfile_rejected {
            warn!("[compress] 7-Zip rejected the UTF-8 listfile, retrying with UTF-16LE");
            if output.exists() {
                std::fs::remove_file(output)?;
            }
            self.attempt(&settings, entries, output, ListfileCharset::Utf16Le)
                .await?
        } else {
            first
        };

        if outcome.status.success() {
            info!("[compress] 7-Zip finished: {}", output.display());
            Ok(())
        } else {
            for line in &outcome.output_tail {
                error!("[compress] 7z: {}", line);
            }
            Err(ArchiverError::ExternalTool {
                status: outcome.status.to_string(),
                output_tail: outcome.output_tail,
            })
        }
    }

    async fn attempt(
        &self,
        settings: &RunSettings<'_>,
        entries: &[FileEntry],
        output: &Path,
        charset: ListfileCharset,
    ) -> Result<RunOutcome> {
        let listfile = listfile_path(output);
        write_listfile(&listfile, entries, charset)?;

        let args = build_args(
            settings.mode,
            output,
            &listfile,
            charset,
            settings.level,
            settings.threads,
        );
        let reporter = ProgressReporter::new(settings.observers, entries);
        let outcome = self.run(&args, reporter).await;

        if let Err(e) = std::fs::remove_file(&listfile) {
            warn!("Could not remove listfile {}: {}", listfile.display(), e);
        }
        outcome
    }

    async fn run(&self, args: &[OsString], reporter: ProgressReporter) -> Result<RunOutcome> {
        info!(
            "[compress] Running: {} {}",
            self.binary.display(),
            args.iter()
                .map(|a| a.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );

        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ArchiverError::ExternalToolLaunch {
                binary: self.binary.clone(),
                source: e,
            })?;

        let stdout = child
            .stdout
            .take()
            .map(|s| tokio::spawn(drain(s, "stdout", Some(reporter))));
        let stderr = child
            .stderr
            .take()
            .map(|s| tokio::spawn(drain(s, "stderr", None)));

        let status = child.wait().await?;

        let mut output_tail = Vec::new();
        let mut listfile_rejected = false;
        for handle in [stdout, stderr].into_iter().flatten() {
            let drained = handle.await?;
            listfile_rejected |= drained.listfile_rejected;
            output_tail.extend(drained.tail);
        }

        Ok(RunOutcome {
            status,
            output_tail,
            listfile_rejected,
        })
    }
}

/// Per-run options shared by both listfile attempts
struct RunSettings<'a> {
    mode: ExternalMode,
    level: u8,
    threads: usize,
    observers: &'a ObserverSet,
}

/// Read a stream to EOF, splitting it into segments at newlines, carriage
/// returns and backspaces (7-Zip redraws its progress line with the latter).
/// Bytes are decoded lossily; console code pages are not always UTF-8.
async fn drain<R>(mut stream: R, name: &'static str, mut progress: Option<ProgressReporter>) -> Drained
where
    R: AsyncRead + Unpin,
{
    let mut drained = Drained::default();
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];
    let mut pending = Vec::new();

    loop {
        match stream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                for &byte in &chunk[..n] {
                    if matches!(byte, b'\n' | b'\r' | 0x08) {
                        drained.take_segment(&mut pending, name, progress.as_mut());
                    } else {
                        pending.push(byte);
                        if pending.len() >= MAX_SEGMENT_BYTES {
                            drained.take_segment(&mut pending, name, progress.as_mut());
                        }
                    }
                }
            }
            Err(e) => {
                warn!("Stopped reading 7z {}: {}", name, e);
                break;
            }
        }
    }
    drained.take_segment(&mut pending, name, progress.as_mut());

    drained
}
