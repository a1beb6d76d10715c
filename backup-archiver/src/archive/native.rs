//! In-process ZIP writer used when no external compressor is installed.
//!
//! Entries are written one at a time through a single transfer buffer that
//! is allocated once per archive; its size does not depend on file sizes or
//! on the number of files. Strictly single-threaded.

use crate::fs::metadata::EntryMetadata;
use crate::fs::walker::FileEntry;
use crate::progress::{CompressionProgressPayload, ObserverSet, PipelineEvent, ThroughputMeter};
use crate::utils::errors::{ArchiverError, Result};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Size of the per-archive transfer buffer
pub const TRANSFER_BUFFER_SIZE: usize = 64 * 1024;

/// Entries at or above this size need ZIP64 headers
const ZIP64_THRESHOLD: u64 = u32::MAX as u64;

/// Minimum time between progress events
const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// Counters from one archive run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NativeStats {
    pub files_written: u64,
    pub files_skipped: u64,
    pub bytes_read: u64,
}

#[derive(Debug, Clone)]
pub struct NativeZipArchiver {
    buffer_size: usize,
}

impl Default for NativeZipArchiver {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeZipArchiver {
    pub fn new() -> Self {
        Self {
            buffer_size: TRANSFER_BUFFER_SIZE,
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Write `entries` into a new ZIP file at `output`.
    ///
    /// Files that are gone or unreadable when opened are skipped with an
    /// [`PipelineEvent::EntrySkipped`]; a read error after an entry has been
    /// started aborts the archive.
    pub fn write_archive(
        &self,
        entries: &[FileEntry],
        output: &Path,
        level: u8,
        observers: &ObserverSet,
    ) -> Result<NativeStats> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(output)
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => ArchiverError::OutputExists(output.to_path_buf()),
                _ => ArchiverError::Io(e),
            })?;
        let mut zip = ZipWriter::new(BufWriter::with_capacity(self.buffer_size, file));

        let total_files = entries.len() as u64;
        let total_bytes: u64 = entries.iter().map(|e| e.size).sum();
        let mut buffer = vec![0u8; self.buffer_size];
        let mut stats = NativeStats::default();
        let mut written: HashSet<String> = HashSet::new();
        let mut meter = ThroughputMeter::new();
        let mut last_report = Instant::now();

        for entry in entries {
            let name = entry.archive_name();
            if written.contains(&name) {
                warn!("Skipping {}: {} is already in the archive", entry.path.display(), name);
                observers.notify(&PipelineEvent::EntrySkipped {
                    path: entry.path.display().to_string(),
                    reason: format!("duplicate archive name {}", name),
                });
                stats.files_skipped += 1;
                continue;
            }

            let mut source = match File::open(&entry.path) {
                Ok(f) => f,
                Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::PermissionDenied) => {
                    warn!("Skipping {}: {}", entry.path.display(), e);
                    observers.notify(&PipelineEvent::EntrySkipped {
                        path: entry.path.display().to_string(),
                        reason: e.to_string(),
                    });
                    stats.files_skipped += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let fs_metadata = source.metadata()?;
            let metadata = EntryMetadata::from_metadata(&fs_metadata);
            let options = entry_options(level, fs_metadata.len(), &metadata);

            zip.start_file(name.as_str(), options)?;
            let copied = copy_through(&mut source, &mut zip, &mut buffer)?;
            debug!("Added {} ({} bytes)", name, copied);

            written.insert(name.clone());
            stats.files_written += 1;
            stats.bytes_read += copied;

            if last_report.elapsed() >= PROGRESS_INTERVAL {
                last_report = Instant::now();
                observers.notify(&PipelineEvent::CompressionProgress(CompressionProgressPayload {
                    files_done: stats.files_written + stats.files_skipped,
                    bytes_done: stats.bytes_read,
                    total_files,
                    total_bytes,
                    bytes_per_second: meter.sample(stats.bytes_read),
                    current_file: Some(name.clone()),
                }));
            }
        }

        let writer = zip.finish()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;

        observers.notify(&PipelineEvent::CompressionProgress(CompressionProgressPayload {
            files_done: stats.files_written + stats.files_skipped,
            bytes_done: stats.bytes_read,
            total_files,
            total_bytes,
            bytes_per_second: meter.average_speed(),
            current_file: None,
        }));

        Ok(stats)
    }
}

fn entry_options(level: u8, size: u64, metadata: &EntryMetadata) -> SimpleFileOptions {
    let mut options = if level == 0 {
        SimpleFileOptions::default().compression_method(CompressionMethod::Stored)
    } else {
        SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(level.into()))
    };
    options = options.large_file(size >= ZIP64_THRESHOLD);

    if let Some(modified) = metadata.zip_modified() {
        options = options.last_modified_time(modified);
    }
    if let Some(mode) = metadata.permissions {
        options = options.unix_permissions(mode);
    }
    options
}

/// Copy through the caller's buffer; no other allocation happens per file.
fn copy_through<R: Read, W: Write>(reader: &mut R, writer: &mut W, buffer: &mut [u8]) -> std::io::Result<u64> {
    let mut total = 0u64;
    loop {
        let n = match reader.read(buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buffer[..n])?;
        total += n as u64;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressObserver;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    fn entry_for(root: &Path, name: &str) -> FileEntry {
        let path = root.join(name);
        let size = fs::metadata(&path).unwrap().len();
        FileEntry {
            path,
            relative_path: PathBuf::from("root").join(name),
            size,
        }
    }

    fn read_entry(archive: &Path, name: &str) -> Vec<u8> {
        let mut zip = zip::ZipArchive::new(File::open(archive).unwrap()).unwrap();
        let mut file = zip.by_name(name).unwrap();
        let mut content = Vec::new();
        file.read_to_end(&mut content).unwrap();
        content
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<PipelineEvent>>);

    impl ProgressObserver for Recorder {
        fn on_event(&self, event: &PipelineEvent) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    #[test]
    fn test_files_larger_than_buffer_stream_intact() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let big: Vec<u8> = (0..(TRANSFER_BUFFER_SIZE * 5 + 123)).map(|i| (i % 251) as u8).collect();
        fs::write(temp_dir.path().join("big.bin"), &big)?;
        fs::write(temp_dir.path().join("small.txt"), b"tiny")?;

        let archiver = NativeZipArchiver::new();
        let entries = vec![
            entry_for(temp_dir.path(), "big.bin"),
            entry_for(temp_dir.path(), "small.txt"),
        ];
        let output = temp_dir.path().join("out.zip");
        let stats = archiver
            .write_archive(&entries, &output, 6, &ObserverSet::new())
            .unwrap();

        assert_eq!(stats.files_written, 2);
        assert_eq!(stats.bytes_read, big.len() as u64 + 4);
        assert_eq!(archiver.buffer_size(), TRANSFER_BUFFER_SIZE);
        assert_eq!(read_entry(&output, "root/big.bin"), big);
        assert_eq!(read_entry(&output, "root/small.txt"), b"tiny");
        Ok(())
    }

    /// Reader that records the largest read request it receives
    struct MeasuredReader<R> {
        inner: R,
        largest_request: usize,
    }

    impl<R: Read> Read for MeasuredReader<R> {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.largest_request = self.largest_request.max(buf.len());
            self.inner.read(buf)
        }
    }

    #[test]
    fn test_read_requests_bounded_by_transfer_buffer() -> std::io::Result<()> {
        let archiver = NativeZipArchiver::new();
        let mut buffer = vec![0u8; archiver.buffer_size()];

        for size in [10usize, TRANSFER_BUFFER_SIZE * 3, TRANSFER_BUFFER_SIZE * 40 + 7] {
            let data: Vec<u8> = (0..size).map(|i| (i % 253) as u8).collect();
            let mut reader = MeasuredReader {
                inner: data.as_slice(),
                largest_request: 0,
            };
            let mut zip = ZipWriter::new(std::io::Cursor::new(Vec::new()));
            let metadata = EntryMetadata {
                modified: None,
                permissions: None,
            };
            zip.start_file("f.bin", entry_options(6, size as u64, &metadata))
                .unwrap();

            let copied = copy_through(&mut reader, &mut zip, &mut buffer)?;
            assert_eq!(copied, size as u64);
            assert!(reader.largest_request <= TRANSFER_BUFFER_SIZE);
            assert_eq!(buffer.len(), TRANSFER_BUFFER_SIZE);
        }
        Ok(())
    }

    #[test]
    fn test_level_zero_is_stored() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("a.txt"), vec![b'a'; 10_000])?;
        let output = temp_dir.path().join("stored.zip");

        NativeZipArchiver::new()
            .write_archive(&[entry_for(temp_dir.path(), "a.txt")], &output, 0, &ObserverSet::new())
            .unwrap();

        let mut zip = zip::ZipArchive::new(File::open(&output)?).unwrap();
        let file = zip.by_index(0).unwrap();
        assert_eq!(file.compression(), CompressionMethod::Stored);
        assert_eq!(file.size(), 10_000);
        Ok(())
    }

    #[test]
    fn test_vanished_file_is_skipped() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("keep.txt"), b"keep")?;
        let gone = FileEntry {
            path: temp_dir.path().join("gone.txt"),
            relative_path: PathBuf::from("root/gone.txt"),
            size: 3,
        };

        let recorder = Arc::new(Recorder::default());
        let mut observers = ObserverSet::new();
        observers.push(recorder.clone());

        let output = temp_dir.path().join("out.zip");
        let stats = NativeZipArchiver::new()
            .write_archive(&[gone, entry_for(temp_dir.path(), "keep.txt")], &output, 6, &observers)
            .unwrap();

        assert_eq!(stats.files_written, 1);
        assert_eq!(stats.files_skipped, 1);
        let events = recorder.0.lock().unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e, PipelineEvent::EntrySkipped { .. })));
        assert!(matches!(
            events.last(),
            Some(PipelineEvent::CompressionProgress(p)) if p.files_done == 2
        ));
        Ok(())
    }

    #[test]
    fn test_duplicate_archive_name_is_skipped() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("one.txt"), b"first")?;
        fs::write(temp_dir.path().join("two.txt"), b"second")?;
        let mut clash = entry_for(temp_dir.path(), "two.txt");
        clash.relative_path = PathBuf::from("root/one.txt");

        let recorder = Arc::new(Recorder::default());
        let mut observers = ObserverSet::new();
        observers.push(recorder.clone());

        let output = temp_dir.path().join("out.zip");
        let stats = NativeZipArchiver::new()
            .write_archive(&[entry_for(temp_dir.path(), "one.txt"), clash], &output, 6, &observers)
            .unwrap();

        assert_eq!(stats.files_written, 1);
        assert_eq!(stats.files_skipped, 1);
        assert_eq!(read_entry(&output, "root/one.txt"), b"first");
        assert!(recorder.0.lock().unwrap().iter().any(|e| matches!(
            e,
            PipelineEvent::EntrySkipped { reason, .. } if reason.contains("duplicate")
        )));
        Ok(())
    }

    #[test]
    fn test_refuses_to_overwrite() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let output = temp_dir.path().join("exists.zip");
        fs::write(&output, b"other run")?;

        let result = NativeZipArchiver::new().write_archive(&[], &output, 6, &ObserverSet::new());
        assert!(matches!(result, Err(ArchiverError::OutputExists(_))));
        assert_eq!(fs::read(&output)?, b"other run");
        Ok(())
    }

    #[test]
    fn test_copy_through_uses_given_buffer() -> std::io::Result<()> {
        let data = vec![7u8; 10_000];
        let mut out = Vec::new();
        let mut buffer = [0u8; 16];
        let copied = copy_through(&mut data.as_slice(), &mut out, &mut buffer)?;
        assert_eq!(copied, 10_000);
        assert_eq!(out, data);
        Ok(())
    }
}
