//! Free-space preflight for the output volume.
//!
//! The archive is assumed to be no smaller than its input, so the required
//! space is the uncompressed total scaled by a safety margin (>= 1.0).

use crate::utils::errors::{ArchiverError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Source of free-space figures for a path
pub trait SpaceProbe: Send + Sync {
    fn available_space(&self, path: &Path) -> std::io::Result<u64>;
}

/// Queries the volume holding the path
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskSpaceProbe;

impl SpaceProbe for DiskSpaceProbe {
    fn available_space(&self, path: &Path) -> std::io::Result<u64> {
        fs4::available_space(path)
    }
}

/// Result of a passed check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceReport {
    pub path: PathBuf,
    pub required: u64,
    pub available: u64,
}

pub struct SpaceChecker {
    probe: Arc<dyn SpaceProbe>,
    safety_margin: f64,
}

impl SpaceChecker {
    pub fn new(probe: Arc<dyn SpaceProbe>, safety_margin: f64) -> Self {
        Self {
            probe,
            safety_margin: safety_margin.max(1.0),
        }
    }

    /// Worst-case bytes needed to archive `total_bytes` of input
    pub fn required_bytes(&self, total_bytes: u64) -> u64 {
        (total_bytes as f64 * self.safety_margin).ceil() as u64
    }

    /// Fail with [`ArchiverError::InsufficientSpace`] when `output_dir` cannot
    /// hold the worst case. Must run before the archive is created.
    pub fn check(&self, total_bytes: u64, output_dir: &Path) -> Result<SpaceReport> {
        let required = self.required_bytes(total_bytes);
        let available = self.probe.available_space(output_dir)?;

        if available < required {
            return Err(ArchiverError::InsufficientSpace {
                path: output_dir.to_path_buf(),
                required,
                available,
            });
        }

        Ok(SpaceReport {
            path: output_dir.to_path_buf(),
            required,
            available,
        })
    }
}

/// Probe returning a fixed figure, for tests and dry runs
#[derive(Debug, Clone, Copy)]
pub struct FixedSpaceProbe(pub u64);

impl SpaceProbe for FixedSpaceProbe {
    fn available_space(&self, _path: &Path) -> std::io::Result<u64> {
        Ok(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_required_bytes_never_below_total() {
        let exact = SpaceChecker::new(Arc::new(FixedSpaceProbe(0)), 1.0);
        assert_eq!(exact.required_bytes(100), 100);

        let padded = SpaceChecker::new(Arc::new(FixedSpaceProbe(0)), 1.05);
        assert_eq!(padded.required_bytes(100), 105);
        assert_eq!(padded.required_bytes(0), 0);

        let clamped = SpaceChecker::new(Arc::new(FixedSpaceProbe(0)), 0.1);
        assert_eq!(clamped.required_bytes(100), 100);
    }

    #[test]
    fn test_check_passes_with_enough_space() {
        let checker = SpaceChecker::new(Arc::new(FixedSpaceProbe(1000)), 1.05);
        let report = checker.check(100, Path::new("/backups")).unwrap();
        assert_eq!(report.required, 105);
        assert_eq!(report.available, 1000);
    }

    #[test]
    fn test_check_fails_when_short() {
        let checker = SpaceChecker::new(Arc::new(FixedSpaceProbe(104)), 1.05);
        match checker.check(100, Path::new("/backups")) {
            Err(ArchiverError::InsufficientSpace {
                required, available, ..
            }) => {
                assert_eq!(required, 105);
                assert_eq!(available, 104);
            }
            other => panic!("expected InsufficientSpace, got {:?}", other),
        }
    }

    #[test]
    fn test_disk_probe_reports_real_volume() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let available = DiskSpaceProbe.available_space(temp_dir.path())?;
        let checker = SpaceChecker::new(Arc::new(DiskSpaceProbe), 1.0);
        assert!(checker.check(0, temp_dir.path()).is_ok());
        assert!(checker.check(available.saturating_add(1 << 40), temp_dir.path()).is_err());
        Ok(())
    }
}
