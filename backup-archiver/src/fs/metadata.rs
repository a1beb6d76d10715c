//! File metadata carried into archive entry headers.

use chrono::{DateTime, Datelike, Local, Timelike};
use std::fs;
use std::time::SystemTime;

/// Metadata recorded alongside each archived file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMetadata {
    /// Last modified time
    pub modified: Option<SystemTime>,

    /// File permissions (Unix mode bits)
    pub permissions: Option<u32>,
}

impl EntryMetadata {
    /// Extract metadata from an open file's metadata
    pub fn from_metadata(metadata: &fs::Metadata) -> Self {
        #[cfg(unix)]
        let permissions = {
            use std::os::unix::fs::PermissionsExt;
            Some(metadata.permissions().mode())
        };

        #[cfg(not(unix))]
        let permissions = None;

        Self {
            modified: metadata.modified().ok(),
            permissions,
        }
    }

    /// Modified time as a ZIP (MS-DOS) timestamp in local time.
    /// None when the time is outside the representable 1980-2107 range.
    pub fn zip_modified(&self) -> Option<zip::DateTime> {
        let local: DateTime<Local> = self.modified?.into();
        let year = u16::try_from(local.year()).ok()?;
        zip::DateTime::from_date_and_time(
            year,
            local.month() as u8,
            local.day() as u8,
            local.hour() as u8,
            local.minute() as u8,
            local.second() as u8,
        )
        .ok()
    }
}
