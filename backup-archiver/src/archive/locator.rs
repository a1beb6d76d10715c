//! Discovery of the external 7-Zip binary.

use crate::config::CompressorConfig;
use std::path::PathBuf;
use tracing::debug;

/// Install locations checked before the search path
#[cfg(windows)]
const WELL_KNOWN_PATHS: &[&str] = &[
    r"C:\Program Files\7-Zip\7z.exe",
    r"C:\Program Files (x86)\7-Zip\7z.exe",
    r"C:\Windows\7z.exe",
];

#[cfg(not(windows))]
const WELL_KNOWN_PATHS: &[&str] = &[
    "/usr/bin/7z",
    "/usr/local/bin/7z",
    "/opt/homebrew/bin/7z",
    "/usr/bin/7zz",
    "/usr/local/bin/7zz",
    "/opt/homebrew/bin/7zz",
];

/// Executable names looked up on `PATH`
const SEARCH_NAMES: &[&str] = &["7z", "7zz", "7za"];

#[derive(Debug, Clone, Default)]
pub struct CompressorLocator {
    candidates: Vec<PathBuf>,
    search_names: Vec<String>,
}

impl CompressorLocator {
    pub fn new(candidates: Vec<PathBuf>, search_names: Vec<String>) -> Self {
        Self {
            candidates,
            search_names,
        }
    }

    /// Well-known install paths, then the search path
    pub fn system() -> Self {
        Self::new(
            WELL_KNOWN_PATHS.iter().map(PathBuf::from).collect(),
            SEARCH_NAMES.iter().map(|s| s.to_string()).collect(),
        )
    }

    /// Never finds anything; forces the native fallback
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Locator for the configured compressor settings
    pub fn from_settings(settings: &CompressorConfig) -> Self {
        if !settings.enabled {
            return Self::disabled();
        }
        let mut locator = Self::system();
        if let Some(binary) = &settings.binary {
            locator.candidates.insert(0, binary.clone());
        }
        locator
    }

    /// First existing candidate, else the first search-path hit
    pub fn locate(&self) -> Option<PathBuf> {
        if let Some(found) = self.candidates.iter().find(|c| c.is_file()) {
            debug!("Found compressor at {}", found.display());
            return Some(found.clone());
        }

        self.search_names.iter().find_map(|name| match which::which(name) {
            Ok(path) => {
                debug!("Found compressor '{}' on PATH at {}", name, path.display());
                Some(path)
            }
            Err(_) => None,
        })
    }
}
