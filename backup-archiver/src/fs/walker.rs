//! Directory traversal with exclusion pruning.
//!
//! Excluded directories are pruned before descending, so their subtrees are
//! never read. Unreadable entries below a source root become warnings; only
//! a root that cannot be opened stops the walk.

use crate::progress::{ObserverSet, PipelineEvent};
use crate::utils::errors::{ArchiverError, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::{DirEntry, WalkDir};

/// Enumeration progress is reported every this many files
pub const PROGRESS_EVERY_FILES: u64 = 1000;

/// A file selected for the archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Full path to the file
    pub path: PathBuf,

    /// Path below its source root, prefixed with the root's own directory
    /// name (`Pictures/2024/a.jpg`)
    pub relative_path: PathBuf,

    /// File size in bytes
    pub size: u64,
}

impl FileEntry {
    /// Classify a non-directory walk entry.
    ///
    /// Symlinks are resolved to their target's size. Symlinks to directories,
    /// broken links, special files and files that cannot be opened for
    /// reading become warnings.
    fn from_entry(entry: &DirEntry, scope: &RootScope) -> WalkItem {
        let path = entry.path().to_path_buf();
        let is_symlink = entry.path_is_symlink();
        let skip = |reason: String| {
            WalkItem::Skipped(WalkWarning {
                path: path.clone(),
                reason,
            })
        };

        let metadata = match std::fs::metadata(&path) {
            Ok(m) => m,
            Err(e) if is_symlink => return skip(format!("broken symlink: {}", e)),
            Err(e) => return skip(e.to_string()),
        };
        if metadata.is_dir() {
            return skip("symlink to directory not followed".to_string());
        }
        if !metadata.is_file() {
            return skip("not a regular file".to_string());
        }
        if let Err(e) = File::open(&path) {
            return skip(format!("cannot be read: {}", e));
        }

        let below_root = path
            .strip_prefix(&scope.root)
            .unwrap_or_else(|_| Path::new(entry.file_name()));
        let relative_path = scope.label.join(below_root);

        WalkItem::File(Self {
            relative_path,
            size: metadata.len(),
            path,
        })
    }

    /// Name of the entry inside the archive, always `/`-separated
    pub fn archive_name(&self) -> String {
        self.relative_path
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Non-fatal problem found while walking
#[derive(Debug, Clone, Serialize)]
pub struct WalkWarning {
    pub path: PathBuf,
    pub reason: String,
}

/// What the walker yields for each visited entry
#[derive(Debug)]
pub enum WalkItem {
    File(FileEntry),
    Skipped(WalkWarning),
}

/// Running totals over the enumerated files
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WalkTotals {
    pub files: u64,
    pub bytes: u64,
}

impl WalkTotals {
    pub fn add(&mut self, entry: &FileEntry) {
        self.files += 1;
        self.bytes += entry.size;
    }
}

/// Outcome of a complete walk
#[derive(Debug, Default)]
pub struct WalkResult {
    pub entries: Vec<FileEntry>,
    pub totals: WalkTotals,
    pub warnings: Vec<WalkWarning>,
}

type EntryIter = Box<dyn Iterator<Item = walkdir::Result<DirEntry>> + Send>;

/// The source root being walked and the name it gets inside the archive
struct RootScope {
    root: PathBuf,
    label: PathBuf,
}

/// Lazy walk over all source roots.
///
/// Each call to [`SourceWalker::new`] starts from scratch; the iterator
/// itself cannot be rewound.
pub struct SourceWalker {
    roots: std::vec::IntoIter<PathBuf>,
    exclusions: Vec<PathBuf>,
    current: Option<(RootScope, EntryIter)>,
    /// Root labels handed out so far, lowercased
    labels: HashSet<String>,
}

impl SourceWalker {
    pub fn new(sources: &[PathBuf], exclusions: &[PathBuf]) -> Self {
        Self {
            roots: sources.to_vec().into_iter(),
            exclusions: exclusions.to_vec(),
            current: None,
            labels: HashSet::new(),
        }
    }

    /// Archive name for a root: its final component, suffixed with `_2`,
    /// `_3`, ... when an earlier root already took that name.
    fn label_for(&mut self, root: &Path) -> PathBuf {
        let Some(name) = root.file_name() else {
            return PathBuf::new();
        };
        let name = name.to_string_lossy().into_owned();

        let mut label = name.clone();
        let mut n = 2;
        while !self.labels.insert(label.to_lowercase()) {
            label = format!("{}_{}", name, n);
            n += 1;
        }
        if label != name {
            warn!(
                "Source {} shares its name with an earlier source, archived as {}",
                root.display(),
                label
            );
        }
        PathBuf::from(label)
    }

    /// Open the next root. Returns the item to yield for roots that are
    /// skipped outright or are plain files.
    fn open_root(&mut self, root: PathBuf) -> Option<Result<WalkItem>> {
        if is_excluded(&root, &self.exclusions) {
            return Some(Ok(WalkItem::Skipped(WalkWarning {
                reason: "source root lies inside an excluded directory".to_string(),
                path: root,
            })));
        }

        let metadata = match std::fs::metadata(&root) {
            Ok(m) => m,
            Err(e) => {
                return Some(Err(ArchiverError::SourceAccess {
                    path: root,
                    source: e,
                }))
            }
        };
        if !metadata.is_dir() {
            if let Err(e) = File::open(&root) {
                return Some(Err(ArchiverError::SourceAccess {
                    path: root,
                    source: e,
                }));
            }
            let relative_path = self.label_for(&root);
            return Some(Ok(WalkItem::File(FileEntry {
                path: root,
                relative_path,
                size: metadata.len(),
            })));
        }

        // Probe the root so an unreadable root is fatal rather than a warning
        if let Err(e) = std::fs::read_dir(&root) {
            return Some(Err(ArchiverError::SourceAccess {
                path: root,
                source: e,
            }));
        }

        let label = self.label_for(&root);
        let exclusions = self.exclusions.clone();
        let iter = WalkDir::new(&root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |entry| {
                !(entry.file_type().is_dir() && is_excluded(entry.path(), &exclusions))
            });
        self.current = Some((RootScope { root, label }, Box::new(iter)));
        None
    }
}

impl Iterator for SourceWalker {
    type Item = Result<WalkItem>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((scope, iter)) = self.current.as_mut() {
                match iter.next() {
                    Some(Ok(entry)) => {
                        if entry.file_type().is_dir() {
                            continue;
                        }
                        return Some(Ok(FileEntry::from_entry(&entry, scope)));
                    }
                    Some(Err(e)) => {
                        let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                        return Some(Ok(WalkItem::Skipped(WalkWarning {
                            path,
                            reason: e.to_string(),
                        })));
                    }
                    None => self.current = None,
                }
            }

            let root = self.roots.next()?;
            if let Some(item) = self.open_root(root) {
                return Some(item);
            }
        }
    }
}

/// Drain a walker into a [`WalkResult`], reporting progress to the observers.
///
/// `on_totals` sees the running totals after every file so a caller can keep
/// partial totals if the walk fails midway.
pub fn collect_walk<F>(
    walker: SourceWalker,
    observers: &ObserverSet,
    mut on_totals: F,
) -> Result<WalkResult>
where
    F: FnMut(WalkTotals),
{
    let mut result = WalkResult::default();

    for item in walker {
        match item? {
            WalkItem::File(entry) => {
                result.totals.add(&entry);
                result.entries.push(entry);
                on_totals(result.totals);

                if result.totals.files % PROGRESS_EVERY_FILES == 0 {
                    observers.notify(&PipelineEvent::EnumerationProgress {
                        files: result.totals.files,
                        bytes: result.totals.bytes,
                    });
                }
            }
            WalkItem::Skipped(warning) => {
                observers.notify(&PipelineEvent::WalkWarning {
                    path: warning.path.display().to_string(),
                    reason: warning.reason.clone(),
                });
                result.warnings.push(warning);
            }
        }
    }

    Ok(result)
}

/// Walk all sources and collect the result
///
/// # Example
/// ```no_run
/// use backup_archiver::fs::walker::walk_sources;
/// use backup_archiver::progress::ObserverSet;
/// use std::path::PathBuf;
///
/// let result = walk_sources(
///     &[PathBuf::from("/data")],
///     &[PathBuf::from("/data/cache")],
///     &ObserverSet::new(),
/// ).unwrap();
/// println!("Found {} files", result.totals.files);
/// ```
pub fn walk_sources(
    sources: &[PathBuf],
    exclusions: &[PathBuf],
    observers: &ObserverSet,
) -> Result<WalkResult> {
    collect_walk(SourceWalker::new(sources, exclusions), observers, |_| {})
}

/// True when `path` equals or lies under one of the exclusion roots
pub fn is_excluded(path: &Path, exclusions: &[PathBuf]) -> bool {
    exclusions.iter().any(|ex| is_under(path, ex))
}

/// Component-wise prefix test; case-insensitive on Windows
pub fn is_under(child: &Path, parent: &Path) -> bool {
    #[cfg(windows)]
    {
        let child = child.to_string_lossy().to_lowercase();
        let parent = parent.to_string_lossy().to_lowercase();
        Path::new(&child).starts_with(Path::new(&parent))
    }

    #[cfg(not(windows))]
    {
        child.starts_with(parent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn walk(sources: &[PathBuf], exclusions: &[PathBuf]) -> WalkResult {
        walk_sources(sources, exclusions, &ObserverSet::new()).unwrap()
    }

    #[test]
    fn test_walk_empty_directory() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let result = walk(&[temp_dir.path().to_path_buf()], &[]);
        assert_eq!(result.entries.len(), 0);
        assert_eq!(result.totals, WalkTotals::default());
        Ok(())
    }

    #[test]
    fn test_walk_with_subdirectories_keeps_root_name() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().join("Pictures");
        fs::create_dir_all(root.join("subdir"))?;
        fs::write(root.join("file1.txt"), b"content1")?;
        fs::write(root.join("subdir/file2.txt"), b"content2")?;

        let result = walk(&[root], &[]);
        let names: Vec<String> = result.entries.iter().map(FileEntry::archive_name).collect();
        assert_eq!(names, vec!["Pictures/file1.txt", "Pictures/subdir/file2.txt"]);
        Ok(())
    }

    #[test]
    fn test_totals_equal_sum_of_entries() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("file1.txt"), b"12345")?; // 5 bytes
        fs::write(temp_dir.path().join("file2.txt"), b"1234567")?; // 7 bytes

        let result = walk(&[temp_dir.path().to_path_buf()], &[]);
        let sum: u64 = result.entries.iter().map(|e| e.size).sum();
        assert_eq!(result.totals.files, 2);
        assert_eq!(result.totals.bytes, 12);
        assert_eq!(sum, result.totals.bytes);
        Ok(())
    }

    #[test]
    fn test_nested_exclusions_at_any_depth() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().join("src");
        fs::create_dir_all(root.join("a/b/c/deep"))?;
        fs::create_dir_all(root.join("skip/inner"))?;
        fs::write(root.join("keep.txt"), b"k")?;
        fs::write(root.join("a/b/keep.txt"), b"k")?;
        fs::write(root.join("a/b/c/deep/secret.txt"), b"s")?;
        fs::write(root.join("skip/inner/secret.txt"), b"s")?;

        let exclusions = vec![root.join("a/b/c"), root.join("skip")];
        let result = walk(&[root.clone()], &exclusions);

        assert_eq!(result.totals.files, 2);
        for entry in &result.entries {
            assert!(!is_excluded(&entry.path, &exclusions), "{:?}", entry.path);
        }
        Ok(())
    }

    #[test]
    fn test_exclusion_is_component_prefix_not_string_prefix() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().join("src");
        fs::create_dir_all(root.join("cache"))?;
        fs::create_dir_all(root.join("cache-keep"))?;
        fs::write(root.join("cache/x"), b"x")?;
        fs::write(root.join("cache-keep/y"), b"y")?;

        let result = walk(&[root.clone()], &[root.join("cache")]);
        let names: Vec<String> = result.entries.iter().map(FileEntry::archive_name).collect();
        assert_eq!(names, vec!["src/cache-keep/y"]);
        Ok(())
    }

    #[test]
    fn test_root_inside_exclusion_is_skipped() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().join("excluded/src");
        fs::create_dir_all(&root)?;
        fs::write(root.join("f"), b"data")?;

        let result = walk(&[root], &[temp_dir.path().join("excluded")]);
        assert_eq!(result.totals.files, 0);
        assert_eq!(result.warnings.len(), 1);
        Ok(())
    }

    #[test]
    fn test_missing_root_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let result = walk_sources(&[temp_dir.path().join("gone")], &[], &ObserverSet::new());
        assert!(matches!(result, Err(ArchiverError::SourceAccess { .. })));
    }

    #[test]
    fn test_file_root_is_single_entry() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let file = temp_dir.path().join("notes.md");
        fs::write(&file, b"hello")?;

        let result = walk(&[file], &[]);
        assert_eq!(result.entries.len(), 1);
        assert_eq!(result.entries[0].archive_name(), "notes.md");
        assert_eq!(result.totals.bytes, 5);
        Ok(())
    }

    #[test]
    fn test_unicode_names() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().join("Fotos");
        fs::create_dir_all(root.join("año"))?;
        fs::write(root.join("año/café ☕.txt"), b"ok")?;

        let result = walk(&[root], &[]);
        assert_eq!(result.entries[0].archive_name(), "Fotos/año/café ☕.txt");
        Ok(())
    }

    #[test]
    fn test_walk_is_restartable_and_stable() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        for name in ["c.txt", "a.txt", "b.txt"] {
            fs::write(temp_dir.path().join(name), name)?;
        }
        let sources = [temp_dir.path().to_path_buf()];

        let first: Vec<PathBuf> = walk(&sources, &[]).entries.into_iter().map(|e| e.path).collect();
        let second: Vec<PathBuf> = walk(&sources, &[]).entries.into_iter().map(|e| e.path).collect();
        assert_eq!(first, second);
        assert!(first[0].ends_with("a.txt"));
        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_symlinks() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().join("src");
        fs::create_dir_all(root.join("dir"))?;
        fs::write(root.join("target.txt"), b"123")?;
        std::os::unix::fs::symlink(root.join("target.txt"), root.join("link.txt"))?;
        std::os::unix::fs::symlink(root.join("dir"), root.join("dirlink"))?;
        std::os::unix::fs::symlink(root.join("nowhere"), root.join("broken"))?;

        let result = walk(&[root], &[]);
        let names: Vec<String> = result.entries.iter().map(FileEntry::archive_name).collect();
        assert_eq!(names, vec!["src/link.txt", "src/target.txt"]);
        assert_eq!(result.totals.bytes, 6);

        let mut reasons: Vec<&str> = result.warnings.iter().map(|w| w.reason.as_str()).collect();
        reasons.sort();
        assert_eq!(reasons.len(), 2);
        assert!(reasons[0].starts_with("broken symlink"));
        assert_eq!(reasons[1], "symlink to directory not followed");
        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_unreadable_file_is_a_warning() -> std::io::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().join("src");
        fs::create_dir_all(&root)?;
        fs::write(root.join("locked.txt"), b"secret")?;
        fs::write(root.join("open.txt"), b"ok")?;
        fs::set_permissions(root.join("locked.txt"), fs::Permissions::from_mode(0o000))?;

        // Permission bits do not stop a privileged user
        if File::open(root.join("locked.txt")).is_ok() {
            return Ok(());
        }

        let result = walk(&[root.clone()], &[]);
        fs::set_permissions(root.join("locked.txt"), fs::Permissions::from_mode(0o644))?;

        let names: Vec<String> = result.entries.iter().map(FileEntry::archive_name).collect();
        assert_eq!(names, vec!["src/open.txt"]);
        assert_eq!(result.totals, WalkTotals { files: 1, bytes: 2 });
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].path.ends_with("locked.txt"));
        assert!(result.warnings[0].reason.starts_with("cannot be read"));
        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_special_files_are_skipped() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().join("src");
        fs::create_dir_all(&root)?;
        fs::write(root.join("a.txt"), b"a")?;
        let _socket = std::os::unix::net::UnixListener::bind(root.join("daemon.sock"))?;

        let result = walk(&[root], &[]);
        assert_eq!(result.totals.files, 1);
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].reason, "not a regular file");
        Ok(())
    }

    #[test]
    fn test_roots_sharing_a_name_get_distinct_labels() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let first = temp_dir.path().join("a/Documents");
        let second = temp_dir.path().join("b/Documents");
        for root in [&first, &second] {
            fs::create_dir_all(root)?;
            fs::write(root.join("x.txt"), b"x")?;
        }

        let result = walk(&[first, second], &[]);
        let names: Vec<String> = result.entries.iter().map(FileEntry::archive_name).collect();
        assert_eq!(names, vec!["Documents/x.txt", "Documents_2/x.txt"]);
        Ok(())
    }

    #[test]
    fn test_collect_walk_reports_running_totals() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("a"), b"12")?;
        fs::write(temp_dir.path().join("b"), b"345")?;

        let mut seen = Vec::new();
        let walker = SourceWalker::new(&[temp_dir.path().to_path_buf()], &[]);
        collect_walk(walker, &ObserverSet::new(), |t| seen.push(t)).unwrap();
        assert_eq!(seen.last(), Some(&WalkTotals { files: 2, bytes: 5 }));
        Ok(())
    }
}
