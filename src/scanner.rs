//! Lazy, error-tolerant directory traversal.

use crate::cancel::CancelToken;
use crate::error::{FileErrorKind, OrganizeError, OrganizeResult};
use crate::path_policy::{LinkTarget, PathPolicy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

/// Metadata of one scanned file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: PathBuf,
    pub size: u64,
    pub modified: DateTime<Utc>,
    /// Lower-cased extension without the dot; empty when the file has none.
    pub extension: String,
}

impl FileEntry {
    pub fn new(path: PathBuf, size: u64, modified: DateTime<Utc>) -> Self {
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        Self {
            path,
            size,
            modified,
            extension,
        }
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Inclusion rules applied to every file the scan reaches.
///
/// An empty filter accepts everything. Files that fail a rule are left where
/// they are and are not reported as errors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFilter {
    /// Extensions to keep, without the dot. Empty keeps every extension.
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub min_size: u64,
    #[serde(default)]
    pub max_size: Option<u64>,
    /// Inclusive lower bound on the modified time.
    #[serde(default)]
    pub modified_after: Option<DateTime<Utc>>,
    /// Inclusive upper bound on the modified time.
    #[serde(default)]
    pub modified_before: Option<DateTime<Utc>>,
}

impl FileFilter {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn accepts(&self, entry: &FileEntry) -> bool {
        if !self.extensions.is_empty()
            && !self
                .extensions
                .iter()
                .any(|ext| ext.trim_start_matches('.').eq_ignore_ascii_case(&entry.extension))
        {
            return false;
        }
        if entry.size < self.min_size || self.max_size.is_some_and(|max| entry.size > max) {
            return false;
        }
        if self.modified_after.is_some_and(|after| entry.modified < after) {
            return false;
        }
        !self.modified_before.is_some_and(|before| entry.modified > before)
    }
}

/// A per-entry failure that did not stop the scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanError {
    pub path: PathBuf,
    pub kind: FileErrorKind,
    pub message: String,
}

/// Outcome of one scan pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanResult {
    /// Files in traversal order.
    pub entries: Vec<FileEntry>,
    pub total_bytes: u64,
    pub errors: Vec<ScanError>,
    /// Files left out by the [`FileFilter`].
    #[serde(default)]
    pub filtered: u64,
    pub cancelled: bool,
}

/// Walks a root through a [`PathPolicy`].
pub struct Scanner<'a> {
    policy: &'a PathPolicy,
    filter: FileFilter,
}

impl<'a> Scanner<'a> {
    pub fn new(policy: &'a PathPolicy) -> Self {
        Self {
            policy,
            filter: FileFilter::default(),
        }
    }

    pub fn with_filter(mut self, filter: FileFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Starts a new traversal. Each call produces an independent sequence.
    ///
    /// Fails with `InvalidPath` if the root itself cannot be opened; any
    /// failure below the root is recorded and skipped.
    pub fn scan(&self, cancel: &CancelToken) -> OrganizeResult<Scan<'a>> {
        let root = self.policy.root();
        fs::read_dir(root).map_err(|e| OrganizeError::InvalidPath {
            path: root.to_path_buf(),
            reason: e.to_string(),
        })?;

        Ok(Scan {
            policy: self.policy,
            walker: WalkDir::new(root)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter(),
            filter: self.filter.clone(),
            cancel: cancel.clone(),
            errors: Vec::new(),
            filtered: 0,
            total_bytes: 0,
            cancelled: false,
            done: false,
        })
    }
}

/// An in-progress traversal, yielding files depth-first with directories
/// visited before their children and siblings in file-name order.
pub struct Scan<'a> {
    policy: &'a PathPolicy,
    walker: walkdir::IntoIter,
    filter: FileFilter,
    cancel: CancelToken,
    errors: Vec<ScanError>,
    filtered: u64,
    total_bytes: u64,
    cancelled: bool,
    done: bool,
}

impl Scan<'_> {
    pub fn errors(&self) -> &[ScanError] {
        &self.errors
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Drains the remaining entries into a [`ScanResult`], calling `on_entry`
    /// for each. Entries already pulled through `Iterator::next` are not
    /// included.
    pub fn collect_result(mut self, mut on_entry: impl FnMut(&FileEntry)) -> ScanResult {
        let mut entries = Vec::new();
        for entry in self.by_ref() {
            on_entry(&entry);
            entries.push(entry);
        }
        ScanResult {
            entries,
            total_bytes: self.total_bytes,
            errors: self.errors,
            filtered: self.filtered,
            cancelled: self.cancelled,
        }
    }

    pub fn finish(self) -> ScanResult {
        self.collect_result(|_| {})
    }

    fn record(&mut self, path: &Path, kind: FileErrorKind, message: String) {
        warn!(path = %path.display(), ?kind, %message, "scan error");
        self.errors.push(ScanError {
            path: path.to_path_buf(),
            kind,
            message,
        });
    }

    fn visit(&mut self, entry: DirEntry) -> Option<FileEntry> {
        if entry.depth() == 0 {
            return None;
        }
        let path = entry.path();
        let file_type = entry.file_type();

        if self.policy.is_excluded(path) {
            if file_type.is_dir() {
                debug!(path = %path.display(), "skipping excluded directory");
                self.walker.skip_current_dir();
            }
            return None;
        }

        if file_type.is_symlink() {
            match self.policy.resolve_link(path) {
                LinkTarget::Inside(_) => {
                    debug!(path = %path.display(), "skipping symlink inside root");
                }
                LinkTarget::Outside(target) => {
                    let message = format!("symlink points outside root to {}", target.display());
                    self.record(path, FileErrorKind::PathEscape, message);
                }
                LinkTarget::Dangling => {
                    self.record(path, FileErrorKind::VanishedEntry, "dangling symlink".into());
                }
            }
            return None;
        }

        if !file_type.is_file() {
            return None;
        }

        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                let kind = e
                    .io_error()
                    .map(FileErrorKind::from_io)
                    .unwrap_or(FileErrorKind::Metadata);
                self.record(path, kind, e.to_string());
                return None;
            }
        };
        let modified = match metadata.modified() {
            Ok(time) => DateTime::<Utc>::from(time),
            Err(e) => {
                self.record(path, FileErrorKind::Metadata, e.to_string());
                return None;
            }
        };

        let file = FileEntry::new(path.to_path_buf(), metadata.len(), modified);
        if !self.filter.accepts(&file) {
            self.filtered += 1;
            return None;
        }
        self.total_bytes += file.size;
        Some(file)
    }
}

impl Iterator for Scan<'_> {
    type Item = FileEntry;

    fn next(&mut self) -> Option<FileEntry> {
        while !self.done {
            if self.cancel.is_cancelled() {
                debug!("scan cancelled");
                self.cancelled = true;
                self.done = true;
                break;
            }

            match self.walker.next() {
                None => self.done = true,
                Some(Err(e)) => {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                    let kind = e
                        .io_error()
                        .map(FileErrorKind::from_io)
                        .unwrap_or(FileErrorKind::Io);
                    self.record(&path, kind, e.to_string());
                }
                Some(Ok(entry)) => {
                    if let Some(file) = self.visit(entry) {
                        return Some(file);
                    }
                }
            }
        }
        None
    }
}
