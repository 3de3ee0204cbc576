//! The organize pipeline: scan, categorize, detect duplicates, relocate.
//!
//! An [`Organizer`] drives one [`Operation`] through its lifecycle on the
//! calling thread. Every file decision becomes a [`FileMovementRecord`] that
//! is appended to the repository only after the filesystem action finished,
//! so the log never claims a move that did not happen.

use crate::cancel::CancelToken;
use crate::category::Categorizer;
use crate::clock::Clock;
use crate::config::EngineSettings;
use crate::duplicates::{DuplicateDetector, DuplicateGroup};
use crate::error::{FileErrorKind, OrganizeError, OrganizeResult, is_resource_exhaustion};
use crate::operation::{
    FileMovementRecord, Mode, Operation, OperationStatus, Outcome, ProgressEvent, Scheme,
};
use crate::path_policy::{ORGANIZED_DIR, PathPolicy, RECYCLE_DIR};
use crate::repository::Repository;
use crate::scanner::{FileEntry, ScanError, Scanner};
use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Receives progress snapshots while an operation runs.
pub trait ProgressSink: Send + Sync {
    fn publish(&self, event: ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn publish(&self, event: ProgressEvent) {
        self(event)
    }
}

/// A sink that drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn publish(&self, _event: ProgressEvent) {}
}

/// A file that could not be organized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFailure {
    pub path: PathBuf,
    pub kind: FileErrorKind,
    pub message: String,
}

/// What a run produced besides the movement log.
#[derive(Debug, Default)]
pub struct RunReport {
    pub duplicate_groups: Vec<DuplicateGroup>,
    /// Entries the scanner or the hasher could not read.
    pub scan_errors: Vec<ScanError>,
    /// Files whose relocation failed or was skipped because of an error.
    pub file_errors: Vec<FileFailure>,
    /// Set when the operation ended `Failed` or `Cancelled`.
    pub error: Option<OrganizeError>,
}

impl RunReport {
    pub fn into_result(self) -> OrganizeResult<Self> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self),
        }
    }
}

/// One file scheduled for relocation.
struct Planned {
    entry: FileEntry,
    category: String,
}

/// Runs operations against a categorizer snapshot, a repository and a clock.
pub struct Organizer {
    categorizer: Arc<Categorizer>,
    repository: Arc<dyn Repository>,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
}

impl Organizer {
    pub fn new(
        categorizer: Arc<Categorizer>,
        repository: Arc<dyn Repository>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            categorizer,
            repository,
            clock,
            settings,
        }
    }

    /// Runs `operation` to a terminal state.
    ///
    /// The operation must be `Pending`. Per-file problems are recorded and
    /// counted; only root-level failures, resource exhaustion, persistence
    /// failures, cancellation and the hard timeout end the run early. The
    /// final state is persisted whatever happens.
    pub fn run(
        &self,
        operation: &mut Operation,
        cancel: &CancelToken,
        progress: &dyn ProgressSink,
    ) -> RunReport {
        let mut report = RunReport::default();
        operation.started_at = Some(self.clock.now());
        info!(
            operation = %operation.id,
            root = %operation.root.display(),
            mode = ?operation.mode,
            scheme = ?operation.scheme,
            dry_run = operation.dry_run,
            "starting operation"
        );

        match self.execute(operation, cancel, progress, &mut report) {
            Ok(()) => {
                info!(
                    operation = %operation.id,
                    relocated = operation.counters.relocated,
                    failed = operation.counters.failed,
                    skipped = operation.counters.skipped,
                    "operation completed"
                );
            }
            Err(e) => {
                let next = match e {
                    OrganizeError::Cancelled => OperationStatus::Cancelled,
                    _ => OperationStatus::Failed,
                };
                if let Err(transition) = operation.transition(next) {
                    error!(operation = %operation.id, error = %transition, "cannot record failure");
                }
                warn!(operation = %operation.id, error = %e, status = ?operation.status, "operation stopped");
                operation.failure = Some(e.to_string());
                report.error = Some(e);
            }
        }

        operation.finished_at = Some(self.clock.now());
        if let Err(e) = self.repository.save_operation(operation) {
            error!(operation = %operation.id, error = %e, "failed to persist final state");
            if report.error.is_none() {
                report.error = Some(e.into());
            }
        }
        progress.publish(operation.progress());
        report
    }

    fn execute(
        &self,
        operation: &mut Operation,
        cancel: &CancelToken,
        progress: &dyn ProgressSink,
        report: &mut RunReport,
    ) -> OrganizeResult<()> {
        self.enter(operation, OperationStatus::Scanning, progress)?;
        let policy = PathPolicy::new(&operation.root, &operation.exclusions)?;
        let scan = Scanner::new(&policy)
            .with_filter(operation.filter.clone())
            .scan(cancel)?;
        let scanned = scan.collect_result(|_| {
            operation.counters.scanned += 1;
            self.check_soft_timeout(operation, cancel);
            progress.publish(operation.progress());
        });
        operation.counters.failed += scanned.errors.len() as u64;
        report.scan_errors = scanned.errors;
        if scanned.cancelled {
            return Err(cancel.stop_error());
        }
        debug!(
            operation = %operation.id,
            files = scanned.entries.len(),
            filtered = scanned.filtered,
            bytes = scanned.total_bytes,
            "scan finished"
        );

        self.enter(operation, OperationStatus::Categorizing, progress)?;
        self.categorizer.check_integrity()?;
        let mut planned = Vec::with_capacity(scanned.entries.len());
        for entry in scanned.entries {
            if cancel.is_cancelled() {
                return Err(cancel.stop_error());
            }
            let category = self.categorize(&entry);
            planned.push(Planned { entry, category });
        }
        operation.total = planned.len() as u64;

        let mut duplicate_of: HashMap<PathBuf, PathBuf> = HashMap::new();
        let mut hashes: HashMap<PathBuf, String> = HashMap::new();
        if operation.detect_duplicates {
            self.enter(operation, OperationStatus::DetectingDuplicates, progress)?;
            let detector = DuplicateDetector::with_threads(
                self.settings.hash_buffer_size,
                self.settings.worker_threads,
            )
            .map_err(|e| OrganizeError::FatalIo {
                path: operation.root.clone(),
                source: io::Error::other(e),
            })?;
            let entries: Vec<FileEntry> = planned.iter().map(|p| p.entry.clone()).collect();
            let detected = detector.detect(&entries, cancel);
            if detected.cancelled {
                return Err(cancel.stop_error());
            }
            for group in &detected.groups {
                for member in group.redundant() {
                    duplicate_of.insert(member.clone(), group.original().to_path_buf());
                }
            }
            operation.counters.duplicates = duplicate_of.len() as u64;
            operation.counters.failed += detected.errors.len() as u64;
            report.scan_errors.extend(detected.errors);
            report.duplicate_groups = detected.groups;
            hashes = detected.hashes;
        }

        self.enter(operation, OperationStatus::Relocating, progress)?;
        let mut claimed: HashSet<PathBuf> = HashSet::new();
        for (index, item) in planned.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(cancel.stop_error());
            }
            self.check_soft_timeout(operation, cancel);

            let mut record = FileMovementRecord {
                operation_id: operation.id,
                sequence: index as u64 + 1,
                original_path: item.entry.path.clone(),
                new_path: None,
                category: item.category,
                outcome: Outcome::Failed,
                error_kind: None,
                error: None,
                duplicate_of: duplicate_of.get(&item.entry.path).cloned(),
                size: item.entry.size,
                modified: item.entry.modified,
                content_hash: hashes.get(&item.entry.path).cloned(),
            };
            self.relocate(operation, &policy, &item.entry, &mut claimed, &mut record)?;

            match record.outcome {
                Outcome::Moved | Outcome::Copied | Outcome::WouldMove => {
                    operation.counters.relocated += 1
                }
                Outcome::Skipped => operation.counters.skipped += 1,
                Outcome::Failed => operation.counters.failed += 1,
            }
            if let (Some(kind), Some(message)) = (record.error_kind, &record.error) {
                report.file_errors.push(FileFailure {
                    path: record.original_path.clone(),
                    kind,
                    message: message.clone(),
                });
            }
            operation.counters.processed += 1;
            progress.publish(operation.progress());
        }

        operation.transition(OperationStatus::Completed)?;
        Ok(())
    }

    fn enter(
        &self,
        operation: &mut Operation,
        next: OperationStatus,
        progress: &dyn ProgressSink,
    ) -> OrganizeResult<()> {
        operation.transition(next)?;
        self.repository.save_operation(operation)?;
        progress.publish(operation.progress());
        Ok(())
    }

    fn check_soft_timeout(&self, operation: &mut Operation, cancel: &CancelToken) {
        if let Some(limit) = operation.soft_timeout
            && !operation.timeout_warning
            && cancel.elapsed() >= limit
        {
            warn!(operation = %operation.id, elapsed = ?cancel.elapsed(), "soft timeout exceeded");
            operation.timeout_warning = true;
        }
    }

    fn categorize(&self, entry: &FileEntry) -> String {
        if entry.extension.is_empty()
            && self.settings.sniff_content
            && let Ok(Some(kind)) = infer::get_from_path(&entry.path)
        {
            debug!(path = %entry.path.display(), mime = kind.mime_type(), "inferred file type");
            return self
                .categorizer
                .categorize_with_hint(entry, kind.extension())
                .name
                .clone();
        }
        self.categorizer.categorize(entry).name.clone()
    }

    /// Destination directory of `entry`, relative to the root.
    fn destination_dir(
        &self,
        scheme: Scheme,
        entry: &FileEntry,
        category: &str,
        recycled: bool,
    ) -> PathBuf {
        let mut dir = PathBuf::from(ORGANIZED_DIR);
        if recycled {
            dir.push(RECYCLE_DIR);
            return dir;
        }
        if scheme.uses_category() {
            dir.push(category);
        }
        if scheme.uses_year() {
            dir.push(self.clock.year_of(entry.modified).to_string());
        }
        dir
    }

    /// Decides and performs one file's relocation, filling in `record`.
    ///
    /// Returns an error only for failures that must end the operation.
    fn relocate(
        &self,
        operation: &Operation,
        policy: &PathPolicy,
        entry: &FileEntry,
        claimed: &mut HashSet<PathBuf>,
        record: &mut FileMovementRecord,
    ) -> OrganizeResult<()> {
        // Copies keep their duplicates in place; the record only references the original.
        if record.duplicate_of.is_some() && operation.mode == Mode::Copy {
            record.outcome = Outcome::Skipped;
            return self.persist(record, None);
        }

        let Some(file_name) = entry.path.file_name() else {
            record.error_kind = Some(FileErrorKind::Io);
            record.error = Some("file has no name component".to_string());
            return self.persist(record, None);
        };
        let relative = self.destination_dir(
            operation.scheme,
            entry,
            &record.category,
            record.duplicate_of.is_some(),
        );
        let dir = match policy.resolve_destination(&relative) {
            Ok(dir) => dir,
            Err(e) => {
                record.error_kind = Some(e.file_kind());
                record.error = Some(e.to_string());
                return self.persist(record, None);
            }
        };
        let destination = unique_destination(&dir, &file_name.to_os_string(), claimed);
        claimed.insert(destination.clone());
        record.new_path = Some(destination.clone());

        if operation.dry_run {
            record.outcome = Outcome::WouldMove;
            return self.persist(record, None);
        }

        let applied = policy
            .ensure_confined(&destination)
            .and_then(|()| {
                fs::create_dir_all(&dir).map_err(|e| OrganizeError::from_io(dir.clone(), e))
            })
            .and_then(|()| {
                let result = match operation.mode {
                    Mode::Move => move_file(&entry.path, &destination),
                    Mode::Copy => copy_new(&entry.path, &destination),
                };
                result.map_err(|e| {
                    if is_resource_exhaustion(&e) {
                        OrganizeError::FatalIo {
                            path: destination.clone(),
                            source: e,
                        }
                    } else {
                        OrganizeError::from_io(entry.path.clone(), e)
                    }
                })
            });

        match applied {
            Ok(()) => {
                record.outcome = match operation.mode {
                    Mode::Move => Outcome::Moved,
                    Mode::Copy => Outcome::Copied,
                };
                debug!(
                    from = %entry.path.display(),
                    to = %destination.display(),
                    "relocated file"
                );
                self.persist(record, Some((destination.as_path(), operation.mode)))
            }
            Err(e @ OrganizeError::FatalIo { .. }) if is_fatal(&e, policy.root()) => {
                record.error_kind = Some(e.file_kind());
                record.error = Some(e.to_string());
                self.persist(record, None)?;
                Err(e)
            }
            Err(e) => {
                warn!(path = %entry.path.display(), error = %e, "failed to relocate file");
                record.outcome = match e {
                    OrganizeError::VanishedEntry { .. } => Outcome::Skipped,
                    _ => Outcome::Failed,
                };
                record.error_kind = Some(e.file_kind());
                record.error = Some(e.to_string());
                self.persist(record, None)?;
                ensure_root_reachable(policy.root())
            }
        }
    }

    /// Appends `record`. If the append fails after a file was really moved or
    /// copied, the action is undone so the log and the tree stay consistent.
    fn persist(
        &self,
        record: &FileMovementRecord,
        applied: Option<(&Path, Mode)>,
    ) -> OrganizeResult<()> {
        let Err(e) = self.repository.append_record(record) else {
            return Ok(());
        };
        error!(path = %record.original_path.display(), error = %e, "failed to append movement record");
        if let Some((destination, mode)) = applied {
            let reverted = match mode {
                Mode::Move => move_file(destination, &record.original_path),
                Mode::Copy => fs::remove_file(destination),
            };
            if let Err(revert) = reverted {
                error!(
                    path = %destination.display(),
                    error = %revert,
                    "could not undo unrecorded relocation"
                );
            }
        }
        Err(OrganizeError::FatalIo {
            path: record.original_path.clone(),
            source: io::Error::other(e),
        })
    }
}

/// Resource exhaustion is always fatal; other I/O errors only when the root
/// itself went away.
fn is_fatal(error: &OrganizeError, root: &Path) -> bool {
    match error {
        OrganizeError::FatalIo { source, .. } if is_resource_exhaustion(source) => true,
        _ => ensure_root_reachable(root).is_err(),
    }
}

fn ensure_root_reachable(root: &Path) -> OrganizeResult<()> {
    fs::read_dir(root)
        .map(|_| ())
        .map_err(|e| OrganizeError::FatalIo {
            path: root.to_path_buf(),
            source: e,
        })
}

/// Picks `dir/name`, or `dir/stem_N.ext` with the lowest free `N >= 1`.
///
/// A candidate is taken when nothing exists at that path and no earlier
/// decision in the same run claimed it.
pub fn unique_destination(dir: &Path, name: &OsString, claimed: &HashSet<PathBuf>) -> PathBuf {
    let is_free = |candidate: &Path| {
        !claimed.contains(candidate) && fs::symlink_metadata(candidate).is_err()
    };

    let first = dir.join(name);
    if is_free(&first) {
        return first;
    }

    let path = Path::new(name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = path.extension().map(|e| e.to_string_lossy().into_owned());

    let mut n: u64 = 1;
    loop {
        let candidate_name = match &extension {
            Some(ext) => format!("{stem}_{n}.{ext}"),
            None => format!("{stem}_{n}"),
        };
        let candidate = dir.join(candidate_name);
        if is_free(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Renames `from` to `to`, falling back to copy and remove when a plain
/// rename is impossible (e.g. across devices).
pub(crate) fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e)
            if matches!(
                e.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
            ) || is_resource_exhaustion(&e) =>
        {
            Err(e)
        }
        Err(e) => {
            debug!(from = %from.display(), error = %e, "rename failed, copying instead");
            copy_new(from, to)?;
            if let Err(remove) = fs::remove_file(from) {
                let _ = fs::remove_file(to);
                return Err(remove);
            }
            Ok(())
        }
    }
}

/// Copies `from` to a new file at `to`, never overwriting. A partially
/// written destination is removed on failure.
pub(crate) fn copy_new(from: &Path, to: &Path) -> io::Result<()> {
    let mut source = File::open(from)?;
    let modified = source.metadata()?.modified()?;
    let mut target = OpenOptions::new().write(true).create_new(true).open(to)?;

    let written = io::copy(&mut source, &mut target)
        .and_then(|_| target.set_modified(modified))
        .and_then(|()| target.sync_all());
    if let Err(e) = written {
        drop(target);
        let _ = fs::remove_file(to);
        return Err(e);
    }
    Ok(())
}
