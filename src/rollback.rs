//! Reverting an organize operation from its movement log.
//!
//! Records are replayed newest first. Each one is handled on its own, so a
//! single stuck file never blocks the rest, and running a rollback again
//! after a partial one only finishes what is left.

use crate::duplicates::{DEFAULT_BUFFER_SIZE, hash_file};
use crate::error::{OrganizeError, OrganizeResult};
use crate::operation::{FileMovementRecord, Operation, OperationId, OperationStatus, Outcome};
use crate::organizer::move_file;
use crate::path_policy::ORGANIZED_DIR;
use crate::repository::Repository;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// A record that could not be reverted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackFailure {
    pub path: PathBuf,
    pub reason: String,
}

/// Aggregate result of a rollback.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackResult {
    /// Files put back (moves) or removed copies.
    pub reverted: usize,
    /// Records whose file is gone from both locations.
    pub already_missing: usize,
    /// Records whose original location already holds the expected file.
    pub already_reverted: usize,
    pub failed: usize,
    pub failures: Vec<RollbackFailure>,
}

impl RollbackResult {
    pub fn is_complete_success(&self) -> bool {
        self.failed == 0
    }

    pub fn total_processed(&self) -> usize {
        self.reverted + self.already_missing + self.already_reverted + self.failed
    }
}

enum Restore {
    Reverted,
    AlreadyMissing,
    AlreadyReverted,
    Failed(PathBuf, String),
}

/// Replays movement records in reverse.
pub struct RollbackEngine {
    repository: Arc<dyn Repository>,
}

impl RollbackEngine {
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        Self { repository }
    }

    /// Rolls back operation `id`.
    ///
    /// Only `moved` and `copied` records are replayed. A dry run has nothing
    /// to undo and returns an empty result. When every record was handled
    /// without failure the operation becomes `RolledBack`.
    ///
    /// # Errors
    ///
    /// `UnknownOperation` if the id was never stored, `OperationInProgress`
    /// if the operation has not reached a terminal state, and repository
    /// errors if the log cannot be read.
    pub fn rollback(&self, id: OperationId) -> OrganizeResult<RollbackResult> {
        let mut operation = self
            .repository
            .load_operation(id)?
            .ok_or(OrganizeError::UnknownOperation(id))?;
        if !operation.status.is_terminal() {
            return Err(OrganizeError::OperationInProgress(id));
        }

        let mut result = RollbackResult::default();
        if operation.dry_run {
            debug!(operation = %id, "dry run has nothing to roll back");
            return Ok(result);
        }

        let mut records: Vec<FileMovementRecord> = self
            .repository
            .records(id)?
            .into_iter()
            .filter(|r| r.outcome.is_applied())
            .collect();
        records.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        info!(operation = %id, records = records.len(), "rolling back operation");

        for record in &records {
            match restore(record) {
                Restore::Reverted => result.reverted += 1,
                Restore::AlreadyMissing => {
                    warn!(path = %record.original_path.display(), "file missing from both locations");
                    result.already_missing += 1
                }
                Restore::AlreadyReverted => result.already_reverted += 1,
                Restore::Failed(path, reason) => {
                    warn!(path = %path.display(), %reason, "could not revert record");
                    result.failed += 1;
                    result.failures.push(RollbackFailure { path, reason });
                }
            }
        }

        prune_empty_dirs(&operation.root.join(ORGANIZED_DIR));
        self.finish(&mut operation, &result)?;

        info!(
            operation = %id,
            reverted = result.reverted,
            already_reverted = result.already_reverted,
            already_missing = result.already_missing,
            failed = result.failed,
            "rollback finished"
        );
        Ok(result)
    }

    fn finish(&self, operation: &mut Operation, result: &RollbackResult) -> OrganizeResult<()> {
        if result.is_complete_success() && operation.status != OperationStatus::RolledBack {
            operation.transition(OperationStatus::RolledBack)?;
            self.repository.save_operation(operation)?;
        }
        Ok(())
    }
}

fn restore(record: &FileMovementRecord) -> Restore {
    let original = &record.original_path;
    let Some(new_path) = &record.new_path else {
        return Restore::Failed(original.clone(), "no destination was recorded".to_string());
    };
    let original_present = fs::symlink_metadata(original).is_ok();
    let new_present = fs::symlink_metadata(new_path).is_ok();

    match record.outcome {
        Outcome::Moved => {
            if original_present && new_present {
                // Both exist: only a byte-identical original lets the organized file go.
                if !same_content(original, new_path) {
                    return occupied(original);
                }
                return match fs::remove_file(new_path) {
                    Ok(()) => {
                        debug!(path = %new_path.display(), "original already restored; removed organized file");
                        Restore::Reverted
                    }
                    Err(e) => Restore::Failed(
                        new_path.clone(),
                        format!("failed to remove organized file: {e}"),
                    ),
                };
            }
            if original_present {
                return if holds_expected(original, record) {
                    Restore::AlreadyReverted
                } else {
                    occupied(original)
                };
            }
            if !new_present {
                return Restore::AlreadyMissing;
            }
            if let Some(parent) = original.parent()
                && let Err(e) = fs::create_dir_all(parent)
            {
                return Restore::Failed(
                    original.clone(),
                    format!("could not recreate directory: {e}"),
                );
            }
            match move_file(new_path, original) {
                Ok(()) => {
                    debug!(from = %new_path.display(), to = %original.display(), "restored file");
                    Restore::Reverted
                }
                Err(e) => Restore::Failed(new_path.clone(), format!("failed to restore file: {e}")),
            }
        }
        Outcome::Copied => match (original_present, new_present) {
            (true, false) => Restore::AlreadyReverted,
            (false, false) => Restore::AlreadyMissing,
            // The copy is the only one left.
            (false, true) => Restore::Failed(
                original.clone(),
                "source of the copy is missing; leaving the copy in place".to_string(),
            ),
            (true, true) => match fs::remove_file(new_path) {
                Ok(()) => {
                    debug!(path = %new_path.display(), "removed copy");
                    Restore::Reverted
                }
                Err(e) => Restore::Failed(new_path.clone(), format!("failed to remove copy: {e}")),
            },
        },
        _ => Restore::AlreadyReverted,
    }
}

fn occupied(original: &Path) -> Restore {
    Restore::Failed(
        original.to_path_buf(),
        "original location is occupied by a different file".to_string(),
    )
}

/// Compares two files by size and content hash.
fn same_content(a: &Path, b: &Path) -> bool {
    let (Ok(left), Ok(right)) = (fs::metadata(a), fs::metadata(b)) else {
        return false;
    };
    if !left.is_file() || !right.is_file() || left.len() != right.len() {
        return false;
    }
    match (hash_file(a, DEFAULT_BUFFER_SIZE), hash_file(b, DEFAULT_BUFFER_SIZE)) {
        (Ok(left), Ok(right)) => left == right,
        _ => false,
    }
}

/// Compares the size, and the content hash when one was recorded. Used once
/// the organized file is gone, so the original is all that is left to check.
fn holds_expected(path: &Path, record: &FileMovementRecord) -> bool {
    let Ok(metadata) = fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() || metadata.len() != record.size {
        return false;
    }
    match &record.content_hash {
        Some(expected) => hash_file(path, DEFAULT_BUFFER_SIZE).is_ok_and(|h| &h == expected),
        None => true,
    }
}

/// Removes directories under `dir` (and `dir` itself) left empty by a rollback.
fn prune_empty_dirs(dir: &Path) {
    if !dir.is_dir() {
        return;
    }
    for entry in WalkDir::new(dir)
        .follow_links(false)
        .contents_first(true)
        .into_iter()
        .flatten()
    {
        if !entry.file_type().is_dir() {
            continue;
        }
        let is_empty = fs::read_dir(entry.path())
            .map(|mut children| children.next().is_none())
            .unwrap_or(false);
        if is_empty && fs::remove_dir(entry.path()).is_ok() {
            debug!(path = %entry.path().display(), "removed empty directory");
        }
    }
}
