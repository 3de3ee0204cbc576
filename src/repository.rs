//! Persistence of operations and their movement logs.
//!
//! The engine only talks to the [`Repository`] trait. Two implementations are
//! provided: [`MemoryRepository`] for tests and embedding, and
//! [`JsonRepository`], which keeps one JSON snapshot per operation plus an
//! append-only JSON Lines journal of movement records.

use crate::operation::{FileMovementRecord, Operation, OperationId};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::warn;

/// Errors raised by a repository.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid history format in {}: {reason}", path.display())]
    InvalidFormat { path: PathBuf, reason: String },
    #[error("repository lock poisoned")]
    Poisoned,
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Durable storage for operations and movement records.
///
/// `append_record` must not return until the record is durable: the engine
/// reports an action as done only after this call succeeds.
pub trait Repository: Send + Sync {
    fn save_operation(&self, operation: &Operation) -> RepositoryResult<()>;

    fn load_operation(&self, id: OperationId) -> RepositoryResult<Option<Operation>>;

    /// All known operations, oldest first.
    fn list_operations(&self) -> RepositoryResult<Vec<Operation>>;

    fn append_record(&self, record: &FileMovementRecord) -> RepositoryResult<()>;

    /// Records of one operation in sequence order.
    fn records(&self, id: OperationId) -> RepositoryResult<Vec<FileMovementRecord>>;
}

/// In-process repository.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    operations: Mutex<HashMap<OperationId, Operation>>,
    records: Mutex<HashMap<OperationId, Vec<FileMovementRecord>>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Repository for MemoryRepository {
    fn save_operation(&self, operation: &Operation) -> RepositoryResult<()> {
        let mut operations = self.operations.lock().map_err(|_| RepositoryError::Poisoned)?;
        operations.insert(operation.id, operation.clone());
        Ok(())
    }

    fn load_operation(&self, id: OperationId) -> RepositoryResult<Option<Operation>> {
        let operations = self.operations.lock().map_err(|_| RepositoryError::Poisoned)?;
        Ok(operations.get(&id).cloned())
    }

    fn list_operations(&self) -> RepositoryResult<Vec<Operation>> {
        let operations = self.operations.lock().map_err(|_| RepositoryError::Poisoned)?;
        let mut list: Vec<_> = operations.values().cloned().collect();
        list.sort_by_key(|op| op.created_at);
        Ok(list)
    }

    fn append_record(&self, record: &FileMovementRecord) -> RepositoryResult<()> {
        let mut records = self.records.lock().map_err(|_| RepositoryError::Poisoned)?;
        records
            .entry(record.operation_id)
            .or_default()
            .push(record.clone());
        Ok(())
    }

    fn records(&self, id: OperationId) -> RepositoryResult<Vec<FileMovementRecord>> {
        let records = self.records.lock().map_err(|_| RepositoryError::Poisoned)?;
        let mut list = records.get(&id).cloned().unwrap_or_default();
        list.sort_by_key(|r| r.sequence);
        Ok(list)
    }
}

/// File-backed repository rooted at a state directory.
///
/// Layout: `<dir>/<id>.json` holds the latest operation snapshot (replaced
/// atomically) and `<dir>/<id>.records.jsonl` the movement journal.
#[derive(Debug)]
pub struct JsonRepository {
    dir: PathBuf,
    append_lock: Mutex<()>,
}

impl JsonRepository {
    /// Opens (and creates if needed) the state directory.
    pub fn open(dir: impl Into<PathBuf>) -> RepositoryResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| RepositoryError::Write {
            path: dir.clone(),
            source: e,
        })?;
        Ok(Self {
            dir,
            append_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn operation_path(&self, id: OperationId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn journal_path(&self, id: OperationId) -> PathBuf {
        self.dir.join(format!("{id}.records.jsonl"))
    }

    fn read_operation(path: &Path) -> RepositoryResult<Operation> {
        let json = fs::read_to_string(path).map_err(|e| RepositoryError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_json::from_str(&json).map_err(|e| RepositoryError::InvalidFormat {
            path: path.to_path_buf(),
            reason: format!("JSON parse error: {e}"),
        })
    }
}

impl Repository for JsonRepository {
    fn save_operation(&self, operation: &Operation) -> RepositoryResult<()> {
        let path = self.operation_path(operation.id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(operation).map_err(|e| {
            RepositoryError::InvalidFormat {
                path: path.clone(),
                reason: format!("JSON serialization failed: {e}"),
            }
        })?;

        let write = |target: &Path| -> io::Result<()> {
            let mut file = fs::File::create(target)?;
            file.write_all(json.as_bytes())?;
            file.sync_data()
        };
        write(&tmp).map_err(|e| RepositoryError::Write {
            path: tmp.clone(),
            source: e,
        })?;
        fs::rename(&tmp, &path).map_err(|e| RepositoryError::Write { path, source: e })
    }

    fn load_operation(&self, id: OperationId) -> RepositoryResult<Option<Operation>> {
        let path = self.operation_path(id);
        if !path.exists() {
            return Ok(None);
        }
        Self::read_operation(&path).map(Some)
    }

    fn list_operations(&self) -> RepositoryResult<Vec<Operation>> {
        let entries = fs::read_dir(&self.dir).map_err(|e| RepositoryError::Read {
            path: self.dir.clone(),
            source: e,
        })?;

        let mut operations = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let is_snapshot = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".json"));
            if is_snapshot {
                operations.push(Self::read_operation(&path)?);
            }
        }
        operations.sort_by_key(|op| op.created_at);
        Ok(operations)
    }

    fn append_record(&self, record: &FileMovementRecord) -> RepositoryResult<()> {
        let path = self.journal_path(record.operation_id);
        let mut line = serde_json::to_string(record).map_err(|e| RepositoryError::InvalidFormat {
            path: path.clone(),
            reason: format!("JSON serialization failed: {e}"),
        })?;
        line.push('\n');

        let _guard = self.append_lock.lock().map_err(|_| RepositoryError::Poisoned)?;
        let append = || -> io::Result<()> {
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            file.write_all(line.as_bytes())?;
            file.sync_data()
        };
        append().map_err(|e| RepositoryError::Write {
            path: path.clone(),
            source: e,
        })
    }

    fn records(&self, id: OperationId) -> RepositoryResult<Vec<FileMovementRecord>> {
        let path = self.journal_path(id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path).map_err(|e| RepositoryError::Read {
            path: path.clone(),
            source: e,
        })?;

        let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
        let mut records = Vec::with_capacity(lines.len());
        for (index, line) in lines.iter().enumerate() {
            match serde_json::from_str::<FileMovementRecord>(line) {
                Ok(record) => records.push(record),
                // A torn final line means a crash mid-append; that record never counted.
                Err(e) if index + 1 == lines.len() => {
                    warn!(path = %path.display(), error = %e, "ignoring torn journal tail");
                }
                Err(e) => {
                    return Err(RepositoryError::InvalidFormat {
                        path,
                        reason: format!("line {}: {e}", index + 1),
                    });
                }
            }
        }
        records.sort_by_key(|r| r.sequence);
        Ok(records)
    }
}
