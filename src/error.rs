//! Error taxonomy for the organize pipeline.
//!
//! Errors fall into two recoverability classes. Per-file kinds
//! ([`FileErrorKind`]) are recorded against a single entry and never abort a
//! run. Everything that reaches the caller as an [`OrganizeError`] from the
//! orchestrator is fatal for the operation it belongs to.

use crate::category::CategoryError;
use crate::config::ConfigError;
use crate::operation::{OperationId, OperationStatus};
use crate::repository::RepositoryError;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while organizing or rolling back a tree.
#[derive(Debug, Error)]
pub enum OrganizeError {
    /// The root is malformed, missing or cannot be opened.
    #[error("invalid path {}: {reason}", path.display())]
    InvalidPath { path: PathBuf, reason: String },

    /// A destination would resolve outside the operation root.
    #[error("path {} escapes root {}", path.display(), root.display())]
    PathEscape { path: PathBuf, root: PathBuf },

    #[error("permission denied: {}", path.display())]
    PermissionDenied { path: PathBuf },

    /// The file disappeared between scan and relocation.
    #[error("file vanished: {}", path.display())]
    VanishedEntry { path: PathBuf },

    #[error("failed to hash {}: {source}", path.display())]
    HashComputation {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Another operation is active on an overlapping root.
    #[error("operation {operation} is already running on {}", root.display())]
    AlreadyRunning {
        root: PathBuf,
        operation: OperationId,
    },

    /// Disk full, root unmounted or the movement log cannot be written.
    #[error("fatal I/O error at {}: {source}", path.display())]
    FatalIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("operation exceeded its hard time limit after {elapsed:?}")]
    TimedOut { elapsed: Duration },

    #[error("operation cancelled")]
    Cancelled,

    #[error("unknown operation {0}")]
    UnknownOperation(OperationId),

    #[error("operation {0} has not finished yet")]
    OperationInProgress(OperationId),

    #[error("illegal status transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: OperationStatus,
        to: OperationStatus,
    },

    #[error(transparent)]
    Category(#[from] CategoryError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl OrganizeError {
    /// Classifies an I/O error raised while touching a single file.
    pub fn from_io(path: PathBuf, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::VanishedEntry { path },
            io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            _ => Self::FatalIo { path, source: err },
        }
    }

    /// Per-file kind for errors that are recorded rather than propagated.
    pub fn file_kind(&self) -> FileErrorKind {
        match self {
            Self::PathEscape { .. } => FileErrorKind::PathEscape,
            Self::PermissionDenied { .. } => FileErrorKind::PermissionDenied,
            Self::VanishedEntry { .. } => FileErrorKind::VanishedEntry,
            Self::HashComputation { .. } => FileErrorKind::HashComputation,
            _ => FileErrorKind::Io,
        }
    }
}

/// Result type for organize operations.
pub type OrganizeResult<T> = Result<T, OrganizeError>;

/// Kind of a recoverable, per-entry failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileErrorKind {
    PermissionDenied,
    VanishedEntry,
    PathEscape,
    HashComputation,
    Metadata,
    Io,
}

impl FileErrorKind {
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::VanishedEntry,
            io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            _ => Self::Io,
        }
    }
}

/// Returns true when an I/O error means the device itself is exhausted.
pub(crate) fn is_resource_exhaustion(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::StorageFull
}
