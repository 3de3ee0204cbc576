//! tidytree - reorganize a directory tree by category, by year, or both
//!
//! This library scans a root directory, classifies every file, detects
//! byte-identical duplicates, relocates files under `<root>/Organized` and
//! keeps an append-only movement log from which any operation can be rolled
//! back. [`JobRunner`] is the entry point; the remaining modules are the
//! pipeline stages it drives.

pub mod cancel;
pub mod category;
pub mod cli;
pub mod clock;
pub mod config;
pub mod duplicates;
pub mod error;
pub mod jobs;
pub mod logging;
pub mod operation;
pub mod organizer;
pub mod output;
pub mod path_policy;
pub mod repository;
pub mod rollback;
pub mod scanner;

pub use cancel::CancelToken;
pub use category::{Categorizer, Category, CategoryError, CategoryRegistry, CategoryUpdate};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{Config, ConfigError, EngineSettings};
pub use duplicates::{DuplicateDetector, DuplicateGroup, DuplicateStats};
pub use error::{FileErrorKind, OrganizeError, OrganizeResult};
pub use jobs::{CancelOutcome, JobRunner, ProgressStream, StatusReport};
pub use operation::{
    FileMovementRecord, Mode, Operation, OperationId, OperationRequest, OperationStatus, Outcome,
    ProgressEvent, Scheme,
};
pub use organizer::{Organizer, RunReport};
pub use path_policy::{ExclusionSet, PathPolicy};
pub use repository::{JsonRepository, MemoryRepository, Repository};
pub use rollback::{RollbackEngine, RollbackResult};
pub use scanner::{FileEntry, FileFilter, ScanResult, Scanner};
