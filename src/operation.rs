//! Operation lifecycle and the append-only movement log model.

use crate::error::{FileErrorKind, OrganizeError, OrganizeResult};
use crate::path_policy::ExclusionSet;
use crate::scanner::FileFilter;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier of an organize operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(Uuid);

impl OperationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for OperationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Whether sources are removed (move) or retained (copy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Move,
    Copy,
}

/// Destination path template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Scheme {
    /// `Organized/<category>/<file>`
    #[default]
    Category,
    /// `Organized/<year>/<file>`
    Year,
    /// `Organized/<category>/<year>/<file>`
    CategoryYear,
}

impl Scheme {
    pub fn uses_category(self) -> bool {
        matches!(self, Scheme::Category | Scheme::CategoryYear)
    }

    pub fn uses_year(self) -> bool {
        matches!(self, Scheme::Year | Scheme::CategoryYear)
    }
}

/// Lifecycle status of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Scanning,
    Categorizing,
    DetectingDuplicates,
    Relocating,
    Completed,
    Failed,
    Cancelled,
    RolledBack,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::RolledBack
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: OperationStatus) -> bool {
        use OperationStatus::*;
        match (self, next) {
            (Pending, Scanning)
            | (Scanning, Categorizing)
            | (Categorizing, DetectingDuplicates)
            | (Categorizing, Relocating)
            | (DetectingDuplicates, Relocating)
            | (Relocating, Completed) => true,
            (from, Failed | Cancelled) => !from.is_terminal(),
            (Completed | Failed | Cancelled, RolledBack) => true,
            _ => false,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scanning => "scanning",
            Self::Categorizing => "categorizing",
            Self::DetectingDuplicates => "detecting duplicates",
            Self::Relocating => "relocating",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::RolledBack => "rolled back",
        }
    }
}

/// Per-operation counters. Only the worker executing the operation mutates them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub scanned: u64,
    pub processed: u64,
    pub relocated: u64,
    pub failed: u64,
    pub skipped: u64,
    pub duplicates: u64,
}

/// Everything a caller supplies to start an operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRequest {
    pub root: PathBuf,
    pub mode: Mode,
    pub scheme: Scheme,
    pub dry_run: bool,
    pub exclusions: ExclusionSet,
    #[serde(default)]
    pub filter: FileFilter,
    pub detect_duplicates: bool,
    pub soft_timeout: Option<Duration>,
    pub hard_timeout: Option<Duration>,
}

impl OperationRequest {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            mode: Mode::default(),
            scheme: Scheme::default(),
            dry_run: false,
            exclusions: ExclusionSet::default(),
            filter: FileFilter::default(),
            detect_duplicates: true,
            soft_timeout: None,
            hard_timeout: None,
        }
    }
}

/// A single organize run and its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub root: PathBuf,
    pub mode: Mode,
    pub scheme: Scheme,
    pub dry_run: bool,
    pub detect_duplicates: bool,
    pub exclusions: ExclusionSet,
    #[serde(default)]
    pub filter: FileFilter,
    pub status: OperationStatus,
    pub counters: Counters,
    /// Files scheduled for relocation; zero until scanning finishes.
    pub total: u64,
    pub soft_timeout: Option<Duration>,
    pub hard_timeout: Option<Duration>,
    /// Set once the soft timeout elapses.
    pub timeout_warning: bool,
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Operation {
    /// Creates a pending operation for an already normalized root.
    pub fn new(id: OperationId, root: PathBuf, request: &OperationRequest, now: DateTime<Utc>) -> Self {
        Self {
            id,
            root,
            mode: request.mode,
            scheme: request.scheme,
            dry_run: request.dry_run,
            detect_duplicates: request.detect_duplicates,
            exclusions: request.exclusions.clone(),
            filter: request.filter.clone(),
            status: OperationStatus::Pending,
            counters: Counters::default(),
            total: 0,
            soft_timeout: request.soft_timeout,
            hard_timeout: request.hard_timeout,
            timeout_warning: false,
            failure: None,
            created_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    /// Moves the operation to `next`, rejecting transitions the lifecycle forbids.
    pub fn transition(&mut self, next: OperationStatus) -> OrganizeResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(OrganizeError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        tracing::debug!(operation = %self.id, from = ?self.status, to = ?next, "status transition");
        self.status = next;
        Ok(())
    }

    pub fn progress(&self) -> ProgressEvent {
        ProgressEvent {
            operation_id: self.id,
            status: self.status,
            processed: self.counters.processed,
            total: self.total,
            scanned: self.counters.scanned,
            failed: self.counters.failed,
            skipped: self.counters.skipped,
            timeout_warning: self.timeout_warning,
        }
    }
}

/// Outcome of one file decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Moved,
    Copied,
    WouldMove,
    Skipped,
    Failed,
}

impl Outcome {
    /// True for outcomes backed by a completed filesystem action.
    pub fn is_applied(self) -> bool {
        matches!(self, Outcome::Moved | Outcome::Copied)
    }
}

/// Durable log entry describing one file's relocation decision and outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMovementRecord {
    pub operation_id: OperationId,
    pub sequence: u64,
    pub original_path: PathBuf,
    pub new_path: Option<PathBuf>,
    pub category: String,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<FileErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Kept original when this file was routed to the recycle bin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_of: Option<PathBuf>,
    pub size: u64,
    pub modified: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

/// Snapshot of an operation's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub operation_id: OperationId,
    pub status: OperationStatus,
    pub processed: u64,
    pub total: u64,
    pub scanned: u64,
    pub failed: u64,
    pub skipped: u64,
    pub timeout_warning: bool,
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending() -> Operation {
        let request = OperationRequest::new("/tmp/root");
        Operation::new(OperationId::new(), request.root.clone(), &request, Utc::now())
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut op = pending();
        for next in [
            OperationStatus::Scanning,
            OperationStatus::Categorizing,
            OperationStatus::DetectingDuplicates,
            OperationStatus::Relocating,
            OperationStatus::Completed,
        ] {
            op.transition(next).expect("legal transition");
        }
        assert!(op.status.is_terminal());
    }

    #[test]
    fn test_duplicate_phase_can_be_skipped() {
        assert!(OperationStatus::Categorizing.can_transition_to(OperationStatus::Relocating));
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut op = pending();
        op.transition(OperationStatus::Cancelled).unwrap();
        assert!(op.transition(OperationStatus::Scanning).is_err());
        assert!(op.transition(OperationStatus::Failed).is_err());
        assert!(op.transition(OperationStatus::RolledBack).is_ok());
    }

    #[test]
    fn test_cannot_skip_scanning() {
        let mut op = pending();
        let err = op.transition(OperationStatus::Relocating).unwrap_err();
        assert!(matches!(err, OrganizeError::InvalidTransition { .. }));
        assert_eq!(op.status, OperationStatus::Pending);
    }

    #[test]
    fn test_operation_id_round_trips_through_display() {
        let id = OperationId::new();
        let parsed: OperationId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }
}
