//! Background execution of organize operations.
//!
//! [`JobRunner`] is the entry point collaborators use: it starts each
//! operation on its own named thread and returns immediately, serializes
//! operations on overlapping roots, and serves status polls, progress
//! subscriptions, cancellation, rollback and category management.

use crate::cancel::CancelToken;
use crate::category::{Category, CategoryRegistry, CategoryUpdate, Categorizer};
use crate::clock::Clock;
use crate::config::EngineSettings;
use crate::duplicates::{DuplicateGroup, HashAlgorithm};
use crate::error::{OrganizeError, OrganizeResult};
use crate::operation::{
    FileMovementRecord, Operation, OperationId, OperationRequest, OperationStatus, ProgressEvent,
};
use crate::organizer::{FileFailure, Organizer, ProgressSink};
use crate::path_policy::normalize;
use crate::repository::Repository;
use crate::rollback::{RollbackEngine, RollbackResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Answer to a status poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub operation_id: OperationId,
    pub status: OperationStatus,
    pub processed: u64,
    pub total: u64,
    pub failed: u64,
    pub skipped: u64,
    pub timeout_warning: bool,
    /// Why the operation failed or was cancelled.
    pub failure: Option<String>,
    /// Per-file problems recorded so far.
    pub errors: Vec<FileError>,
}

/// A per-file problem as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileError {
    pub path: PathBuf,
    pub message: String,
}

impl From<FileFailure> for FileError {
    fn from(failure: FileFailure) -> Self {
        Self {
            path: failure.path,
            message: failure.message,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    Accepted,
    AlreadyTerminal,
}

/// Progress events of one operation, ending after the terminal event.
///
/// The first event is the snapshot current at subscription time.
pub struct ProgressStream {
    receiver: Receiver<ProgressEvent>,
    finished: bool,
}

impl Iterator for ProgressStream {
    type Item = ProgressEvent;

    fn next(&mut self) -> Option<ProgressEvent> {
        if self.finished {
            return None;
        }
        match self.receiver.recv() {
            Ok(event) => {
                self.finished = event.is_terminal();
                Some(event)
            }
            Err(_) => {
                self.finished = true;
                None
            }
        }
    }
}

/// What a finished worker leaves behind for later queries.
#[derive(Default)]
struct Outcome {
    duplicate_groups: Vec<DuplicateGroup>,
    scan_errors: Vec<FileError>,
}

struct Job {
    root: PathBuf,
    cancel: CancelToken,
    latest: ProgressEvent,
    subscribers: Vec<Sender<ProgressEvent>>,
    outcome: Option<Outcome>,
}

impl Job {
    fn is_active(&self) -> bool {
        self.outcome.is_none()
    }
}

struct Shared {
    registry: CategoryRegistry,
    repository: Arc<dyn Repository>,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
    jobs: Mutex<HashMap<OperationId, Job>>,
    /// Roots with a rollback in progress. Locked after `jobs`, never before.
    rollbacks: Mutex<HashMap<OperationId, PathBuf>>,
    finished: Condvar,
}

impl Shared {
    fn jobs(&self) -> MutexGuard<'_, HashMap<OperationId, Job>> {
        // Workers never panic while holding the lock; recover the data if one did.
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn rollbacks(&self) -> MutexGuard<'_, HashMap<OperationId, PathBuf>> {
        self.rollbacks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Keeps a root marked busy while its rollback runs.
struct RollbackGuard<'a> {
    shared: &'a Shared,
    id: OperationId,
}

impl Drop for RollbackGuard<'_> {
    fn drop(&mut self) {
        self.shared.rollbacks().remove(&self.id);
    }
}

/// Forwards worker progress to the job table and subscribers.
///
/// Every event refreshes the polled snapshot. Subscribers receive phase
/// changes and terminal events immediately and everything else at most once
/// per progress interval.
struct JobSink {
    shared: Arc<Shared>,
    id: OperationId,
    last_sent: Mutex<Option<(Instant, OperationStatus)>>,
}

impl ProgressSink for JobSink {
    fn publish(&self, event: ProgressEvent) {
        let due = {
            let mut last = self
                .last_sent
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let due = match *last {
                None => true,
                Some((at, status)) => {
                    status != event.status
                        || event.is_terminal()
                        || at.elapsed() >= self.shared.settings.progress_interval()
                }
            };
            if due {
                *last = Some((Instant::now(), event.status));
            }
            due
        };

        let mut jobs = self.shared.jobs();
        if let Some(job) = jobs.get_mut(&self.id) {
            job.latest = event;
            if due {
                job.subscribers.retain(|tx| tx.send(event).is_ok());
            }
        }
    }
}

/// Runs operations in the background and answers queries about them.
pub struct JobRunner {
    shared: Arc<Shared>,
}

impl JobRunner {
    pub fn new(
        repository: Arc<dyn Repository>,
        categorizer: Categorizer,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry: CategoryRegistry::new(categorizer),
                repository,
                clock,
                settings,
                jobs: Mutex::new(HashMap::new()),
                rollbacks: Mutex::new(HashMap::new()),
                finished: Condvar::new(),
            }),
        }
    }

    /// Validates the request and starts the operation on a new thread.
    ///
    /// # Errors
    ///
    /// `InvalidPath` if the root cannot be resolved to a directory, `Config`
    /// if an exclusion pattern does not compile, and `AlreadyRunning` if an
    /// active operation works on the same root or on an ancestor or
    /// descendant of it.
    pub fn start_operation(&self, request: OperationRequest) -> OrganizeResult<OperationId> {
        let root = normalize(&request.root)?;
        if !root.is_dir() {
            return Err(OrganizeError::InvalidPath {
                path: root,
                reason: "not a directory".to_string(),
            });
        }
        request.exclusions.compile()?;

        let mut jobs = self.shared.jobs();
        check_overlap(&jobs, &root)?;
        check_rollbacks(&self.shared.rollbacks(), &root)?;

        let id = OperationId::new();
        let mut operation = Operation::new(id, root.clone(), &request, self.shared.clock.now());
        self.shared.repository.save_operation(&operation)?;
        let cancel = CancelToken::with_deadline(request.hard_timeout);
        jobs.insert(
            id,
            Job {
                root: root.clone(),
                cancel: cancel.clone(),
                latest: operation.progress(),
                subscribers: Vec::new(),
                outcome: None,
            },
        );

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("tidytree-op-{}", &id.to_string()[..8]))
            .spawn(move || run_job(shared, &mut operation, &cancel));
        if let Err(e) = spawned {
            jobs.remove(&id);
            return Err(OrganizeError::FatalIo {
                path: root,
                source: io::Error::other(e),
            });
        }

        info!(operation = %id, root = %root.display(), "operation started");
        Ok(id)
    }

    pub fn operation_status(&self, id: OperationId) -> OrganizeResult<StatusReport> {
        let (running, scan_errors) = {
            let jobs = self.shared.jobs();
            match jobs.get(&id) {
                Some(job) => {
                    let scan_errors = job
                        .outcome
                        .as_ref()
                        .map(|o| o.scan_errors.clone())
                        .unwrap_or_default();
                    (job.is_active().then_some(job.latest), scan_errors)
                }
                None => (None, Vec::new()),
            }
        };

        let mut errors = scan_errors;
        errors.extend(
            self.shared
                .repository
                .records(id)?
                .into_iter()
                .filter_map(record_error),
        );

        if let Some(event) = running {
            return Ok(StatusReport {
                operation_id: id,
                status: event.status,
                processed: event.processed,
                total: event.total,
                failed: event.failed,
                skipped: event.skipped,
                timeout_warning: event.timeout_warning,
                failure: None,
                errors,
            });
        }

        let operation = self.load(id)?;
        Ok(StatusReport {
            operation_id: id,
            status: operation.status,
            processed: operation.counters.processed,
            total: operation.total,
            failed: operation.counters.failed,
            skipped: operation.counters.skipped,
            timeout_warning: operation.timeout_warning,
            failure: operation.failure,
            errors,
        })
    }

    /// Subscribes to progress events of `id`.
    ///
    /// Each call yields an independent stream. For an operation that already
    /// finished the stream holds only its final snapshot.
    pub fn subscribe_progress(&self, id: OperationId) -> OrganizeResult<ProgressStream> {
        let (tx, rx) = mpsc::channel();
        {
            let mut jobs = self.shared.jobs();
            if let Some(job) = jobs.get_mut(&id) {
                let _ = tx.send(job.latest);
                if job.is_active() && !job.latest.is_terminal() {
                    job.subscribers.push(tx);
                }
                return Ok(ProgressStream {
                    receiver: rx,
                    finished: false,
                });
            }
        }

        let operation = self.load(id)?;
        let _ = tx.send(operation.progress());
        Ok(ProgressStream {
            receiver: rx,
            finished: false,
        })
    }

    /// Requests cooperative cancellation of `id`.
    ///
    /// An operation left non-terminal by a process that no longer runs it is
    /// marked `Cancelled` directly.
    pub fn cancel_operation(&self, id: OperationId) -> OrganizeResult<CancelOutcome> {
        {
            let jobs = self.shared.jobs();
            if let Some(job) = jobs.get(&id) {
                if job.is_active() && !job.latest.is_terminal() {
                    job.cancel.cancel();
                    info!(operation = %id, "cancellation requested");
                    return Ok(CancelOutcome::Accepted);
                }
                return Ok(CancelOutcome::AlreadyTerminal);
            }
        }

        let mut operation = self.load(id)?;
        if operation.status.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal);
        }
        warn!(operation = %id, status = ?operation.status, "cancelling orphaned operation");
        operation.transition(OperationStatus::Cancelled)?;
        operation.failure = Some("interrupted".to_string());
        operation.finished_at = Some(self.shared.clock.now());
        self.shared.repository.save_operation(&operation)?;
        Ok(CancelOutcome::Accepted)
    }

    /// Rolls back a finished operation.
    ///
    /// Refused while the operation itself, or another one on an overlapping
    /// root, is still running.
    pub fn rollback_operation(&self, id: OperationId) -> OrganizeResult<RollbackResult> {
        let operation = self.load(id)?;
        let _busy = {
            let jobs = self.shared.jobs();
            if jobs.get(&id).is_some_and(Job::is_active) {
                return Err(OrganizeError::OperationInProgress(id));
            }
            check_overlap(&jobs, &operation.root)?;
            let mut rollbacks = self.shared.rollbacks();
            if rollbacks.contains_key(&id) {
                return Err(OrganizeError::OperationInProgress(id));
            }
            check_rollbacks(&rollbacks, &operation.root)?;
            rollbacks.insert(id, operation.root.clone());
            RollbackGuard {
                shared: self.shared.as_ref(),
                id,
            }
        };
        RollbackEngine::new(Arc::clone(&self.shared.repository)).rollback(id)
    }

    /// Blocks until `id` reaches a terminal state and returns its final status.
    pub fn wait(&self, id: OperationId) -> OrganizeResult<StatusReport> {
        {
            let mut jobs = self.shared.jobs();
            while jobs.get(&id).is_some_and(Job::is_active) {
                jobs = self
                    .shared
                    .finished
                    .wait(jobs)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
        }
        self.operation_status(id)
    }

    /// Duplicate groups found by a finished operation.
    ///
    /// Operations run by this runner answer from memory; older ones are
    /// rebuilt from their movement records.
    pub fn list_duplicate_groups(&self, id: OperationId) -> OrganizeResult<Vec<DuplicateGroup>> {
        {
            let jobs = self.shared.jobs();
            if let Some(job) = jobs.get(&id) {
                return match &job.outcome {
                    Some(outcome) => Ok(outcome.duplicate_groups.clone()),
                    None => Err(OrganizeError::OperationInProgress(id)),
                };
            }
        }

        let operation = self.load(id)?;
        if !operation.status.is_terminal() {
            return Err(OrganizeError::OperationInProgress(id));
        }
        Ok(groups_from_records(&self.shared.repository.records(id)?))
    }

    pub fn list_operations(&self) -> OrganizeResult<Vec<Operation>> {
        Ok(self.shared.repository.list_operations()?)
    }

    pub fn list_categories(&self) -> Vec<Category> {
        self.shared.registry.list()
    }

    /// Adds a category; operations already running keep their snapshot.
    pub fn add_category(&self, category: Category) -> OrganizeResult<()> {
        Ok(self.shared.registry.add(category)?)
    }

    pub fn remove_category(&self, name: &str) -> OrganizeResult<Category> {
        Ok(self.shared.registry.remove(name)?)
    }

    pub fn update_category(&self, name: &str, update: CategoryUpdate) -> OrganizeResult<()> {
        Ok(self.shared.registry.update(name, update)?)
    }

    fn load(&self, id: OperationId) -> OrganizeResult<Operation> {
        self.shared
            .repository
            .load_operation(id)?
            .ok_or(OrganizeError::UnknownOperation(id))
    }
}

fn run_job(shared: Arc<Shared>, operation: &mut Operation, cancel: &CancelToken) {
    let id = operation.id;
    let organizer = Organizer::new(
        shared.registry.snapshot(),
        Arc::clone(&shared.repository),
        Arc::clone(&shared.clock),
        shared.settings.clone(),
    );
    let sink = JobSink {
        shared: Arc::clone(&shared),
        id,
        last_sent: Mutex::new(None),
    };
    let report = organizer.run(operation, cancel, &sink);

    let mut scan_errors: Vec<FileError> = report
        .scan_errors
        .into_iter()
        .map(|e| FileError {
            path: e.path,
            message: e.message,
        })
        .collect();
    scan_errors.sort_by(|a, b| a.path.cmp(&b.path));

    let mut jobs = shared.jobs();
    if let Some(job) = jobs.get_mut(&id) {
        job.latest = operation.progress();
        job.subscribers.clear();
        job.outcome = Some(Outcome {
            duplicate_groups: report.duplicate_groups,
            scan_errors,
        });
    }
    shared.finished.notify_all();
    debug!(operation = %id, status = ?operation.status, "worker finished");
}

/// Rejects `root` if an active job works on it, inside it or above it.
fn check_overlap(jobs: &HashMap<OperationId, Job>, root: &Path) -> OrganizeResult<()> {
    let conflict = jobs
        .iter()
        .filter(|(_, job)| job.is_active())
        .find(|(_, job)| job.root.starts_with(root) || root.starts_with(&job.root));
    match conflict {
        Some((operation, _)) => Err(OrganizeError::AlreadyRunning {
            root: root.to_path_buf(),
            operation: *operation,
        }),
        None => Ok(()),
    }
}

fn check_rollbacks(rollbacks: &HashMap<OperationId, PathBuf>, root: &Path) -> OrganizeResult<()> {
    match rollbacks
        .iter()
        .find(|(_, busy)| busy.starts_with(root) || root.starts_with(busy))
    {
        Some((operation, _)) => Err(OrganizeError::AlreadyRunning {
            root: root.to_path_buf(),
            operation: *operation,
        }),
        None => Ok(()),
    }
}

fn record_error(record: FileMovementRecord) -> Option<FileError> {
    record.error.map(|message| FileError {
        path: record.original_path,
        message,
    })
}

/// Rebuilds duplicate groups from recycle records.
fn groups_from_records(records: &[FileMovementRecord]) -> Vec<DuplicateGroup> {
    let sequence_of: HashMap<&Path, u64> = records
        .iter()
        .map(|r| (r.original_path.as_path(), r.sequence))
        .collect();

    let mut groups: Vec<DuplicateGroup> = Vec::new();
    for record in records {
        let Some(original) = &record.duplicate_of else {
            continue;
        };
        match groups.iter_mut().find(|g| &g.members[0] == original) {
            Some(group) => group.members.push(record.original_path.clone()),
            None => groups.push(DuplicateGroup {
                hash: record.content_hash.clone().unwrap_or_default(),
                algorithm: HashAlgorithm::Blake3,
                size: record.size,
                members: vec![original.clone(), record.original_path.clone()],
            }),
        }
    }
    groups.sort_by_key(|g| sequence_of.get(g.members[0].as_path()).copied());
    groups
}
