/// Integration tests for tidytree
///
/// These tests drive the public API end to end on real temporary trees.
///
/// Test categories:
/// 1. Organizing by category, year and both
/// 2. Dry-run mode verification
/// 3. Duplicates and the recycle bin
/// 4. Rollback round trips and idempotence
/// 5. Exclusions and collisions
/// 6. Background jobs: serialization, cancellation, timeouts, persistence
use chrono::{TimeZone, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;
use tidytree::repository::RepositoryResult;
use tidytree::{
    CancelOutcome, CancelToken, Categorizer, EngineSettings, FileMovementRecord, FixedClock,
    JobRunner, JsonRepository, MemoryRepository, Operation, OperationId, OperationRequest,
    OperationStatus, OrganizeError, Organizer, Outcome, ProgressEvent, Repository, Scheme,
};

// ============================================================================
// Test Utilities
// ============================================================================

/// A temporary root with helpers to build and inspect a file tree.
struct TestFixture {
    temp_dir: TempDir,
}

impl TestFixture {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        TestFixture { temp_dir }
    }

    /// Canonical root, as recorded by operations.
    fn path(&self) -> PathBuf {
        fs::canonicalize(self.temp_dir.path()).expect("Failed to canonicalize root")
    }

    fn create_file(&self, rel_path: &str, content: &[u8]) -> PathBuf {
        let path = self.path().join(rel_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create parent directory");
        }
        fs::write(&path, content).expect("Failed to write file content");
        path
    }

    fn set_modified(&self, rel_path: &str, secs_since_epoch: u64) {
        let file = fs::File::options()
            .write(true)
            .open(self.path().join(rel_path))
            .expect("Failed to open file");
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs_since_epoch))
            .expect("Failed to set modification time");
    }

    fn assert_file_exists(&self, rel_path: &str) {
        let path = self.path().join(rel_path);
        assert!(path.is_file(), "File should exist: {}", path.display());
    }

    fn assert_file_not_exists(&self, rel_path: &str) {
        let path = self.path().join(rel_path);
        assert!(!path.exists(), "File should not exist: {}", path.display());
    }

    /// Every file under the root as (relative path, content).
    fn snapshot(&self) -> BTreeMap<PathBuf, Vec<u8>> {
        let root = self.path();
        let mut files = BTreeMap::new();
        let mut stack = vec![root.clone()];
        while let Some(dir) = stack.pop() {
            for entry in fs::read_dir(&dir).expect("Failed to read dir") {
                let path = entry.expect("Failed to read entry").path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    let content = fs::read(&path).expect("Failed to read file");
                    files.insert(path.strip_prefix(&root).unwrap().to_path_buf(), content);
                }
            }
        }
        files
    }

    /// Every directory under the root, relative.
    fn directories(&self) -> BTreeSet<PathBuf> {
        let root = self.path();
        let mut dirs = BTreeSet::new();
        let mut stack = vec![root.clone()];
        while let Some(dir) = stack.pop() {
            for entry in fs::read_dir(&dir).expect("Failed to read dir") {
                let path = entry.expect("Failed to read entry").path();
                if path.is_dir() {
                    dirs.insert(path.strip_prefix(&root).unwrap().to_path_buf());
                    stack.push(path);
                }
            }
        }
        dirs
    }

    fn request(&self) -> OperationRequest {
        OperationRequest::new(self.path())
    }
}

fn fixed_clock() -> Arc<FixedClock> {
    Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2030, 6, 1, 12, 0, 0).unwrap(),
    ))
}

fn runner_with(repository: Arc<dyn Repository>) -> JobRunner {
    JobRunner::new(
        repository,
        Categorizer::new(),
        fixed_clock(),
        EngineSettings::default(),
    )
}

fn runner() -> (JobRunner, Arc<MemoryRepository>) {
    let repository = Arc::new(MemoryRepository::new());
    (runner_with(repository.clone()), repository)
}

/// Runs `request` to completion and returns the operation id.
fn organize(runner: &JobRunner, request: OperationRequest) -> OperationId {
    let id = runner
        .start_operation(request)
        .expect("Failed to start operation");
    let status = runner.wait(id).expect("Failed to wait for operation");
    assert!(status.status.is_terminal());
    id
}

/// Repository whose record appends block until the gate opens, to hold an
/// operation in `Relocating` for as long as a test needs.
struct GatedRepository {
    inner: MemoryRepository,
    open: Mutex<bool>,
    opened: Condvar,
    waiting: Mutex<usize>,
    arrived: Condvar,
}

impl GatedRepository {
    fn new() -> Self {
        Self {
            inner: MemoryRepository::new(),
            open: Mutex::new(false),
            opened: Condvar::new(),
            waiting: Mutex::new(0),
            arrived: Condvar::new(),
        }
    }

    /// Blocks until a worker is parked on the gate.
    fn wait_for_worker(&self) {
        let mut waiting = self.waiting.lock().unwrap();
        while *waiting == 0 {
            waiting = self.arrived.wait(waiting).unwrap();
        }
    }

    fn release(&self) {
        *self.open.lock().unwrap() = true;
        self.opened.notify_all();
    }
}

impl Repository for GatedRepository {
    fn save_operation(&self, operation: &Operation) -> RepositoryResult<()> {
        self.inner.save_operation(operation)
    }

    fn load_operation(&self, id: OperationId) -> RepositoryResult<Option<Operation>> {
        self.inner.load_operation(id)
    }

    fn list_operations(&self) -> RepositoryResult<Vec<Operation>> {
        self.inner.list_operations()
    }

    fn append_record(&self, record: &FileMovementRecord) -> RepositoryResult<()> {
        {
            *self.waiting.lock().unwrap() += 1;
            self.arrived.notify_all();
        }
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.opened.wait(open).unwrap();
        }
        drop(open);
        self.inner.append_record(record)
    }

    fn records(&self, id: OperationId) -> RepositoryResult<Vec<FileMovementRecord>> {
        self.inner.records(id)
    }
}

// ============================================================================
// 1. Organizing
// ============================================================================

#[test]
fn test_example_scenario_with_duplicates_and_rollback() {
    let fixture = TestFixture::new();
    fixture.create_file("a.txt", b"same text");
    fixture.create_file("b.txt", b"same text");
    fixture.create_file("c.jpg", b"\xFF\xD8\xFF picture");
    let (runner, repository) = runner();

    let id = organize(&runner, fixture.request());

    fixture.assert_file_exists("Organized/Documents/a.txt");
    fixture.assert_file_exists("Organized/Duplicates_RecycleBin/b.txt");
    fixture.assert_file_exists("Organized/Images/c.jpg");
    fixture.assert_file_not_exists("a.txt");

    let groups = runner.list_duplicate_groups(id).unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(
        groups[0].members,
        vec![fixture.path().join("a.txt"), fixture.path().join("b.txt")]
    );

    let records = repository.records(id).unwrap();
    let by_name: BTreeMap<_, _> = records
        .iter()
        .map(|r| (r.original_path.file_name().unwrap().to_owned(), r))
        .collect();
    assert_eq!(by_name[std::ffi::OsStr::new("a.txt")].category, "Documents");
    assert_eq!(by_name[std::ffi::OsStr::new("c.jpg")].category, "Images");
    assert_eq!(
        by_name[std::ffi::OsStr::new("b.txt")].duplicate_of,
        Some(fixture.path().join("a.txt"))
    );

    let result = runner.rollback_operation(id).unwrap();
    assert_eq!(result.reverted, 3);
    fixture.assert_file_exists("a.txt");
    fixture.assert_file_exists("b.txt");
    fixture.assert_file_exists("c.jpg");
    fixture.assert_file_not_exists("Organized");
    assert_eq!(
        runner.operation_status(id).unwrap().status,
        OperationStatus::RolledBack
    );
}

#[test]
fn test_category_year_layout() {
    let fixture = TestFixture::new();
    fixture.create_file("scan.pdf", b"pdf");
    fixture.set_modified("scan.pdf", 1_262_347_200); // 2010-01-01T12:00:00Z
    let (runner, _) = runner();
    let mut request = fixture.request();
    request.scheme = Scheme::CategoryYear;

    organize(&runner, request);

    fixture.assert_file_exists("Organized/Documents/2010/scan.pdf");
}

#[test]
fn test_categorization_is_deterministic() {
    let fixture = TestFixture::new();
    fixture.create_file("one.mp3", b"1");
    fixture.create_file("two.MP3", b"22");
    fixture.create_file("deep/three.mp3", b"333");
    let (runner, repository) = runner();
    let mut request = fixture.request();
    request.dry_run = true;

    let first = organize(&runner, request.clone());
    let second = organize(&runner, request);

    let categories = |id| {
        repository
            .records(id)
            .unwrap()
            .into_iter()
            .map(|r| (r.original_path, r.category))
            .collect::<BTreeMap<_, _>>()
    };
    let first = categories(first);
    assert!(first.values().all(|c| c == "Audio"));
    assert_eq!(first, categories(second));
}

// ============================================================================
// 2. Dry run
// ============================================================================

#[test]
fn test_dry_run_leaves_tree_identical() {
    let fixture = TestFixture::new();
    fixture.create_file("a.txt", b"dup");
    fixture.create_file("b.txt", b"dup");
    fixture.create_file("photos/c.png", b"png");
    fixture.create_file("photos/2019/d.mov", b"mov");
    let before_files = fixture.snapshot();
    let before_dirs = fixture.directories();
    let (runner, repository) = runner();
    let mut request = fixture.request();
    request.dry_run = true;

    let id = organize(&runner, request);

    assert_eq!(fixture.snapshot(), before_files);
    assert_eq!(fixture.directories(), before_dirs);
    let records = repository.records(id).unwrap();
    assert_eq!(records.len(), 4);
    assert!(records.iter().all(|r| r.outcome == Outcome::WouldMove));
    assert!(records.iter().all(|r| r.new_path.is_some()));

    let rollback = runner.rollback_operation(id).unwrap();
    assert_eq!(rollback.total_processed(), 0);
}

// ============================================================================
// 3. Duplicates
// ============================================================================

#[test]
fn test_n_identical_files_yield_one_group() {
    let fixture = TestFixture::new();
    for i in 0..6 {
        fixture.create_file(&format!("copy{i}.dat"), b"identical payload");
    }
    fixture.create_file("other.dat", b"different payload");
    let (runner, _) = runner();

    let id = organize(&runner, fixture.request());

    let groups = runner.list_duplicate_groups(id).unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].members.len(), 6);
    let recycled = fs::read_dir(fixture.path().join("Organized/Duplicates_RecycleBin"))
        .unwrap()
        .count();
    assert_eq!(recycled, 5);
}

#[test]
fn test_empty_files_are_duplicates_of_each_other() {
    let fixture = TestFixture::new();
    for i in 1..=3 {
        fixture.create_file(&format!("e{i}.txt"), b"");
    }
    let (runner, _) = runner();

    let id = organize(&runner, fixture.request());

    let groups = runner.list_duplicate_groups(id).unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].members.len(), 3);
    assert_eq!(groups[0].original(), fixture.path().join("e1.txt").as_path());
    fixture.assert_file_exists("Organized/Documents/e1.txt");
    fixture.assert_file_exists("Organized/Duplicates_RecycleBin/e2.txt");
    fixture.assert_file_exists("Organized/Duplicates_RecycleBin/e3.txt");
}

#[test]
fn test_duplicate_groups_survive_restart() {
    let fixture = TestFixture::new();
    let state = TempDir::new().expect("Failed to create temp directory");
    fixture.create_file("a.txt", b"dup");
    fixture.create_file("b.txt", b"dup");

    let id = {
        let repository = Arc::new(JsonRepository::open(state.path()).unwrap());
        organize(&runner_with(repository), fixture.request())
    };

    let repository = Arc::new(JsonRepository::open(state.path()).unwrap());
    let runner = runner_with(repository);
    let history = runner.list_operations().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, OperationStatus::Completed);

    let groups = runner.list_duplicate_groups(id).unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].original(), fixture.path().join("a.txt").as_path());

    let result = runner.rollback_operation(id).unwrap();
    assert_eq!(result.reverted, 2);
    fixture.assert_file_exists("b.txt");
}

// ============================================================================
// 4. Rollback
// ============================================================================

#[test]
fn test_round_trip_restores_tree() {
    let fixture = TestFixture::new();
    fixture.create_file("notes.txt", b"notes");
    fixture.create_file("music/song.mp3", b"song");
    fixture.create_file("music/album/cover.jpg", b"cover");
    fixture.create_file("music/album/cover_copy.jpg", b"cover");
    fixture.create_file("code/main.rs", b"fn main() {}");
    fixture.create_file("code/README", b"");
    let before = fixture.snapshot();
    let (runner, _) = runner();
    let mut request = fixture.request();
    request.scheme = Scheme::CategoryYear;

    let id = organize(&runner, request);
    assert_ne!(fixture.snapshot(), before);

    let result = runner.rollback_operation(id).unwrap();
    assert!(result.is_complete_success());
    assert_eq!(fixture.snapshot(), before);
}

#[test]
fn test_rollback_twice_is_idempotent() {
    let fixture = TestFixture::new();
    fixture.create_file("a.txt", b"a");
    fixture.create_file("b.pdf", b"bb");
    let (runner, _) = runner();
    let id = organize(&runner, fixture.request());

    let first = runner.rollback_operation(id).unwrap();
    let before = fixture.snapshot();
    let second = runner.rollback_operation(id).unwrap();

    assert_eq!(first.reverted, 2);
    assert_eq!(second.reverted, 0);
    assert_eq!(second.already_reverted, 2);
    assert_eq!(fixture.snapshot(), before);
}

#[test]
fn test_rollback_flags_replaced_original() {
    let fixture = TestFixture::new();
    fixture.create_file("a.txt", b"original");
    let (runner, _) = runner();
    let id = organize(&runner, fixture.request());
    fixture.create_file("a.txt", b"a newer, unrelated file");

    let result = runner.rollback_operation(id).unwrap();

    assert_eq!(result.failed, 1);
    assert_eq!(
        fs::read(fixture.path().join("a.txt")).unwrap(),
        b"a newer, unrelated file"
    );
    fixture.assert_file_exists("Organized/Documents/a.txt");
    assert_eq!(
        runner.operation_status(id).unwrap().status,
        OperationStatus::Completed
    );
}

#[test]
fn test_rollback_flags_same_size_replacement() {
    let fixture = TestFixture::new();
    fixture.create_file("a.txt", b"AAAA");
    let (runner, _) = runner();
    let id = organize(&runner, fixture.request());
    fixture.create_file("a.txt", b"ZZZZ");

    let result = runner.rollback_operation(id).unwrap();

    assert_eq!(result.already_reverted, 0);
    assert_eq!(result.failed, 1);
    assert_eq!(fs::read(fixture.path().join("Organized/Documents/a.txt")).unwrap(), b"AAAA");
    assert_eq!(
        runner.operation_status(id).unwrap().status,
        OperationStatus::Completed
    );
}

// ============================================================================
// 5. Exclusions and collisions
// ============================================================================

#[test]
fn test_node_modules_is_never_scanned() {
    let fixture = TestFixture::new();
    fixture.create_file("proj/node_modules/x.js", b"module.exports = 1");
    fixture.create_file("proj/index.js", b"require('x')");
    let (runner, repository) = runner();
    let mut request = fixture.request();
    request.exclusions.add("node_modules");

    let id = organize(&runner, request);

    let records = repository.records(id).unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].original_path.ends_with("proj/index.js"));
    fixture.assert_file_exists("proj/node_modules/x.js");
}

#[test]
fn test_collision_suffix_is_deterministic() {
    let fixture = TestFixture::new();
    fixture.create_file("first/report.txt", b"first");
    fixture.create_file("second/report.txt", b"second");
    let (runner, repository) = runner();
    let mut dry = fixture.request();
    dry.dry_run = true;

    let planned = |id| {
        repository
            .records(id)
            .unwrap()
            .into_iter()
            .map(|r| (r.original_path, r.new_path))
            .collect::<Vec<_>>()
    };
    let run_a = planned(organize(&runner, dry.clone()));
    let run_b = planned(organize(&runner, dry));
    assert_eq!(run_a, run_b);

    let id = organize(&runner, fixture.request());
    assert_eq!(planned(id), run_a);
    let docs = fixture.path().join("Organized/Documents");
    let names: BTreeSet<_> = fs::read_dir(&docs)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(
        names,
        BTreeSet::from(["report.txt".to_string(), "report_1.txt".to_string()])
    );
}

// ============================================================================
// 6. Background jobs
// ============================================================================

#[test]
fn test_overlapping_root_is_rejected_while_running() {
    let fixture = TestFixture::new();
    fixture.create_file("sub/a.txt", b"a");
    let repository = Arc::new(GatedRepository::new());
    let runner = runner_with(repository.clone());

    let id = runner.start_operation(fixture.request()).unwrap();
    repository.wait_for_worker();

    let nested = runner.start_operation(OperationRequest::new(fixture.path().join("sub")));
    assert!(matches!(
        nested,
        Err(OrganizeError::AlreadyRunning { operation, .. }) if operation == id
    ));
    assert!(matches!(
        runner.rollback_operation(id),
        Err(OrganizeError::OperationInProgress(_))
    ));
    assert!(matches!(
        runner.list_duplicate_groups(id),
        Err(OrganizeError::OperationInProgress(_))
    ));
    let status = runner.operation_status(id).unwrap();
    assert_eq!(status.status, OperationStatus::Relocating);

    repository.release();
    assert_eq!(runner.wait(id).unwrap().status, OperationStatus::Completed);
    let again = runner.start_operation(OperationRequest::new(fixture.path().join("sub")));
    assert!(again.is_ok());
    runner.wait(again.unwrap()).unwrap();
}

#[test]
fn test_cancel_stops_at_file_boundary() {
    let fixture = TestFixture::new();
    for i in 0..4 {
        fixture.create_file(&format!("f{i}.txt"), format!("{i}").as_bytes());
    }
    let repository = Arc::new(GatedRepository::new());
    let runner = runner_with(repository.clone());

    let id = runner.start_operation(fixture.request()).unwrap();
    repository.wait_for_worker();
    assert_eq!(runner.cancel_operation(id).unwrap(), CancelOutcome::Accepted);
    repository.release();

    let status = runner.wait(id).unwrap();
    assert_eq!(status.status, OperationStatus::Cancelled);
    assert_eq!(repository.records(id).unwrap().len(), 1);
    assert_eq!(
        runner.cancel_operation(id).unwrap(),
        CancelOutcome::AlreadyTerminal
    );

    // What was moved before the cancel can still be rolled back.
    let result = runner.rollback_operation(id).unwrap();
    assert_eq!(result.reverted, 1);
    assert_eq!(fixture.snapshot().len(), 4);
}

#[test]
fn test_hard_timeout_fails_operation() {
    let fixture = TestFixture::new();
    fixture.create_file("a.txt", b"a");
    let (runner, _) = runner();
    let mut request = fixture.request();
    request.hard_timeout = Some(Duration::ZERO);

    let id = runner.start_operation(request).unwrap();
    let status = runner.wait(id).unwrap();

    assert_eq!(status.status, OperationStatus::Failed);
    assert!(status.failure.unwrap().contains("time limit"));
    fixture.assert_file_exists("a.txt");
}

#[test]
fn test_organizer_cancel_from_progress_sink() {
    let fixture = TestFixture::new();
    fixture.create_file("a.txt", b"a");
    fixture.create_file("b.txt", b"b");
    let repository = Arc::new(MemoryRepository::new());
    let organizer = Organizer::new(
        Arc::new(Categorizer::new()),
        repository.clone(),
        fixed_clock(),
        EngineSettings::default(),
    );
    let request = fixture.request();
    let mut operation = Operation::new(OperationId::new(), fixture.path(), &request, Utc::now());
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    let sink = move |event: ProgressEvent| {
        if event.status == OperationStatus::Relocating {
            trigger.cancel();
        }
    };

    let report = organizer.run(&mut operation, &cancel, &sink);

    assert!(matches!(report.error, Some(OrganizeError::Cancelled)));
    assert_eq!(operation.status, OperationStatus::Cancelled);
    assert!(repository.records(operation.id).unwrap().is_empty());
    fixture.assert_file_exists("a.txt");
}

#[test]
fn test_status_lists_per_file_errors_without_failing() {
    let fixture = TestFixture::new();
    fixture.create_file("a.txt", b"a");
    let outside = TempDir::new().expect("Failed to create temp directory");
    fs::write(outside.path().join("secret.txt"), "s").unwrap();
    #[cfg(unix)]
    std::os::unix::fs::symlink(outside.path().join("secret.txt"), fixture.path().join("link.txt"))
        .unwrap();
    let (runner, _) = runner();

    let id = organize(&runner, fixture.request());
    let status = runner.operation_status(id).unwrap();

    assert_eq!(status.status, OperationStatus::Completed);
    #[cfg(unix)]
    {
        assert_eq!(status.failed, 1);
        assert_eq!(status.errors.len(), 1);
        assert_eq!(status.errors[0].path, fixture.path().join("link.txt"));
    }
    assert!(outside.path().join("secret.txt").exists());
}
