//! Two-stage duplicate detection: group by size, then hash only the files
//! that share a size with at least one other file.

use crate::cancel::CancelToken;
use crate::error::OrganizeError;
use crate::scanner::{FileEntry, ScanError};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Default read buffer used while hashing.
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    Blake3,
}

/// Files with identical size and content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub hash: String,
    pub algorithm: HashAlgorithm,
    /// Size of every member.
    pub size: u64,
    /// Member paths in scan order; the first one is kept.
    pub members: Vec<PathBuf>,
}

impl DuplicateGroup {
    pub fn original(&self) -> &Path {
        &self.members[0]
    }

    pub fn redundant(&self) -> &[PathBuf] {
        &self.members[1..]
    }

    pub fn reclaimable_bytes(&self) -> u64 {
        self.size * (self.members.len() as u64 - 1)
    }
}

/// Summary figures over a set of duplicate groups.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateStats {
    pub total_groups: usize,
    /// Members that would be recycled.
    pub redundant_files: usize,
    /// Members of every group, originals included.
    pub grouped_files: usize,
    pub reclaimable_bytes: u64,
    pub largest_group: usize,
    /// Member size shared by the most groups; ties go to the smaller size.
    pub most_common_size: u64,
}

impl DuplicateStats {
    pub fn from_groups(groups: &[DuplicateGroup]) -> Self {
        let mut size_counts: BTreeMap<u64, usize> = BTreeMap::new();
        for group in groups {
            *size_counts.entry(group.size).or_insert(0) += 1;
        }
        let most_common_size = size_counts
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map(|(size, _)| *size)
            .unwrap_or(0);

        Self {
            total_groups: groups.len(),
            redundant_files: groups.iter().map(|g| g.redundant().len()).sum(),
            grouped_files: groups.iter().map(|g| g.members.len()).sum(),
            reclaimable_bytes: groups.iter().map(DuplicateGroup::reclaimable_bytes).sum(),
            largest_group: groups.iter().map(|g| g.members.len()).max().unwrap_or(0),
            most_common_size,
        }
    }
}

/// Keeps the groups whose member size lies within `min_size..=max_size`.
pub fn filter_by_size(
    groups: Vec<DuplicateGroup>,
    min_size: u64,
    max_size: Option<u64>,
) -> Vec<DuplicateGroup> {
    groups
        .into_iter()
        .filter(|g| g.size >= min_size && max_size.is_none_or(|max| g.size <= max))
        .collect()
}

/// Result of a detection pass.
#[derive(Debug, Default)]
pub struct DuplicateReport {
    /// Groups ordered by the scan position of their first member.
    pub groups: Vec<DuplicateGroup>,
    /// Content hash of every file that was hashed successfully.
    pub hashes: HashMap<PathBuf, String>,
    /// Files excluded from grouping because they could not be read.
    pub errors: Vec<ScanError>,
    pub hashed_files: usize,
    pub hashed_bytes: u64,
    pub cancelled: bool,
}

impl DuplicateReport {
    pub fn reclaimable_bytes(&self) -> u64 {
        self.groups.iter().map(DuplicateGroup::reclaimable_bytes).sum()
    }
}

/// Hashes a file with a fixed-size buffer so memory use does not depend on
/// file size.
pub fn hash_file(path: &Path, buffer_size: usize) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; buffer_size.max(1)];
    loop {
        let read = match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..read]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// Groups files by content identity.
pub struct DuplicateDetector {
    buffer_size: usize,
    pool: Option<ThreadPool>,
}

impl DuplicateDetector {
    /// A detector hashing on rayon's global pool.
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            pool: None,
        }
    }

    /// A detector with its own bounded pool; `0` keeps the global pool.
    pub fn with_threads(buffer_size: usize, threads: usize) -> Result<Self, ThreadPoolBuildError> {
        let pool = if threads == 0 {
            None
        } else {
            Some(
                ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(|i| format!("tidytree-hash-{i}"))
                    .build()?,
            )
        };
        Ok(Self { buffer_size, pool })
    }

    /// Detects duplicates among `entries`.
    ///
    /// Empty files group together like any other size. Files that fail to hash are reported
    /// and left out of every group. Cancellation is checked before each file
    /// is hashed; a hash already in flight completes.
    pub fn detect(&self, entries: &[FileEntry], cancel: &CancelToken) -> DuplicateReport {
        let mut by_size: HashMap<u64, Vec<usize>> = HashMap::new();
        for (index, entry) in entries.iter().enumerate() {
            by_size.entry(entry.size).or_default().push(index);
        }

        let mut candidates: Vec<usize> = by_size
            .into_values()
            .filter(|indices| indices.len() > 1)
            .flatten()
            .collect();
        candidates.sort_unstable();
        debug!(
            files = entries.len(),
            candidates = candidates.len(),
            "size grouping done"
        );

        let buffer_size = self.buffer_size;
        let hash_all = || {
            candidates
                .par_iter()
                .map(|&index| {
                    if cancel.is_cancelled() {
                        return (index, None);
                    }
                    (index, Some(hash_file(&entries[index].path, buffer_size)))
                })
                .collect::<Vec<_>>()
        };
        let results = match &self.pool {
            Some(pool) => pool.install(hash_all),
            None => hash_all(),
        };

        let mut report = DuplicateReport::default();
        let mut by_content: HashMap<(u64, String), Vec<usize>> = HashMap::new();
        for (index, outcome) in results {
            let entry = &entries[index];
            match outcome {
                None => {}
                Some(Ok(hash)) => {
                    report.hashed_files += 1;
                    report.hashed_bytes += entry.size;
                    report.hashes.insert(entry.path.clone(), hash.clone());
                    by_content.entry((entry.size, hash)).or_default().push(index);
                }
                Some(Err(source)) => {
                    let err = OrganizeError::HashComputation {
                        path: entry.path.clone(),
                        source,
                    };
                    warn!(error = %err, "failed to hash file");
                    report.errors.push(ScanError {
                        path: entry.path.clone(),
                        kind: err.file_kind(),
                        message: err.to_string(),
                    });
                }
            }
        }

        let mut groups: Vec<(usize, DuplicateGroup)> = by_content
            .into_iter()
            .filter(|(_, indices)| indices.len() > 1)
            .map(|((size, hash), indices)| {
                let first = indices[0];
                let group = DuplicateGroup {
                    hash,
                    algorithm: HashAlgorithm::Blake3,
                    size,
                    members: indices.iter().map(|&i| entries[i].path.clone()).collect(),
                };
                (first, group)
            })
            .collect();
        groups.sort_by_key(|(first, _)| *first);
        report.groups = groups.into_iter().map(|(_, group)| group).collect();
        report.cancelled = cancel.is_cancelled();

        info!(
            groups = report.groups.len(),
            hashed = report.hashed_files,
            reclaimable = report.reclaimable_bytes(),
            "duplicate detection finished"
        );
        report
    }
}

impl Default for DuplicateDetector {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FileErrorKind;
    use chrono::Utc;
    use std::fs;
    use tempfile::TempDir;

    fn entry(dir: &TempDir, name: &str, content: &[u8]) -> FileEntry {
        let path = dir.path().join(name);
        fs::write(&path, content).expect("Failed to write test file");
        FileEntry::new(path, content.len() as u64, Utc::now())
    }

    #[test]
    fn test_identical_files_form_one_group() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let entries: Vec<_> = (0..5)
            .map(|i| entry(&temp_dir, &format!("copy{i}.bin"), b"same content"))
            .collect();

        let report = DuplicateDetector::default().detect(&entries, &CancelToken::new());

        assert_eq!(report.groups.len(), 1);
        let group = &report.groups[0];
        assert_eq!(group.members.len(), 5);
        assert_eq!(group.original(), entries[0].path.as_path());
        assert_eq!(group.redundant().len(), 4);
        assert_eq!(group.reclaimable_bytes(), 12 * 4);
    }

    #[test]
    fn test_same_size_different_content_is_not_duplicate() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let entries = vec![
            entry(&temp_dir, "a.txt", b"aaaa"),
            entry(&temp_dir, "b.txt", b"bbbb"),
        ];

        let report = DuplicateDetector::default().detect(&entries, &CancelToken::new());
        assert!(report.groups.is_empty());
        assert_eq!(report.hashed_files, 2);
    }

    #[test]
    fn test_unique_sizes_are_never_hashed() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let entries = vec![
            entry(&temp_dir, "a.txt", b"a"),
            entry(&temp_dir, "b.txt", b"bb"),
            entry(&temp_dir, "c.txt", b"ccc"),
        ];

        let report = DuplicateDetector::default().detect(&entries, &CancelToken::new());
        assert_eq!(report.hashed_files, 0);
        assert!(report.hashes.is_empty());
    }

    #[test]
    fn test_empty_files_form_one_group() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let entries: Vec<_> = (1..=3)
            .map(|i| entry(&temp_dir, &format!("e{i}.txt"), b""))
            .collect();

        let report = DuplicateDetector::default().detect(&entries, &CancelToken::new());
        assert_eq!(report.groups.len(), 1);
        assert_eq!(report.groups[0].members.len(), 3);
        assert_eq!(report.groups[0].original(), entries[0].path.as_path());
        assert_eq!(report.groups[0].reclaimable_bytes(), 0);
    }

    #[test]
    fn test_unreadable_file_is_excluded_from_group() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let entries = vec![
            entry(&temp_dir, "a.txt", b"dup"),
            entry(&temp_dir, "b.txt", b"dup"),
            entry(&temp_dir, "c.txt", b"dup"),
        ];
        fs::remove_file(&entries[1].path).unwrap();

        let report = DuplicateDetector::default().detect(&entries, &CancelToken::new());
        assert_eq!(report.groups.len(), 1);
        assert_eq!(
            report.groups[0].members,
            vec![entries[0].path.clone(), entries[2].path.clone()]
        );
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].kind, FileErrorKind::HashComputation);
        assert!(report.errors[0].message.starts_with("failed to hash"));
    }

    #[test]
    fn test_small_buffer_and_bounded_pool_agree_with_default() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let content = vec![7u8; 100_000];
        let entries = vec![
            entry(&temp_dir, "big1", &content),
            entry(&temp_dir, "big2", &content),
        ];

        let detector = DuplicateDetector::with_threads(16, 2).unwrap();
        let report = detector.detect(&entries, &CancelToken::new());
        assert_eq!(report.groups.len(), 1);
        assert_eq!(
            report.groups[0].hash,
            hash_file(&entries[0].path, DEFAULT_BUFFER_SIZE).unwrap()
        );
    }

    fn group(size: u64, members: usize) -> DuplicateGroup {
        DuplicateGroup {
            hash: format!("{size:x}"),
            algorithm: HashAlgorithm::Blake3,
            size,
            members: (0..members)
                .map(|i| PathBuf::from(format!("/r/{size}_{i}")))
                .collect(),
        }
    }

    #[test]
    fn test_stats_summarize_groups() {
        let groups = vec![group(10, 2), group(100, 4), group(10, 3)];

        let stats = DuplicateStats::from_groups(&groups);

        assert_eq!(stats.total_groups, 3);
        assert_eq!(stats.grouped_files, 9);
        assert_eq!(stats.redundant_files, 6);
        assert_eq!(stats.reclaimable_bytes, 10 + 300 + 20);
        assert_eq!(stats.largest_group, 4);
        assert_eq!(stats.most_common_size, 10);
        assert_eq!(DuplicateStats::from_groups(&[]), DuplicateStats::default());
    }

    #[test]
    fn test_filter_groups_by_size() {
        let groups = vec![group(0, 2), group(10, 2), group(100, 2), group(1000, 2)];

        let sizes = |groups: Vec<DuplicateGroup>| groups.iter().map(|g| g.size).collect::<Vec<_>>();
        assert_eq!(sizes(filter_by_size(groups.clone(), 10, Some(100))), vec![10, 100]);
        assert_eq!(sizes(filter_by_size(groups, 1, None)), vec![10, 100, 1000]);
    }

    #[test]
    fn test_cancelled_detection_hashes_nothing() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let entries = vec![entry(&temp_dir, "a", b"x"), entry(&temp_dir, "b", b"x")];
        let cancel = CancelToken::new();
        cancel.cancel();

        let report = DuplicateDetector::default().detect(&entries, &cancel);
        assert!(report.cancelled);
        assert!(report.groups.is_empty());
    }
}
