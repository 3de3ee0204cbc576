//! Path validation, exclusion and root confinement.
//!
//! Every component that touches the filesystem routes its paths through a
//! [`PathPolicy`] built for the operation root.

use crate::config::ConfigError;
use crate::error::{OrganizeError, OrganizeResult};
use glob::Pattern;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Directory under the root that receives organized files.
pub const ORGANIZED_DIR: &str = "Organized";

/// Directory under [`ORGANIZED_DIR`] that receives redundant duplicates.
pub const RECYCLE_DIR: &str = "Duplicates_RecycleBin";

/// Folder names skipped unless the caller supplies its own set.
pub const DEFAULT_EXCLUDED_NAMES: &[&str] = &[
    "node_modules",
    ".git",
    ".vscode",
    ".idea",
    "__pycache__",
    "venv",
    ".venv",
    ".pytest_cache",
    ".mypy_cache",
];

/// Serializable exclusion rules, snapshotted into every operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusionSet {
    /// Bare names matched against every component below the root.
    #[serde(default)]
    pub names: Vec<String>,
    /// Absolute path prefixes.
    #[serde(default)]
    pub paths: Vec<PathBuf>,
    /// Glob patterns matched against the root-relative path.
    #[serde(default)]
    pub patterns: Vec<String>,
    /// Regular expressions matched against the file name.
    #[serde(default)]
    pub regex: Vec<String>,
}

impl ExclusionSet {
    /// The default folder exclusions.
    pub fn with_defaults() -> Self {
        Self {
            names: DEFAULT_EXCLUDED_NAMES.iter().map(|n| n.to_string()).collect(),
            ..Default::default()
        }
    }

    /// Adds an exclusion, treating absolute paths as prefixes and anything else as a bare name.
    pub fn add(&mut self, exclusion: &str) {
        let path = Path::new(exclusion);
        if path.is_absolute() {
            self.paths.push(path.to_path_buf());
        } else {
            self.names.push(exclusion.to_string());
        }
    }

    /// Pre-compiles the rules so matching does not reparse patterns per file.
    pub fn compile(&self) -> Result<CompiledExclusions, ConfigError> {
        let patterns = self
            .patterns
            .iter()
            .map(|pattern| {
                Pattern::new(pattern).map_err(|_| ConfigError::InvalidGlobPattern(pattern.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let regexes = self
            .regex
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| ConfigError::InvalidRegexPattern {
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(CompiledExclusions {
            names: self.names.iter().map(|n| n.to_ascii_lowercase()).collect(),
            prefixes: self
                .paths
                .iter()
                .map(|p| fs::canonicalize(p).unwrap_or_else(|_| p.clone()))
                .collect(),
            patterns,
            regexes,
        })
    }
}

/// Compiled form of an [`ExclusionSet`].
#[derive(Debug, Clone)]
pub struct CompiledExclusions {
    names: HashSet<String>,
    prefixes: Vec<PathBuf>,
    patterns: Vec<Pattern>,
    regexes: Vec<Regex>,
}

impl CompiledExclusions {
    /// Checks `path` against the rules. Name and glob rules only see the part
    /// of the path below `root`, so the root's own ancestors never match.
    pub fn matches(&self, root: &Path, path: &Path) -> bool {
        if self.prefixes.iter().any(|prefix| path.starts_with(prefix)) {
            return true;
        }

        let relative = path.strip_prefix(root).unwrap_or(path);

        let name_hit = relative.components().any(|component| match component {
            Component::Normal(name) => self
                .names
                .contains(&name.to_string_lossy().to_ascii_lowercase()),
            _ => false,
        });
        if name_hit {
            return true;
        }

        if self
            .patterns
            .iter()
            .any(|pattern| pattern.matches_path(relative))
        {
            return true;
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_default();
        self.regexes.iter().any(|regex| regex.is_match(&file_name))
    }
}

/// Where a symbolic link points relative to the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkTarget {
    Inside(PathBuf),
    Outside(PathBuf),
    Dangling,
}

/// Resolves a path to its canonical absolute form.
pub fn normalize(path: &Path) -> OrganizeResult<PathBuf> {
    if path.as_os_str().is_empty() {
        return Err(OrganizeError::InvalidPath {
            path: path.to_path_buf(),
            reason: "path is empty".to_string(),
        });
    }
    fs::canonicalize(path).map_err(|e| OrganizeError::InvalidPath {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Path rules for one operation root.
#[derive(Debug, Clone)]
pub struct PathPolicy {
    root: PathBuf,
    output_dir: PathBuf,
    exclusions: CompiledExclusions,
}

impl PathPolicy {
    /// Normalizes `root`, requires it to be a directory and compiles the exclusions.
    pub fn new(root: &Path, exclusions: &ExclusionSet) -> OrganizeResult<Self> {
        let root = normalize(root)?;
        if !root.is_dir() {
            return Err(OrganizeError::InvalidPath {
                path: root,
                reason: "not a directory".to_string(),
            });
        }
        let exclusions = exclusions.compile()?;
        Ok(Self {
            output_dir: root.join(ORGANIZED_DIR),
            root,
            exclusions,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `root/Organized`, which is never scanned.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn is_excluded(&self, path: &Path) -> bool {
        path.starts_with(&self.output_dir) || self.exclusions.matches(&self.root, path)
    }

    /// Lexically joins `relative` onto the root, failing if the result would leave it.
    pub fn resolve_destination(&self, relative: &Path) -> OrganizeResult<PathBuf> {
        let escape = || OrganizeError::PathEscape {
            path: relative.to_path_buf(),
            root: self.root.clone(),
        };

        let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => parts.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    parts.pop().ok_or_else(escape)?;
                }
                Component::RootDir | Component::Prefix(_) => return Err(escape()),
            }
        }
        if parts.is_empty() {
            return Err(escape());
        }

        let mut resolved = self.root.clone();
        resolved.extend(parts);
        Ok(resolved)
    }

    /// Verifies that the nearest existing ancestor of `path` really lives
    /// under the root, so a symlinked directory cannot carry writes outside it.
    pub fn ensure_confined(&self, path: &Path) -> OrganizeResult<()> {
        let mut ancestor = path;
        loop {
            if ancestor.exists() {
                let real = normalize(ancestor)?;
                if real.starts_with(&self.root) {
                    return Ok(());
                }
                return Err(OrganizeError::PathEscape {
                    path: path.to_path_buf(),
                    root: self.root.clone(),
                });
            }
            match ancestor.parent() {
                Some(parent) => ancestor = parent,
                None => {
                    return Err(OrganizeError::PathEscape {
                        path: path.to_path_buf(),
                        root: self.root.clone(),
                    });
                }
            }
        }
    }

    /// Resolves a symlink without following it past the root.
    pub fn resolve_link(&self, link: &Path) -> LinkTarget {
        match fs::canonicalize(link) {
            Ok(target) if target.starts_with(&self.root) => LinkTarget::Inside(target),
            Ok(target) => LinkTarget::Outside(target),
            Err(_) => LinkTarget::Dangling,
        }
    }
}
