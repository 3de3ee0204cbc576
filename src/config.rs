//! Configuration loaded from TOML files.
//!
//! Settings are explicit values handed to the engine; nothing here is global
//! state.
//!
//! # Configuration File Format
//!
//! ```toml
//! [organize]
//! mode = "move"            # or "copy"
//! scheme = "category"      # "year", "category_year"
//! dry_run = false
//! detect_duplicates = true
//!
//! [exclude]
//! use_defaults = true      # node_modules, .git, __pycache__, ...
//! names = ["build"]
//! paths = ["/home/me/Downloads/keep"]
//! patterns = ["*.part"]
//! regex = ["^~\\$"]
//!
//! [filters]                # files outside these bounds are left in place
//! extensions = ["pdf", "jpg"]
//! min_size = 1024
//! max_size = 104857600
//! modified_after = "2023-01-01T00:00:00Z"
//! modified_before = "2024-12-31T23:59:59Z"
//!
//! [engine]
//! hash_buffer_size = 8192
//! worker_threads = 0       # 0 = one per CPU
//! progress_interval_ms = 100
//! soft_timeout_secs = 600
//! hard_timeout_secs = 3600
//! sniff_content = true
//! state_dir = "/home/me/.local/state/tidytree"
//!
//! [[categories]]
//! name = "Invoices"
//! extensions = []
//! keywords = ["invoice", "receipt"]
//! ```

use crate::category::{Categorizer, Category, CategoryError};
use crate::duplicates::DEFAULT_BUFFER_SIZE;
use crate::operation::{Mode, OperationRequest, Scheme};
use crate::path_policy::ExclusionSet;
use crate::scanner::FileFilter;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration loading and compilation.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {}", .0.display())]
    ConfigNotFound(PathBuf),
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),
    #[error("Invalid glob pattern '{0}'")]
    InvalidGlobPattern(String),
    #[error("Invalid regex pattern '{pattern}': {reason}")]
    InvalidRegexPattern {
        /// The regex pattern that failed to compile.
        pattern: String,
        /// The reason why the pattern is invalid.
        reason: String,
    },
    #[error("IO error reading configuration: {0}")]
    IoError(String),
}

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub organize: OrganizeSettings,
    #[serde(default)]
    pub exclude: ExcludeSettings,
    #[serde(default)]
    pub filters: FileFilter,
    #[serde(default)]
    pub engine: EngineSettings,
    /// Custom categories, appended after the built-in ones in this order.
    #[serde(default)]
    pub categories: Vec<CategoryRule>,
}

/// Defaults for new operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrganizeSettings {
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub scheme: Scheme,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_true")]
    pub detect_duplicates: bool,
}

impl Default for OrganizeSettings {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            scheme: Scheme::default(),
            dry_run: false,
            detect_duplicates: true,
        }
    }
}

/// Exclusion rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExcludeSettings {
    /// Whether the built-in folder exclusions apply.
    #[serde(default = "default_true")]
    pub use_defaults: bool,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub paths: Vec<PathBuf>,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub regex: Vec<String>,
}

impl Default for ExcludeSettings {
    fn default() -> Self {
        Self {
            use_defaults: true,
            names: Vec::new(),
            paths: Vec::new(),
            patterns: Vec::new(),
            regex: Vec::new(),
        }
    }
}

/// Engine tuning shared by every operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_buffer_size")]
    pub hash_buffer_size: usize,
    /// Hashing threads; 0 uses one per CPU.
    #[serde(default)]
    pub worker_threads: usize,
    /// Minimum gap between two pushed progress events.
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    #[serde(default)]
    pub soft_timeout_secs: Option<u64>,
    #[serde(default)]
    pub hard_timeout_secs: Option<u64>,
    /// Infer a type from content for files without an extension.
    #[serde(default = "default_true")]
    pub sniff_content: bool,
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

impl EngineSettings {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    /// Where the CLI keeps operation history. Outside the organized tree so
    /// that dry runs leave it untouched.
    pub fn state_dir(&self) -> PathBuf {
        if let Some(dir) = &self.state_dir {
            return dir.clone();
        }
        match std::env::var("HOME") {
            Ok(home) => PathBuf::from(home)
                .join(".local")
                .join("state")
                .join("tidytree"),
            Err(_) => std::env::temp_dir().join("tidytree"),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            hash_buffer_size: DEFAULT_BUFFER_SIZE,
            worker_threads: 0,
            progress_interval_ms: default_progress_interval_ms(),
            soft_timeout_secs: None,
            hard_timeout_secs: None,
            sniff_content: true,
            state_dir: None,
        }
    }
}

/// A custom category declared in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryRule {
    pub name: String,
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_progress_interval_ms() -> u64 {
    100
}

impl Config {
    /// Load configuration from a file, with fallback to defaults.
    ///
    /// Attempts to load configuration in the following order:
    /// 1. If `config_path` is provided, load from that file
    /// 2. Look for `.tidytreerc.toml` in the current directory
    /// 3. Look for `~/.config/tidytree/config.toml` in home directory
    /// 4. Fall back to default configuration
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration file is explicitly provided but cannot be read.
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = config_path {
            return Self::load_from_file(path);
        }

        let local_config = PathBuf::from(".tidytreerc.toml");
        if local_config.exists() {
            return Self::load_from_file(&local_config);
        }

        if let Ok(home) = std::env::var("HOME") {
            let home_config = PathBuf::from(home)
                .join(".config")
                .join("tidytree")
                .join("config.toml");
            if home_config.exists() {
                return Self::load_from_file(&home_config);
            }
        }

        Ok(Self::default())
    }

    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::ConfigNotFound(path.to_path_buf()));
        }
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::ConfigInvalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values serde cannot, and that every pattern compiles.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.hash_buffer_size == 0 {
            return Err(ConfigError::ConfigInvalid(
                "engine.hash_buffer_size must be greater than zero".to_string(),
            ));
        }
        if let (Some(soft), Some(hard)) = (self.engine.soft_timeout_secs, self.engine.hard_timeout_secs)
            && soft > hard
        {
            return Err(ConfigError::ConfigInvalid(
                "engine.soft_timeout_secs must not exceed engine.hard_timeout_secs".to_string(),
            ));
        }
        if let Some(max) = self.filters.max_size
            && self.filters.min_size > max
        {
            return Err(ConfigError::ConfigInvalid(
                "filters.min_size must not exceed filters.max_size".to_string(),
            ));
        }
        if let (Some(after), Some(before)) =
            (self.filters.modified_after, self.filters.modified_before)
            && after > before
        {
            return Err(ConfigError::ConfigInvalid(
                "filters.modified_after must not be later than filters.modified_before".to_string(),
            ));
        }
        self.exclusion_set().compile().map(|_| ())
    }

    pub fn exclusion_set(&self) -> ExclusionSet {
        let mut set = if self.exclude.use_defaults {
            ExclusionSet::with_defaults()
        } else {
            ExclusionSet::default()
        };
        set.names.extend(self.exclude.names.iter().cloned());
        set.paths.extend(self.exclude.paths.iter().cloned());
        set.patterns.extend(self.exclude.patterns.iter().cloned());
        set.regex.extend(self.exclude.regex.iter().cloned());
        set
    }

    /// Builds a request for `root` from the configured defaults.
    pub fn request(&self, root: &Path) -> OperationRequest {
        OperationRequest {
            root: root.to_path_buf(),
            mode: self.organize.mode,
            scheme: self.organize.scheme,
            dry_run: self.organize.dry_run,
            exclusions: self.exclusion_set(),
            filter: self.filters.clone(),
            detect_duplicates: self.organize.detect_duplicates,
            soft_timeout: self.engine.soft_timeout_secs.map(Duration::from_secs),
            hard_timeout: self.engine.hard_timeout_secs.map(Duration::from_secs),
        }
    }

    /// The built-in categories followed by the configured ones.
    pub fn categorizer(&self) -> Result<Categorizer, CategoryError> {
        let mut categorizer = Categorizer::new();
        for rule in &self.categories {
            categorizer.add(Category::custom(&rule.name, &rule.extensions, &rule.keywords))?;
        }
        Ok(categorizer)
    }
}
