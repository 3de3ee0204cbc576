//! File categorization by ordered extension and keyword rules.
//!
//! Categories are checked in registration order and the first one whose
//! extension set or keyword matcher matches wins. Files that match nothing
//! fall into the built-in [`OTHER`] category, which can never be removed or
//! edited.
//!
//! # Examples
//!
//! ```
//! use tidytree::category::Categorizer;
//!
//! let categorizer = Categorizer::default();
//! assert_eq!(categorizer.categorize_name("photo.JPG").name, "Images");
//! assert_eq!(categorizer.categorize_name("notes.txt").name, "Documents");
//! assert_eq!(categorizer.categorize_name("mystery.zzz").name, "Other");
//! ```

use crate::scanner::FileEntry;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Component, Path};
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Name of the fallback category.
pub const OTHER: &str = "Other";

/// Built-in categories in registration order.
const DEFAULT_CATEGORIES: &[(&str, &[&str])] = &[
    (
        "Images",
        &[
            "jpg", "jpeg", "png", "gif", "bmp", "tiff", "tif", "webp", "svg", "ico", "heic",
            "heif", "raw", "cr2", "nef", "arw", "dng", "orf", "psd",
        ],
    ),
    (
        "Videos",
        &[
            "mp4", "avi", "mkv", "mov", "wmv", "flv", "webm", "m4v", "mpg", "mpeg", "3gp", "ogv",
        ],
    ),
    (
        "Documents",
        &[
            "pdf", "doc", "docx", "txt", "rtf", "odt", "tex", "wpd", "md", "markdown",
        ],
    ),
    ("Spreadsheets", &["xls", "xlsx", "csv", "ods", "xlsm", "xlsb"]),
    ("Presentations", &["ppt", "pptx", "odp", "key"]),
    (
        "Audio",
        &[
            "mp3", "wav", "flac", "aac", "ogg", "wma", "m4a", "opus", "aiff", "ape",
        ],
    ),
    (
        "Archives",
        &[
            "zip", "rar", "7z", "tar", "gz", "bz2", "xz", "iso", "dmg", "pkg",
        ],
    ),
    (
        "Code",
        &[
            "py", "js", "java", "cpp", "c", "h", "cs", "php", "rb", "go", "rs", "swift", "kt",
            "ts", "html", "css", "scss", "sql", "sh", "bat", "ps1", "r", "m", "scala", "lua",
        ],
    ),
    ("Executables", &["exe", "msi", "app", "deb", "rpm", "apk"]),
    ("Fonts", &["ttf", "otf", "woff", "woff2", "eot"]),
];

/// Errors raised when editing the category table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CategoryError {
    #[error("category '{0}' already exists")]
    DuplicateName(String),
    #[error("category '{0}' not found")]
    NotFound(String),
    #[error("the 'Other' category cannot be modified")]
    ImmutableOther,
    #[error("invalid category name '{0}': must be a single non-empty path component")]
    InvalidName(String),
    #[error("category table is corrupt: {0}")]
    Corrupt(String),
}

/// A named classification bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub name: String,
    /// Lower-cased extensions without the leading dot, in declaration order.
    #[serde(default)]
    pub extensions: Vec<String>,
    /// Case-insensitive substrings matched against the file stem.
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub is_custom: bool,
}

impl Category {
    /// Creates a custom category, normalizing its extensions and keywords.
    pub fn custom<E, K>(name: &str, extensions: E, keywords: K) -> Self
    where
        E: IntoIterator,
        E::Item: AsRef<str>,
        K: IntoIterator,
        K::Item: AsRef<str>,
    {
        let mut category = Self {
            name: name.to_string(),
            extensions: extensions.into_iter().map(|e| e.as_ref().to_string()).collect(),
            keywords: keywords.into_iter().map(|k| k.as_ref().to_string()).collect(),
            is_custom: true,
        };
        category.normalize();
        category
    }

    fn builtin(name: &str, extensions: &[&str]) -> Self {
        let mut category = Self::custom(name, extensions, std::iter::empty::<&str>());
        category.is_custom = false;
        category
    }

    fn other() -> Self {
        Self {
            name: OTHER.to_string(),
            extensions: Vec::new(),
            keywords: Vec::new(),
            is_custom: false,
        }
    }

    fn normalize(&mut self) {
        let mut seen = BTreeSet::new();
        self.extensions = self
            .extensions
            .iter()
            .map(|e| e.trim().trim_start_matches('.').to_lowercase())
            .filter(|e| !e.is_empty() && seen.insert(e.clone()))
            .collect();
        self.keywords = self
            .keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
    }

    fn matches_keyword(&self, stem_lower: &str) -> bool {
        self.keywords.iter().any(|k| stem_lower.contains(k.as_str()))
    }
}

/// Replacement rules for an existing category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryUpdate {
    pub extensions: Option<Vec<String>>,
    pub keywords: Option<Vec<String>>,
}

fn validate_name(name: &str) -> Result<(), CategoryError> {
    let mut components = Path::new(name).components();
    let single_normal = matches!(components.next(), Some(Component::Normal(_)))
        && components.next().is_none();
    if name.trim().is_empty() || !single_normal || name.contains(['/', '\\']) {
        return Err(CategoryError::InvalidName(name.to_string()));
    }
    if name.eq_ignore_ascii_case(OTHER) {
        return Err(CategoryError::ImmutableOther);
    }
    Ok(())
}

/// Maps files to categories.
///
/// Each category gets a monotonically increasing rank at registration. The
/// extension index maps an extension to the ranks that list it, so the
/// winning category is the smallest rank and edits only touch the affected
/// extensions.
#[derive(Debug, Clone)]
pub struct Categorizer {
    categories: BTreeMap<u64, Category>,
    ranks_by_name: HashMap<String, u64>,
    extension_index: HashMap<String, BTreeSet<u64>>,
    keyword_ranks: BTreeSet<u64>,
    next_rank: u64,
    other: Category,
}

impl Categorizer {
    /// An empty table holding only the fallback category.
    pub fn empty() -> Self {
        Self {
            categories: BTreeMap::new(),
            ranks_by_name: HashMap::new(),
            extension_index: HashMap::new(),
            keyword_ranks: BTreeSet::new(),
            next_rank: 0,
            other: Category::other(),
        }
    }

    /// The built-in table.
    pub fn new() -> Self {
        let mut categorizer = Self::empty();
        for (name, extensions) in DEFAULT_CATEGORIES {
            categorizer.insert(Category::builtin(name, extensions));
        }
        categorizer
    }

    /// Categories in priority order, followed by `Other`.
    pub fn categories(&self) -> impl Iterator<Item = &Category> {
        self.categories.values().chain(std::iter::once(&self.other))
    }

    pub fn get(&self, name: &str) -> Option<&Category> {
        if name == OTHER {
            return Some(&self.other);
        }
        self.ranks_by_name
            .get(name)
            .and_then(|rank| self.categories.get(rank))
    }

    pub fn other(&self) -> &Category {
        &self.other
    }

    /// Appends a category at the lowest priority (just above `Other`).
    pub fn add(&mut self, category: Category) -> Result<(), CategoryError> {
        validate_name(&category.name)?;
        if self.ranks_by_name.contains_key(&category.name) {
            return Err(CategoryError::DuplicateName(category.name));
        }
        let mut category = category;
        category.normalize();
        self.insert(category);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Result<Category, CategoryError> {
        if name == OTHER {
            return Err(CategoryError::ImmutableOther);
        }
        let rank = self
            .ranks_by_name
            .remove(name)
            .ok_or_else(|| CategoryError::NotFound(name.to_string()))?;
        let category = self
            .categories
            .remove(&rank)
            .ok_or_else(|| CategoryError::Corrupt(format!("no category at rank {rank}")))?;
        self.unindex(rank, &category);
        Ok(category)
    }

    /// Replaces the rules of a category while keeping its priority.
    pub fn update(&mut self, name: &str, update: CategoryUpdate) -> Result<(), CategoryError> {
        if name == OTHER {
            return Err(CategoryError::ImmutableOther);
        }
        let rank = *self
            .ranks_by_name
            .get(name)
            .ok_or_else(|| CategoryError::NotFound(name.to_string()))?;
        let mut category = self
            .categories
            .remove(&rank)
            .ok_or_else(|| CategoryError::Corrupt(format!("no category at rank {rank}")))?;
        self.unindex(rank, &category);

        if let Some(extensions) = update.extensions {
            category.extensions = extensions;
        }
        if let Some(keywords) = update.keywords {
            category.keywords = keywords;
        }
        category.normalize();
        self.index(rank, &category);
        self.categories.insert(rank, category);
        Ok(())
    }

    pub fn categorize(&self, entry: &FileEntry) -> &Category {
        let stem = entry
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        self.lookup(&stem, &entry.extension)
    }

    /// Categorizes a bare file name.
    pub fn categorize_name(&self, file_name: &str) -> &Category {
        let path = Path::new(file_name);
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        self.lookup(&stem, &extension)
    }

    /// Categorizes using an extension that does not come from the file name,
    /// e.g. one inferred from content.
    pub fn categorize_with_hint(&self, entry: &FileEntry, extension: &str) -> &Category {
        let stem = entry
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        self.lookup(&stem, &extension.to_lowercase())
    }

    fn lookup(&self, stem_lower: &str, extension: &str) -> &Category {
        let by_extension = self
            .extension_index
            .get(extension)
            .and_then(|ranks| ranks.first().copied());

        // A keyword rule only wins if it ranks ahead of the extension hit.
        let by_keyword = self
            .keyword_ranks
            .iter()
            .take_while(|rank| by_extension.is_none_or(|ext_rank| **rank < ext_rank))
            .find(|rank| {
                self.categories
                    .get(*rank)
                    .is_some_and(|c| c.matches_keyword(stem_lower))
            })
            .copied();

        by_keyword
            .or(by_extension)
            .and_then(|rank| self.categories.get(&rank))
            .unwrap_or(&self.other)
    }

    /// Confirms every indexed rank still points at a registered category.
    pub fn check_integrity(&self) -> Result<(), CategoryError> {
        let dangling = self
            .extension_index
            .values()
            .flatten()
            .chain(self.keyword_ranks.iter())
            .find(|rank| !self.categories.contains_key(*rank));
        match dangling {
            Some(rank) => Err(CategoryError::Corrupt(format!(
                "index refers to missing rank {rank}"
            ))),
            None => Ok(()),
        }
    }

    fn insert(&mut self, category: Category) {
        let rank = self.next_rank;
        self.next_rank += 1;
        self.index(rank, &category);
        self.ranks_by_name.insert(category.name.clone(), rank);
        self.categories.insert(rank, category);
    }

    fn index(&mut self, rank: u64, category: &Category) {
        for extension in &category.extensions {
            self.extension_index
                .entry(extension.clone())
                .or_default()
                .insert(rank);
        }
        if !category.keywords.is_empty() {
            self.keyword_ranks.insert(rank);
        }
    }

    fn unindex(&mut self, rank: u64, category: &Category) {
        for extension in &category.extensions {
            if let Some(ranks) = self.extension_index.get_mut(extension) {
                ranks.remove(&rank);
                if ranks.is_empty() {
                    self.extension_index.remove(extension);
                }
            }
        }
        self.keyword_ranks.remove(&rank);
    }
}

impl Default for Categorizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared, copy-on-write category table.
///
/// Running operations hold an `Arc` snapshot; edits clone the table only
/// while such a snapshot is alive.
#[derive(Debug, Default)]
pub struct CategoryRegistry {
    current: RwLock<Arc<Categorizer>>,
}

impl CategoryRegistry {
    pub fn new(categorizer: Categorizer) -> Self {
        Self {
            current: RwLock::new(Arc::new(categorizer)),
        }
    }

    pub fn snapshot(&self) -> Arc<Categorizer> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn list(&self) -> Vec<Category> {
        self.snapshot().categories().cloned().collect()
    }

    pub fn add(&self, category: Category) -> Result<(), CategoryError> {
        self.edit(|table| table.add(category))
    }

    pub fn remove(&self, name: &str) -> Result<Category, CategoryError> {
        self.edit(|table| table.remove(name))
    }

    pub fn update(&self, name: &str, update: CategoryUpdate) -> Result<(), CategoryError> {
        self.edit(|table| table.update(name, update))
    }

    fn edit<T>(
        &self,
        apply: impl FnOnce(&mut Categorizer) -> Result<T, CategoryError>,
    ) -> Result<T, CategoryError> {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        apply(Arc::make_mut(&mut guard))
    }
}
