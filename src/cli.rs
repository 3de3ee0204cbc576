//! Command-line interface for tidytree.
//!
//! A thin front end over [`JobRunner`]: it parses arguments, loads the
//! configuration, starts work and renders the results. It holds no
//! organizing logic of its own.

use crate::clock::SystemClock;
use crate::config::Config;
use crate::duplicates::filter_by_size;
use crate::jobs::JobRunner;
use crate::operation::{Mode, OperationId, Outcome, Scheme};
use crate::output::OutputFormatter;
use crate::repository::{JsonRepository, Repository};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "tidytree", version, about = "Sort a directory tree into an organized layout")]
pub struct Cli {
    /// Configuration file (defaults to ./.tidytreerc.toml, then ~/.config/tidytree/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Where operation history is kept
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Organize a directory into <dir>/Organized
    Organize {
        path: PathBuf,

        #[arg(long, value_enum)]
        mode: Option<Mode>,

        #[arg(long, value_enum)]
        scheme: Option<Scheme>,

        /// Show what would happen without touching any file
        #[arg(long)]
        dry_run: bool,

        /// Leave duplicates where the scheme puts them
        #[arg(long)]
        no_duplicates: bool,

        /// Extra folder name or absolute path to skip (repeatable)
        #[arg(short, long = "exclude")]
        exclude: Vec<String>,

        /// Only organize files with this extension (repeatable)
        #[arg(long = "ext")]
        extensions: Vec<String>,

        /// Only organize files of at least this many bytes
        #[arg(long)]
        min_size: Option<u64>,

        /// Only organize files of at most this many bytes
        #[arg(long)]
        max_size: Option<u64>,

        /// Only organize files modified at or after this RFC 3339 time
        #[arg(long)]
        modified_after: Option<DateTime<Utc>>,

        /// Only organize files modified at or before this RFC 3339 time
        #[arg(long)]
        modified_before: Option<DateTime<Utc>>,

        /// Warn after this many seconds
        #[arg(long)]
        soft_timeout: Option<u64>,

        /// Stop after this many seconds
        #[arg(long)]
        hard_timeout: Option<u64>,
    },
    /// Undo an operation
    Rollback { id: OperationId },
    /// List recorded operations
    History,
    /// Show the status of an operation
    Status { id: OperationId },
    /// List the category table
    Categories,
    /// List the duplicate groups found by an operation
    Duplicates {
        id: OperationId,

        /// Hide groups of files smaller than this many bytes
        #[arg(long, default_value_t = 0)]
        min_size: u64,

        /// Hide groups of files larger than this many bytes
        #[arg(long)]
        max_size: Option<u64>,
    },
}

/// Runs a parsed command line.
///
/// # Examples
///
/// ```no_run
/// use clap::Parser;
/// use tidytree::cli::{Cli, run_cli};
///
/// let cli = Cli::parse_from(["tidytree", "organize", "/path/to/directory", "--dry-run"]);
/// if let Err(e) = run_cli(cli) {
///     eprintln!("Error: {}", e);
/// }
/// ```
pub fn run_cli(cli: Cli) -> Result<(), String> {
    let config = Config::load(cli.config.as_deref())
        .map_err(|e| format!("Error loading configuration: {}", e))?;
    let state_dir = cli
        .state_dir
        .clone()
        .unwrap_or_else(|| config.engine.state_dir());
    let repository = Arc::new(
        JsonRepository::open(&state_dir)
            .map_err(|e| format!("Error opening history in {}: {}", state_dir.display(), e))?,
    );
    let categorizer = config
        .categorizer()
        .map_err(|e| format!("Error in category configuration: {}", e))?;
    let runner = JobRunner::new(
        repository.clone(),
        categorizer,
        Arc::new(SystemClock),
        config.engine.clone(),
    );

    match cli.command {
        Command::Organize {
            path,
            mode,
            scheme,
            dry_run,
            no_duplicates,
            exclude,
            extensions,
            min_size,
            max_size,
            modified_after,
            modified_before,
            soft_timeout,
            hard_timeout,
        } => {
            let mut request = config.request(&path);
            if let Some(mode) = mode {
                request.mode = mode;
            }
            if let Some(scheme) = scheme {
                request.scheme = scheme;
            }
            request.dry_run |= dry_run;
            request.detect_duplicates &= !no_duplicates;
            for exclusion in &exclude {
                request.exclusions.add(exclusion);
            }
            if !extensions.is_empty() {
                request.filter.extensions = extensions;
            }
            if let Some(min) = min_size {
                request.filter.min_size = min;
            }
            request.filter.max_size = max_size.or(request.filter.max_size);
            request.filter.modified_after = modified_after.or(request.filter.modified_after);
            request.filter.modified_before = modified_before.or(request.filter.modified_before);
            if let Some(secs) = soft_timeout {
                request.soft_timeout = Some(Duration::from_secs(secs));
            }
            if let Some(secs) = hard_timeout {
                request.hard_timeout = Some(Duration::from_secs(secs));
            }
            organize(&runner, repository.as_ref(), request)
        }
        Command::Rollback { id } => {
            OutputFormatter::info(&format!("Rolling back operation {}...", id));
            let result = runner.rollback_operation(id).map_err(|e| e.to_string())?;
            OutputFormatter::rollback_report(&result);
            if result.is_complete_success() {
                OutputFormatter::success("Rollback complete!");
                Ok(())
            } else {
                Err("Some files could not be restored. Fix the issues above and run rollback again."
                    .to_string())
            }
        }
        Command::History => {
            let operations = runner.list_operations().map_err(|e| e.to_string())?;
            OutputFormatter::history(&operations);
            Ok(())
        }
        Command::Status { id } => {
            let report = runner.operation_status(id).map_err(|e| e.to_string())?;
            OutputFormatter::status_report(&report);
            Ok(())
        }
        Command::Categories => {
            OutputFormatter::categories(&runner.list_categories());
            Ok(())
        }
        Command::Duplicates {
            id,
            min_size,
            max_size,
        } => {
            let groups = runner.list_duplicate_groups(id).map_err(|e| e.to_string())?;
            OutputFormatter::duplicate_groups(&filter_by_size(groups, min_size, max_size));
            Ok(())
        }
    }
}

fn organize(
    runner: &JobRunner,
    repository: &dyn Repository,
    request: crate::operation::OperationRequest,
) -> Result<(), String> {
    let dry_run = request.dry_run;
    if dry_run {
        OutputFormatter::dry_run_notice(&format!("Analyzing {}", request.root.display()));
    } else {
        OutputFormatter::info(&format!("Organizing contents of: {}", request.root.display()));
    }

    let id = runner.start_operation(request).map_err(|e| e.to_string())?;
    let pb = OutputFormatter::create_progress_bar();
    for event in runner.subscribe_progress(id).map_err(|e| e.to_string())? {
        OutputFormatter::update_progress(&pb, &event);
    }
    pb.finish_and_clear();

    let report = runner.wait(id).map_err(|e| e.to_string())?;
    let records = repository.records(id).map_err(|e| e.to_string())?;
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for record in &records {
        let placed = matches!(
            record.outcome,
            Outcome::Moved | Outcome::Copied | Outcome::WouldMove
        );
        if placed {
            let bucket = if record.duplicate_of.is_some() {
                "Duplicates".to_string()
            } else {
                record.category.clone()
            };
            *counts.entry(bucket).or_insert(0) += 1;
        }
    }
    OutputFormatter::summary_table(&counts, counts.values().sum());
    OutputFormatter::status_report(&report);

    let duplicates = records.iter().filter(|r| r.duplicate_of.is_some()).count();
    if duplicates > 0 {
        OutputFormatter::info(&format!(
            "{} duplicate(s) found. Run 'tidytree duplicates {}' for details.",
            duplicates, id
        ));
    }
    if dry_run {
        OutputFormatter::dry_run_notice("No files were modified.");
    } else if !records.is_empty() {
        OutputFormatter::info(&format!(
            "Run 'tidytree rollback {}' to revert these changes.",
            id
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_organize_flags() {
        let cli = Cli::parse_from([
            "tidytree",
            "organize",
            "/tmp/downloads",
            "--mode",
            "copy",
            "--scheme",
            "category-year",
            "--dry-run",
            "-e",
            "build",
            "--ext",
            "pdf",
            "--max-size",
            "2048",
            "--modified-after",
            "2024-01-01T00:00:00Z",
        ]);
        match cli.command {
            Command::Organize {
                path,
                mode,
                scheme,
                dry_run,
                exclude,
                extensions,
                max_size,
                modified_after,
                ..
            } => {
                assert_eq!(path, PathBuf::from("/tmp/downloads"));
                assert_eq!(mode, Some(Mode::Copy));
                assert_eq!(scheme, Some(Scheme::CategoryYear));
                assert!(dry_run);
                assert_eq!(exclude, vec!["build".to_string()]);
                assert_eq!(extensions, vec!["pdf".to_string()]);
                assert_eq!(max_size, Some(2048));
                assert_eq!(
                    modified_after.map(|t| t.timestamp()),
                    Some(1_704_067_200)
                );
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_rollback_id() {
        let id = OperationId::new();
        let cli = Cli::parse_from(["tidytree", "rollback", &id.to_string()]);
        assert!(matches!(cli.command, Command::Rollback { id: parsed } if parsed == id));
    }

    #[test]
    fn test_parse_duplicates_size_range() {
        let id = OperationId::new();
        let cli = Cli::parse_from([
            "tidytree",
            "duplicates",
            &id.to_string(),
            "--min-size",
            "1024",
        ]);
        match cli.command {
            Command::Duplicates {
                id: parsed,
                min_size,
                max_size,
            } => {
                assert_eq!(parsed, id);
                assert_eq!(min_size, 1024);
                assert_eq!(max_size, None);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
