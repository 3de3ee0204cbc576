//! Output formatting and styling module.
//!
//! Provides a centralized interface for all CLI output, including colored output,
//! progress tracking, and formatted tables. The engine never prints; only the
//! command-line front end goes through here.

use crate::category::Category;
use crate::duplicates::{DuplicateGroup, DuplicateStats};
use crate::jobs::StatusReport;
use crate::operation::{Operation, OperationStatus, ProgressEvent};
use crate::rollback::RollbackResult;
use colored::*;
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use std::collections::BTreeMap;

/// Manages all CLI output with consistent styling and formatting.
///
/// This struct provides methods for:
/// - Status lines (success, error, warning, info)
/// - A progress bar fed by operation progress events
/// - Summary tables and listings of operations, duplicates and categories
pub struct OutputFormatter;

impl OutputFormatter {
    /// Prints a success message in green with a checkmark.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use tidytree::output::OutputFormatter;
    /// OutputFormatter::success("Rollback complete");
    /// ```
    pub fn success(message: &str) {
        println!("{} {}", "✓".green(), message);
    }

    /// Prints an error message in red with an X mark.
    ///
    /// # Arguments
    ///
    /// * `message` - The message to display
    ///
    /// # Example
    ///
    /// ```no_run
    /// use tidytree::output::OutputFormatter;
    /// OutputFormatter::error("Failed to open history");
    /// ```
    pub fn error(message: &str) {
        eprintln!("{} {}", "✗".red(), message);
    }

    /// Prints a warning message in yellow with a warning symbol.
    ///
    /// # Arguments
    ///
    /// * `message` - The message to display
    pub fn warning(message: &str) {
        println!("{} {}", "⚠".yellow(), message);
    }

    /// Prints an info message in cyan.
    ///
    /// # Arguments
    ///
    /// * `message` - The message to display
    ///
    /// # Example
    ///
    /// ```no_run
    /// use tidytree::output::OutputFormatter;
    /// OutputFormatter::info("Organizing contents of: /home/user/Downloads");
    /// ```
    pub fn info(message: &str) {
        println!("{}", message.cyan());
    }

    /// Prints a bold section header preceded by a blank line.
    ///
    /// # Arguments
    ///
    /// * `header` - The header text to display
    pub fn header(header: &str) {
        println!("\n{}", header.bold());
    }

    /// Prints a yellow message prefixed with `[DRY RUN]`.
    pub fn dry_run_notice(message: &str) {
        println!("{}", format!("[DRY RUN] {}", message).yellow());
    }

    /// Creates a progress bar for an organize run. The length is set once
    /// scanning knows how many files there are.
    pub fn create_progress_bar() -> ProgressBar {
        let pb = ProgressBar::new(0);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.cyan} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓░");
        pb.set_style(style);
        pb
    }

    /// Applies one progress event to `pb`.
    ///
    /// While scanning the bar only counts files found; afterwards it tracks
    /// processed files against the total.
    pub fn update_progress(pb: &ProgressBar, event: &ProgressEvent) {
        match event.status {
            OperationStatus::Scanning => {
                pb.set_message(format!("scanning ({} files found)", event.scanned));
            }
            status => {
                pb.set_length(event.total);
                pb.set_position(event.processed);
                let mut message = status.label().to_string();
                if event.timeout_warning {
                    message.push_str(" (taking longer than expected)");
                }
                pb.set_message(message);
            }
        }
    }

    /// Prints a summary table with file counts by category.
    ///
    /// # Arguments
    ///
    /// * `category_counts` - Files placed per category, in display order
    /// * `total_files` - The total shown in the last row
    ///
    /// # Example
    ///
    /// ```no_run
    /// use std::collections::BTreeMap;
    /// use tidytree::output::OutputFormatter;
    ///
    /// let mut counts = BTreeMap::new();
    /// counts.insert("Images".to_string(), 10);
    /// counts.insert("Documents".to_string(), 5);
    /// OutputFormatter::summary_table(&counts, 15);
    /// ```
    pub fn summary_table(category_counts: &BTreeMap<String, usize>, total_files: usize) {
        Self::header("SUMMARY");

        let max_category_len = category_counts
            .keys()
            .map(|name| name.len())
            .max()
            .unwrap_or(0)
            .max(8); // At least "Category" width

        println!(
            "{:<width$} | {}",
            "Category".bold(),
            "Files".bold(),
            width = max_category_len
        );
        println!("{}", "-".repeat(max_category_len + 10));

        for (category, count) in category_counts {
            println!(
                "{:<width$} | {} {}",
                category,
                count.to_string().green(),
                plural(*count),
                width = max_category_len
            );
        }

        println!("{}", "-".repeat(max_category_len + 10));
        println!(
            "{:<width$} | {} {}",
            "Total".bold(),
            total_files.to_string().green().bold(),
            plural(total_files),
            width = max_category_len
        );
    }

    /// Prints the outcome of a finished operation.
    ///
    /// The headline is green for a clean run, yellow for a completed run
    /// with failures or a cancelled one, and red otherwise. Per-file errors
    /// follow on stderr.
    pub fn status_report(report: &StatusReport) {
        let line = format!(
            "Operation {} {}: {}/{} processed, {} failed, {} skipped",
            report.operation_id,
            report.status.label(),
            report.processed,
            report.total,
            report.failed,
            report.skipped
        );
        match report.status {
            OperationStatus::Completed if report.failed == 0 => Self::success(&line),
            OperationStatus::Completed | OperationStatus::Cancelled => Self::warning(&line),
            _ => Self::error(&line),
        }
        if let Some(failure) = &report.failure {
            Self::error(failure);
        }
        if report.timeout_warning {
            Self::warning("The operation exceeded its soft time limit");
        }
        for error in &report.errors {
            eprintln!("    - {}: {}", error.path.display(), error.message);
        }
    }

    /// Lists duplicate groups, the kept original first, followed by totals.
    ///
    /// # Arguments
    ///
    /// * `groups` - Groups in scan order of their originals
    pub fn duplicate_groups(groups: &[DuplicateGroup]) {
        if groups.is_empty() {
            Self::info("No duplicates found.");
            return;
        }
        Self::header("DUPLICATES");
        for group in groups {
            println!(
                "{} ({} bytes each, {} reclaimable)",
                group.hash.get(..12).unwrap_or(&group.hash).dimmed(),
                group.size,
                group.reclaimable_bytes().to_string().green()
            );
            println!("  keep   {}", group.original().display());
            for member in group.redundant() {
                println!("  {} {}", "recycle".yellow(), member.display());
            }
        }
        let stats = DuplicateStats::from_groups(groups);
        println!(
            "\n{} reclaimable in {} groups ({} redundant of {} files, largest group {}, most common size {})",
            HumanBytes(stats.reclaimable_bytes).to_string().green().bold(),
            stats.total_groups,
            stats.redundant_files,
            stats.grouped_files,
            stats.largest_group,
            HumanBytes(stats.most_common_size)
        );
    }

    /// Prints the counters of a rollback and every file it could not restore.
    ///
    /// # Arguments
    ///
    /// * `result` - The result returned by the rollback
    pub fn rollback_report(result: &RollbackResult) {
        println!("  Restored: {}", result.reverted);
        if result.already_reverted > 0 {
            println!("  Already restored: {}", result.already_reverted);
        }
        if result.already_missing > 0 {
            println!("  Missing: {}", result.already_missing);
        }
        if !result.failures.is_empty() {
            println!("  Failed: {}", result.failed);
            for failure in &result.failures {
                eprintln!("    - {}: {}", failure.path.display(), failure.reason);
            }
        }
    }

    /// Lists recorded operations, one line each, in the order given.
    ///
    /// # Arguments
    ///
    /// * `operations` - The operations to list
    pub fn history(operations: &[Operation]) {
        if operations.is_empty() {
            Self::info("No operations recorded yet.");
            return;
        }
        Self::header("HISTORY");
        for op in operations {
            let status = match op.status {
                OperationStatus::Completed => op.status.label().green(),
                OperationStatus::RolledBack => op.status.label().cyan(),
                OperationStatus::Failed => op.status.label().red(),
                _ => op.status.label().yellow(),
            };
            println!(
                "{}  {}  {:<12} {}{}",
                op.id,
                op.created_at.format("%Y-%m-%d %H:%M"),
                status,
                op.root.display(),
                if op.dry_run { " (dry run)" } else { "" }
            );
        }
    }

    /// Lists the category table in match order with each rule.
    ///
    /// # Arguments
    ///
    /// * `categories` - Categories in registration order
    pub fn categories(categories: &[Category]) {
        Self::header("CATEGORIES");
        for category in categories {
            let mut rule = category.extensions.join(", ");
            if !category.keywords.is_empty() {
                if !rule.is_empty() {
                    rule.push_str("; ");
                }
                rule.push_str(&format!("keywords: {}", category.keywords.join(", ")));
            }
            let name = if category.is_custom {
                format!("{} (custom)", category.name)
            } else {
                category.name.clone()
            };
            println!("{:<24} {}", name.bold(), rule.dimmed());
        }
    }
}

fn plural(count: usize) -> &'static str {
    if count == 1 { "file" } else { "files" }
}
