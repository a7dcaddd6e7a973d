//! Backup run context, naming rules and run statistics.
//!
//! This module holds the pure parts of a backup run: how items are
//! classified, what files they produce and how outcomes are tallied. The I/O
//! lives in [`crate::runner`].

use chrono::NaiveDate;
use std::path::PathBuf;

use crate::config::WaitPolicy;
use crate::models::{Item, ItemType};

/// Process-wide state for one backup run.
///
/// Built once at startup and passed by reference to every operation.
#[derive(Debug, Clone)]
pub struct BackupContext {
    pub output_dir: PathBuf,
    pub run_date: NaiveDate,
    pub wait: WaitPolicy,
    /// Log and continue past per-item failures instead of aborting the run.
    pub keep_going: bool,
}

impl BackupContext {
    pub fn new(output_dir: impl Into<PathBuf>, run_date: NaiveDate) -> Self {
        Self {
            output_dir: output_dir.into(),
            run_date,
            wait: WaitPolicy::default(),
            keep_going: false,
        }
    }

    /// Run date as `YYYYMMDD`.
    pub fn date_stamp(&self) -> String {
        self.run_date.format("%Y%m%d").to_string()
    }

    /// Paths of the description and data snapshots for `item`.
    ///
    /// # Examples
    ///
    /// ```
    /// use agol_backup_core::backup::BackupContext;
    /// use agol_backup_core::models::{Item, ItemType};
    /// use chrono::NaiveDate;
    ///
    /// let ctx = BackupContext::new("/backups", NaiveDate::from_ymd_opt(2024, 3, 9).unwrap());
    /// let item = Item::new("1", "Ops View", ItemType::Dashboard);
    /// let (desc, data) = ctx.snapshot_paths(&item);
    /// assert!(desc.ends_with("20240309-Ops_View-Dashboard-desc.json"));
    /// assert!(data.ends_with("20240309-Ops_View-Dashboard-data.json"));
    /// ```
    pub fn snapshot_paths(&self, item: &Item) -> (PathBuf, PathBuf) {
        let stem = format!(
            "{}-{}-{}",
            self.date_stamp(),
            underscored(&item.title),
            underscored(item.item_type.as_str())
        );
        (
            self.output_dir.join(format!("{}-desc.json", stem)),
            self.output_dir.join(format!("{}-data.json", stem)),
        )
    }

    /// Title given to the package produced by exporting `item`.
    pub fn export_name(&self, item: &Item) -> String {
        format!("{}-{}", self.date_stamp(), underscored(&item.title))
    }
}

/// Replaces spaces with underscores. Other characters are kept as-is.
fn underscored(s: &str) -> String {
    s.replace(' ', "_")
}

/// What a run does with one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupPlan {
    /// Type outside the allow-list; reported at the end of the run.
    Ignore,
    /// Write the JSON snapshots only.
    Snapshot,
    /// Feature service view: snapshots only, its data belongs to the source service.
    SnapshotView,
    /// Feature service: snapshots plus a geodatabase export.
    SnapshotAndExport,
}

impl BackupPlan {
    pub fn for_item(item: &Item) -> Self {
        match item.item_type {
            ItemType::FeatureService if item.is_view() => BackupPlan::SnapshotView,
            ItemType::FeatureService => BackupPlan::SnapshotAndExport,
            ref t if t.is_backed_up() => BackupPlan::Snapshot,
            _ => BackupPlan::Ignore,
        }
    }
}

/// Result of exporting one feature service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportOutcome {
    /// Package downloaded to `path` and removed from the catalog.
    Downloaded { path: PathBuf },
    /// The export finished but no package could be located. Not an error.
    NotFound,
}

/// Outcome of processing a single item during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Ignored,
    Snapshotted,
    ViewSkipped,
    Exported,
    ExportNotFound,
    Failed,
}

/// Statistics for a backup run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BackupStats {
    pub snapshotted: usize,
    pub views_skipped: usize,
    pub exported: usize,
    pub export_not_found: usize,
    pub ignored: usize,
    pub failed: usize,
}

impl BackupStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an outcome, incrementing the appropriate counter.
    ///
    /// Views, exports and missing exports also count as snapshotted, since
    /// every one of them had its JSON written first.
    pub fn record(&mut self, outcome: &ItemOutcome) {
        match outcome {
            ItemOutcome::Ignored => self.ignored += 1,
            ItemOutcome::Snapshotted => self.snapshotted += 1,
            ItemOutcome::ViewSkipped => {
                self.snapshotted += 1;
                self.views_skipped += 1;
            }
            ItemOutcome::Exported => {
                self.snapshotted += 1;
                self.exported += 1;
            }
            ItemOutcome::ExportNotFound => {
                self.snapshotted += 1;
                self.export_not_found += 1;
            }
            ItemOutcome::Failed => self.failed += 1,
        }
    }

    /// Total items seen by the run.
    pub fn total(&self) -> usize {
        self.snapshotted + self.ignored + self.failed
    }
}

/// A per-item failure tolerated because the run was started with `keep_going`.
#[derive(Debug, Clone)]
pub struct ItemFailure {
    pub title: String,
    pub item_type: ItemType,
    pub error: String,
}

/// Everything a finished run reports back.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub stats: BackupStats,
    /// Items outside the allow-list, in catalog order.
    pub ignored: Vec<Item>,
    pub failures: Vec<ItemFailure>,
    /// Set when the listing reached [`crate::config::MAX_ITEMS`] and later items were dropped.
    pub truncated: bool,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}
