//! Backup runner: enumerates the catalog and backs up each item in turn.
//!
//! Items are processed strictly one after another. By default the first error
//! aborts the run; with [`BackupContext::keep_going`] set, per-item errors are
//! logged and counted instead.

use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::backup::{
    BackupContext, BackupPlan, ExportOutcome, ItemFailure, ItemOutcome, RunReport,
};
use crate::catalog::Catalog;
use crate::config::MAX_ITEMS;
use crate::error::AppError;
use crate::models::{ExportArtifact, ExportJob, Item, JobStatus, FILE_GEODATABASE};

/// Search query matching every item visible to the signed-in account.
pub const ALL_ITEMS_QUERY: &str = "owner:*";

/// Results requested when looking up an export package by title.
const ARTIFACT_SEARCH_LIMIT: usize = 10;

/// Drives a backup run against a [`Catalog`].
///
/// # Examples
///
/// ```no_run
/// use agol_backup_core::backup::BackupContext;
/// use agol_backup_core::catalog::memory::InMemoryCatalog;
/// use agol_backup_core::runner::BackupRunner;
/// use chrono::Local;
///
/// # async fn example() -> Result<(), agol_backup_core::AppError> {
/// let catalog = InMemoryCatalog::new();
/// let ctx = BackupContext::new("/var/backups/agol", Local::now().date_naive());
/// let report = BackupRunner::new(&catalog, &ctx).run().await?;
/// println!("{} items backed up", report.stats.snapshotted);
/// # Ok(())
/// # }
/// ```
pub struct BackupRunner<'a, C: Catalog> {
    catalog: &'a C,
    ctx: &'a BackupContext,
}

impl<'a, C: Catalog> BackupRunner<'a, C> {
    pub fn new(catalog: &'a C, ctx: &'a BackupContext) -> Self {
        Self { catalog, ctx }
    }

    /// Backs up every eligible item in the catalog.
    ///
    /// # Errors
    ///
    /// Fails if the output directory cannot be created or the catalog cannot
    /// be listed. Without `keep_going`, also fails on the first item error,
    /// leaving earlier items backed up and later ones untouched.
    pub async fn run(&self) -> Result<RunReport, AppError> {
        tokio::fs::create_dir_all(&self.ctx.output_dir).await?;

        info!("Getting hold of items...");
        let items = self.catalog.search(ALL_ITEMS_QUERY, MAX_ITEMS).await?;
        info!("Found {} items", items.len());

        let mut report = RunReport::default();
        if items.len() >= MAX_ITEMS {
            warn!(
                "Catalog listing hit the {} item cap; remaining items are not backed up",
                MAX_ITEMS
            );
            report.truncated = true;
        }

        for item in items {
            match self.process_item(&item).await {
                Ok(outcome) => {
                    if outcome == ItemOutcome::Ignored {
                        debug!("Ignoring {}: {}", item.title, item.item_type);
                        report.ignored.push(item);
                    }
                    report.stats.record(&outcome);
                }
                Err(e) if self.ctx.keep_going => {
                    error!("Failed to back up {}: {}", item.title, e);
                    report.stats.record(&ItemOutcome::Failed);
                    report.failures.push(ItemFailure {
                        title: item.title.clone(),
                        item_type: item.item_type.clone(),
                        error: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        Ok(report)
    }

    /// Classifies one item and performs its backup.
    pub async fn process_item(&self, item: &Item) -> Result<ItemOutcome, AppError> {
        let plan = BackupPlan::for_item(item);
        if plan == BackupPlan::Ignore {
            return Ok(ItemOutcome::Ignored);
        }

        info!("Backing up {}: {}...", item.title, item.item_type);
        self.snapshot(item).await?;

        match plan {
            BackupPlan::SnapshotView => {
                info!("  ignoring view data");
                Ok(ItemOutcome::ViewSkipped)
            }
            BackupPlan::SnapshotAndExport => match self.export(item).await? {
                ExportOutcome::Downloaded { .. } => Ok(ItemOutcome::Exported),
                ExportOutcome::NotFound => Ok(ItemOutcome::ExportNotFound),
            },
            _ => Ok(ItemOutcome::Snapshotted),
        }
    }

    /// Writes the description and data JSON files for `item`.
    ///
    /// Existing files with the same name are overwritten.
    pub async fn snapshot(&self, item: &Item) -> Result<(PathBuf, PathBuf), AppError> {
        info!("...Downloading item JSON");
        let (desc_path, data_path) = self.ctx.snapshot_paths(item);

        // Nothing is written until both documents are in hand.
        let desc = serde_json::to_vec(item)?;
        let data: Value = self.catalog.get_data(item).await?;
        let data = serde_json::to_vec(&data)?;

        tokio::fs::write(&desc_path, desc).await?;
        tokio::fs::write(&data_path, data).await?;

        debug!(
            "Wrote {} and {}",
            desc_path.display(),
            data_path.display()
        );
        Ok((desc_path, data_path))
    }

    /// Exports a feature service to a file geodatabase, downloads the package
    /// and removes it from the catalog.
    pub async fn export(&self, item: &Item) -> Result<ExportOutcome, AppError> {
        info!("...Exporting hosted feature layer");
        let export_name = self.ctx.export_name(item);

        let source = self.catalog.get_item(&item.id).await?;
        let job = self
            .catalog
            .export(&source, &export_name, FILE_GEODATABASE)
            .await?;
        self.wait_for_export(&job, &item.title).await?;

        info!("...Downloading file geodatabase");
        let Some(artifact) = self.find_artifact(&export_name, &job).await? else {
            warn!("...No backup file geodatabase found for {}", item.title);
            return Ok(ExportOutcome::NotFound);
        };

        let path = self.download_and_delete(&artifact).await?;
        Ok(ExportOutcome::Downloaded { path })
    }

    /// Polls the export job with exponential backoff until it completes.
    async fn wait_for_export(&self, job: &ExportJob, title: &str) -> Result<(), AppError> {
        let policy = &self.ctx.wait;
        let started = Instant::now();
        let mut delay = policy.initial_delay;

        loop {
            match self.catalog.job_status(job).await? {
                JobStatus::Completed => {
                    debug!(
                        "Export job {} completed after {:.1}s",
                        job.job_id,
                        started.elapsed().as_secs_f64()
                    );
                    return Ok(());
                }
                JobStatus::Failed(message) => {
                    return Err(AppError::ExportFailed {
                        item: title.to_string(),
                        message,
                    });
                }
                JobStatus::Processing => {}
            }

            let elapsed = started.elapsed();
            if elapsed >= policy.timeout {
                return Err(AppError::ExportTimeout {
                    item: title.to_string(),
                    secs: policy.timeout.as_secs(),
                });
            }

            let pause = delay.min(policy.timeout - elapsed);
            debug!(
                "Export job {} still processing, checking again in {:?}",
                job.job_id, pause
            );
            sleep(pause).await;
            delay = policy.next_delay(delay);
        }
    }

    /// Looks up the export package produced by `job`.
    ///
    /// Portal title search is relevance ranked and tokenized, so results are
    /// narrowed to titles that really start with `export_name`. The item the
    /// job reported as its output wins; otherwise the first prefix match is used.
    async fn find_artifact(
        &self,
        export_name: &str,
        job: &ExportJob,
    ) -> Result<Option<ExportArtifact>, AppError> {
        let query = format!("title:{}*", export_name);
        let results = self.catalog.search(&query, ARTIFACT_SEARCH_LIMIT).await?;

        let candidates: Vec<&Item> = results
            .iter()
            .filter(|candidate| candidate.title.starts_with(export_name))
            .collect();
        let chosen = candidates
            .iter()
            .find(|candidate| candidate.id == job.export_item_id)
            .or_else(|| candidates.first());

        let Some(chosen) = chosen else {
            if !results.is_empty() {
                debug!(
                    "Ignoring {} search results whose titles do not start with {}",
                    results.len(),
                    export_name
                );
            }
            return Ok(None);
        };
        let item = self.catalog.get_item(&chosen.id).await?;
        Ok(Some(ExportArtifact { item }))
    }

    async fn download_and_delete(&self, artifact: &ExportArtifact) -> Result<PathBuf, AppError> {
        let dir: &Path = &self.ctx.output_dir;
        let path = self
            .catalog
            .download(&artifact.item, dir, &artifact.file_name())
            .await?;
        info!("...Saved {}", path.display());

        info!(
            "...Deleting temporary {} ({}) from the portal",
            artifact.item.title, artifact.item.item_type
        );
        self.catalog.delete(&artifact.item).await?;
        Ok(path)
    }
}
