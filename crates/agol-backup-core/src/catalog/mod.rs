//! Remote content catalog abstraction.
//!
//! This module provides:
//!
//! - [`Catalog`]: Trait for the operations a backup run needs from a portal
//! - [`memory::InMemoryCatalog`]: In-memory catalog for testing
//!
//! An authenticated [`Catalog`] value is the session: it is created once at
//! startup and borrowed by every operation of the run.

pub mod memory;

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::error::AppError;
use crate::models::{ExportJob, Item, JobStatus};

/// Operations consumed from a content catalog service.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Runs a search query and returns at most `max_items` results, in the
    /// order the service ranks them.
    async fn search(&self, query: &str, max_items: usize) -> Result<Vec<Item>, AppError>;

    /// Fetches the full metadata record of one item.
    async fn get_item(&self, id: &str) -> Result<Item, AppError>;

    /// Fetches the item's data payload (map definition, app configuration, ...).
    ///
    /// Items without data yield an empty JSON object.
    async fn get_data(&self, item: &Item) -> Result<Value, AppError>;

    /// Requests a server-side export of `item` into a new package item titled `title`.
    async fn export(&self, item: &Item, title: &str, format: &str)
        -> Result<ExportJob, AppError>;

    /// Reports the progress of an export job.
    async fn job_status(&self, job: &ExportJob) -> Result<JobStatus, AppError>;

    /// Downloads the item's file into `dir` as `file_name`, returning the written path.
    async fn download(&self, item: &Item, dir: &Path, file_name: &str)
        -> Result<PathBuf, AppError>;

    /// Deletes the item from the catalog.
    async fn delete(&self, item: &Item) -> Result<(), AppError>;
}
