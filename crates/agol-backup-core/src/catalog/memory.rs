//! In-memory catalog implementation for testing.
//!
//! [`InMemoryCatalog`] keeps items, data payloads and export jobs in a single
//! lock and records every call, so tests can assert on the order of remote
//! operations.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: nothing leaves the process
//! - **Queries**: only `owner:*` and `title:<prefix>*` are understood
//! - **Downloads** write a small placeholder file

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::Catalog;
use crate::error::AppError;
use crate::models::{ExportJob, Item, ItemType, JobStatus, FILE_GEODATABASE};

/// How the catalog responds to an export request for a given item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportBehavior {
    /// Job reports `processing` for the given number of polls, then completes
    /// and the package item becomes searchable.
    Complete { polls_before_done: u32 },
    /// Job completes but the package never shows up in search results.
    CompleteWithoutArtifact,
    /// Job reports failure on the first poll.
    Fail(String),
    /// Job never leaves `processing`.
    NeverComplete,
}

impl Default for ExportBehavior {
    fn default() -> Self {
        ExportBehavior::Complete {
            polls_before_done: 0,
        }
    }
}

/// A recorded catalog operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogCall {
    Search(String),
    GetItem(String),
    GetData(String),
    Export { item_id: String, title: String },
    JobStatus(String),
    Download { item_id: String, file_name: String },
    Delete(String),
}

#[derive(Debug)]
struct PendingJob {
    source_id: String,
    title: String,
    behavior: ExportBehavior,
    polls: u32,
    published: bool,
}

#[derive(Debug, Default)]
struct CatalogState {
    items: Vec<Item>,
    data: HashMap<String, Value>,
    behaviors: HashMap<String, ExportBehavior>,
    failing_data: HashMap<String, String>,
    jobs: HashMap<String, PendingJob>,
    calls: Vec<CatalogCall>,
    next_job: u64,
}

/// In-memory catalog for testing.
///
/// ## Example
///
/// ```rust
/// use agol_backup_core::catalog::memory::InMemoryCatalog;
/// use agol_backup_core::models::{Item, ItemType};
/// use serde_json::json;
///
/// let catalog = InMemoryCatalog::new();
/// catalog.add_item(
///     Item::new("map-1", "City Map", ItemType::WebMap),
///     json!({"operationalLayers": []}),
/// );
/// assert_eq!(catalog.items().len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    state: Mutex<CatalogState>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CatalogState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds an item together with its data payload.
    pub fn add_item(&self, item: Item, data: Value) {
        let mut state = self.lock();
        state.data.insert(item.id.clone(), data);
        state.items.push(item);
    }

    /// Sets how export requests for `item_id` behave.
    pub fn set_export_behavior(&self, item_id: &str, behavior: ExportBehavior) {
        self.lock()
            .behaviors
            .insert(item_id.to_string(), behavior);
    }

    /// Makes data requests for `item_id` fail with the given message.
    pub fn fail_data_for(&self, item_id: &str, message: &str) {
        self.lock()
            .failing_data
            .insert(item_id.to_string(), message.to_string());
    }

    /// Snapshot of the items currently in the catalog.
    pub fn items(&self) -> Vec<Item> {
        self.lock().items.clone()
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<CatalogCall> {
        self.lock().calls.clone()
    }

    fn record(&self, call: CatalogCall) {
        self.lock().calls.push(call);
    }

    fn publish_artifact(state: &mut CatalogState, job_id: &str) {
        let Some(job) = state.jobs.get_mut(job_id) else {
            return;
        };
        if job.published || job.behavior == ExportBehavior::CompleteWithoutArtifact {
            return;
        }
        job.published = true;

        let owner = state
            .items
            .iter()
            .find(|i| i.id == job.source_id)
            .and_then(|i| i.owner().map(str::to_string));
        let mut item = Item::new(job_id, job.title.clone(), ItemType::from(FILE_GEODATABASE))
            .with_field("name", json!(format!("{}.zip", job.title)));
        if let Some(owner) = owner {
            item = item.with_field("owner", json!(owner));
        }
        state.items.push(item);
    }
}

fn matches_query(item: &Item, query: &str) -> bool {
    if query == "owner:*" {
        return true;
    }
    if let Some(prefix) = query
        .strip_prefix("title:")
        .and_then(|rest| rest.strip_suffix('*'))
    {
        return item.title.starts_with(prefix);
    }
    false
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn search(&self, query: &str, max_items: usize) -> Result<Vec<Item>, AppError> {
        self.record(CatalogCall::Search(query.to_string()));
        let state = self.lock();
        Ok(state
            .items
            .iter()
            .filter(|item| matches_query(item, query))
            .take(max_items)
            .cloned()
            .collect())
    }

    async fn get_item(&self, id: &str) -> Result<Item, AppError> {
        self.record(CatalogCall::GetItem(id.to_string()));
        self.lock()
            .items
            .iter()
            .find(|item| item.id == id)
            .cloned()
            .ok_or_else(|| AppError::ApiError {
                code: 400,
                message: format!("Item does not exist or is inaccessible: {}", id),
            })
    }

    async fn get_data(&self, item: &Item) -> Result<Value, AppError> {
        self.record(CatalogCall::GetData(item.id.clone()));
        let state = self.lock();
        if let Some(message) = state.failing_data.get(&item.id) {
            return Err(AppError::ClientError(message.clone()));
        }
        Ok(state
            .data
            .get(&item.id)
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new())))
    }

    async fn export(
        &self,
        item: &Item,
        title: &str,
        _format: &str,
    ) -> Result<ExportJob, AppError> {
        self.record(CatalogCall::Export {
            item_id: item.id.clone(),
            title: title.to_string(),
        });
        let mut state = self.lock();
        state.next_job += 1;
        let job_id = format!("job-{}", state.next_job);
        let behavior = state
            .behaviors
            .get(&item.id)
            .cloned()
            .unwrap_or_default();
        state.jobs.insert(
            job_id.clone(),
            PendingJob {
                source_id: item.id.clone(),
                title: title.to_string(),
                behavior,
                polls: 0,
                published: false,
            },
        );
        Ok(ExportJob {
            export_item_id: job_id.clone(),
            job_id,
        })
    }

    async fn job_status(&self, job: &ExportJob) -> Result<JobStatus, AppError> {
        self.record(CatalogCall::JobStatus(job.job_id.clone()));
        let mut state = self.lock();
        let pending = state
            .jobs
            .get_mut(&job.job_id)
            .ok_or_else(|| AppError::Generic(format!("unknown job {}", job.job_id)))?;
        pending.polls += 1;

        let status = match &pending.behavior {
            ExportBehavior::Complete { polls_before_done } => {
                if pending.polls > *polls_before_done {
                    JobStatus::Completed
                } else {
                    JobStatus::Processing
                }
            }
            ExportBehavior::CompleteWithoutArtifact => JobStatus::Completed,
            ExportBehavior::Fail(message) => JobStatus::Failed(message.clone()),
            ExportBehavior::NeverComplete => JobStatus::Processing,
        };

        if status == JobStatus::Completed {
            Self::publish_artifact(&mut state, &job.job_id);
        }
        Ok(status)
    }

    async fn download(
        &self,
        item: &Item,
        dir: &Path,
        file_name: &str,
    ) -> Result<PathBuf, AppError> {
        self.record(CatalogCall::Download {
            item_id: item.id.clone(),
            file_name: file_name.to_string(),
        });
        let path = dir.join(file_name);
        tokio::fs::write(&path, b"PK\x03\x04").await?;
        Ok(path)
    }

    async fn delete(&self, item: &Item) -> Result<(), AppError> {
        self.record(CatalogCall::Delete(item.id.clone()));
        let mut state = self.lock();
        let before = state.items.len();
        state.items.retain(|i| i.id != item.id);
        if state.items.len() == before {
            return Err(AppError::ApiError {
                code: 400,
                message: format!("Item does not exist or is inaccessible: {}", item.id),
            });
        }
        Ok(())
    }
}
