//! agol-backup core - domain types, backup runner, error handling and configuration.

pub mod backup;
pub mod catalog;
pub mod config;
pub mod error;
pub mod models;
pub mod runner;

pub use backup::{
    BackupContext, BackupPlan, BackupStats, ExportOutcome, ItemFailure, ItemOutcome, RunReport,
};
pub use catalog::Catalog;
pub use config::{
    default_config_path, load_config, FileConfig, HttpConfig, WaitPolicy, DEFAULT_PORTAL_URL,
    MAX_ITEMS,
};
pub use error::AppError;
pub use models::{ExportArtifact, ExportJob, Item, ItemType, JobStatus};
pub use runner::BackupRunner;
