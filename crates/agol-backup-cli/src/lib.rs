//! agol-backup CLI - command-line interface for backing up ArcGIS Online content
//!
//! This crate provides the CLI application that ties together all agol-backup components.

pub mod config;
pub mod report;

pub use config::{Config, Settings};
pub use report::RunSummary;
