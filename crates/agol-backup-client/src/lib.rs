//! agol-backup client - HTTP client for the ArcGIS sharing REST API
//!
//! This crate provides [`ArcGisClient`], the network implementation of
//! [`agol_backup_core::Catalog`].
//!
//! # Overview
//!
//! The client handles sign-in, paged search, request building, response
//! parsing and error mapping for ArcGIS Online and ArcGIS Enterprise portals.

pub mod arcgis;

pub use arcgis::ArcGisClient;
