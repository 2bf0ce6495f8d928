//! Leak Harvest Core Library
//!
//! This library implements the pipeline behind the `leakharvest` tool,
//! which walks a leak-intelligence search provider backwards in time
//! and condenses everything it finds into a single reviewable archive.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`search`] - Provider API client: search, bundle export, terminate
//! - [`store`] - SQLite-backed result store with atomic dedup
//! - [`archive`] - Bundle extraction, inventory CSV, final artifact
//! - [`engine`] - Harvest runs: rounds, worker pool, progress
//! - [`fsutil`] - Safe file names, temp workspaces, content sniffing

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod archive;
pub mod engine;
pub mod fsutil;
pub mod search;
pub mod store;

// Re-export commonly used types
pub use engine::{
    DEFAULT_PAGE_LIMIT, DEFAULT_WORKER_THREADS, HarvestError, Harvester, HarvesterConfig,
    RunStatus, RunSummary, StatusSnapshot, Step,
};
pub use search::{DEFAULT_BASE_URL, SearchClient, SearchClientOptions, SearchError, SortOrder};
pub use store::{ResultRecord, ResultStore, StoreError};
