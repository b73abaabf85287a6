// src/lib.rs

//! depotkeep
//!
//! Ingests uploaded archives of depot manifests and scripts, assembles one
//! versioned bundle per catalog title, and keeps the stored bundles in step
//! with the catalog's latest depot revisions.
//!
//! # Architecture
//!
//! - Archive parsing: zip and (compressed) tar containers into typed entries
//! - Assembly: per-title grouping, key resolution, script synthesis
//! - Version store: one unit per title, full replacement on every commit
//! - Reconciliation: scheduled and on-demand drift repair against the catalog
//! - DLC analysis: how much of a title's extension content is tracked
//!
//! Every external system (store, catalog, manifest downloads, key table,
//! rate limiting) sits behind a trait so it can be swapped in tests.

pub mod archive;
pub mod assembler;
pub mod catalog;
pub mod config;
pub mod dlc;
mod error;
pub mod ingest;
pub mod keys;
pub mod model;
pub mod reconcile;
pub mod report;
pub mod script;
pub mod store;

pub use catalog::{Catalog, ManifestSource, TitleMetadata};
pub use dlc::{DlcAnalyzer, DlcReport};
pub use error::{Error, Result};
pub use ingest::Ingestor;
pub use keys::{KeyTable, MemoryKeyTable, SqliteKeyTable};
pub use model::{Bundle, Depot, ManifestFile, TitleId};
pub use reconcile::{ReconcileDaemon, Reconciler};
pub use report::{CommitReport, CommitStatus, IngestReport, PassReport, ReconcileOutcome};
pub use store::{FilesystemStore, MemoryStore, StoreClient, TitleLocks, VersionStore};
