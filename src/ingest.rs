// src/ingest.rs

//! Archive ingestion
//!
//! One call takes an uploaded archive through the whole pipeline:
//! parse, group per title, assemble and commit. Titles are committed one at a
//! time in archive order, each under its title lock, so two titles are never
//! interleaved in the store. Only archive-level failures abort the call;
//! everything else lands in the [`IngestReport`].

use crate::archive::parse_archive;
use crate::assembler::Assembler;
use crate::catalog::Catalog;
use crate::error::{Error, Result};
use crate::keys::KeyTable;
use crate::model::TitleId;
use crate::report::{CommitReport, CommitStatus, IngestReport};
use crate::store::StoreClient;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

pub struct Ingestor {
    store: StoreClient,
    key_table: Arc<dyn KeyTable>,
    catalog: Option<Arc<dyn Catalog>>,
    clock: Option<fn() -> u64>,
}

impl Ingestor {
    pub fn new(store: StoreClient, key_table: Arc<dyn KeyTable>) -> Self {
        Self {
            store,
            key_table,
            catalog: None,
            clock: None,
        }
    }

    /// Look up display names in the catalog while ingesting
    pub fn with_catalog(mut self, catalog: Arc<dyn Catalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Clock for synthesized manifest revisions
    pub fn with_clock(mut self, clock: fn() -> u64) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Ingest an archive file from disk
    pub async fn ingest_file(&self, path: impl AsRef<Path>) -> Result<IngestReport> {
        let path = path.as_ref();
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| Error::IoError(format!("Failed to read archive {}: {e}", path.display())))?;
        self.ingest(&data).await
    }

    /// Ingest an in-memory archive
    pub async fn ingest(&self, data: &[u8]) -> Result<IngestReport> {
        let parsed = parse_archive(data)?;
        let keys_before = self.key_count();

        let mut assembler = Assembler::new(self.key_table.as_ref());
        if let Some(clock) = self.clock {
            assembler = assembler.with_clock(clock);
        }

        let mut report = IngestReport::default();
        let (aux_tables, table_errors) = assembler.import_key_tables(&parsed.key_tables);
        report.parse_errors.extend(table_errors);

        let grouping = assembler.group(&parsed);
        report.parse_errors.extend(grouping.parse_errors);
        report.unmatched_manifests = grouping.unmatched_manifests;

        for group in &grouping.groups {
            let title_id = &group.title_id;
            let guard = match self.store.lock(title_id).await {
                Ok(guard) => guard,
                Err(e) => {
                    warn!("Cannot lock title {}: {}", title_id, e);
                    report.titles.push(failed(title_id, 0, Vec::new(), e));
                    continue;
                }
            };

            let previous_script = match self.store.read(title_id).await {
                Ok(unit) => unit.and_then(|u| u.script()),
                Err(e) => {
                    warn!("Cannot read stored unit for title {}: {}", title_id, e);
                    None
                }
            };
            let title_name = self.title_name(title_id).await;

            let assembly = match assembler.assemble_title(
                group,
                &aux_tables,
                previous_script.as_deref(),
                title_name.as_deref(),
            ) {
                Ok(assembly) => assembly,
                Err(e) => {
                    warn!("Failed to assemble title {}: {}", title_id, e);
                    report.titles.push(failed(title_id, 0, Vec::new(), e));
                    continue;
                }
            };

            let Some(bundle) = assembly.bundle else {
                report.titles.push(CommitReport {
                    title_affected: title_id.clone(),
                    status: CommitStatus::Skipped,
                    depot_count: 0,
                    skipped_depot_count: assembly.unresolved_keys.len(),
                    unresolved_keys: assembly.unresolved_keys,
                    synthesized_revisions: Vec::new(),
                    errors: vec!["no depot with a resolvable key".to_string()],
                    digest: None,
                });
                continue;
            };

            match self.store.commit_held(&guard, &bundle).await {
                Ok(outcome) => report.titles.push(CommitReport {
                    title_affected: title_id.clone(),
                    status: if outcome.created {
                        CommitStatus::Created
                    } else {
                        CommitStatus::Updated
                    },
                    depot_count: bundle.depots.len(),
                    skipped_depot_count: bundle.skipped_depot_count,
                    unresolved_keys: assembly.unresolved_keys,
                    synthesized_revisions: assembly.synthesized_revisions,
                    errors: Vec::new(),
                    digest: Some(outcome.digest),
                }),
                Err(e) => {
                    warn!("Commit of title {} failed: {}", title_id, e);
                    report.titles.push(failed(
                        title_id,
                        bundle.skipped_depot_count,
                        assembly.unresolved_keys,
                        e,
                    ));
                }
            }
        }

        report.keys_learned = self.key_count().saturating_sub(keys_before);

        info!(
            "Ingestion done: {} created, {} updated, {} awaiting key(s), {} parse error(s)",
            report.created().count(),
            report.updated().count(),
            report.unresolved_keys().len(),
            report.parse_errors.len()
        );
        Ok(report)
    }

    /// Display name from the catalog; store-only when the catalog is down
    async fn title_name(&self, title_id: &TitleId) -> Option<String> {
        let catalog = self.catalog.as_ref()?;
        match catalog.get_title_metadata(title_id).await {
            Ok(metadata) => metadata.and_then(|m| m.name),
            Err(e) => {
                warn!("Catalog lookup for title {} failed, continuing without it: {}", title_id, e);
                None
            }
        }
    }

    fn key_count(&self) -> usize {
        self.key_table.len().unwrap_or_else(|e| {
            warn!("Cannot count key table entries: {}", e);
            0
        })
    }
}

fn failed(
    title_id: &TitleId,
    skipped_depot_count: usize,
    unresolved_keys: Vec<crate::report::UnresolvedKey>,
    error: Error,
) -> CommitReport {
    CommitReport {
        title_affected: title_id.clone(),
        status: CommitStatus::Failed,
        depot_count: 0,
        skipped_depot_count,
        unresolved_keys,
        synthesized_revisions: Vec::new(),
        errors: vec![error.to_string()],
        digest: None,
    }
}
