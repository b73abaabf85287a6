// src/reconcile/mod.rs

//! Revision drift reconciliation
//!
//! For a title under management, compare the stored `depot → revision` pins
//! with the catalog's latest ones. Drifted depots get their new manifest from
//! the [`ManifestSource`], and the title is re-assembled and re-committed
//! under its lock. Depots whose new manifest cannot be fetched keep their
//! stored revision and are reported.

pub mod scheduler;

pub use scheduler::{DaemonHandle, ReconcileDaemon, ReconcileScheduler, SchedulerState};

use crate::assembler::{Assembler, IdentifiedManifest, TitleGroup};
use crate::catalog::{Catalog, ManifestSource};
use crate::error::{Error, Result};
use crate::keys::KeyTable;
use crate::model::{DepotId, ManifestFile, RevisionId, RevisionSource, TitleId};
use crate::report::{FailedDepot, PassReport, ReconcileOutcome, RevisionChange, SkippedTitle};
use crate::script;
use crate::store::StoreClient;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default wall-clock budget for on-demand reconciliation
pub const DEFAULT_ON_DEMAND_BUDGET: Duration = Duration::from_secs(15);

/// Drives reconciliation for single titles and whole passes
#[derive(Clone)]
pub struct Reconciler {
    store: StoreClient,
    catalog: Arc<dyn Catalog>,
    manifests: Arc<dyn ManifestSource>,
    key_table: Arc<dyn KeyTable>,
}

impl Reconciler {
    /// `catalog` should already be throttled
    pub fn new(
        store: StoreClient,
        catalog: Arc<dyn Catalog>,
        manifests: Arc<dyn ManifestSource>,
        key_table: Arc<dyn KeyTable>,
    ) -> Self {
        Self {
            store,
            catalog,
            manifests,
            key_table,
        }
    }

    /// Reconcile one title, committing a new bundle if any depot moved
    pub async fn reconcile_title(&self, title_id: &TitleId) -> Result<ReconcileOutcome> {
        let guard = self.store.lock(title_id).await?;

        let unit = self
            .store
            .read(title_id)
            .await?
            .ok_or_else(|| Error::NotFoundError(format!("No stored unit for title {title_id}")))?;

        let Some(metadata) = self.catalog.get_title_metadata(title_id).await? else {
            debug!("Catalog does not know title {}; nothing to reconcile", title_id);
            return Ok(ReconcileOutcome::unchanged(title_id.clone()));
        };

        let stored = unit.revisions();
        let latest = &metadata.current_revisions_by_depot;
        let drifted = drifted_depots(&stored, latest);
        let unverified = unit.unverified_revisions();

        let mut manifests: BTreeMap<DepotId, ManifestFile> = unit
            .manifests()
            .into_iter()
            .map(|m| (m.depot_id.clone(), m))
            .collect();
        let mut changes = Vec::new();
        let mut failed_depots = Vec::new();

        // A synthesized revision the catalog confirms only needs its record cleared
        let mut verified = 0;
        for (depot_id, revision_id) in &unverified {
            match latest.get(depot_id) {
                Some(current) if current == revision_id => {
                    if let Some(manifest) = manifests.get_mut(depot_id) {
                        manifest.revision_source = RevisionSource::Filename;
                        verified += 1;
                    }
                }
                Some(_) => {}
                None => {
                    warn!(
                        "Depot {} of title {} has unverified revision {} and no catalog revision",
                        depot_id, title_id, revision_id
                    );
                    failed_depots.push(FailedDepot {
                        depot_id: depot_id.clone(),
                        wanted_revision: revision_id.clone(),
                        reason: "synthesized revision is unverified and the catalog reports none".to_string(),
                    });
                }
            }
        }

        if drifted.is_empty() && verified == 0 {
            debug!("Title {} is up to date", title_id);
            return Ok(ReconcileOutcome {
                title_id: title_id.clone(),
                changes,
                failed_depots,
                committed: false,
            });
        }

        info!(
            "Title {}: {} depot(s) drifted, {} revision(s) verified",
            title_id,
            drifted.len(),
            verified
        );

        for change in drifted {
            match self.manifests.fetch(&change.depot_id, &change.current).await {
                Ok(bytes) => {
                    info!(
                        "Depot {} of title {}: {} -> {}",
                        change.depot_id, title_id, change.previous, change.current
                    );
                    manifests.insert(
                        change.depot_id.clone(),
                        ManifestFile::new(&change.depot_id, &change.current, bytes),
                    );
                    changes.push(change);
                }
                Err(e) => {
                    warn!(
                        "Cannot fetch manifest {}_{} for title {}: {}",
                        change.depot_id, change.current, title_id, e
                    );
                    failed_depots.push(FailedDepot {
                        depot_id: change.depot_id,
                        wanted_revision: change.current,
                        reason: e.to_string(),
                    });
                }
            }
        }

        if changes.is_empty() && verified == 0 {
            return Ok(ReconcileOutcome {
                title_id: title_id.clone(),
                changes,
                failed_depots,
                committed: false,
            });
        }

        let script_text = unit.script().unwrap_or_default();
        let group = TitleGroup {
            title_id: title_id.clone(),
            script_name: title_id.script_file_name(),
            embedded_keys: script::embedded_keys(&script_text),
            references: script::referenced_ids(&script_text),
            manifests: manifests
                .into_values()
                .map(|manifest| IdentifiedManifest {
                    source_name: manifest.file_name(),
                    manifest,
                })
                .collect(),
            script_text: script_text.clone(),
            shared_depots: BTreeMap::new(),
        };

        let assembler = Assembler::new(self.key_table.as_ref());
        let assembly = assembler.assemble_title(
            &group,
            &unit.auxiliary_key_tables(),
            Some(&script_text),
            metadata.name.as_deref(),
        )?;

        for unresolved in &assembly.unresolved_keys {
            failed_depots.push(FailedDepot {
                depot_id: unresolved.depot_id.clone(),
                wanted_revision: stored
                    .get(&unresolved.depot_id)
                    .cloned()
                    .unwrap_or_default(),
                reason: "no decryption key".to_string(),
            });
        }

        let Some(bundle) = assembly.bundle else {
            warn!("Title {} has no resolvable depots after drift; keeping stored unit", title_id);
            return Ok(ReconcileOutcome {
                title_id: title_id.clone(),
                changes: Vec::new(),
                failed_depots,
                committed: false,
            });
        };

        changes.retain(|c| bundle.manifest_files.iter().any(|m| m.depot_id == c.depot_id));

        self.store.commit_held(&guard, &bundle).await?;
        info!("Re-committed title {} with {} revision change(s)", title_id, changes.len());

        Ok(ReconcileOutcome {
            title_id: title_id.clone(),
            changes,
            failed_depots,
            committed: true,
        })
    }

    /// On-demand reconciliation bounded by a wall-clock budget
    ///
    /// Returns `Ok(None)` when the budget runs out; the caller carries on
    /// without the result. The reconciliation itself runs as its own task and
    /// is never cut short, so a commit in flight always completes under the
    /// title lock.
    pub async fn reconcile_with_budget(
        &self,
        title_id: &TitleId,
        budget: Duration,
    ) -> Result<Option<ReconcileOutcome>> {
        let reconciler = self.clone();
        let owned = title_id.clone();
        let mut task = tokio::spawn(async move { reconciler.reconcile_title(&owned).await });

        match tokio::time::timeout(budget, &mut task).await {
            Ok(Ok(result)) => result.map(Some),
            Ok(Err(e)) => Err(Error::IoError(format!("Reconciliation task for title {title_id} failed: {e}"))),
            Err(_) => {
                warn!(
                    "Reconciliation of title {} exceeded {:?}; continuing in the background",
                    title_id, budget
                );
                Ok(None)
            }
        }
    }

    /// Reconcile every title under management
    ///
    /// A failing title is logged and skipped; the pass always continues.
    pub async fn run_pass(&self) -> Result<PassReport> {
        let titles = self.store.list().await?;
        info!("Reconciliation pass over {} title(s)", titles.len());

        let mut report = PassReport {
            checked: titles.len(),
            ..Default::default()
        };

        for title_id in titles {
            match self.reconcile_title(&title_id).await {
                Ok(outcome) => report.outcomes.push(outcome),
                Err(e) => {
                    warn!("Skipping title {} this pass: {}", title_id, e);
                    report.skipped.push(SkippedTitle {
                        title_id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            "Reconciliation pass done: {} re-committed, {} skipped",
            report.recommitted(),
            report.skipped.len()
        );
        Ok(report)
    }
}

/// Depots under management whose latest revision differs from the stored one
pub fn drifted_depots(
    stored: &BTreeMap<DepotId, RevisionId>,
    latest: &BTreeMap<DepotId, RevisionId>,
) -> Vec<RevisionChange> {
    stored
        .iter()
        .filter_map(|(depot_id, previous)| {
            let current = latest.get(depot_id)?;
            (current != previous).then(|| RevisionChange {
                depot_id: depot_id.clone(),
                previous: previous.clone(),
                current: current.clone(),
            })
        })
        .collect()
}
