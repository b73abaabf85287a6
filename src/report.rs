// src/report.rs

//! Reports handed back to the calling layer
//!
//! Every ingestion call must be able to say which titles succeeded, which
//! were skipped and why, and exactly which depots are waiting for a key.

use crate::model::{DepotId, RevisionId, TitleId};
use serde::Serialize;

/// A depot whose manifest was dropped for lack of a key
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnresolvedKey {
    pub title_id: TitleId,
    pub depot_id: DepotId,
    pub manifest_filename: String,
}

/// A committed manifest whose revision was synthesized and is unverified
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SynthesizedRevision {
    pub depot_id: DepotId,
    pub revision_id: RevisionId,
    pub manifest_filename: String,
}

/// A per-file or per-title failure that did not abort the batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParseFailure {
    /// Archive entry the failure relates to
    pub file_name: String,
    pub title_id: Option<TitleId>,
    pub message: String,
}

/// Whether a commit created a new store unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitStatus {
    Created,
    Updated,
    /// Title was assembled but could not be written
    Failed,
    /// Title produced no bundle (no resolvable depots)
    Skipped,
}

/// Outcome for one title of an ingestion call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitReport {
    pub title_affected: TitleId,
    pub status: CommitStatus,
    pub depot_count: usize,
    pub skipped_depot_count: usize,
    pub unresolved_keys: Vec<UnresolvedKey>,
    /// Committed revisions that reconciliation still has to verify
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub synthesized_revisions: Vec<SynthesizedRevision>,
    pub errors: Vec<String>,
    /// Digest of the committed file set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl CommitReport {
    pub fn succeeded(&self) -> bool {
        matches!(self.status, CommitStatus::Created | CommitStatus::Updated)
    }
}

/// Full report for one ingestion call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    /// Per-title outcomes in archive order
    pub titles: Vec<CommitReport>,
    pub parse_errors: Vec<ParseFailure>,
    /// Manifest entries no script claimed
    pub unmatched_manifests: Vec<String>,
    /// Depot keys newly added to the key table by this call
    pub keys_learned: usize,
}

impl IngestReport {
    /// All depots awaiting a key, across titles
    pub fn unresolved_keys(&self) -> Vec<&UnresolvedKey> {
        self.titles
            .iter()
            .flat_map(|t| t.unresolved_keys.iter())
            .collect()
    }

    pub fn created(&self) -> impl Iterator<Item = &CommitReport> {
        self.titles.iter().filter(|t| t.status == CommitStatus::Created)
    }

    pub fn updated(&self) -> impl Iterator<Item = &CommitReport> {
        self.titles.iter().filter(|t| t.status == CommitStatus::Updated)
    }
}

/// Before/after revision of one drifted depot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RevisionChange {
    pub depot_id: DepotId,
    pub previous: RevisionId,
    pub current: RevisionId,
}

/// A drifted depot that could not be moved to its new revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedDepot {
    pub depot_id: DepotId,
    pub wanted_revision: RevisionId,
    pub reason: String,
}

/// Result of reconciling one title
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub title_id: TitleId,
    /// Depots actually moved to a new revision
    pub changes: Vec<RevisionChange>,
    pub failed_depots: Vec<FailedDepot>,
    /// Whether a new bundle was committed
    pub committed: bool,
}

impl ReconcileOutcome {
    pub fn unchanged(title_id: TitleId) -> Self {
        Self {
            title_id,
            changes: Vec::new(),
            failed_depots: Vec::new(),
            committed: false,
        }
    }
}

/// A title the scheduled pass had to skip
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedTitle {
    pub title_id: TitleId,
    pub reason: String,
}

/// Result of one scheduled reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub checked: usize,
    pub outcomes: Vec<ReconcileOutcome>,
    pub skipped: Vec<SkippedTitle>,
}

impl PassReport {
    /// Number of titles that received a new commit
    pub fn recommitted(&self) -> usize {
        self.outcomes.iter().filter(|o| o.committed).count()
    }
}
