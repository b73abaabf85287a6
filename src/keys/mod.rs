// src/keys/mod.rs

//! Depot key resolution
//!
//! Keys are looked up with a fixed precedence, first hit wins:
//! 1. the key embedded in the title's script for this exact depot
//! 2. the persistent [`KeyTable`] entry for this exact depot
//! 3. re-identification: `titleId + suffix` for each suffix in
//!    [`CANDIDATE_SUFFIXES`], checking (1) then (2) for the candidate
//!
//! A re-identified manifest takes the candidate's depot ID. Candidates that
//! another manifest of the same title already claims are skipped, since that
//! would merge two distinct depots.

pub mod table;

use crate::error::Result;
use crate::model::{DepotId, TitleId};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

pub use table::{KeyTable, MemoryKeyTable, SqliteKeyTable, parse_key_table_json};

/// Suffixes appended to the title ID when retrying a failed lookup
pub const CANDIDATE_SUFFIXES: [&str; 4] = ["1", "2", "3", ""];

/// Which source produced a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    Script,
    KeyTable,
}

/// Outcome of resolving one depot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Key found for the depot as named
    Direct { key: String, source: KeySource },
    /// Key found for a candidate depot; the manifest must be renamed
    Reidentified {
        depot_id: DepotId,
        key: String,
        source: KeySource,
    },
    Unresolved,
}

impl Resolution {
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Direct { key, .. } | Self::Reidentified { key, .. } => Some(key),
            Self::Unresolved => None,
        }
    }
}

/// Resolves keys for the depots of one title
pub struct KeyResolver<'a> {
    embedded: &'a BTreeMap<DepotId, String>,
    table: &'a dyn KeyTable,
}

impl<'a> KeyResolver<'a> {
    /// Create a resolver over a script's embedded keys and the key table
    pub fn new(embedded: &'a BTreeMap<DepotId, String>, table: &'a dyn KeyTable) -> Self {
        Self { embedded, table }
    }

    /// Look up a key for an exact depot ID using sources (1) then (2)
    pub fn lookup(&self, depot_id: &str) -> Result<Option<(String, KeySource)>> {
        if let Some(key) = self.embedded.get(depot_id) {
            return Ok(Some((key.clone(), KeySource::Script)));
        }
        Ok(self
            .table
            .get(depot_id)?
            .map(|key| (key, KeySource::KeyTable)))
    }

    /// Resolve the key for `depot_id` of `title_id`
    ///
    /// `claimed` holds depot IDs already owned by other manifests of the
    /// same title; they are never chosen as re-identification targets.
    pub fn resolve(
        &self,
        title_id: &TitleId,
        depot_id: &str,
        claimed: &BTreeSet<DepotId>,
    ) -> Result<Resolution> {
        if let Some((key, source)) = self.lookup(depot_id)? {
            debug!("Resolved key for depot {} from {:?}", depot_id, source);
            return Ok(Resolution::Direct { key, source });
        }

        for suffix in CANDIDATE_SUFFIXES {
            let candidate = format!("{}{}", title_id, suffix);
            if candidate == depot_id || claimed.contains(&candidate) {
                continue;
            }
            if let Some((key, source)) = self.lookup(&candidate)? {
                info!(
                    "Re-identified manifest depot {} as {} for title {} ({:?})",
                    depot_id, candidate, title_id, source
                );
                return Ok(Resolution::Reidentified {
                    depot_id: candidate,
                    key,
                    source,
                });
            }
        }

        debug!("No key for depot {} of title {}", depot_id, title_id);
        Ok(Resolution::Unresolved)
    }
}
