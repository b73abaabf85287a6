// src/assembler/mod.rs

//! Bundle assembly
//!
//! Turns the typed entries of one archive into per-title bundles:
//! - group manifests under the scripts that reference them
//! - resolve a key for every manifest, dropping the ones without a key
//! - synthesize the title's script from the surviving depots
//!
//! Failures are per title and never abort sibling titles. A title with zero
//! resolvable depots produces no bundle at all.

pub mod ident;

use crate::archive::{DEPOT_KEYS_TABLE, KeyTableEntry, ParsedArchive};
use crate::error::{Error, Result};
use crate::keys::{KeyResolver, KeyTable, Resolution, parse_key_table_json};
use crate::model::{AuxiliaryKeyTable, Bundle, Depot, DepotId, ManifestFile, TitleId};
use crate::report::{ParseFailure, SynthesizedRevision, UnresolvedKey};
use crate::script::{self, PinnedDepot, SynthesisInput};
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, info, warn};

use ident::{belongs_to, compare_numeric, identify_manifest, title_id_from_script_name};

/// A manifest entry with its identity worked out
#[derive(Debug, Clone)]
pub struct IdentifiedManifest {
    /// Filename as it appeared in the archive
    pub source_name: String,
    pub manifest: ManifestFile,
}

/// Everything one script pulls out of an archive
#[derive(Debug, Clone)]
pub struct TitleGroup {
    pub title_id: TitleId,
    pub script_name: String,
    pub script_text: String,
    pub embedded_keys: BTreeMap<DepotId, String>,
    pub references: BTreeSet<String>,
    pub manifests: Vec<IdentifiedManifest>,
    /// Depots other scripts in the batch claim too, mapped to the first claimant
    pub shared_depots: BTreeMap<DepotId, TitleId>,
}

/// Titles found in one archive, plus what could not be attributed
#[derive(Debug, Clone, Default)]
pub struct Grouping {
    pub groups: Vec<TitleGroup>,
    pub parse_errors: Vec<ParseFailure>,
    pub unmatched_manifests: Vec<String>,
}

/// Result of assembling a single title
#[derive(Debug, Clone)]
pub struct TitleAssembly {
    pub title_id: TitleId,
    /// `None` when no depot could be resolved
    pub bundle: Option<Bundle>,
    pub unresolved_keys: Vec<UnresolvedKey>,
    /// Bundled manifests whose revision was synthesized
    pub synthesized_revisions: Vec<SynthesizedRevision>,
}

/// Ephemeral result of assembling a whole archive
#[derive(Debug, Clone, Default)]
pub struct UploadBatch {
    pub bundles: Vec<Bundle>,
    pub unresolved_keys: Vec<UnresolvedKey>,
    pub parse_errors: Vec<ParseFailure>,
    pub unmatched_manifests: Vec<String>,
}

/// Orchestrates identifier extraction, key resolution and synthesis
pub struct Assembler<'a> {
    key_table: &'a dyn KeyTable,
    clock: fn() -> u64,
}

fn unix_now() -> u64 {
    Utc::now().timestamp().max(0) as u64
}

impl<'a> Assembler<'a> {
    pub fn new(key_table: &'a dyn KeyTable) -> Self {
        Self {
            key_table,
            clock: unix_now,
        }
    }

    /// Override the clock used for synthesized revisions
    pub fn with_clock(mut self, clock: fn() -> u64) -> Self {
        self.clock = clock;
        self
    }

    /// Assemble every title in an archive without any prior store state
    pub fn assemble(&self, archive: &ParsedArchive) -> UploadBatch {
        let mut batch = UploadBatch::default();
        let (aux_tables, table_errors) = self.import_key_tables(&archive.key_tables);
        batch.parse_errors.extend(table_errors);

        let grouping = self.group(archive);
        batch.parse_errors.extend(grouping.parse_errors);
        batch.unmatched_manifests = grouping.unmatched_manifests;

        for group in &grouping.groups {
            match self.assemble_title(group, &aux_tables, None, None) {
                Ok(assembly) => {
                    batch.unresolved_keys.extend(assembly.unresolved_keys);
                    if let Some(bundle) = assembly.bundle {
                        batch.bundles.push(bundle);
                    }
                }
                Err(e) => batch.parse_errors.push(ParseFailure {
                    file_name: group.script_name.clone(),
                    title_id: Some(group.title_id.clone()),
                    message: e.to_string(),
                }),
            }
        }

        batch
    }

    /// Validate auxiliary key tables and import depot keys into the key table
    ///
    /// Returns the tables to pass through into bundles plus any parse errors.
    pub fn import_key_tables(&self, entries: &[KeyTableEntry]) -> (Vec<AuxiliaryKeyTable>, Vec<ParseFailure>) {
        let mut tables = Vec::new();
        let mut errors = Vec::new();

        for entry in entries {
            let parsed = match parse_key_table_json(&entry.raw_bytes) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!("Ignoring malformed key table {}: {}", entry.name, e);
                    errors.push(ParseFailure {
                        file_name: entry.name.clone(),
                        title_id: None,
                        message: e.to_string(),
                    });
                    continue;
                }
            };

            if parsed.is_empty() {
                debug!("Skipping empty key table {}", entry.name);
                continue;
            }

            if entry.name == DEPOT_KEYS_TABLE {
                match self.key_table.put_many(&parsed) {
                    Ok(n) => info!("Imported {} depot key(s) from {}", n, entry.name),
                    Err(e) => {
                        warn!("Failed to import keys from {}: {}", entry.name, e);
                        errors.push(ParseFailure {
                            file_name: entry.name.clone(),
                            title_id: None,
                            message: e.to_string(),
                        });
                    }
                }
            }

            // Later tables with the same reserved name replace earlier ones
            tables.retain(|t: &AuxiliaryKeyTable| t.name != entry.name);
            tables.push(AuxiliaryKeyTable {
                name: entry.name.clone(),
                raw_bytes: entry.raw_bytes.clone(),
            });
        }

        (tables, errors)
    }

    /// Attribute manifest entries to the scripts that reference them
    pub fn group(&self, archive: &ParsedArchive) -> Grouping {
        let mut grouping = Grouping::default();
        let now = (self.clock)();

        let mut identified = Vec::with_capacity(archive.manifests.len());
        for entry in &archive.manifests {
            match identify_manifest(&entry.file_name, &entry.raw_bytes, now) {
                Some(identity) => {
                    if identity.source != crate::model::RevisionSource::Filename {
                        debug!(
                            "Manifest {} identified as depot {} revision {} ({:?})",
                            entry.file_name, identity.depot_id, identity.revision_id, identity.source
                        );
                    }
                    identified.push(IdentifiedManifest {
                        source_name: entry.file_name.clone(),
                        manifest: ManifestFile {
                            depot_id: identity.depot_id,
                            revision_id: identity.revision_id,
                            raw_bytes: entry.raw_bytes.clone(),
                            revision_source: identity.source,
                        },
                    });
                }
                None => grouping.unmatched_manifests.push(entry.file_name.clone()),
            }
        }

        let mut claimants: Vec<Vec<usize>> = vec![Vec::new(); identified.len()];
        let mut seen_titles = HashSet::new();

        for script in &archive.scripts {
            let Some(title_id) = title_id_from_script_name(&script.file_name) else {
                warn!("Skipping script without a title ID: {}", script.file_name);
                grouping.parse_errors.push(ParseFailure {
                    file_name: script.file_name.clone(),
                    title_id: None,
                    message: Error::UnextractableTitleId(script.file_name.clone()).to_string(),
                });
                continue;
            };

            if !seen_titles.insert(title_id.clone()) {
                grouping.parse_errors.push(ParseFailure {
                    file_name: script.file_name.clone(),
                    title_id: Some(title_id),
                    message: "duplicate script for title; first one wins".to_string(),
                });
                continue;
            }

            let references = script::referenced_ids(&script.text);
            let mut manifests = Vec::new();
            for (i, item) in identified.iter().enumerate() {
                if belongs_to(&item.manifest.depot_id, &item.source_name, &title_id, &references) {
                    claimants[i].push(grouping.groups.len());
                    manifests.push(item.clone());
                }
            }

            debug!(
                "Title {}: {} reference(s), {} manifest(s)",
                title_id,
                references.len(),
                manifests.len()
            );

            grouping.groups.push(TitleGroup {
                embedded_keys: script::embedded_keys(&script.text),
                title_id,
                script_name: script.file_name.clone(),
                script_text: script.text.clone(),
                references,
                manifests,
                shared_depots: BTreeMap::new(),
            });
        }

        for (item, claimed_by) in identified.iter().zip(claimants) {
            match claimed_by.as_slice() {
                [] => grouping.unmatched_manifests.push(item.source_name.clone()),
                [_] => {}
                [first, ..] => {
                    let owner = grouping.groups[*first].title_id.clone();
                    debug!(
                        "Depot {} is claimed by {} scripts; first is title {}",
                        item.manifest.depot_id,
                        claimed_by.len(),
                        owner
                    );
                    for &g in &claimed_by {
                        grouping.groups[g]
                            .shared_depots
                            .insert(item.manifest.depot_id.clone(), owner.clone());
                    }
                }
            }
        }

        grouping
    }

    /// Assemble one title group into a bundle
    ///
    /// `previous_script` is the script currently in the store, whose author
    /// lines survive the upload. `title_name` comes from the catalog when
    /// available.
    pub fn assemble_title(
        &self,
        group: &TitleGroup,
        aux_tables: &[AuxiliaryKeyTable],
        previous_script: Option<&str>,
        title_name: Option<&str>,
    ) -> Result<TitleAssembly> {
        if !group.embedded_keys.is_empty()
            && let Err(e) = self.key_table.put_many(&group.embedded_keys)
        {
            warn!("Failed to record script keys for title {}: {}", group.title_id, e);
        }

        let manifests = dedupe_manifests(&group.manifests);
        let mut claimed: BTreeSet<DepotId> = manifests.iter().map(|m| m.manifest.depot_id.clone()).collect();
        let resolver = KeyResolver::new(&group.embedded_keys, self.key_table);

        let mut pinned: Vec<PinnedDepot> = Vec::new();
        let mut files: Vec<ManifestFile> = Vec::new();
        let mut unresolved = Vec::new();
        let mut synthesized = Vec::new();
        let mut excluded = BTreeSet::new();

        for item in manifests {
            let mut manifest = item.manifest;
            let resolution = resolver.resolve(&group.title_id, &manifest.depot_id, &claimed)?;

            let key = match resolution {
                Resolution::Direct { key, .. } => key,
                Resolution::Reidentified { depot_id, key, .. } => {
                    claimed.insert(depot_id.clone());
                    manifest.depot_id = depot_id;
                    key
                }
                Resolution::Unresolved => {
                    let reason = Error::UnresolvedKey {
                        title_id: group.title_id.to_string(),
                        depot_id: manifest.depot_id.clone(),
                    };
                    warn!("{}; skipping {}", reason, item.source_name);
                    excluded.insert(manifest.depot_id.clone());
                    unresolved.push(UnresolvedKey {
                        title_id: group.title_id.clone(),
                        depot_id: manifest.depot_id.clone(),
                        manifest_filename: item.source_name.clone(),
                    });
                    continue;
                }
            };

            if manifest.is_synthesized() {
                synthesized.push(SynthesizedRevision {
                    depot_id: manifest.depot_id.clone(),
                    revision_id: manifest.revision_id.clone(),
                    manifest_filename: item.source_name.clone(),
                });
            }
            pinned.push(PinnedDepot::new(&manifest.depot_id, &manifest.revision_id, key));
            files.push(manifest);
        }

        if pinned.is_empty() {
            info!(
                "Title {} has no resolvable depots; no bundle produced",
                group.title_id
            );
            return Ok(TitleAssembly {
                title_id: group.title_id.clone(),
                bundle: None,
                unresolved_keys: unresolved,
                synthesized_revisions: Vec::new(),
            });
        }

        pinned.sort_by(|a, b| compare_numeric(&a.depot_id, &b.depot_id));
        files.sort_by(|a, b| compare_numeric(&a.depot_id, &b.depot_id));

        let script = script::synthesize(&SynthesisInput {
            title_id: &group.title_id,
            title_name,
            depots: &pinned,
            excluded: &excluded,
            prior: Some(&group.script_text),
            previous: previous_script,
        });

        let depots = pinned
            .iter()
            .map(|p| {
                let mut depot = Depot::new(&p.depot_id, &p.revision_id).with_key(&p.key);
                if let Some(owner) = group.shared_depots.get(&p.depot_id) {
                    depot.is_shared = true;
                    if owner != &group.title_id {
                        depot.shared_from_title = Some(owner.clone());
                    }
                }
                depot
            })
            .collect();

        info!(
            "Assembled title {}: {} depot(s), {} skipped",
            group.title_id,
            pinned.len(),
            unresolved.len()
        );

        Ok(TitleAssembly {
            title_id: group.title_id.clone(),
            bundle: Some(Bundle {
                title_id: group.title_id.clone(),
                title_name: title_name.map(str::to_string),
                script,
                depots,
                manifest_files: files,
                auxiliary_key_tables: aux_tables.to_vec(),
                skipped_depot_count: unresolved.len(),
            }),
            unresolved_keys: unresolved,
            synthesized_revisions: synthesized,
        })
    }
}

/// Keep one manifest per depot
///
/// A filename revision beats a sniffed one, which beats a synthesized one;
/// ties keep the numerically greatest revision. Archive order is kept for
/// the survivors.
pub fn dedupe_manifests(manifests: &[IdentifiedManifest]) -> Vec<IdentifiedManifest> {
    let mut best: BTreeMap<&str, usize> = BTreeMap::new();
    for (i, item) in manifests.iter().enumerate() {
        let depot = item.manifest.depot_id.as_str();
        match best.get(depot) {
            Some(&j) => {
                let current = &manifests[j].manifest;
                let candidate = &item.manifest;
                let better = candidate
                    .revision_source
                    .cmp(&current.revision_source)
                    .then_with(|| compare_numeric(&candidate.revision_id, &current.revision_id))
                    .is_gt();
                if better {
                    best.insert(depot, i);
                }
            }
            None => {
                best.insert(depot, i);
            }
        }
    }

    let keep: HashSet<usize> = best.into_values().collect();
    manifests
        .iter()
        .enumerate()
        .filter(|(i, _)| keep.contains(i))
        .map(|(_, m)| m.clone())
        .collect()
}
