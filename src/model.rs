// src/model.rs

//! Core data model: titles, depots, manifest files and bundles
//!
//! A [`Bundle`] is the unit committed to the version store. It is built once
//! by the assembler and re-created (never mutated in place) when a depot's
//! revision drifts.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Suffix of script files produced by the synthesizer
pub const SCRIPT_SUFFIX: &str = ".script";

/// Legacy script suffix accepted on input
pub const LEGACY_SCRIPT_SUFFIX: &str = ".lua";

/// Suffix of manifest files
pub const MANIFEST_SUFFIX: &str = ".manifest";

/// Unit file recording manifest revisions that were synthesized, not read
pub const UNVERIFIED_REVISIONS_FILE: &str = "unverified.json";

/// Depot identifier (decimal digits)
pub type DepotId = String;

/// Revision identifier (decimal digits)
pub type RevisionId = String;

/// Numeric catalog title identifier, stored in normalized string form
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TitleId(String);

impl TitleId {
    /// Parse and normalize a title ID
    ///
    /// Surrounding whitespace is trimmed; the remainder must be ASCII digits.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::ParseError(format!("Invalid title ID: '{raw}'")));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filename of this title's script
    pub fn script_file_name(&self) -> String {
        format!("{}{}", self.0, SCRIPT_SUFFIX)
    }
}

impl fmt::Display for TitleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TitleId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TitleId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<TitleId> for String {
    fn from(id: TitleId) -> Self {
        id.0
    }
}

/// A depot as tracked for one title
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Depot {
    pub depot_id: DepotId,
    pub current_revision_id: RevisionId,
    /// Absent while the key is unresolved
    pub decryption_key: Option<String>,
    pub platform_tag: Option<String>,
    pub language_tag: Option<String>,
    #[serde(default)]
    pub is_shared: bool,
    pub shared_from_title: Option<TitleId>,
}

impl Depot {
    pub fn new(depot_id: impl Into<String>, revision_id: impl Into<String>) -> Self {
        Self {
            depot_id: depot_id.into(),
            current_revision_id: revision_id.into(),
            decryption_key: None,
            platform_tag: None,
            language_tag: None,
            is_shared: false,
            shared_from_title: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.decryption_key = Some(key.into());
        self
    }
}

/// Where a manifest file's revision ID came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevisionSource {
    /// Synthesized from the current timestamp; unverified
    Synthesized,
    /// Recovered from a digit run in the first kilobyte of content
    Sniffed,
    /// Parsed from a strict `<depot>_<revision>.manifest` filename
    Filename,
}

/// Binary descriptor pinning one depot to one revision
#[derive(Clone, PartialEq, Eq)]
pub struct ManifestFile {
    pub depot_id: DepotId,
    pub revision_id: RevisionId,
    pub raw_bytes: Vec<u8>,
    pub revision_source: RevisionSource,
}

impl ManifestFile {
    pub fn new(depot_id: impl Into<String>, revision_id: impl Into<String>, raw_bytes: Vec<u8>) -> Self {
        Self {
            depot_id: depot_id.into(),
            revision_id: revision_id.into(),
            raw_bytes,
            revision_source: RevisionSource::Filename,
        }
    }

    /// Canonical `<depot>_<revision>.manifest` filename
    pub fn file_name(&self) -> String {
        manifest_file_name(&self.depot_id, &self.revision_id)
    }

    pub fn is_synthesized(&self) -> bool {
        self.revision_source == RevisionSource::Synthesized
    }
}

impl fmt::Debug for ManifestFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManifestFile")
            .field("depot_id", &self.depot_id)
            .field("revision_id", &self.revision_id)
            .field("len", &self.raw_bytes.len())
            .field("revision_source", &self.revision_source)
            .finish()
    }
}

/// Build the canonical manifest filename for a depot revision
pub fn manifest_file_name(depot_id: &str, revision_id: &str) -> String {
    format!("{depot_id}_{revision_id}{MANIFEST_SUFFIX}")
}

/// Auxiliary key table carried verbatim in a bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuxiliaryKeyTable {
    /// Lowercase reserved name, e.g. `depotkeys.json`
    pub name: String,
    pub raw_bytes: Vec<u8>,
}

/// One named file inside a store unit
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct StoredFile {
    pub name: String,
    pub data: Vec<u8>,
}

impl StoredFile {
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

/// Full committed artifact set for one title
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    pub title_id: TitleId,
    pub title_name: Option<String>,
    /// Synthesized script text
    pub script: String,
    /// Depots registered with a resolved key and pinned to a revision
    pub depots: Vec<Depot>,
    /// At most one manifest file per depot
    pub manifest_files: Vec<ManifestFile>,
    pub auxiliary_key_tables: Vec<AuxiliaryKeyTable>,
    /// Depots dropped because no key could be resolved
    pub skipped_depot_count: usize,
}

impl Bundle {
    /// Materialize the full file set written to the store, sorted by name
    pub fn files(&self) -> Vec<StoredFile> {
        let mut files = Vec::with_capacity(1 + self.manifest_files.len() + self.auxiliary_key_tables.len());
        files.push(StoredFile::new(
            self.title_id.script_file_name(),
            self.script.as_bytes().to_vec(),
        ));
        for manifest in &self.manifest_files {
            files.push(StoredFile::new(manifest.file_name(), manifest.raw_bytes.clone()));
        }
        for table in &self.auxiliary_key_tables {
            files.push(StoredFile::new(table.name.clone(), table.raw_bytes.clone()));
        }
        let unverified = self.unverified_revisions();
        if !unverified.is_empty()
            && let Ok(data) = serde_json::to_vec_pretty(&unverified)
        {
            files.push(StoredFile::new(UNVERIFIED_REVISIONS_FILE, data));
        }
        files.sort();
        files
    }

    /// `depot → revision` for manifests whose revision was synthesized
    pub fn unverified_revisions(&self) -> BTreeMap<DepotId, RevisionId> {
        self.manifest_files
            .iter()
            .filter(|m| m.is_synthesized())
            .map(|m| (m.depot_id.clone(), m.revision_id.clone()))
            .collect()
    }

    /// SHA-256 over the sorted file set (names and contents)
    pub fn digest(&self) -> String {
        files_digest(&self.files())
    }

    /// Current `(depot, revision)` pins carried by the manifest files
    pub fn revisions(&self) -> Vec<(DepotId, RevisionId)> {
        self.manifest_files
            .iter()
            .map(|m| (m.depot_id.clone(), m.revision_id.clone()))
            .collect()
    }
}

/// Digest a file set independent of input order
pub fn files_digest(files: &[StoredFile]) -> String {
    let mut sorted: Vec<&StoredFile> = files.iter().collect();
    sorted.sort();

    let mut hasher = Sha256::new();
    for file in sorted {
        hasher.update(file.name.as_bytes());
        hasher.update([0u8]);
        hasher.update((file.data.len() as u64).to_le_bytes());
        hasher.update(&file.data);
    }
    hex::encode(hasher.finalize())
}
