// src/archive/mod.rs

//! Archive parsing
//!
//! Decodes an uploaded archive into typed entry lists: scripts (by filename
//! suffix), manifest files (by filename suffix) and auxiliary key tables (by
//! reserved base name, case-insensitive). Anything else is ignored.
//! Manifest bytes are kept exactly as read.

pub mod container;

use crate::error::{Error, Result};
use crate::model::{LEGACY_SCRIPT_SUFFIX, MANIFEST_SUFFIX, SCRIPT_SUFFIX};
use tracing::{debug, info};

pub use container::{Compression, ContainerFormat, RawEntry, read_entries};

/// Reserved base name of the depot key table
pub const DEPOT_KEYS_TABLE: &str = "depotkeys.json";

/// Reserved base name of the access token table
pub const ACCESS_TOKENS_TABLE: &str = "appaccesstokens.json";

/// All reserved auxiliary table names (lowercase)
pub const RESERVED_TABLES: [&str; 2] = [DEPOT_KEYS_TABLE, ACCESS_TOKENS_TABLE];

/// A script found in the archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptEntry {
    /// Base filename, e.g. `730.script`
    pub file_name: String,
    pub text: String,
}

/// A manifest file found in the archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Base filename, e.g. `7301_1111111111.manifest`
    pub file_name: String,
    pub raw_bytes: Vec<u8>,
}

/// An auxiliary key table found in the archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyTableEntry {
    /// Lowercase reserved name
    pub name: String,
    pub raw_bytes: Vec<u8>,
}

/// Typed view of an uploaded archive, entries in archive order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedArchive {
    pub scripts: Vec<ScriptEntry>,
    pub manifests: Vec<ManifestEntry>,
    pub key_tables: Vec<KeyTableEntry>,
}

/// Parse raw archive bytes
///
/// Fails with [`Error::EmptyArchive`] if neither scripts nor manifest files
/// are present.
pub fn parse_archive(data: &[u8]) -> Result<ParsedArchive> {
    let entries = read_entries(data)?;
    let parsed = classify_entries(entries);

    if parsed.scripts.is_empty() && parsed.manifests.is_empty() {
        return Err(Error::EmptyArchive);
    }

    info!(
        "Parsed archive: {} script(s), {} manifest file(s), {} key table(s)",
        parsed.scripts.len(),
        parsed.manifests.len(),
        parsed.key_tables.len()
    );
    Ok(parsed)
}

/// Sort raw entries into scripts, manifests and key tables
pub fn classify_entries(entries: Vec<RawEntry>) -> ParsedArchive {
    let mut parsed = ParsedArchive::default();

    for entry in entries {
        let Some(file_name) = base_name(&entry.path) else {
            continue;
        };
        let lower = file_name.to_ascii_lowercase();

        if lower.ends_with(MANIFEST_SUFFIX) {
            parsed.manifests.push(ManifestEntry {
                file_name,
                raw_bytes: entry.data,
            });
        } else if lower.ends_with(SCRIPT_SUFFIX) || lower.ends_with(LEGACY_SCRIPT_SUFFIX) {
            parsed.scripts.push(ScriptEntry {
                file_name,
                text: String::from_utf8_lossy(&entry.data).into_owned(),
            });
        } else if RESERVED_TABLES.contains(&lower.as_str()) {
            parsed.key_tables.push(KeyTableEntry {
                name: lower,
                raw_bytes: entry.data,
            });
        } else {
            debug!("Ignoring archive entry: {}", entry.path);
        }
    }

    parsed
}

/// Extract the base filename of an archive path
///
/// Returns `None` for directory placeholders, hidden files and resource-fork
/// folders that some archivers add.
fn base_name(path: &str) -> Option<String> {
    let normalized = path.replace('\\', "/");
    if normalized.starts_with("__MACOSX/") || normalized.contains("/__MACOSX/") {
        return None;
    }

    let name = normalized.rsplit('/').next()?.trim();
    if name.is_empty() || name.starts_with('.') {
        return None;
    }
    Some(name.to_string())
}
