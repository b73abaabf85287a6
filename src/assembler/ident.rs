// src/assembler/ident.rs
//! Identifier extraction rules
//!
//! Pure functions over filenames and bytes. Manifest identity is decided by
//! an explicit precedence list: strict filename pattern, then loose filename
//! pattern plus content sniff, then a synthesized timestamp revision.

use crate::model::{DepotId, RevisionId, RevisionSource, TitleId};
use regex::Regex;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::LazyLock;

/// Only this many leading bytes are sniffed for a revision
pub const SNIFF_WINDOW: usize = 1024;

/// Minimum digit run accepted as a sniffed revision
pub const MIN_SNIFFED_DIGITS: usize = 10;

static SCRIPT_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(\d+)\.(?:script|lua)$").expect("valid regex"));

static STRICT_MANIFEST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(\d+)_(\d+)\.manifest$").expect("valid regex"));

static LOOSE_MANIFEST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(\d+)(?:\D.*)?\.manifest$").expect("valid regex"));

/// Title ID encoded in a script filename (`730.script`)
pub fn title_id_from_script_name(file_name: &str) -> Option<TitleId> {
    let caps = SCRIPT_NAME_RE.captures(file_name.trim())?;
    TitleId::parse(&caps[1]).ok()
}

/// Identity recovered for one manifest entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestIdentity {
    pub depot_id: DepotId,
    pub revision_id: RevisionId,
    pub source: RevisionSource,
}

/// Work out `(depot, revision)` for a manifest entry
///
/// Returns `None` when the filename carries no leading depot number at all.
/// `now_secs` supplies the synthesized revision when nothing else is found.
pub fn identify_manifest(file_name: &str, raw_bytes: &[u8], now_secs: u64) -> Option<ManifestIdentity> {
    let name = file_name.trim();

    if let Some(caps) = STRICT_MANIFEST_RE.captures(name) {
        return Some(ManifestIdentity {
            depot_id: caps[1].to_string(),
            revision_id: caps[2].to_string(),
            source: RevisionSource::Filename,
        });
    }

    let caps = LOOSE_MANIFEST_RE.captures(name)?;
    let depot_id = caps[1].to_string();

    match sniff_revision(raw_bytes) {
        Some(revision_id) => Some(ManifestIdentity {
            depot_id,
            revision_id,
            source: RevisionSource::Sniffed,
        }),
        None => Some(ManifestIdentity {
            depot_id,
            revision_id: now_secs.to_string(),
            source: RevisionSource::Synthesized,
        }),
    }
}

/// First run of at least [`MIN_SNIFFED_DIGITS`] ASCII digits in the sniff window
pub fn sniff_revision(raw_bytes: &[u8]) -> Option<RevisionId> {
    let window = &raw_bytes[..raw_bytes.len().min(SNIFF_WINDOW)];

    let mut start = None;
    for (i, b) in window.iter().enumerate() {
        match (b.is_ascii_digit(), start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                if i - s >= MIN_SNIFFED_DIGITS {
                    return Some(String::from_utf8_lossy(&window[s..i]).into_owned());
                }
                start = None;
            }
            _ => {}
        }
    }

    match start {
        Some(s) if window.len() - s >= MIN_SNIFFED_DIGITS => {
            Some(String::from_utf8_lossy(&window[s..]).into_owned())
        }
        _ => None,
    }
}

/// Whether a manifest belongs to a title
///
/// True if its depot is referenced by the title's script, or if the filename
/// literally contains the title ID (fallback for malformed scripts).
pub fn belongs_to(depot_id: &str, file_name: &str, title_id: &TitleId, references: &BTreeSet<String>) -> bool {
    references.contains(depot_id) || file_name.contains(title_id.as_str())
}

/// Order numeric ID strings by value, falling back to text order
pub fn compare_numeric(a: &str, b: &str) -> Ordering {
    let a_trim = a.trim_start_matches('0');
    let b_trim = b.trim_start_matches('0');
    a_trim
        .len()
        .cmp(&b_trim.len())
        .then_with(|| a_trim.cmp(b_trim))
        .then_with(|| a.cmp(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_title_id_from_script_name() {
        assert_eq!(title_id_from_script_name("730.script").unwrap().as_str(), "730");
        assert_eq!(title_id_from_script_name("440.LUA").unwrap().as_str(), "440");
        assert!(title_id_from_script_name("game.script").is_none());
        assert!(title_id_from_script_name("730_extra.script").is_none());
    }

    #[test]
    fn test_strict_manifest_name() {
        let id = identify_manifest("7301_1111111111.manifest", b"", 42).unwrap();
        assert_eq!(id.depot_id, "7301");
        assert_eq!(id.revision_id, "1111111111");
        assert_eq!(id.source, RevisionSource::Filename);
    }

    #[test]
    fn test_loose_manifest_name_sniffs_content() {
        let mut bytes = vec![0u8, 1, 2, b'1', b'2', b'3'];
        bytes.extend_from_slice(b"\x00rev=9876543210123\x00");
        let id = identify_manifest("7301.manifest", &bytes, 42).unwrap();
        assert_eq!(id.depot_id, "7301");
        assert_eq!(id.revision_id, "9876543210123");
        assert_eq!(id.source, RevisionSource::Sniffed);
    }

    #[test]
    fn test_loose_manifest_name_synthesizes_revision() {
        let id = identify_manifest("7301-copy.manifest", b"no digits here", 1_700_000_000).unwrap();
        assert_eq!(id.depot_id, "7301");
        assert_eq!(id.revision_id, "1700000000");
        assert_eq!(id.source, RevisionSource::Synthesized);
    }

    #[test]
    fn test_unidentifiable_manifest() {
        assert!(identify_manifest("depot.manifest", b"", 1).is_none());
    }

    #[test]
    fn test_sniff_window_is_one_kilobyte() {
        let mut bytes = vec![0u8; SNIFF_WINDOW];
        bytes.extend_from_slice(b"12345678901234");
        assert_eq!(sniff_revision(&bytes), None);

        let mut bytes = vec![0u8; SNIFF_WINDOW - 12];
        bytes.extend_from_slice(b"123456789012");
        assert_eq!(sniff_revision(&bytes).as_deref(), Some("123456789012"));
    }

    #[test]
    fn test_short_digit_runs_ignored() {
        assert_eq!(sniff_revision(b"123456789 and 12345"), None);
    }

    #[test]
    fn test_belongs_to() {
        let title = TitleId::parse("730").unwrap();
        let refs: BTreeSet<String> = ["7301".to_string()].into_iter().collect();
        assert!(belongs_to("7301", "7301_1.manifest", &title, &refs));
        assert!(belongs_to("9", "730_backup.manifest", &title, &refs));
        assert!(!belongs_to("9", "9_1.manifest", &title, &refs));
    }

    #[test]
    fn test_compare_numeric() {
        assert_eq!(compare_numeric("9", "10"), Ordering::Less);
        assert_eq!(compare_numeric("3333333333", "1111111111"), Ordering::Greater);
        assert_eq!(compare_numeric("5", "5"), Ordering::Equal);
    }
}
