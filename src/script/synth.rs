// src/script/synth.rs
//! Script synthesis with structural merge
//!
//! The synthesizer owns three kinds of lines: the generated header block,
//! the title registration, and the keyed registration plus revision pin of
//! every pinned depot. Everything else in the prior script (optional
//! component registrations, tokens, comments, unknown calls) is written back
//! verbatim at its original position. Depots that are new relative to the
//! prior script are inserted right after the last managed line.

use super::{Declaration, ScriptDocument, ScriptLine};
use crate::model::{DepotId, RevisionId, TitleId};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// First line of every generated header block
pub const HEADER_BANNER: &str = "-- depotkeep manifest bundle";

/// Registration flag written when the prior script does not supply one
const DEFAULT_FLAG: &str = "1";

/// A depot with a resolved key, pinned to one revision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinnedDepot {
    pub depot_id: DepotId,
    pub revision_id: RevisionId,
    pub key: String,
}

impl PinnedDepot {
    pub fn new(depot_id: impl Into<String>, revision_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            depot_id: depot_id.into(),
            revision_id: revision_id.into(),
            key: key.into(),
        }
    }
}

/// Everything the synthesizer needs for one title
#[derive(Debug, Clone, Copy)]
pub struct SynthesisInput<'a> {
    pub title_id: &'a TitleId,
    pub title_name: Option<&'a str>,
    /// Depots to register and pin, in output order for new depots
    pub depots: &'a [PinnedDepot],
    /// Depots whose declarations must disappear (unresolved keys)
    pub excluded: &'a BTreeSet<DepotId>,
    /// Structural base: its layout and author lines are kept in place
    pub prior: Option<&'a str>,
    /// Older version whose author lines are appended when missing from `prior`
    pub previous: Option<&'a str>,
}

/// Produce a script body for one title
pub fn synthesize(input: &SynthesisInput<'_>) -> String {
    let prior = input.prior.map(ScriptDocument::parse).unwrap_or_default();
    let pinned: BTreeMap<&str, &PinnedDepot> = input
        .depots
        .iter()
        .map(|d| (d.depot_id.as_str(), d))
        .collect();

    let trailing = collect_trailing(&prior, &pinned);
    let title = input.title_id.as_str();

    let mut body: Vec<String> = Vec::new();
    let mut emitted: HashSet<&str> = HashSet::new();
    let mut title_emitted = false;
    let mut insert_at: Option<usize> = None;

    for line in skip_header(&prior.lines) {
        let ScriptLine::Declaration { decl, trailing: own_trailing, raw } = line else {
            body.push(line.raw().to_string());
            continue;
        };
        let id = decl.id();

        if id == title && decl.is_registration() {
            if !title_emitted {
                body.push(with_trailing(format!("addappid({title})"), own_trailing.as_deref()));
                title_emitted = true;
                insert_at = Some(body.len());
            }
            continue;
        }

        if let Some(depot) = pinned.get(id)
            && !matches!(decl, Declaration::Token { .. })
        {
            if emitted.insert(depot.depot_id.as_str()) {
                let comments = trailing.get(id);
                body.push(registration_line(
                    depot,
                    comments.and_then(|c| c.flag.as_deref()),
                    comments.and_then(|c| c.register.as_deref()),
                ));
                body.push(pin_line(depot, comments.and_then(|c| c.pin.as_deref())));
                insert_at = Some(body.len());
            }
            continue;
        }

        if is_excluded(decl, title, input.excluded) {
            continue;
        }

        // Pins are owned by the synthesizer; a pin without a pinned depot is stale
        if matches!(decl, Declaration::Pin { .. }) {
            continue;
        }

        body.push(raw.clone());
    }

    if !title_emitted {
        body.insert(0, format!("addappid({title})"));
        insert_at = Some(insert_at.map_or(1, |i| i + 1));
    }

    let mut new_lines = Vec::new();
    for depot in input.depots {
        if !emitted.contains(depot.depot_id.as_str()) {
            new_lines.push(registration_line(depot, None, None));
            new_lines.push(pin_line(depot, None));
        }
    }
    let at = insert_at.unwrap_or(body.len()).min(body.len());
    body.splice(at..at, new_lines);

    if let Some(previous) = input.previous {
        append_missing_author_lines(&mut body, previous, input, &pinned);
    }

    while body.last().is_some_and(|l| l.trim().is_empty()) {
        body.pop();
    }

    let mut out = header(input);
    out.push('\n');
    for line in body {
        out.push_str(&line);
        out.push('\n');
    }
    out
}

/// Registrations and pins of an excluded depot are dropped; tokens and the
/// title's own lines are never dropped
fn is_excluded(decl: &Declaration, title: &str, excluded: &BTreeSet<DepotId>) -> bool {
    decl.id() != title
        && excluded.contains(decl.id())
        && (decl.is_registration() || matches!(decl, Declaration::Pin { .. }))
}

fn header(input: &SynthesisInput<'_>) -> String {
    let mut out = String::new();
    out.push_str(HEADER_BANNER);
    out.push('\n');
    let name = input.title_name.map(header_safe).unwrap_or_default();
    if name.is_empty() {
        out.push_str(&format!("-- Title: {}\n", input.title_id));
    } else {
        out.push_str(&format!("-- Title: {} ({})\n", name, input.title_id));
    }
    out.push_str(&format!("-- Depots: {}\n", input.depots.len()));
    out
}

/// Catalog names must stay on the one header comment line
fn header_safe(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Skip a previously generated header block (banner plus contiguous comments)
fn skip_header(lines: &[ScriptLine]) -> &[ScriptLine] {
    match lines.first() {
        Some(ScriptLine::Comment(raw)) if raw.trim() == HEADER_BANNER => {
            let end = lines
                .iter()
                .position(|l| !matches!(l, ScriptLine::Comment(_)))
                .unwrap_or(lines.len());
            // Drop the blank separator written after the header
            let end = if matches!(lines.get(end), Some(ScriptLine::Blank)) {
                end + 1
            } else {
                end
            };
            &lines[end..]
        }
        _ => lines,
    }
}

#[derive(Debug, Default)]
struct DepotAnnotations {
    flag: Option<String>,
    register: Option<String>,
    pin: Option<String>,
}

/// Flags and trailing comments attached to pinned depots in the prior script
fn collect_trailing<'a>(
    prior: &ScriptDocument,
    pinned: &BTreeMap<&'a str, &PinnedDepot>,
) -> BTreeMap<String, DepotAnnotations> {
    let mut out: BTreeMap<String, DepotAnnotations> = BTreeMap::new();
    for line in &prior.lines {
        let ScriptLine::Declaration { decl, trailing, .. } = line else {
            continue;
        };
        if !pinned.contains_key(decl.id()) {
            continue;
        }
        let entry = out.entry(decl.id().to_string()).or_default();
        match decl {
            Declaration::RegisterKeyed { flag, .. } => {
                entry.flag.get_or_insert_with(|| flag.clone());
                if entry.register.is_none() {
                    entry.register = trailing.clone();
                }
            }
            Declaration::Register { .. } => {
                if entry.register.is_none() {
                    entry.register = trailing.clone();
                }
            }
            Declaration::Pin { .. } => {
                if entry.pin.is_none() {
                    entry.pin = trailing.clone();
                }
            }
            Declaration::Token { .. } => {}
        }
    }
    out
}

fn registration_line(depot: &PinnedDepot, flag: Option<&str>, trailing: Option<&str>) -> String {
    with_trailing(
        format!(
            "addappid({}, {}, \"{}\")",
            depot.depot_id,
            flag.unwrap_or(DEFAULT_FLAG),
            depot.key
        ),
        trailing,
    )
}

fn pin_line(depot: &PinnedDepot, trailing: Option<&str>) -> String {
    with_trailing(
        format!("setManifestid({}, \"{}\")", depot.depot_id, depot.revision_id),
        trailing,
    )
}

fn with_trailing(line: String, trailing: Option<&str>) -> String {
    match trailing {
        Some(comment) => format!("{line} {comment}"),
        None => line,
    }
}

/// Append author lines from an older script that the new base lacks
fn append_missing_author_lines(
    body: &mut Vec<String>,
    previous: &str,
    input: &SynthesisInput<'_>,
    pinned: &BTreeMap<&str, &PinnedDepot>,
) {
    let present: HashSet<String> = body.iter().map(|l| l.trim().to_string()).collect();
    let previous = ScriptDocument::parse(previous);
    let title = input.title_id.as_str();

    let mut missing = Vec::new();
    for line in skip_header(&previous.lines) {
        let keep = match line {
            ScriptLine::Blank => false,
            ScriptLine::Comment(_) | ScriptLine::Other(_) => true,
            ScriptLine::Declaration { decl, .. } => {
                let id = decl.id();
                !matches!(decl, Declaration::Pin { .. })
                    && !(id == title && decl.is_registration())
                    && !(pinned.contains_key(id) && decl.is_registration())
                    && !is_excluded(decl, title, input.excluded)
            }
        };
        if keep && !present.contains(line.raw().trim()) {
            missing.push(line.raw().to_string());
        }
    }

    if !missing.is_empty() {
        body.push(String::new());
        body.extend(missing);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn title() -> TitleId {
        TitleId::parse("730").unwrap()
    }

    fn input<'a>(
        title: &'a TitleId,
        depots: &'a [PinnedDepot],
        excluded: &'a BTreeSet<DepotId>,
        prior: Option<&'a str>,
    ) -> SynthesisInput<'a> {
        SynthesisInput {
            title_id: title,
            title_name: Some("Counter-Strike 2"),
            depots,
            excluded,
            prior,
            previous: None,
        }
    }

    #[test]
    fn test_fresh_script() {
        let title = title();
        let depots = vec![
            PinnedDepot::new("7301", "1111111111", "ABC"),
            PinnedDepot::new("7302", "2222222222", "DEF"),
        ];
        let excluded = BTreeSet::new();
        let text = synthesize(&input(&title, &depots, &excluded, None));

        assert_eq!(
            text,
            "-- depotkeep manifest bundle\n\
             -- Title: Counter-Strike 2 (730)\n\
             -- Depots: 2\n\
             \n\
             addappid(730)\n\
             addappid(7301, 1, \"ABC\")\n\
             setManifestid(7301, \"1111111111\")\n\
             addappid(7302, 1, \"DEF\")\n\
             setManifestid(7302, \"2222222222\")\n"
        );
    }

    #[test]
    fn test_round_trip_pins() {
        let title = title();
        let depots = vec![
            PinnedDepot::new("7301", "1111111111", "ABC"),
            PinnedDepot::new("7305", "5555555555", "FFF"),
        ];
        let excluded = BTreeSet::new();
        let text = synthesize(&input(&title, &depots, &excluded, None));

        let extracted: BTreeSet<(String, String)> = ScriptDocument::parse(&text).pins().into_iter().collect();
        let expected: BTreeSet<(String, String)> = depots
            .iter()
            .map(|d| (d.depot_id.clone(), d.revision_id.clone()))
            .collect();
        assert_eq!(extracted, expected);
    }

    #[test]
    fn test_merge_preserves_author_lines_in_place() {
        let prior = "-- my notes\n\
                     addappid(730)\n\
                     addappid(7301, 1, \"ABC\") -- main\n\
                     setManifestid(7301, \"1111111111\")\n\
                     addappid(99901) -- soundtrack DLC\n\
                     addtoken(730, \"tok\")\n";
        let title = title();
        let depots = vec![PinnedDepot::new("7301", "3333333333", "ABC")];
        let excluded = BTreeSet::new();
        let text = synthesize(&input(&title, &depots, &excluded, Some(prior)));

        let body: Vec<&str> = text.lines().skip(4).collect();
        assert_eq!(
            body,
            vec![
                "-- my notes",
                "addappid(730)",
                "addappid(7301, 1, \"ABC\") -- main",
                "setManifestid(7301, \"3333333333\")",
                "addappid(99901) -- soundtrack DLC",
                "addtoken(730, \"tok\")",
            ]
        );
    }

    #[test]
    fn test_regeneration_is_stable() {
        let title = title();
        let depots = vec![PinnedDepot::new("7301", "1111111111", "ABC")];
        let excluded = BTreeSet::new();
        let first = synthesize(&input(&title, &depots, &excluded, Some("addappid(730)\naddappid(4242)\n")));
        let second = synthesize(&input(&title, &depots, &excluded, Some(&first)));
        assert_eq!(first, second);
        assert_eq!(first.matches(HEADER_BANNER).count(), 1);
    }

    #[test]
    fn test_excluded_depot_dropped_and_keyed_unmatched_survives() {
        let prior = "addappid(730)\n\
                     addappid(7301, 1, \"ABC\")\n\
                     addappid(7302)\n\
                     setManifestid(7302, \"2222222222\")\n\
                     addappid(7303, 1, \"XYZ\")\n";
        let title = title();
        let depots = vec![PinnedDepot::new("7301", "1111111111", "ABC")];
        let excluded: BTreeSet<DepotId> = ["7302".to_string()].into_iter().collect();
        let text = synthesize(&input(&title, &depots, &excluded, Some(prior)));

        assert!(!text.contains("7302"));
        assert!(text.contains("addappid(7303, 1, \"XYZ\")"));
        assert!(!text.contains("setManifestid(7303"));
        assert_eq!(ScriptDocument::parse(&text).pins().len(), 1);
    }

    #[test]
    fn test_new_depots_follow_last_managed_line() {
        let prior = "addappid(730)\n\
                     addappid(7301, 2, \"ABC\")\n\
                     setManifestid(7301, \"1\")\n\
                     -- trailer\n";
        let title = title();
        let depots = vec![
            PinnedDepot::new("7301", "1", "ABC"),
            PinnedDepot::new("7304", "4", "DDD"),
        ];
        let excluded = BTreeSet::new();
        let text = synthesize(&input(&title, &depots, &excluded, Some(prior)));
        let body: Vec<&str> = text.lines().skip(4).collect();
        assert_eq!(
            body,
            vec![
                "addappid(730)",
                "addappid(7301, 2, \"ABC\")",
                "setManifestid(7301, \"1\")",
                "addappid(7304, 1, \"DDD\")",
                "setManifestid(7304, \"4\")",
                "-- trailer",
            ]
        );
    }

    #[test]
    fn test_previous_author_lines_appended_once() {
        let title = title();
        let depots = vec![PinnedDepot::new("7301", "2", "ABC")];
        let excluded = BTreeSet::new();
        let mut inp = input(&title, &depots, &excluded, Some("addappid(730)\naddappid(555)\n"));
        let previous = "addappid(730)\naddappid(555)\naddappid(666) -- artbook\nsetManifestid(7301, \"1\")\n";
        inp.previous = Some(previous);

        let text = synthesize(&inp);
        assert_eq!(text.matches("addappid(555)").count(), 1);
        assert!(text.ends_with("addappid(666) -- artbook\n"));
        assert!(!text.contains("setManifestid(7301, \"1\")"));
    }

    #[test]
    fn test_title_token_survives_when_title_depot_unresolved() {
        let prior = "addappid(730)\n\
                     addappid(7301)\n\
                     addtoken(730, \"tok\") -- operator token\n";
        let title = title();
        let depots = vec![PinnedDepot::new("7301", "1", "A")];
        let excluded: BTreeSet<DepotId> = ["730".to_string()].into_iter().collect();
        let mut inp = input(&title, &depots, &excluded, Some(prior));
        inp.previous = Some(prior);

        let text = synthesize(&inp);
        assert_eq!(text.matches("addtoken(730, \"tok\") -- operator token").count(), 1);
        assert_eq!(text.matches("addappid(730)\n").count(), 1);
        assert!(text.contains("setManifestid(7301, \"1\")"));
    }

    #[test]
    fn test_excluded_depot_token_is_kept() {
        let prior = "addappid(730)\n\
                     addappid(7302)\n\
                     setManifestid(7302, \"2\")\n\
                     addtoken(7302, \"dlc-token\")\n";
        let title = title();
        let depots = vec![PinnedDepot::new("7301", "1", "A")];
        let excluded: BTreeSet<DepotId> = ["7302".to_string()].into_iter().collect();
        let text = synthesize(&input(&title, &depots, &excluded, Some(prior)));

        assert!(text.contains("addtoken(7302, \"dlc-token\")"));
        assert!(!text.contains("addappid(7302)"));
        assert!(!text.contains("setManifestid(7302"));
    }

    #[test]
    fn test_control_characters_in_name_stay_in_header() {
        let title = title();
        let depots = vec![PinnedDepot::new("7301", "1", "A")];
        let excluded = BTreeSet::new();
        let mut inp = input(&title, &depots, &excluded, None);
        inp.title_name = Some("Evil\naddappid(9999, 1, \"X\")\r");

        let text = synthesize(&inp);
        assert!(text.contains("-- Title: Evil addappid(9999, 1, \"X\") (730)\n"));
        assert!(!ScriptDocument::parse(&text).registers("9999"));

        // Regenerating from that script does not pick up the name as a declaration
        let again = synthesize(&input(&title, &depots, &excluded, Some(&text)));
        assert!(!ScriptDocument::parse(&again).registers("9999"));
    }
}
