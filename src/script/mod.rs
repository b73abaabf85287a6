// src/script/mod.rs

//! Declarative bundle scripts
//!
//! A script is a line-oriented list of Lua-style calls:
//!
//! ```text
//! -- comment
//! addappid(730)                          -- register title (or a bare id)
//! addappid(7301, 1, "ABCDEF")            -- register depot with key
//! setManifestid(7301, "1111111111")      -- pin depot to revision
//! addtoken(730, "token")                 -- token declaration
//! ```
//!
//! Parsing is lossless: every line keeps its raw text so that lines the
//! synthesizer does not own can be written back verbatim.

pub mod synth;

use crate::model::{DepotId, RevisionId};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

pub use synth::{PinnedDepot, SynthesisInput, synthesize};

static REGISTER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^\s*addappid\s*\(\s*(\d+)\s*(?:,\s*(\d+)\s*,\s*["']([^"']*)["']\s*)?\)\s*;?\s*(--.*)?$"#,
    )
    .expect("valid regex")
});

static PIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^\s*setManifestid\s*\(\s*(\d+)\s*,\s*["'](\d+)["']\s*(?:,\s*(\d+)\s*)?\)\s*;?\s*(--.*)?$"#,
    )
    .expect("valid regex")
});

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*addtoken\s*\(\s*(\d+)\s*,\s*["']([^"']*)["']\s*\)\s*;?\s*(--.*)?$"#)
        .expect("valid regex")
});

/// Loose scan used for the reference set; tolerates several calls per line
static REFERENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:addappid|setManifestid|addtoken)\s*\(\s*(\d+)").expect("valid regex")
});

/// Loose scan for keyed registrations anywhere in the text
static EMBEDDED_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"addappid\s*\(\s*(\d+)\s*,\s*\d+\s*,\s*["']([^"']+)["']"#).expect("valid regex")
});

/// A recognised script declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Declaration {
    /// `addappid(id)`: title registration or bare optional component
    Register { id: String },
    /// `addappid(id, flag, "key")`
    RegisterKeyed { id: String, flag: String, key: String },
    /// `setManifestid(id, "revision"[, size])`
    Pin {
        id: String,
        revision: RevisionId,
        size: Option<String>,
    },
    /// `addtoken(id, "token")`
    Token { id: String, token: String },
}

impl Declaration {
    /// The numeric ID the declaration is about
    pub fn id(&self) -> &str {
        match self {
            Self::Register { id }
            | Self::RegisterKeyed { id, .. }
            | Self::Pin { id, .. }
            | Self::Token { id, .. } => id,
        }
    }

    pub fn is_registration(&self) -> bool {
        matches!(self, Self::Register { .. } | Self::RegisterKeyed { .. })
    }
}

/// One line of a script
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptLine {
    Declaration {
        decl: Declaration,
        /// Trailing `-- comment`, if any
        trailing: Option<String>,
        raw: String,
    },
    Comment(String),
    Blank,
    /// Anything unrecognised; always preserved verbatim
    Other(String),
}

impl ScriptLine {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Self::Blank;
        }

        if let Some(caps) = REGISTER_RE.captures(raw) {
            let id = caps[1].to_string();
            let trailing = caps.get(4).map(|m| m.as_str().to_string());
            let decl = match (caps.get(2), caps.get(3)) {
                (Some(flag), Some(key)) if !key.as_str().is_empty() => Declaration::RegisterKeyed {
                    id,
                    flag: flag.as_str().to_string(),
                    key: key.as_str().to_string(),
                },
                _ => Declaration::Register { id },
            };
            return Self::Declaration {
                decl,
                trailing,
                raw: raw.to_string(),
            };
        }

        if let Some(caps) = PIN_RE.captures(raw) {
            return Self::Declaration {
                decl: Declaration::Pin {
                    id: caps[1].to_string(),
                    revision: caps[2].to_string(),
                    size: caps.get(3).map(|m| m.as_str().to_string()),
                },
                trailing: caps.get(4).map(|m| m.as_str().to_string()),
                raw: raw.to_string(),
            };
        }

        if let Some(caps) = TOKEN_RE.captures(raw) {
            return Self::Declaration {
                decl: Declaration::Token {
                    id: caps[1].to_string(),
                    token: caps[2].to_string(),
                },
                trailing: caps.get(3).map(|m| m.as_str().to_string()),
                raw: raw.to_string(),
            };
        }

        if trimmed.starts_with("--") {
            return Self::Comment(raw.to_string());
        }

        Self::Other(raw.to_string())
    }

    /// Original text of the line
    pub fn raw(&self) -> &str {
        match self {
            Self::Declaration { raw, .. } | Self::Comment(raw) | Self::Other(raw) => raw,
            Self::Blank => "",
        }
    }

    pub fn declaration(&self) -> Option<&Declaration> {
        match self {
            Self::Declaration { decl, .. } => Some(decl),
            _ => None,
        }
    }
}

/// Parsed script, one entry per input line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptDocument {
    pub lines: Vec<ScriptLine>,
}

impl ScriptDocument {
    pub fn parse(text: &str) -> Self {
        Self {
            lines: text.lines().map(ScriptLine::parse).collect(),
        }
    }

    pub fn declarations(&self) -> impl Iterator<Item = &Declaration> {
        self.lines.iter().filter_map(ScriptLine::declaration)
    }

    /// `(depot, revision)` pins in order of appearance, first pin per depot wins
    pub fn pins(&self) -> Vec<(DepotId, RevisionId)> {
        let mut seen = BTreeSet::new();
        let mut pins = Vec::new();
        for decl in self.declarations() {
            if let Declaration::Pin { id, revision, .. } = decl
                && seen.insert(id.clone())
            {
                pins.push((id.clone(), revision.clone()));
            }
        }
        pins
    }

    /// Whether any registration line names `id`
    pub fn registers(&self, id: &str) -> bool {
        self.declarations()
            .any(|d| d.is_registration() && d.id() == id)
    }
}

/// Keys declared by `addappid(depot, flag, "key")`, last declaration wins
pub fn embedded_keys(text: &str) -> BTreeMap<DepotId, String> {
    EMBEDDED_KEY_RE
        .captures_iter(text)
        .map(|caps| (caps[1].to_string(), caps[2].to_string()))
        .collect()
}

/// Every numeric ID referenced by a registration, pin or token declaration
pub fn referenced_ids(text: &str) -> BTreeSet<String> {
    REFERENCE_RE
        .captures_iter(text)
        .map(|caps| caps[1].to_string())
        .collect()
}
