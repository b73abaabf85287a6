// src/catalog/mod.rs

//! Catalog service ports
//!
//! The catalog is consumed, never owned: it reports a title's display name,
//! its extension content, and the latest revision of each depot. It is
//! eventually consistent and may be down, so every caller has a store-only
//! fallback.

mod http;
mod throttle;

pub use http::{HttpCatalog, HttpManifestSource};
pub use throttle::{MinIntervalThrottle, NoThrottle, Throttle, ThrottledCatalog};

use crate::error::Result;
use crate::model::{DepotId, RevisionId, TitleId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Whether an extension carries game content or is cosmetic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionKind {
    Content,
    /// Soundtracks, artbooks and other extras
    Decorative,
}

/// One declared extension (DLC) of a title
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Extension {
    pub id: TitleId,
    #[serde(default)]
    pub name: Option<String>,
    pub kind: ExtensionKind,
    /// False when the extension ships inside the base title's depots
    #[serde(default)]
    pub has_own_depot: bool,
}

/// Catalog view of one title
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TitleMetadata {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub extensions: Vec<Extension>,
    #[serde(default)]
    pub current_revisions_by_depot: BTreeMap<DepotId, RevisionId>,
}

/// Read-only catalog port
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Metadata for a title, `None` if the catalog does not know it
    ///
    /// Transport failures surface as `CatalogServiceUnavailable`.
    async fn get_title_metadata(&self, title_id: &TitleId) -> Result<Option<TitleMetadata>>;
}

/// Source of raw manifest bytes for a specific depot revision
#[async_trait]
pub trait ManifestSource: Send + Sync {
    async fn fetch(&self, depot_id: &str, revision_id: &str) -> Result<Vec<u8>>;
}
