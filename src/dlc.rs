// src/dlc.rs

//! DLC completeness analysis
//!
//! Counts how many of a title's content-bearing extensions are tracked in the
//! store. Decorative extras are listed but never move the percentage.

use crate::catalog::{Catalog, ExtensionKind};
use crate::error::{Error, Result};
use crate::model::TitleId;
use crate::script::ScriptDocument;
use crate::store::StoreClient;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default wall-clock budget for one analysis
pub const DEFAULT_ANALYSIS_BUDGET: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Tracked,
    Missing,
    Decorative,
}

/// Per-extension detail
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DlcItem {
    pub id: TitleId,
    pub name: Option<String>,
    pub has_own_depot: bool,
    pub status: ItemStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DlcReport {
    pub title_id: TitleId,
    pub total_extensions: usize,
    pub content_count: usize,
    pub tracked_content_count: usize,
    pub decorative_count: usize,
    pub completion_percent: f64,
    pub items: Vec<DlcItem>,
}

/// `tracked / content × 100`, rounded to two decimals
///
/// A title with no content extensions is complete.
pub fn completion_percent(tracked: usize, content: usize) -> f64 {
    if content == 0 {
        return 100.0;
    }
    let raw = tracked as f64 / content as f64 * 100.0;
    (raw * 100.0).round() / 100.0
}

pub struct DlcAnalyzer {
    store: StoreClient,
    catalog: Arc<dyn Catalog>,
}

impl DlcAnalyzer {
    pub fn new(store: StoreClient, catalog: Arc<dyn Catalog>) -> Self {
        Self { store, catalog }
    }

    pub async fn analyze(&self, title_id: &TitleId) -> Result<DlcReport> {
        let metadata = self
            .catalog
            .get_title_metadata(title_id)
            .await?
            .ok_or_else(|| Error::NotFoundError(format!("Catalog does not know title {title_id}")))?;

        let units: BTreeSet<TitleId> = self.store.list().await?.into_iter().collect();

        // Extensions shipped inside the base depots are tracked through the base script
        let base_script = match self.store.read(title_id).await? {
            Some(unit) => unit.script().map(|s| ScriptDocument::parse(&s)),
            None => None,
        };

        let mut items = Vec::with_capacity(metadata.extensions.len());
        for extension in &metadata.extensions {
            let status = match extension.kind {
                ExtensionKind::Decorative => ItemStatus::Decorative,
                ExtensionKind::Content => {
                    let has_unit = units.contains(&extension.id);
                    let in_base = !extension.has_own_depot
                        && base_script
                            .as_ref()
                            .is_some_and(|doc| doc.registers(extension.id.as_str()));
                    if has_unit || in_base {
                        ItemStatus::Tracked
                    } else {
                        ItemStatus::Missing
                    }
                }
            };
            debug!("Extension {} of {}: {:?}", extension.id, title_id, status);
            items.push(DlcItem {
                id: extension.id.clone(),
                name: extension.name.clone(),
                has_own_depot: extension.has_own_depot,
                status,
            });
        }

        let content_count = items.iter().filter(|i| i.status != ItemStatus::Decorative).count();
        let tracked_content_count = items.iter().filter(|i| i.status == ItemStatus::Tracked).count();

        Ok(DlcReport {
            title_id: title_id.clone(),
            total_extensions: items.len(),
            content_count,
            tracked_content_count,
            decorative_count: items.len() - content_count,
            completion_percent: completion_percent(tracked_content_count, content_count),
            items,
        })
    }

    /// Analysis bounded by a wall-clock budget; `Ok(None)` on timeout
    pub async fn analyze_with_budget(&self, title_id: &TitleId, budget: Duration) -> Result<Option<DlcReport>> {
        match tokio::time::timeout(budget, self.analyze(title_id)).await {
            Ok(result) => result.map(Some),
            Err(_) => {
                warn!("DLC analysis of title {} exceeded {:?}; skipping", title_id, budget);
                Ok(None)
            }
        }
    }
}
