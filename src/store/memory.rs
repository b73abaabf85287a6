// src/store/memory.rs

//! In-memory version store

use super::VersionStore;
use crate::error::Result;
use crate::model::{StoredFile, TitleId};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// Store units held in a map; used by tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryStore {
    units: RwLock<BTreeMap<TitleId, Vec<StoredFile>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn unit_count(&self) -> usize {
        self.units.read().await.len()
    }
}

#[async_trait]
impl VersionStore for MemoryStore {
    async fn read_unit(&self, title_id: &TitleId) -> Result<Option<Vec<StoredFile>>> {
        Ok(self.units.read().await.get(title_id).cloned())
    }

    async fn write_unit(&self, title_id: &TitleId, files: &[StoredFile]) -> Result<bool> {
        let mut sorted = files.to_vec();
        sorted.sort();
        let previous = self.units.write().await.insert(title_id.clone(), sorted);
        Ok(previous.is_none())
    }

    async fn list_units(&self) -> Result<Vec<TitleId>> {
        Ok(self.units.read().await.keys().cloned().collect())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
