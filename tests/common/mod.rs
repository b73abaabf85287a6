// tests/common/mod.rs

//! Shared test utilities and helpers for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use depotkeep::catalog::{Catalog, Extension, ExtensionKind, ManifestSource, TitleMetadata};
use depotkeep::model::{StoredFile, TitleId};
use depotkeep::store::{RetryPolicy, VersionStore};
use depotkeep::{Error, MemoryStore, Result, StoreClient};
use std::collections::BTreeMap;
use std::io::{Cursor, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

pub fn title(id: &str) -> TitleId {
    TitleId::parse(id).unwrap()
}

/// Build a zip archive from `(path, contents)` pairs
pub fn zip_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    for (name, data) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// Build a gzip-compressed tar archive from `(path, contents)` pairs
pub fn tar_gz_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *data).unwrap();
    }
    let tar = builder.into_inner().unwrap();

    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(&tar).unwrap();
    encoder.finish().unwrap()
}

/// Retry policy with millisecond delays
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        attempts: 3,
        delay: Duration::from_millis(1),
    }
}

/// Store client over a fresh in-memory store
pub fn memory_client() -> (Arc<MemoryStore>, StoreClient) {
    let store = Arc::new(MemoryStore::new());
    let client = StoreClient::new(store.clone()).with_retry(fast_retry());
    (store, client)
}

/// Catalog answering from a mutable in-memory map
#[derive(Default)]
pub struct FakeCatalog {
    titles: RwLock<BTreeMap<TitleId, TitleMetadata>>,
    pub calls: AtomicUsize,
    /// Titles for which the catalog reports itself unavailable
    unavailable: RwLock<Vec<TitleId>>,
    delay: Option<Duration>,
}

impl FakeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call sleeps this long before answering
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub async fn insert(&self, title_id: &str, metadata: TitleMetadata) {
        self.titles.write().await.insert(title(title_id), metadata);
    }

    pub async fn set_revisions(&self, title_id: &str, revisions: &[(&str, &str)]) {
        let mut titles = self.titles.write().await;
        let entry = titles.entry(title(title_id)).or_default();
        entry.current_revisions_by_depot = revisions
            .iter()
            .map(|(d, r)| (d.to_string(), r.to_string()))
            .collect();
    }

    pub async fn fail_for(&self, title_id: &str) {
        self.unavailable.write().await.push(title(title_id));
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Catalog for FakeCatalog {
    async fn get_title_metadata(&self, title_id: &TitleId) -> Result<Option<TitleMetadata>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.unavailable.read().await.contains(title_id) {
            return Err(Error::CatalogServiceUnavailable("fake outage".to_string()));
        }
        Ok(self.titles.read().await.get(title_id).cloned())
    }
}

/// Manifest source serving bytes from a map keyed by `(depot, revision)`
#[derive(Default)]
pub struct FakeManifestSource {
    manifests: RwLock<BTreeMap<(String, String), Vec<u8>>>,
    pub fetches: AtomicUsize,
}

impl FakeManifestSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, depot_id: &str, revision_id: &str, bytes: &[u8]) {
        self.manifests
            .write()
            .await
            .insert((depot_id.to_string(), revision_id.to_string()), bytes.to_vec());
    }
}

#[async_trait]
impl ManifestSource for FakeManifestSource {
    async fn fetch(&self, depot_id: &str, revision_id: &str) -> Result<Vec<u8>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.manifests
            .read()
            .await
            .get(&(depot_id.to_string(), revision_id.to_string()))
            .cloned()
            .ok_or_else(|| Error::NotFoundError(format!("{depot_id}_{revision_id}")))
    }
}

/// Store whose writes fail with a transient error a fixed number of times
pub struct FlakyStore {
    inner: MemoryStore,
    remaining_failures: AtomicUsize,
    pub writes: AtomicUsize,
}

impl FlakyStore {
    pub fn new(failures: usize) -> Self {
        Self {
            inner: MemoryStore::new(),
            remaining_failures: AtomicUsize::new(failures),
            writes: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl VersionStore for FlakyStore {
    async fn read_unit(&self, title_id: &TitleId) -> Result<Option<Vec<StoredFile>>> {
        self.inner.read_unit(title_id).await
    }

    async fn write_unit(&self, title_id: &TitleId, files: &[StoredFile]) -> Result<bool> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let remaining = self.remaining_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.remaining_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::IoError("simulated outage".to_string()));
        }
        self.inner.write_unit(title_id, files).await
    }

    async fn list_units(&self) -> Result<Vec<TitleId>> {
        self.inner.list_units().await
    }

    fn name(&self) -> &str {
        "flaky"
    }
}

pub fn extension(id: &str, kind: ExtensionKind, has_own_depot: bool) -> Extension {
    Extension {
        id: title(id),
        name: Some(format!("Extension {id}")),
        kind,
        has_own_depot,
    }
}
