// src/store/mod.rs

//! Version store client
//!
//! The store is a plain key-value port: one unit (a flat file set) per title.
//! [`StoreClient`] layers the commit contract on top of it:
//! - read the current unit to learn whether this is a create or an update
//! - write the full bundle file set, replacing the unit wholesale
//! - retry transient write failures with linear backoff
//! - hold the title's lock for the whole read-then-write

mod filesystem;
mod lock;
mod memory;

pub use filesystem::FilesystemStore;
pub use lock::{TitleGuard, TitleLocks};
pub use memory::MemoryStore;

use crate::archive::RESERVED_TABLES;
use crate::assembler::ident::compare_numeric;
use crate::error::{Error, Result};
use crate::model::{
    AuxiliaryKeyTable, Bundle, DepotId, LEGACY_SCRIPT_SUFFIX, ManifestFile, RevisionId, RevisionSource, StoredFile,
    TitleId, UNVERIFIED_REVISIONS_FILE, files_digest,
};
use crate::script::ScriptDocument;
use async_trait::async_trait;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default number of write attempts before a commit fails
///
/// The first attempt plus three retries, waiting 1s, 2s and 3s.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 4;

/// Default base delay; attempt `n` waits `n` times this
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

static STORED_MANIFEST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)_(\d+)\.manifest$").expect("valid regex"));

/// Key-value port over the backing store
#[async_trait]
pub trait VersionStore: Send + Sync {
    /// Full file set of a title's unit, `None` if the unit does not exist
    async fn read_unit(&self, title_id: &TitleId) -> Result<Option<Vec<StoredFile>>>;

    /// Replace a title's unit with `files`; returns true if the unit was new
    async fn write_unit(&self, title_id: &TitleId, files: &[StoredFile]) -> Result<bool>;

    /// Titles that currently have a unit
    async fn list_units(&self) -> Result<Vec<TitleId>>;

    /// Backend name for logging
    fn name(&self) -> &str;

    /// Directory for cross-process title lock files, for shared backends
    fn lock_dir(&self) -> Option<&Path> {
        None
    }
}

/// Retry behaviour for store writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first; `attempts - 1` retries follow a failure
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_RETRY_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// A title's unit as read back from the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredUnit {
    pub title_id: TitleId,
    pub files: Vec<StoredFile>,
}

impl StoredUnit {
    /// Script text, preferring `<title>.script` over the legacy suffix
    pub fn script(&self) -> Option<String> {
        let primary = self.title_id.script_file_name();
        let legacy = format!("{}{}", self.title_id, LEGACY_SCRIPT_SUFFIX);
        self.files
            .iter()
            .find(|f| f.name == primary)
            .or_else(|| self.files.iter().find(|f| f.name.eq_ignore_ascii_case(&legacy)))
            .map(|f| String::from_utf8_lossy(&f.data).into_owned())
    }

    /// Manifest files named `<depot>_<revision>.manifest`
    ///
    /// If a unit somehow holds several revisions of one depot, only the
    /// numerically greatest is returned.
    ///
    /// Revisions listed in the unverified record come back as synthesized.
    pub fn manifests(&self) -> Vec<ManifestFile> {
        let unverified = self.unverified_revisions();
        let mut by_depot: BTreeMap<DepotId, ManifestFile> = BTreeMap::new();
        for file in &self.files {
            let Some(caps) = STORED_MANIFEST_RE.captures(&file.name) else {
                continue;
            };
            let mut manifest = ManifestFile::new(&caps[1], &caps[2], file.data.clone());
            if unverified.get(&manifest.depot_id) == Some(&manifest.revision_id) {
                manifest.revision_source = RevisionSource::Synthesized;
            }
            match by_depot.get(&manifest.depot_id) {
                Some(existing) if compare_numeric(&existing.revision_id, &manifest.revision_id).is_ge() => {}
                _ => {
                    by_depot.insert(manifest.depot_id.clone(), manifest);
                }
            }
        }
        by_depot.into_values().collect()
    }

    /// Stored `depot → revision` pairs
    ///
    /// Manifest filenames are authoritative; pins in the script fill in
    /// depots whose manifest is missing.
    pub fn revisions(&self) -> BTreeMap<DepotId, RevisionId> {
        let mut revisions: BTreeMap<DepotId, RevisionId> = self
            .manifests()
            .into_iter()
            .map(|m| (m.depot_id, m.revision_id))
            .collect();

        if let Some(script) = self.script() {
            for (depot_id, revision_id) in ScriptDocument::parse(&script).pins() {
                revisions.entry(depot_id).or_insert(revision_id);
            }
        }
        revisions
    }

    /// Recorded `depot → revision` pairs whose revision was synthesized
    pub fn unverified_revisions(&self) -> BTreeMap<DepotId, RevisionId> {
        let Some(file) = self.files.iter().find(|f| f.name == UNVERIFIED_REVISIONS_FILE) else {
            return BTreeMap::new();
        };
        serde_json::from_slice(&file.data).unwrap_or_else(|e| {
            warn!("Ignoring malformed {} in unit {}: {}", UNVERIFIED_REVISIONS_FILE, self.title_id, e);
            BTreeMap::new()
        })
    }

    /// Auxiliary key tables carried in the unit
    pub fn auxiliary_key_tables(&self) -> Vec<AuxiliaryKeyTable> {
        self.files
            .iter()
            .filter(|f| RESERVED_TABLES.iter().any(|r| f.name.eq_ignore_ascii_case(r)))
            .map(|f| AuxiliaryKeyTable {
                name: f.name.to_ascii_lowercase(),
                raw_bytes: f.data.clone(),
            })
            .collect()
    }

    pub fn digest(&self) -> String {
        files_digest(&self.files)
    }
}

/// Result of a successful commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    /// True when no unit existed before this commit
    pub created: bool,
    pub digest: String,
    /// Write attempts used
    pub attempts: u32,
}

/// Commit-level client over a [`VersionStore`]
#[derive(Clone)]
pub struct StoreClient {
    store: Arc<dyn VersionStore>,
    locks: TitleLocks,
    retry: RetryPolicy,
}

impl StoreClient {
    pub fn new(store: Arc<dyn VersionStore>) -> Self {
        let locks = match store.lock_dir() {
            Some(dir) => TitleLocks::with_lock_dir(dir),
            None => TitleLocks::new(),
        };
        Self {
            store,
            locks,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Share a lock registry with other components
    pub fn with_locks(mut self, locks: TitleLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn locks(&self) -> &TitleLocks {
        &self.locks
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Take the lock for a title, for callers doing read-modify-write
    pub async fn lock(&self, title_id: &TitleId) -> Result<TitleGuard> {
        self.locks.acquire(title_id).await
    }

    /// Read a title's unit
    pub async fn read(&self, title_id: &TitleId) -> Result<Option<StoredUnit>> {
        let files = self.with_retries(title_id, "read", || self.store.read_unit(title_id)).await?;
        Ok(files.map(|files| StoredUnit {
            title_id: title_id.clone(),
            files,
        }))
    }

    /// Titles under management
    pub async fn list(&self) -> Result<Vec<TitleId>> {
        self.store.list_units().await
    }

    /// Commit a bundle, taking the title's lock for the duration
    pub async fn commit(&self, title_id: &TitleId, bundle: &Bundle) -> Result<CommitOutcome> {
        let guard = self.lock(title_id).await?;
        self.commit_held(&guard, bundle).await
    }

    /// Commit a bundle while the caller already holds the title's lock
    pub async fn commit_held(&self, guard: &TitleGuard, bundle: &Bundle) -> Result<CommitOutcome> {
        if guard.title_id() != &bundle.title_id {
            return Err(Error::LockMismatch {
                held: guard.title_id().to_string(),
                requested: bundle.title_id.to_string(),
            });
        }
        let title_id = &bundle.title_id;

        let existing = self.read(title_id).await.map_err(|e| Error::StoreWriteFailure {
            title_id: title_id.to_string(),
            attempts: self.retry.attempts,
            reason: format!("read before write failed: {e}"),
        })?;
        let created = existing.is_none();

        let files = bundle.files();
        let digest = files_digest(&files);

        if let Some(existing) = &existing
            && existing.digest() == digest
        {
            debug!("Unit {} already matches bundle {}", title_id, &digest[..12]);
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.write_unit(title_id, &files).await {
                Ok(_) => {
                    info!(
                        "Committed title {} to {} store ({}, {} file(s))",
                        title_id,
                        self.store.name(),
                        if created { "created" } else { "updated" },
                        files.len()
                    );
                    return Ok(CommitOutcome {
                        created,
                        digest,
                        attempts: attempt,
                    });
                }
                Err(e) if e.is_transient() && attempt < self.retry.attempts => {
                    warn!(
                        "Write attempt {} for title {} failed: {}, retrying...",
                        attempt, title_id, e
                    );
                    tokio::time::sleep(self.retry.delay * attempt).await;
                }
                Err(e) => {
                    return Err(Error::StoreWriteFailure {
                        title_id: title_id.to_string(),
                        attempts: attempt,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    async fn with_retries<T, F, Fut>(&self, title_id: &TitleId, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.retry.attempts => {
                    warn!(
                        "Store {} attempt {} for title {} failed: {}, retrying...",
                        what, attempt, title_id, e
                    );
                    tokio::time::sleep(self.retry.delay * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Depot;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn title(id: &str) -> TitleId {
        TitleId::parse(id).unwrap()
    }

    fn bundle(rev: &str) -> Bundle {
        Bundle {
            title_id: title("730"),
            title_name: None,
            script: format!("addappid(730)\naddappid(7301, 1, \"ABC\")\nsetManifestid(7301, \"{rev}\")\n"),
            depots: vec![Depot::new("7301", rev).with_key("ABC")],
            manifest_files: vec![ManifestFile::new("7301", rev, b"bytes".to_vec())],
            auxiliary_key_tables: vec![],
            skipped_depot_count: 0,
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            delay: Duration::from_millis(1),
        }
    }

    /// Fails the first `failures` writes with a transient error
    struct FlakyStore {
        inner: MemoryStore,
        failures: u32,
        writes: AtomicU32,
    }

    #[async_trait]
    impl VersionStore for FlakyStore {
        async fn read_unit(&self, title_id: &TitleId) -> Result<Option<Vec<StoredFile>>> {
            self.inner.read_unit(title_id).await
        }

        async fn write_unit(&self, title_id: &TitleId, files: &[StoredFile]) -> Result<bool> {
            let n = self.writes.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(Error::IoError("connection reset".to_string()));
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

    #[tokio::test]
    async fn test_commit_twice_created_then_updated() {
        let client = StoreClient::new(Arc::new(MemoryStore::new()));
        let b = bundle("1111111111");

        let first = client.commit(&b.title_id, &b).await.unwrap();
        let second = client.commit(&b.title_id, &b).await.unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.digest, second.digest);

        let unit = client.read(&b.title_id).await.unwrap().unwrap();
        assert_eq!(unit.files, b.files());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            failures: 2,
            writes: AtomicU32::new(0),
        });
        let client = StoreClient::new(store.clone()).with_retry(fast_retry());
        let b = bundle("1");

        let outcome = client.commit(&b.title_id, &b).await.unwrap();
        assert_eq!(outcome.attempts, 3);
        assert!(outcome.created);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_is_store_write_failure() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            failures: 10,
            writes: AtomicU32::new(0),
        });
        let client = StoreClient::new(store.clone()).with_retry(fast_retry());
        let b = bundle("1");

        match client.commit(&b.title_id, &b).await {
            Err(Error::StoreWriteFailure { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(store.writes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_default_policy_retries_three_times() {
        assert_eq!(RetryPolicy::default().attempts, 4);
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            failures: 3,
            writes: AtomicU32::new(0),
        });
        let policy = RetryPolicy {
            delay: Duration::from_millis(1),
            ..RetryPolicy::default()
        };
        let client = StoreClient::new(store.clone()).with_retry(policy);
        let b = bundle("1");

        let outcome = client.commit(&b.title_id, &b).await.unwrap();
        assert_eq!(outcome.attempts, 4);
        assert_eq!(store.writes.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_filesystem_client_uses_file_locks() {
        let dir = tempfile::tempdir().unwrap();
        let client = StoreClient::new(Arc::new(FilesystemStore::new(dir.path())));
        assert_eq!(client.locks().lock_dir(), Some(dir.path()));
        assert_eq!(StoreClient::new(Arc::new(MemoryStore::new())).locks().lock_dir(), None);
    }

    #[tokio::test]
    async fn test_commit_held_rejects_wrong_guard() {
        let client = StoreClient::new(Arc::new(MemoryStore::new()));
        let guard = client.lock(&title("440")).await.unwrap();
        let err = client.commit_held(&guard, &bundle("1")).await.unwrap_err();
        assert!(matches!(err, Error::LockMismatch { .. }));
    }

    #[test]
    fn test_stored_unit_revisions() {
        let unit = StoredUnit {
            title_id: title("730"),
            files: vec![
                StoredFile::new(
                    "730.script",
                    "addappid(7301, 1, \"A\")\nsetManifestid(7301, \"9\")\nsetManifestid(7302, \"2222222222\")\n",
                ),
                StoredFile::new("7301_1111111111.manifest", "m"),
                StoredFile::new("DepotKeys.json", "{}"),
            ],
        };

        let revisions = unit.revisions();
        assert_eq!(revisions.get("7301").map(String::as_str), Some("1111111111"));
        assert_eq!(revisions.get("7302").map(String::as_str), Some("2222222222"));
        assert_eq!(unit.auxiliary_key_tables()[0].name, "depotkeys.json");
        assert!(unit.script().unwrap().contains("7301"));
    }
}
