// src/store/lock.rs

//! Per-title write serialization
//!
//! Ingestion commits and reconciliation read-modify-write cycles for the same
//! title take the same lock. Different titles never contend. Whoever commits
//! last wins; nothing fails because another writer got there first.
//!
//! Inside one process the lock is an async mutex per title. When the backing
//! store lives on a shared filesystem, the guard also holds an exclusive
//! `flock` on `<lock dir>/.<title>.lock`, so `depotkeep ingest` and a running
//! `depotkeep daemon` serialize against each other as well.

use crate::error::{Error, Result};
use crate::model::TitleId;
use dashmap::DashMap;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{trace, warn};

type LockMap = Arc<DashMap<TitleId, Arc<Mutex<()>>>>;

/// Registry of per-title async mutexes
#[derive(Debug, Default, Clone)]
pub struct TitleLocks {
    locks: LockMap,
    /// Directory holding cross-process lock files, if any
    lock_dir: Option<PathBuf>,
}

/// Proof that the holder owns the lock for one title
///
/// Dropping the guard releases the file lock, then the in-process mutex,
/// and forgets the title's registry entry once nobody else refers to it.
#[derive(Debug)]
pub struct TitleGuard {
    title_id: TitleId,
    file: Option<File>,
    guard: Option<OwnedMutexGuard<()>>,
    locks: LockMap,
}

impl TitleGuard {
    pub fn title_id(&self) -> &TitleId {
        &self.title_id
    }
}

impl Drop for TitleGuard {
    fn drop(&mut self) {
        drop(self.file.take());
        drop(self.guard.take());
        // The map holds the only reference once no guard or waiter is left
        self.locks
            .remove_if(&self.title_id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

fn lock_file_path(dir: &Path, title_id: &TitleId) -> PathBuf {
    dir.join(format!(".{title_id}.lock"))
}

fn open_lock_file(dir: &Path, title_id: &TitleId) -> Result<File> {
    fs::create_dir_all(dir)?;
    let path = lock_file_path(dir, title_id);
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
        .map_err(|e| Error::IoError(format!("Failed to open lock file {}: {e}", path.display())))
}

impl TitleLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that also takes a file lock per title under `dir`
    pub fn with_lock_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            locks: LockMap::default(),
            lock_dir: Some(dir.as_ref().to_path_buf()),
        }
    }

    pub fn lock_dir(&self) -> Option<&Path> {
        self.lock_dir.as_deref()
    }

    fn mutex_for(&self, title_id: &TitleId) -> Arc<Mutex<()>> {
        // Clone the Arc out so the DashMap shard is not held across an await
        self.locks
            .entry(title_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Wait for and take the lock for `title_id`
    pub async fn acquire(&self, title_id: &TitleId) -> Result<TitleGuard> {
        let mutex = self.mutex_for(title_id);

        trace!("Waiting for lock on title {}", title_id);
        let mut guard = TitleGuard {
            title_id: title_id.clone(),
            file: None,
            guard: Some(mutex.lock_owned().await),
            locks: self.locks.clone(),
        };

        if let Some(dir) = self.lock_dir.clone() {
            let owned = title_id.clone();
            let file = tokio::task::spawn_blocking(move || {
                let file = open_lock_file(&dir, &owned)?;
                file.lock_exclusive()
                    .map_err(|e| Error::IoError(format!("Failed to lock title {owned}: {e}")))?;
                Ok::<_, Error>(file)
            })
            .await
            .map_err(|e| Error::IoError(format!("Lock task for title {title_id} failed: {e}")))??;
            guard.file = Some(file);
        }

        trace!("Acquired lock on title {}", title_id);
        Ok(guard)
    }

    /// Take the lock only if nobody holds it, in this process or another
    pub fn try_acquire(&self, title_id: &TitleId) -> Option<TitleGuard> {
        let mutex = self.mutex_for(title_id);
        let mut guard = TitleGuard {
            title_id: title_id.clone(),
            file: None,
            guard: Some(mutex.try_lock_owned().ok()?),
            locks: self.locks.clone(),
        };

        if let Some(dir) = &self.lock_dir {
            let file = match open_lock_file(dir, title_id) {
                Ok(file) => file,
                Err(e) => {
                    warn!("{}", e);
                    return None;
                }
            };
            file.try_lock_exclusive().ok()?;
            guard.file = Some(file);
        }

        Some(guard)
    }

    /// Number of titles currently locked or waited on
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
