// src/store/filesystem.rs

//! Filesystem version store
//!
//! One directory per title under the store root. A write stages the full
//! file set in a `.<title>.tmp-<nanos>` sibling, moves the current unit
//! aside to `.<title>.old-<nanos>`, then renames the staging directory into
//! place. A reader sees either the old unit or the new one, never a mix.
//!
//! The swap runs on the blocking pool and finishes even when the caller
//! stops waiting for it. If the process dies between the two renames, the
//! retired copy is served by reads and moved back by the next write.

use super::VersionStore;
use crate::error::{Error, Result};
use crate::model::{StoredFile, TitleId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

const STAGING_TAG: &str = "tmp";
const RETIRED_TAG: &str = "old";
const READ_ATTEMPTS: usize = 3;

/// Directory-per-title store
#[derive(Debug, Clone)]
pub struct FilesystemStore {
    root: PathBuf,
    /// Serializes swaps issued through this store
    swap: Arc<Mutex<()>>,
}

impl FilesystemStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            swap: Arc::new(Mutex::new(())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn unit_path(&self, title_id: &TitleId) -> PathBuf {
        self.root.join(title_id.as_str())
    }
}

fn check_file_name(name: &str) -> Result<()> {
    if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
        return Err(Error::IoError(format!("Refusing to store file with unsafe name '{name}'")));
    }
    Ok(())
}

fn scratch_path(root: &Path, title_id: &TitleId, tag: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    root.join(format!(".{}.{}-{}", title_id, tag, nanos))
}

/// Split `.<title>.<tag>-<nanos>` into its parts
fn parse_scratch_name(name: &str) -> Option<(&str, &str, u128)> {
    let rest = name.strip_prefix('.')?;
    let (title, tail) = rest.split_once('.')?;
    let (tag, nanos) = tail.split_once('-')?;
    Some((title, tag, nanos.parse().ok()?))
}

/// Scratch directories belonging to `title_id`, oldest first
fn scratch_dirs(root: &Path, title_id: &TitleId, tag: &str) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::IoError(format!("Failed to list store root: {e}"))),
    };

    let mut found = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::IoError(format!("Failed to list store root: {e}")))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some((title, entry_tag, nanos)) = parse_scratch_name(name)
            && title == title_id.as_str()
            && entry_tag == tag
        {
            found.push((nanos, entry.path()));
        }
    }
    found.sort();
    Ok(found.into_iter().map(|(_, path)| path).collect())
}

fn remove_scratch(path: &Path) {
    if let Err(e) = fs::remove_dir_all(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!("Failed to remove {}: {}", path.display(), e);
    }
}

/// Undo what an interrupted swap left behind for `title_id`
fn recover_unit(root: &Path, title_id: &TitleId) -> Result<()> {
    for staging in scratch_dirs(root, title_id, STAGING_TAG)? {
        debug!("Removing abandoned staging directory {}", staging.display());
        remove_scratch(&staging);
    }

    let mut retired = scratch_dirs(root, title_id, RETIRED_TAG)?;
    let target = root.join(title_id.as_str());
    if !target.exists()
        && let Some(latest) = retired.pop()
    {
        fs::rename(&latest, &target).map_err(|e| {
            Error::IoError(format!("Failed to restore unit {} from {}: {e}", title_id, latest.display()))
        })?;
        info!("Restored unit {} from interrupted write", title_id);
    }
    for stale in retired {
        remove_scratch(&stale);
    }
    Ok(())
}

fn write_unit_blocking(root: &Path, title_id: &TitleId, files: &[StoredFile]) -> Result<bool> {
    fs::create_dir_all(root).map_err(|e| Error::IoError(format!("Failed to create store root: {e}")))?;
    recover_unit(root, title_id)?;

    let staging = scratch_path(root, title_id, STAGING_TAG);
    fs::create_dir(&staging)
        .map_err(|e| Error::IoError(format!("Failed to create staging directory: {e}")))?;

    for file in files {
        if let Err(e) = fs::write(staging.join(&file.name), &file.data) {
            remove_scratch(&staging);
            return Err(Error::IoError(format!("Failed to write {}: {e}", file.name)));
        }
    }

    let target = root.join(title_id.as_str());
    let created = !target.exists();

    let retired = if created {
        None
    } else {
        let retired = scratch_path(root, title_id, RETIRED_TAG);
        if let Err(e) = fs::rename(&target, &retired) {
            remove_scratch(&staging);
            return Err(Error::IoError(format!("Failed to retire unit {}: {e}", title_id)));
        }
        Some(retired)
    };

    if let Err(e) = fs::rename(&staging, &target) {
        if let Some(retired) = &retired
            && let Err(restore) = fs::rename(retired, &target)
        {
            error!(
                "Failed to put unit {} back from {}: {}; the next write will restore it",
                title_id,
                retired.display(),
                restore
            );
        }
        remove_scratch(&staging);
        return Err(Error::IoError(format!("Failed to swap unit {}: {e}", title_id)));
    }

    if let Some(retired) = retired {
        remove_scratch(&retired);
    }

    Ok(created)
}

async fn read_dir_files(dir: &Path, title_id: &TitleId) -> Result<Option<Vec<StoredFile>>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(Error::IoError(format!("Failed to read unit {}: {e}", dir.display())));
        }
    };

    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| Error::IoError(format!("Failed to list unit {}: {e}", dir.display())))?
    {
        let file_type = entry
            .file_type()
            .await
            .map_err(|e| Error::IoError(format!("Failed to stat {}: {e}", entry.path().display())))?;
        if !file_type.is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            warn!("Ignoring non-UTF-8 file in unit {}", title_id);
            continue;
        };
        let data = tokio::fs::read(entry.path())
            .await
            .map_err(|e| Error::IoError(format!("Failed to read {}: {e}", entry.path().display())))?;
        files.push(StoredFile { name, data });
    }

    files.sort();
    Ok(Some(files))
}

#[async_trait]
impl VersionStore for FilesystemStore {
    async fn read_unit(&self, title_id: &TitleId) -> Result<Option<Vec<StoredFile>>> {
        let dir = self.unit_path(title_id);
        for _ in 0..READ_ATTEMPTS {
            if let Some(files) = read_dir_files(&dir, title_id).await? {
                return Ok(Some(files));
            }

            // Mid-swap, or a write was interrupted between its renames
            let retired = {
                let root = self.root.clone();
                let title_id = title_id.clone();
                tokio::task::spawn_blocking(move || scratch_dirs(&root, &title_id, RETIRED_TAG))
                    .await
                    .map_err(|e| Error::IoError(format!("Store scan task failed: {e}")))??
            };
            let Some(latest) = retired.last() else {
                return read_dir_files(&dir, title_id).await;
            };
            if let Some(files) = read_dir_files(latest, title_id).await? {
                debug!("Serving unit {} from {}", title_id, latest.display());
                return Ok(Some(files));
            }
            // The swap completed while the retired copy was looked up
        }
        read_dir_files(&dir, title_id).await
    }

    async fn write_unit(&self, title_id: &TitleId, files: &[StoredFile]) -> Result<bool> {
        for file in files {
            check_file_name(&file.name)?;
        }

        let root = self.root.clone();
        let swap = self.swap.clone();
        let owned_title = title_id.clone();
        let owned_files = files.to_vec();
        let created = tokio::task::spawn_blocking(move || {
            let _swap = swap.lock();
            write_unit_blocking(&root, &owned_title, &owned_files)
        })
        .await
        .map_err(|e| Error::IoError(format!("Store write task failed: {e}")))??;

        debug!("Wrote {} file(s) to unit {}", files.len(), title_id);
        Ok(created)
    }

    async fn list_units(&self) -> Result<Vec<TitleId>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::IoError(format!("Failed to list store root: {e}"))),
        };

        let mut titles = BTreeSet::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::IoError(format!("Failed to list store root: {e}")))?
        {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            // A retired copy with no live unit still counts as stored
            let candidate = match parse_scratch_name(&name) {
                Some((title, RETIRED_TAG, _)) => title.to_string(),
                Some(_) => continue,
                None => name,
            };
            if let Ok(title_id) = TitleId::parse(&candidate) {
                titles.insert(title_id);
            }
        }

        Ok(titles.into_iter().collect())
    }

    fn name(&self) -> &str {
        "filesystem"
    }

    fn lock_dir(&self) -> Option<&Path> {
        Some(&self.root)
    }
}
