// src/keys/table.rs

//! Persistent depot key table
//!
//! Maps depot IDs to decryption keys. Writes are idempotent upserts (last
//! write wins per depot) and are never tied to a version-store commit.

use crate::error::{Error, Result};
use crate::model::DepotId;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

/// Key-value port for depot keys
pub trait KeyTable: Send + Sync {
    /// Look up the key for a depot
    fn get(&self, depot_id: &str) -> Result<Option<String>>;

    /// Insert or replace the key for a depot
    fn put(&self, depot_id: &str, key: &str) -> Result<()>;

    /// Number of stored keys
    fn len(&self) -> Result<usize>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Upsert many entries; returns how many were written
    fn put_many(&self, entries: &BTreeMap<DepotId, String>) -> Result<usize> {
        for (depot_id, key) in entries {
            self.put(depot_id, key)?;
        }
        Ok(entries.len())
    }
}

/// In-memory key table
#[derive(Debug, Default)]
pub struct MemoryKeyTable {
    keys: RwLock<BTreeMap<DepotId, String>>,
}

impl MemoryKeyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let keys = entries
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self {
            keys: RwLock::new(keys),
        }
    }
}

impl KeyTable for MemoryKeyTable {
    fn get(&self, depot_id: &str) -> Result<Option<String>> {
        Ok(self.keys.read().get(depot_id).cloned())
    }

    fn put(&self, depot_id: &str, key: &str) -> Result<()> {
        self.keys.write().insert(depot_id.to_string(), key.to_string());
        Ok(())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.keys.read().len())
    }
}

/// SQLite-backed key table
pub struct SqliteKeyTable {
    conn: Mutex<Connection>,
}

impl SqliteKeyTable {
    /// Open (creating if needed) the key table database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::IoError(format!("Failed to create directory {}: {e}", parent.display()))
            })?;
        }

        let conn = Connection::open(path)?;
        info!("Opened key table at {}", path.display());
        Self::init(conn)
    }

    /// In-memory database, used by tests
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS depot_keys (
                 depot_id TEXT PRIMARY KEY NOT NULL,
                 decryption_key TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl KeyTable for SqliteKeyTable {
    fn get(&self, depot_id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT decryption_key FROM depot_keys WHERE depot_id = ?1")?;
        let key = stmt
            .query_row([depot_id], |row| row.get::<_, String>(0))
            .optional()?;
        Ok(key)
    }

    fn put(&self, depot_id: &str, key: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO depot_keys (depot_id, decryption_key, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(depot_id) DO UPDATE SET
                 decryption_key = excluded.decryption_key,
                 updated_at = excluded.updated_at",
            params![depot_id, key, Utc::now().to_rfc3339()],
        )?;
        debug!("Stored key for depot {}", depot_id);
        Ok(())
    }

    fn len(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM depot_keys", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn put_many(&self, entries: &BTreeMap<DepotId, String>) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        {
            let mut stmt = tx.prepare(
                "INSERT INTO depot_keys (depot_id, decryption_key, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(depot_id) DO UPDATE SET
                     decryption_key = excluded.decryption_key,
                     updated_at = excluded.updated_at",
            )?;
            for (depot_id, key) in entries {
                stmt.execute(params![depot_id, key, now])?;
            }
        }
        tx.commit()?;
        Ok(entries.len())
    }
}

/// Parse a `depotkeys.json`-style table
///
/// The document must be a JSON object whose keys are numeric IDs and whose
/// values are strings. Entries with empty values are dropped.
pub fn parse_key_table_json(data: &[u8]) -> Result<BTreeMap<DepotId, String>> {
    let value: serde_json::Value = serde_json::from_slice(data)?;
    let object = value
        .as_object()
        .ok_or_else(|| Error::ParseError("key table must be a JSON object".to_string()))?;

    let mut entries = BTreeMap::new();
    for (id, key) in object {
        let id = id.trim();
        if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::ParseError(format!("key table has non-numeric ID '{id}'")));
        }
        let key = key
            .as_str()
            .ok_or_else(|| Error::ParseError(format!("key for {id} is not a string")))?
            .trim();
        if !key.is_empty() {
            entries.insert(id.to_string(), key.to_string());
        }
    }
    Ok(entries)
}
