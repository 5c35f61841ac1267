//! Snapshot storage trait with in-memory and SQLite implementations.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::traits::{CacheEntry, DatasetSnapshot};
use crate::error::{ListError, Result};
use crate::filters::{CacheKey, Signature};

/// Trait for snapshot storage backends.
///
/// Implementations replace entries wholesale; they never merge snapshots.
pub trait SnapshotStorage: Send + Sync {
  /// Get the entry stored under `key`.
  fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>>;

  /// Store (or replace) the entry under `key`.
  fn put(&self, key: &CacheKey, entry: &CacheEntry) -> Result<()>;

  /// All keys currently stored.
  fn keys(&self) -> Result<Vec<CacheKey>>;

  /// Remove the given keys, ignoring ones that are absent.
  fn remove(&self, keys: &[CacheKey]) -> Result<()>;

  /// Remove everything.
  fn clear(&self) -> Result<()>;
}

/// Session-scoped storage. Default backend.
#[derive(Debug, Default)]
pub struct MemoryStorage {
  entries: Mutex<HashMap<CacheKey, CacheEntry>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }
}

impl SnapshotStorage for MemoryStorage {
  fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
    Ok(self.entries.lock()?.get(key).cloned())
  }

  fn put(&self, key: &CacheKey, entry: &CacheEntry) -> Result<()> {
    self.entries.lock()?.insert(key.clone(), entry.clone());
    Ok(())
  }

  fn keys(&self) -> Result<Vec<CacheKey>> {
    Ok(self.entries.lock()?.keys().cloned().collect())
  }

  fn remove(&self, keys: &[CacheKey]) -> Result<()> {
    let mut entries = self.entries.lock()?;
    for key in keys {
      entries.remove(key);
    }
    Ok(())
  }

  fn clear(&self) -> Result<()> {
    self.entries.lock()?.clear();
    Ok(())
  }
}

/// SQLite-based snapshot storage, so a restarted session can serve stale
/// pages while it revalidates.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

/// Schema for the page cache table.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS page_cache (
    signature TEXT NOT NULL,
    page_size INTEGER NOT NULL,
    page INTEGER NOT NULL,
    data BLOB NOT NULL,
    fetched_at TEXT NOT NULL,
    ttl_ms INTEGER NOT NULL,
    PRIMARY KEY (signature, page_size, page)
);

CREATE INDEX IF NOT EXISTS idx_page_cache_signature ON page_cache(signature);
"#;

impl SqliteStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        ListError::Storage(format!("Failed to create cache directory: {}", e))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      ListError::Storage(format!(
        "Failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::with_connection(conn)
  }

  /// Open a throwaway database that lives as long as the storage.
  pub fn open_in_memory() -> Result<Self> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| ListError::Storage("Could not determine data directory".to_string()))?;

    Ok(data_dir.join("userdeck").join("cache.db"))
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| ListError::Storage(format!("Failed to run cache migrations: {}", e)))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }
}

impl SnapshotStorage for SqliteStorage {
  fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
    let conn = self.conn.lock()?;

    let row: Option<(Vec<u8>, String, i64)> = conn
      .query_row(
        "SELECT data, fetched_at, ttl_ms FROM page_cache
         WHERE signature = ? AND page_size = ? AND page = ?",
        params![key.signature.as_str(), key.page_size, key.page],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()?;

    let Some((data, fetched_at, ttl_ms)) = row else {
      return Ok(None);
    };

    let snapshot: DatasetSnapshot = serde_json::from_slice(&data)
      .map_err(|e| ListError::Storage(format!("Failed to deserialize snapshot: {}", e)))?;

    Ok(Some(CacheEntry {
      snapshot: Arc::new(snapshot),
      fetched_at: parse_datetime(&fetched_at)?,
      ttl: Duration::milliseconds(ttl_ms),
    }))
  }

  fn put(&self, key: &CacheKey, entry: &CacheEntry) -> Result<()> {
    let conn = self.conn.lock()?;
    let data = serde_json::to_vec(entry.snapshot.as_ref())
      .map_err(|e| ListError::Storage(format!("Failed to serialize snapshot: {}", e)))?;

    conn.execute(
      "INSERT OR REPLACE INTO page_cache (signature, page_size, page, data, fetched_at, ttl_ms)
       VALUES (?, ?, ?, ?, ?, ?)",
      params![
        key.signature.as_str(),
        key.page_size,
        key.page,
        data,
        entry.fetched_at.to_rfc3339(),
        entry.ttl.num_milliseconds()
      ],
    )?;

    Ok(())
  }

  fn keys(&self) -> Result<Vec<CacheKey>> {
    let conn = self.conn.lock()?;
    let mut stmt = conn.prepare("SELECT signature, page_size, page FROM page_cache")?;

    let keys = stmt
      .query_map([], |row| {
        Ok(CacheKey {
          signature: Signature::from_hex(row.get::<_, String>(0)?),
          page_size: row.get(1)?,
          page: row.get(2)?,
        })
      })?
      .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(keys)
  }

  fn remove(&self, keys: &[CacheKey]) -> Result<()> {
    let mut conn = self.conn.lock()?;
    let tx = conn.transaction()?;
    for key in keys {
      tx.execute(
        "DELETE FROM page_cache WHERE signature = ? AND page_size = ? AND page = ?",
        params![key.signature.as_str(), key.page_size, key.page],
      )?;
    }
    tx.commit()?;
    Ok(())
  }

  fn clear(&self) -> Result<()> {
    self.conn.lock()?.execute("DELETE FROM page_cache", [])?;
    Ok(())
  }
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| ListError::Storage(format!("Failed to parse datetime '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::types::Role;
  use crate::filters::FilterSet;

  fn entry(total_items: u64) -> CacheEntry {
    CacheEntry {
      snapshot: Arc::new(DatasetSnapshot {
        items: Vec::new(),
        page: 1,
        page_size: 10,
        total_items,
        total_pages: 1,
      }),
      fetched_at: DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap(),
      ttl: Duration::minutes(5),
    }
  }

  fn exercise(storage: &dyn SnapshotStorage) {
    let all = CacheKey::new(1, 10, &FilterSet::default());
    let admins = CacheKey::new(1, 10, &FilterSet::default().with_role(Role::Admin));

    assert!(storage.get(&all).unwrap().is_none());

    storage.put(&all, &entry(3)).unwrap();
    storage.put(&admins, &entry(1)).unwrap();
    let stored = storage.get(&all).unwrap().unwrap();
    assert_eq!(stored.snapshot.total_items, 3);
    assert_eq!(stored.ttl, Duration::minutes(5));
    assert_eq!(stored.fetched_at, entry(3).fetched_at);

    // Replace, not merge
    storage.put(&all, &entry(7)).unwrap();
    assert_eq!(storage.get(&all).unwrap().unwrap().snapshot.total_items, 7);

    let mut keys = storage.keys().unwrap();
    keys.sort();
    assert_eq!(keys.len(), 2);

    storage.remove(&[admins.clone()]).unwrap();
    assert!(storage.get(&admins).unwrap().is_none());
    assert!(storage.get(&all).unwrap().is_some());

    storage.clear().unwrap();
    assert!(storage.keys().unwrap().is_empty());
  }

  #[test]
  fn test_memory_storage() {
    exercise(&MemoryStorage::new());
  }

  #[test]
  fn test_sqlite_storage() {
    exercise(&SqliteStorage::open_in_memory().unwrap());
  }
}
