//! SQLite-backed durable store.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::KvStore;
use crate::error::StoreError;

/// Durable key-value store backed by SQLite.
///
/// Values are serialized to JSON blobs. The connection is shared behind a
/// mutex and held only for the duration of a single statement.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open or create the store at the default location.
  pub fn open() -> Result<Self, StoreError> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open or create the store at the given path.
  pub fn open_at(path: &Path) -> Result<Self, StoreError> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
        path: parent.display().to_string(),
        source,
      })?;
    }

    let conn = Connection::open(path)?;
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  /// Open a store that lives only in memory. No durability; useful for
  /// tests and throwaway instances.
  pub fn in_memory() -> Result<Self, StoreError> {
    let conn = Connection::open_in_memory()?;
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  /// Get the default database path.
  fn default_path() -> Result<PathBuf, StoreError> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or(StoreError::NoDataDir)?;

    Ok(data_dir.join("synckit").join("offline.db"))
  }

  /// Run database migrations.
  fn run_migrations(&self) -> Result<(), StoreError> {
    let conn = self.lock()?;
    conn.execute_batch(SCHEMA)?;
    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
    self.conn.lock().map_err(|_| StoreError::LockPoisoned)
  }
}

/// Schema for the key-value table.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_entries (
    namespace TEXT NOT NULL,
    key TEXT NOT NULL,
    data BLOB NOT NULL,
    stored_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (namespace, key)
);

CREATE INDEX IF NOT EXISTS idx_kv_entries_namespace ON kv_entries(namespace);
"#;

impl KvStore for SqliteStore {
  fn set<T: Serialize>(&self, namespace: &str, key: &str, value: &T) -> Result<(), StoreError> {
    let data = serde_json::to_vec(value).map_err(|source| StoreError::Serialization {
      namespace: namespace.to_string(),
      key: key.to_string(),
      source,
    })?;

    let conn = self.lock()?;
    conn.execute(
      "INSERT OR REPLACE INTO kv_entries (namespace, key, data, stored_at)
       VALUES (?, ?, ?, datetime('now'))",
      params![namespace, key, data],
    )?;

    Ok(())
  }

  fn get<T: DeserializeOwned>(&self, namespace: &str, key: &str) -> Result<Option<T>, StoreError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT data FROM kv_entries WHERE namespace = ? AND key = ?")?;

    let data: Option<Vec<u8>> = stmt
      .query_row(params![namespace, key], |row| row.get(0))
      .optional()?;

    match data {
      Some(data) => {
        let value = serde_json::from_slice(&data).map_err(|source| StoreError::Deserialization {
          namespace: namespace.to_string(),
          key: key.to_string(),
          source,
        })?;
        Ok(Some(value))
      }
      None => Ok(None),
    }
  }

  fn delete(&self, namespace: &str, key: &str) -> Result<bool, StoreError> {
    let conn = self.lock()?;
    let removed = conn.execute(
      "DELETE FROM kv_entries WHERE namespace = ? AND key = ?",
      params![namespace, key],
    )?;
    Ok(removed > 0)
  }

  fn clear(&self, namespace: &str) -> Result<usize, StoreError> {
    let conn = self.lock()?;
    let removed = conn.execute(
      "DELETE FROM kv_entries WHERE namespace = ?",
      params![namespace],
    )?;
    Ok(removed)
  }

  fn keys(&self, namespace: &str) -> Result<Vec<String>, StoreError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT key FROM kv_entries WHERE namespace = ?")?;

    let keys = stmt
      .query_map(params![namespace], |row| row.get(0))?
      .collect::<Result<Vec<String>, _>>()?;

    Ok(keys)
  }
}
