//! In-memory store backend.
//!
//! Backs ephemeral cache instances and keeps tests off the filesystem.
//! Same contract as [`SqliteStore`](super::SqliteStore), minus durability.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

use super::KvStore;
use crate::error::StoreError;

#[derive(Debug, Default)]
pub struct MemoryStore {
  entries: Mutex<HashMap<(String, String), Value>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<(String, String), Value>>, StoreError> {
    self.entries.lock().map_err(|_| StoreError::LockPoisoned)
  }
}

impl KvStore for MemoryStore {
  fn set<T: Serialize>(&self, namespace: &str, key: &str, value: &T) -> Result<(), StoreError> {
    let value = serde_json::to_value(value).map_err(|source| StoreError::Serialization {
      namespace: namespace.to_string(),
      key: key.to_string(),
      source,
    })?;

    let mut entries = self.lock()?;
    entries.insert((namespace.to_string(), key.to_string()), value);
    Ok(())
  }

  fn get<T: DeserializeOwned>(&self, namespace: &str, key: &str) -> Result<Option<T>, StoreError> {
    let entries = self.lock()?;
    match entries.get(&(namespace.to_string(), key.to_string())) {
      Some(value) => {
        let value =
          serde_json::from_value(value.clone()).map_err(|source| StoreError::Deserialization {
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
    let mut entries = self.lock()?;
    Ok(
      entries
        .remove(&(namespace.to_string(), key.to_string()))
        .is_some(),
    )
  }

  fn clear(&self, namespace: &str) -> Result<usize, StoreError> {
    let mut entries = self.lock()?;
    let before = entries.len();
    entries.retain(|(ns, _), _| ns != namespace);
    Ok(before - entries.len())
  }

  fn keys(&self, namespace: &str) -> Result<Vec<String>, StoreError> {
    let entries = self.lock()?;
    Ok(
      entries
        .keys()
        .filter(|(ns, _)| ns == namespace)
        .map(|(_, key)| key.clone())
        .collect(),
    )
  }
}
