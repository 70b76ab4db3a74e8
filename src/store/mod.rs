//! Namespaced durable key-value storage.
//!
//! This module is the persistence foundation for the cache and the sync
//! queue. Each subsystem owns a distinct namespace, so a single backend
//! can be shared without key collisions:
//! - `cache:<key>` — cache entries
//! - `syncqueue:<operation_id>` and `syncqueue:index` — queue state
//!
//! Values are stored as JSON. A missing key is a normal `None` result;
//! only corrupt-but-present data is an error.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use serde::{de::DeserializeOwned, Serialize};

use crate::error::StoreError;

/// Per-key outcomes of a batch operation, in input order.
pub type BatchResults<T> = Vec<(String, Result<T, StoreError>)>;

/// Trait for key-value storage backends.
pub trait KvStore: Send + Sync + 'static {
  /// Serialize `value` and write it under `namespace:key`, overwriting any
  /// previous value.
  fn set<T: Serialize>(&self, namespace: &str, key: &str, value: &T) -> Result<(), StoreError>;

  /// Read and deserialize the value under `namespace:key`.
  fn get<T: DeserializeOwned>(&self, namespace: &str, key: &str) -> Result<Option<T>, StoreError>;

  /// Remove the value under `namespace:key`. Returns whether a value was
  /// actually removed.
  fn delete(&self, namespace: &str, key: &str) -> Result<bool, StoreError>;

  /// Remove every key in the namespace. Returns the number removed.
  fn clear(&self, namespace: &str) -> Result<usize, StoreError>;

  /// All keys currently present in the namespace, in no particular order.
  fn keys(&self, namespace: &str) -> Result<Vec<String>, StoreError>;

  /// Batch write. Each key reports its own outcome; a value that fails to
  /// serialize does not prevent the remaining entries from landing.
  fn multi_set<T: Serialize>(&self, namespace: &str, entries: &[(&str, T)]) -> BatchResults<()> {
    entries
      .iter()
      .map(|(key, value)| ((*key).to_string(), self.set(namespace, key, value)))
      .collect()
  }

  /// Batch read with per-key outcomes.
  fn multi_get<T: DeserializeOwned>(&self, namespace: &str, keys: &[&str]) -> BatchResults<Option<T>> {
    keys
      .iter()
      .map(|key| ((*key).to_string(), self.get(namespace, key)))
      .collect()
  }
}
