//! Error types for the store, cache, and sync queue.

use thiserror::Error;

/// Errors from the key-value store.
#[derive(Debug, Error)]
pub enum StoreError {
  /// The value could not be serialized to JSON.
  #[error("failed to serialize value for {namespace}:{key}: {source}")]
  Serialization {
    namespace: String,
    key: String,
    #[source]
    source: serde_json::Error,
  },

  /// Data exists under the key but could not be deserialized.
  ///
  /// A missing key is not an error; it is an `Ok(None)` result.
  #[error("failed to deserialize stored data for {namespace}:{key}: {source}")]
  Deserialization {
    namespace: String,
    key: String,
    #[source]
    source: serde_json::Error,
  },

  #[error("storage backend error: {0}")]
  Backend(#[from] rusqlite::Error),

  #[error("failed to create storage directory {path}: {source}")]
  Io {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("could not determine data directory")]
  NoDataDir,

  #[error("storage lock poisoned")]
  LockPoisoned,
}

/// Errors from the cache manager.
#[derive(Debug, Error)]
pub enum CacheError {
  #[error(transparent)]
  Store(#[from] StoreError),

  /// The compute function passed to `get_or_set` failed.
  ///
  /// Failures are never cached; a subsequent call runs the compute again.
  #[error("compute failed for cache key {key}: {message}")]
  Compute { key: String, message: String },
}

/// Errors from the sync queue.
#[derive(Debug, Error)]
pub enum QueueError {
  /// Enqueue was called for an operation type with no registered handler.
  #[error("no handler registered for operation type \"{0}\"")]
  UnregisteredHandler(String),

  #[error(transparent)]
  Store(#[from] StoreError),
}
