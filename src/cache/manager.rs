//! Cache manager: TTL expiry, LRU eviction, single-flight get-or-compute,
//! and pattern invalidation.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use regex::Regex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::error::{CacheError, StoreError};
use crate::store::KvStore;

/// Namespace the cache owns inside the backing store.
const NAMESPACE: &str = "cache";

/// A stored entry: the value plus the metadata TTL and LRU need.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
  value: Value,
  stored_at: DateTime<Utc>,
  ttl_ms: u64,
  last_accessed: DateTime<Utc>,
}

impl CacheEntry {
  fn is_expired(&self, now: DateTime<Utc>) -> bool {
    now - self.stored_at > chrono::Duration::milliseconds(self.ttl_ms as i64)
  }
}

/// In-memory view of an entry's timing metadata. Values stay in the
/// backing store; the index is what LRU decisions and size checks read.
#[derive(Debug, Clone, Copy)]
struct EntryMeta {
  stored_at: DateTime<Utc>,
  last_accessed: DateTime<Utc>,
  expires_at: DateTime<Utc>,
}

/// Cumulative counters since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
  pub hits: u64,
  pub misses: u64,
  pub evictions: u64,
  pub size: usize,
}

/// Key selector for [`CacheManager::invalidate`].
#[derive(Debug, Clone)]
pub enum KeyPattern {
  Exact(String),
  Regex(Regex),
}

impl KeyPattern {
  pub fn exact(key: impl Into<String>) -> Self {
    Self::Exact(key.into())
  }

  pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
    Ok(Self::Regex(Regex::new(pattern)?))
  }

  fn matches(&self, key: &str) -> bool {
    match self {
      Self::Exact(exact) => key == exact,
      Self::Regex(regex) => regex.is_match(key),
    }
  }
}

/// Result of an in-flight compute, cloneable across every waiter.
type InFlightResult = Result<Value, String>;
type InFlightFuture = Shared<BoxFuture<'static, InFlightResult>>;

struct CacheShared<S: KvStore> {
  store: Arc<S>,
  max_size: usize,
  clock: Arc<dyn Clock>,
  index: Mutex<HashMap<String, EntryMeta>>,
  in_flight: Mutex<HashMap<String, InFlightFuture>>,
  hits: AtomicU64,
  misses: AtomicU64,
  evictions: AtomicU64,
}

/// Bounded, TTL-expiring cache layered over a key-value store.
pub struct CacheManager<S: KvStore> {
  shared: Arc<CacheShared<S>>,
}

impl<S: KvStore> CacheManager<S> {
  /// Create a cache over the given backend, hydrating the metadata index
  /// from whatever a previous process left behind. Entries that are
  /// already expired or unreadable are dropped during hydration.
  pub fn new(
    store: Arc<S>,
    config: &CacheConfig,
    clock: Arc<dyn Clock>,
  ) -> Result<Self, CacheError> {
    let now = clock.now();
    let mut index = HashMap::new();

    for key in store.keys(NAMESPACE)? {
      match store.get::<CacheEntry>(NAMESPACE, &key) {
        Ok(Some(entry)) if !entry.is_expired(now) => {
          index.insert(key, entry_meta(&entry));
        }
        Ok(_) => {
          let _ = store.delete(NAMESPACE, &key);
        }
        Err(err) => {
          warn!(key = %key, error = %err, "dropping unreadable cache entry");
          let _ = store.delete(NAMESPACE, &key);
        }
      }
    }

    Ok(Self {
      shared: Arc::new(CacheShared {
        store,
        max_size: config.max_size,
        clock,
        index: Mutex::new(index),
        in_flight: Mutex::new(HashMap::new()),
        hits: AtomicU64::new(0),
        misses: AtomicU64::new(0),
        evictions: AtomicU64::new(0),
      }),
    })
  }

  /// Look up a value. Expired entries count as misses and are lazily
  /// removed; a hit refreshes the entry's LRU position.
  pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
    match self.shared.lookup(key)? {
      Some(value) => {
        let value =
          serde_json::from_value(value).map_err(|source| StoreError::Deserialization {
            namespace: NAMESPACE.to_string(),
            key: key.to_string(),
            source,
          })?;
        Ok(Some(value))
      }
      None => Ok(None),
    }
  }

  /// Insert or overwrite an entry with the given TTL, evicting the least
  /// recently accessed entry first if the cache is full.
  pub fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<(), CacheError> {
    let value = serde_json::to_value(value).map_err(|source| StoreError::Serialization {
      namespace: NAMESPACE.to_string(),
      key: key.to_string(),
      source,
    })?;
    self.shared.insert_entry(key, value, ttl)
  }

  /// Cache-aside read: return the cached value, or run `compute`, store
  /// its result under `key` with the given TTL, and return it.
  ///
  /// Concurrent calls for the same key share a single in-flight compute;
  /// late callers await the first caller's result instead of recomputing.
  /// Compute failures propagate to every waiter and are never cached, so
  /// the next call after a failure computes again.
  pub async fn get_or_set<T, F, Fut>(
    &self,
    key: &str,
    ttl: Duration,
    compute: F,
  ) -> Result<T, CacheError>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = color_eyre::Result<T>> + Send + 'static,
  {
    if let Some(value) = self.get::<T>(key)? {
      return Ok(value);
    }

    let (future, leader) = {
      let mut in_flight = self
        .shared
        .in_flight
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
      match in_flight.get(key) {
        Some(existing) => (existing.clone(), false),
        None => {
          let future: InFlightFuture =
            run_compute(Arc::clone(&self.shared), key.to_string(), ttl, compute())
              .boxed()
              .shared();
          in_flight.insert(key.to_string(), future.clone());
          (future, true)
        }
      }
    };

    let result = future.await;

    if leader {
      self
        .shared
        .in_flight
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(key);
    }

    match result {
      Ok(value) => {
        let value =
          serde_json::from_value(value).map_err(|source| StoreError::Deserialization {
            namespace: NAMESPACE.to_string(),
            key: key.to_string(),
            source,
          })?;
        Ok(value)
      }
      Err(message) => Err(CacheError::Compute {
        key: key.to_string(),
        message,
      }),
    }
  }

  /// Remove all entries whose key matches the pattern. Returns the count
  /// removed.
  pub fn invalidate(&self, pattern: &KeyPattern) -> Result<usize, CacheError> {
    let mut index = self.shared.lock_index();
    let matching: Vec<String> = index
      .keys()
      .filter(|key| pattern.matches(key))
      .cloned()
      .collect();

    for key in &matching {
      index.remove(key);
      self.shared.store.delete(NAMESPACE, key)?;
    }

    if !matching.is_empty() {
      debug!(count = matching.len(), "invalidated cache entries");
    }
    Ok(matching.len())
  }

  /// Cumulative counters since construction.
  pub fn stats(&self) -> CacheStats {
    CacheStats {
      hits: self.shared.hits.load(Ordering::Relaxed),
      misses: self.shared.misses.load(Ordering::Relaxed),
      evictions: self.shared.evictions.load(Ordering::Relaxed),
      size: self.shared.lock_index().len(),
    }
  }
}

impl<S: KvStore> Clone for CacheManager<S> {
  fn clone(&self) -> Self {
    Self {
      shared: Arc::clone(&self.shared),
    }
  }
}

impl<S: KvStore> CacheShared<S> {
  fn lock_index(&self) -> std::sync::MutexGuard<'_, HashMap<String, EntryMeta>> {
    self.index.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Fetch a live value, refreshing its LRU position. Counts a hit or a
  /// miss; lazily deletes entries found expired.
  fn lookup(&self, key: &str) -> Result<Option<Value>, CacheError> {
    let now = self.clock.now();

    let expired = {
      let index = self.lock_index();
      match index.get(key) {
        None => {
          self.misses.fetch_add(1, Ordering::Relaxed);
          return Ok(None);
        }
        Some(meta) => now > meta.expires_at,
      }
    };

    if expired {
      // Logically absent already; remove it lazily now that we noticed
      self.lock_index().remove(key);
      self.store.delete(NAMESPACE, key)?;
      self.misses.fetch_add(1, Ordering::Relaxed);
      return Ok(None);
    }

    // Read through to the backing store; the index only holds metadata.
    let entry: Option<CacheEntry> = self.store.get(NAMESPACE, key)?;
    let Some(mut entry) = entry else {
      // Index said present but the backend disagrees; resync.
      self.lock_index().remove(key);
      self.misses.fetch_add(1, Ordering::Relaxed);
      return Ok(None);
    };

    entry.last_accessed = now;
    self.store.set(NAMESPACE, key, &entry)?;
    if let Some(meta) = self.lock_index().get_mut(key) {
      meta.last_accessed = now;
    }

    self.hits.fetch_add(1, Ordering::Relaxed);
    Ok(Some(entry.value))
  }

  fn insert_entry(&self, key: &str, value: Value, ttl: Duration) -> Result<(), CacheError> {
    let now = self.clock.now();
    let entry = CacheEntry {
      value,
      stored_at: now,
      ttl_ms: ttl.as_millis() as u64,
      last_accessed: now,
    };

    let mut index = self.lock_index();
    if !index.contains_key(key) && index.len() >= self.max_size {
      self.evict_lru(&mut index)?;
    }

    self.store.set(NAMESPACE, key, &entry)?;
    index.insert(key.to_string(), entry_meta(&entry));
    Ok(())
  }

  /// Evict the least recently accessed entry, ties broken by earliest
  /// stored_at.
  fn evict_lru(&self, index: &mut HashMap<String, EntryMeta>) -> Result<(), CacheError> {
    let victim = index
      .iter()
      .min_by_key(|(_, meta)| (meta.last_accessed, meta.stored_at))
      .map(|(key, _)| key.clone());

    if let Some(key) = victim {
      index.remove(&key);
      self.store.delete(NAMESPACE, &key)?;
      self.evictions.fetch_add(1, Ordering::Relaxed);
      debug!(key = %key, "evicted least recently used cache entry");
    }
    Ok(())
  }
}

fn entry_meta(entry: &CacheEntry) -> EntryMeta {
  EntryMeta {
    stored_at: entry.stored_at,
    last_accessed: entry.last_accessed,
    expires_at: entry.stored_at + chrono::Duration::milliseconds(entry.ttl_ms as i64),
  }
}

/// Body of the single in-flight compute for a key: run the caller's
/// future, store the result, and hand the serialized value to every
/// waiter. Failures are reported as strings so the result stays cloneable.
async fn run_compute<S, T, Fut>(
  shared: Arc<CacheShared<S>>,
  key: String,
  ttl: Duration,
  fut: Fut,
) -> InFlightResult
where
  S: KvStore,
  T: Serialize,
  Fut: Future<Output = color_eyre::Result<T>>,
{
  match fut.await {
    Ok(value) => {
      let value = serde_json::to_value(&value).map_err(|e| e.to_string())?;
      shared
        .insert_entry(&key, value.clone(), ttl)
        .map_err(|e| e.to_string())?;
      Ok(value)
    }
    Err(err) => Err(err.to_string()),
  }
}
