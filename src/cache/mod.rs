//! TTL- and LRU-bounded caching over a key-value store.
//!
//! A [`CacheManager`] is layered over a storage backend: use
//! [`SqliteStore`](crate::store::SqliteStore) for a persistent cache that
//! survives restarts, or [`MemoryStore`](crate::store::MemoryStore) for an
//! ephemeral one. A given instance is one or the other, fixed at
//! construction by its type parameter.
//!
//! Entries expire after their TTL and are lazily removed on read; when the
//! entry count would exceed the configured maximum, the least recently
//! accessed entry is evicted first.

mod manager;

pub use manager::{CacheManager, CacheStats, KeyPattern};
