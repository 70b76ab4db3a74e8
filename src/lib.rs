//! Offline support toolkit: local-first storage with eventual remote
//! delivery.
//!
//! Four pieces, leaf-first:
//! - [`store`]: namespaced durable key-value storage (SQLite-backed or
//!   in-memory).
//! - [`network`]: connectivity monitor with change notifications and a
//!   wait-for-connection primitive.
//! - [`cache`]: TTL/LRU-bounded cache layered over a store, with
//!   single-flight get-or-compute and pattern invalidation.
//! - [`queue`]: a persistent, deduplicated, retry-driven queue that
//!   delivers locally-enqueued operations to registered handlers when
//!   connectivity allows.
//!
//! Application code enqueues mutations and writes optimistically to the
//! cache; the queue drains through its handlers when the monitor reports
//! online, with exponential backoff and a bounded retry ceiling. Failed
//! operations are retained for inspection, never silently dropped.

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod network;
pub mod queue;
pub mod store;

pub use cache::{CacheManager, CacheStats, KeyPattern};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, Config, QueueConfig, StorageConfig};
pub use error::{CacheError, QueueError, StoreError};
pub use network::{ConnectionType, NetworkMonitor, NetworkStatus, Subscription};
pub use queue::{
  DrainSummary, EnqueueOptions, OperationStatus, QueueStats, QueuedOperation, SyncQueue,
};
pub use store::{KvStore, MemoryStore, SqliteStore};
