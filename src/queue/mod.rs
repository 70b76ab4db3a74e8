//! Persistent, retryable, deduplicated queue of pending remote operations.
//!
//! Application code enqueues locally-originated mutations; the queue
//! persists them immediately, then delivers them to registered handlers
//! when the network monitor reports online, retrying with exponential
//! backoff up to a per-operation ceiling. Operations that exhaust their
//! retries are retained as failed, never silently dropped, until
//! explicitly cleared.
//!
//! The queue assumes single-process ownership of its persisted state;
//! coordinating several processes over one store is out of scope.

mod operation;
mod sync_queue;

pub use operation::{BackoffPolicy, OperationStatus, QueuedOperation};
pub use sync_queue::{DrainSummary, EnqueueOptions, QueueStats, SyncQueue};
