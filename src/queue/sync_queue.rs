//! The sync queue: persistence, dedupe coalescing, and the drain loop.

use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::operation::{BackoffPolicy, OperationStatus, QueuedOperation};
use crate::clock::Clock;
use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::network::NetworkMonitor;
use crate::store::KvStore;

/// Namespace the queue owns inside the backing store.
const NAMESPACE: &str = "syncqueue";
/// Key holding the FIFO index of retained operation ids.
const INDEX_KEY: &str = "index";

/// A boxed future returned by an operation handler.
type HandlerFuture = Pin<Box<dyn Future<Output = color_eyre::Result<()>> + Send>>;

/// A registered handler, invoked with the operation payload during drain.
type HandlerFn = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

/// Counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
  pub pending: usize,
  pub in_flight: usize,
  pub failed: usize,
  pub total: usize,
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
  pub attempted: usize,
  pub succeeded: usize,
  pub rescheduled: usize,
  pub failed: usize,
}

/// Per-operation enqueue options.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
  /// Retry ceiling override; defaults to the queue's configured ceiling.
  pub max_retries: Option<u32>,
  /// Coalescing key; see [`QueuedOperation::dedupe_key`].
  pub dedupe_key: Option<String>,
}

struct QueueState {
  ops: HashMap<String, QueuedOperation>,
  /// Retained operation ids in creation order. Drives FIFO drains and is
  /// persisted so ordering survives restarts.
  order: Vec<String>,
}

struct QueueShared<S: KvStore> {
  store: Arc<S>,
  config: QueueConfig,
  backoff: BackoffPolicy,
  clock: Arc<dyn Clock>,
  monitor: NetworkMonitor,
  handlers: RwLock<HashMap<String, HandlerFn>>,
  state: Mutex<QueueState>,
  draining: AtomicBool,
  tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Persistent, deduplicated queue that delivers enqueued operations to
/// registered handlers once connectivity allows.
///
/// One instance owns its persisted namespace; running two processes over
/// the same store is not supported.
pub struct SyncQueue<S: KvStore> {
  shared: Arc<QueueShared<S>>,
}

impl<S: KvStore> Clone for SyncQueue<S> {
  fn clone(&self) -> Self {
    Self {
      shared: Arc::clone(&self.shared),
    }
  }
}

/// Clears the draining flag when a pass ends, on every exit path.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}

impl<S: KvStore> SyncQueue<S> {
  /// Open the queue over the given store, restoring any operations a
  /// previous process persisted. Entries left `InFlight` by a dead
  /// process go back to `Pending` with their attempt counts intact.
  pub fn open(
    store: Arc<S>,
    monitor: NetworkMonitor,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
  ) -> Result<Self, QueueError> {
    let index: Vec<String> = store.get(NAMESPACE, INDEX_KEY)?.unwrap_or_default();
    let index_len = index.len();

    let mut ops = HashMap::new();
    let mut order = Vec::new();
    for id in index {
      match store.get::<QueuedOperation>(NAMESPACE, &id) {
        Ok(Some(mut op)) => {
          if op.status == OperationStatus::InFlight {
            // The process died mid-flight; the attempt never resolved
            op.status = OperationStatus::Pending;
            store.set(NAMESPACE, &id, &op)?;
          }
          order.push(id.clone());
          ops.insert(id, op);
        }
        Ok(None) => warn!(operation_id = %id, "queue index references a missing entry"),
        Err(err) => {
          warn!(operation_id = %id, error = %err, "dropping unreadable queue entry");
          let _ = store.delete(NAMESPACE, &id);
        }
      }
    }
    if order.len() != index_len {
      store.set(NAMESPACE, INDEX_KEY, &order)?;
    }
    if !order.is_empty() {
      info!(count = order.len(), "restored persisted sync queue entries");
    }

    let backoff = BackoffPolicy {
      base_delay_ms: config.base_delay_ms,
      max_delay_ms: config.max_delay_ms,
    };

    Ok(Self {
      shared: Arc::new(QueueShared {
        store,
        config,
        backoff,
        clock,
        monitor,
        handlers: RwLock::new(HashMap::new()),
        state: Mutex::new(QueueState { ops, order }),
        draining: AtomicBool::new(false),
        tasks: Mutex::new(Vec::new()),
      }),
    })
  }

  /// Bind a handler for an operation type. Re-registering the same type
  /// replaces the previous handler; last write wins. That is intentional,
  /// so hot-reload scenarios can swap handlers without restarting the
  /// queue.
  pub fn register_handler<F, Fut>(&self, operation_type: &str, handler: F)
  where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = color_eyre::Result<()>> + Send + 'static,
  {
    let handler: HandlerFn = Arc::new(move |payload| Box::pin(handler(payload)));
    self
      .shared
      .handlers
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(operation_type.to_string(), handler);
  }

  /// Queue an operation for delivery and persist it immediately.
  ///
  /// Fails fast when no handler is bound for `operation_type`. When
  /// `dedupe_key` matches a live entry, that entry's payload is replaced
  /// instead of adding a second one, and the existing id is returned.
  pub fn enqueue(
    &self,
    operation_type: &str,
    payload: Value,
    options: EnqueueOptions,
  ) -> Result<String, QueueError> {
    if !self
      .shared
      .handlers
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .contains_key(operation_type)
    {
      return Err(QueueError::UnregisteredHandler(operation_type.to_string()));
    }

    let now = self.shared.clock.now();
    let mut state = self.lock_state();

    if let Some(dedupe_key) = options.dedupe_key.as_deref() {
      let existing = state
        .ops
        .values_mut()
        .find(|op| op.is_live() && op.dedupe_key.as_deref() == Some(dedupe_key));
      if let Some(existing) = existing {
        // Last write wins: only the final payload matters for coalesced
        // operations like repeated updates to the same record
        existing.payload = payload;
        let op = existing.clone();
        self.shared.store.set(NAMESPACE, &op.operation_id, &op)?;
        debug!(
          operation_id = %op.operation_id,
          dedupe_key,
          "coalesced enqueue into existing entry"
        );
        return Ok(op.operation_id);
      }
    }

    let op = QueuedOperation {
      operation_id: Uuid::new_v4().to_string(),
      operation_type: operation_type.to_string(),
      payload,
      dedupe_key: options.dedupe_key,
      attempt: 0,
      max_retries: options
        .max_retries
        .unwrap_or(self.shared.config.default_max_retries),
      next_attempt_at: now,
      created_at: now,
      status: OperationStatus::Pending,
      last_error: None,
    };

    self.shared.store.set(NAMESPACE, &op.operation_id, &op)?;
    state.order.push(op.operation_id.clone());
    if let Err(err) = self.persist_index(&state.order) {
      state.order.pop();
      let _ = self.shared.store.delete(NAMESPACE, &op.operation_id);
      return Err(err.into());
    }

    let operation_id = op.operation_id.clone();
    debug!(operation_id = %operation_id, operation_type, "operation enqueued");
    state.ops.insert(operation_id.clone(), op);
    Ok(operation_id)
  }

  /// Process every due pending operation, FIFO by creation time.
  ///
  /// Only one pass runs at a time; a trigger that arrives while a pass is
  /// already running returns an empty summary instead of starting a
  /// second pass. Operations are only started while the monitor reports
  /// online, but an in-flight handler is never force-cancelled when
  /// connectivity drops mid-pass.
  pub async fn drain(&self) -> Result<DrainSummary, QueueError> {
    if self.shared.draining.swap(true, Ordering::SeqCst) {
      debug!("drain already in progress, skipping");
      return Ok(DrainSummary::default());
    }
    let _guard = DrainGuard(&self.shared.draining);

    let handlers: HashMap<String, HandlerFn> = self
      .shared
      .handlers
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone();

    let mut summary = DrainSummary::default();
    loop {
      if !self.shared.monitor.is_online() {
        break;
      }
      let now = self.shared.clock.now();

      let next = {
        let mut state = self.lock_state();
        let selected = state.order.iter().find_map(|id| {
          let op = state.ops.get(id)?;
          if !op.is_due(now) {
            return None;
          }
          // Entries restored from a previous process may predate handler
          // registration; leave them pending rather than failing them
          let handler = handlers.get(&op.operation_type)?;
          Some((id.clone(), handler.clone()))
        });
        match selected {
          Some((id, handler)) => state.ops.get_mut(&id).map(|op| {
            op.status = OperationStatus::InFlight;
            (op.clone(), handler)
          }),
          None => None,
        }
      };
      let Some((op, handler)) = next else { break };

      if let Err(err) = self.shared.store.set(NAMESPACE, &op.operation_id, &op) {
        if let Some(entry) = self.lock_state().ops.get_mut(&op.operation_id) {
          entry.status = OperationStatus::Pending;
        }
        return Err(err.into());
      }

      debug!(
        operation_id = %op.operation_id,
        operation_type = %op.operation_type,
        attempt = op.attempt,
        "executing operation"
      );
      summary.attempted += 1;
      let outcome = handler(op.payload.clone()).await;

      match outcome {
        Ok(()) => {
          summary.succeeded += 1;
          let order = {
            let mut state = self.lock_state();
            state.ops.remove(&op.operation_id);
            state.order.retain(|id| id != &op.operation_id);
            state.order.clone()
          };
          self.shared.store.delete(NAMESPACE, &op.operation_id)?;
          self.persist_index(&order)?;
          debug!(operation_id = %op.operation_id, "operation delivered");
        }
        Err(err) => {
          let updated = {
            let mut state = self.lock_state();
            state.ops.get_mut(&op.operation_id).map(|entry| {
              let delay = self.shared.backoff.delay_for(entry.attempt);
              entry.attempt += 1;
              entry.last_error = Some(err.to_string());
              if entry.attempt >= entry.max_retries {
                entry.status = OperationStatus::Failed;
                summary.failed += 1;
                warn!(
                  operation_id = %entry.operation_id,
                  attempts = entry.attempt,
                  error = %err,
                  "operation exhausted its retries"
                );
              } else {
                entry.status = OperationStatus::Pending;
                entry.next_attempt_at =
                  self.shared.clock.now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
                summary.rescheduled += 1;
                debug!(
                  operation_id = %entry.operation_id,
                  attempt = entry.attempt,
                  retry_in_ms = delay.as_millis() as u64,
                  "operation failed, retry scheduled"
                );
              }
              entry.clone()
            })
          };
          if let Some(entry) = updated {
            self.shared.store.set(NAMESPACE, &entry.operation_id, &entry)?;
          }
        }
      }
    }

    Ok(summary)
  }

  /// Spawn the standing drain triggers: a connectivity watcher that
  /// drains on the offline-to-online edge, and a periodic safety-net
  /// timer. Calling `start` again while running is a no-op.
  pub fn start(&self) {
    let mut tasks = self
      .shared
      .tasks
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    if !tasks.is_empty() {
      return;
    }

    let queue = self.clone();
    let mut connected = self.shared.monitor.connected_watch();
    tasks.push(tokio::spawn(async move {
      while connected.changed().await.is_ok() {
        if *connected.borrow_and_update() {
          info!("connectivity restored, draining sync queue");
          if let Err(err) = queue.drain().await {
            warn!(error = %err, "drain after reconnect failed");
          }
        }
      }
    }));

    // The first tick fires immediately, which also picks up operations
    // restored from a previous process
    let queue = self.clone();
    let period = Duration::from_millis(self.shared.config.drain_interval_ms);
    tasks.push(tokio::spawn(async move {
      let mut ticker = tokio::time::interval(period);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        if queue.shared.monitor.is_online() {
          if let Err(err) = queue.drain().await {
            warn!(error = %err, "periodic drain failed");
          }
        }
      }
    }));
  }

  /// Stop the background drain triggers. Meant for application shutdown.
  pub fn shutdown(&self) {
    let mut tasks = self
      .shared
      .tasks
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    for task in tasks.drain(..) {
      task.abort();
    }
  }

  /// Counts per status.
  pub fn stats(&self) -> QueueStats {
    let state = self.lock_state();
    let mut stats = QueueStats {
      total: state.ops.len(),
      ..Default::default()
    };
    for op in state.ops.values() {
      match op.status {
        OperationStatus::Pending => stats.pending += 1,
        OperationStatus::InFlight => stats.in_flight += 1,
        OperationStatus::Failed => stats.failed += 1,
      }
    }
    stats
  }

  /// Snapshot of every retained operation, FIFO by creation time.
  pub fn operations(&self) -> Vec<QueuedOperation> {
    let state = self.lock_state();
    state
      .order
      .iter()
      .filter_map(|id| state.ops.get(id))
      .cloned()
      .collect()
  }

  /// Snapshot of operations that exhausted their retries, FIFO by
  /// creation time. Entries stay here until [`SyncQueue::clear_failed`].
  pub fn failed_operations(&self) -> Vec<QueuedOperation> {
    self
      .operations()
      .into_iter()
      .filter(|op| op.status == OperationStatus::Failed)
      .collect()
  }

  /// Drop every failed entry. Failed operations are never dropped
  /// automatically; losing data is something an operator has to ask for.
  pub fn clear_failed(&self) -> Result<usize, QueueError> {
    let (failed_ids, order) = {
      let mut state = self.lock_state();
      let failed: Vec<String> = state
        .ops
        .values()
        .filter(|op| op.status == OperationStatus::Failed)
        .map(|op| op.operation_id.clone())
        .collect();
      for id in &failed {
        state.ops.remove(id);
      }
      state.order.retain(|id| !failed.contains(id));
      (failed, state.order.clone())
    };

    for id in &failed_ids {
      self.shared.store.delete(NAMESPACE, id)?;
    }
    if !failed_ids.is_empty() {
      self.persist_index(&order)?;
      info!(count = failed_ids.len(), "cleared failed operations");
    }
    Ok(failed_ids.len())
  }

  /// Remove a pending or failed entry. Returns false when the id is
  /// unknown or the operation is currently in flight; a running handler
  /// is allowed to finish.
  pub fn cancel(&self, operation_id: &str) -> Result<bool, QueueError> {
    let order = {
      let mut state = self.lock_state();
      match state.ops.get(operation_id) {
        Some(op) if op.status != OperationStatus::InFlight => {
          state.ops.remove(operation_id);
          state.order.retain(|id| id != operation_id);
          state.order.clone()
        }
        _ => return Ok(false),
      }
    };

    self.shared.store.delete(NAMESPACE, operation_id)?;
    self.persist_index(&order)?;
    debug!(operation_id, "operation cancelled");
    Ok(true)
  }

  fn lock_state(&self) -> MutexGuard<'_, QueueState> {
    self
      .shared
      .state
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  fn persist_index(&self, order: &Vec<String>) -> Result<(), crate::error::StoreError> {
    self.shared.store.set(NAMESPACE, INDEX_KEY, order)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::{ManualClock, SystemClock};
  use crate::network::{ConnectionType, NetworkStatus};
  use crate::store::MemoryStore;
  use chrono::Utc;
  use color_eyre::eyre::eyre;
  use serde_json::json;
  use std::sync::atomic::AtomicU32;
  use tokio::sync::Notify;

  fn manual_queue() -> (
    SyncQueue<MemoryStore>,
    NetworkMonitor,
    Arc<ManualClock>,
    Arc<MemoryStore>,
  ) {
    let store = Arc::new(MemoryStore::new());
    let monitor = NetworkMonitor::new();
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let queue = SyncQueue::open(
      Arc::clone(&store),
      monitor.clone(),
      QueueConfig::default(),
      clock.clone() as Arc<dyn Clock>,
    )
    .unwrap();
    (queue, monitor, clock, store)
  }

  fn go_online(monitor: &NetworkMonitor) {
    monitor.report(NetworkStatus::online(ConnectionType::Wifi));
  }

  #[test]
  fn enqueue_rejects_unregistered_types() {
    let (queue, _monitor, _clock, _store) = manual_queue();

    let result = queue.enqueue("nope", json!({}), EnqueueOptions::default());
    assert!(matches!(result, Err(QueueError::UnregisteredHandler(t)) if t == "nope"));
  }

  #[tokio::test]
  async fn offline_enqueue_then_online_drain_delivers_once() {
    let (queue, monitor, _clock, _store) = manual_queue();

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen2 = Arc::clone(&seen);
    queue.register_handler("create_task", move |payload| {
      let seen = Arc::clone(&seen2);
      async move {
        seen.lock().unwrap().push(payload);
        Ok(())
      }
    });

    queue
      .enqueue(
        "create_task",
        json!({"title": "Buy milk"}),
        EnqueueOptions {
          dedupe_key: Some("task_1".to_string()),
          ..Default::default()
        },
      )
      .unwrap();
    assert_eq!(queue.stats().pending, 1);

    // Still offline: a drain pass starts nothing
    let summary = queue.drain().await.unwrap();
    assert_eq!(summary.attempted, 0);
    assert_eq!(queue.stats().pending, 1);

    go_online(&monitor);
    let summary = queue.drain().await.unwrap();
    assert_eq!(summary.succeeded, 1);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.as_slice(), &[json!({"title": "Buy milk"})]);
    assert_eq!(queue.stats().pending, 0);
    assert_eq!(queue.stats().total, 0);
  }

  #[tokio::test]
  async fn drain_is_fifo_by_creation_order() {
    let (queue, monitor, _clock, _store) = manual_queue();

    let delivered = Arc::new(std::sync::Mutex::new(Vec::new()));
    let delivered2 = Arc::clone(&delivered);
    queue.register_handler("op", move |payload| {
      let delivered = Arc::clone(&delivered2);
      async move {
        delivered.lock().unwrap().push(payload["n"].as_u64().unwrap());
        Ok(())
      }
    });

    for n in 0..5u64 {
      queue.enqueue("op", json!({"n": n}), EnqueueOptions::default()).unwrap();
    }

    go_online(&monitor);
    queue.drain().await.unwrap();

    assert_eq!(delivered.lock().unwrap().as_slice(), &[0, 1, 2, 3, 4]);
  }

  #[test]
  fn dedupe_key_coalesces_to_the_newest_payload() {
    let (queue, _monitor, _clock, _store) = manual_queue();
    queue.register_handler("update_task", |_| async { Ok(()) });

    let options = EnqueueOptions {
      dedupe_key: Some("task_7".to_string()),
      ..Default::default()
    };
    let first = queue
      .enqueue("update_task", json!({"title": "v1"}), options.clone())
      .unwrap();
    let second = queue
      .enqueue("update_task", json!({"title": "v2"}), options)
      .unwrap();

    assert_eq!(first, second);
    assert_eq!(queue.stats().total, 1);

    let ops = queue.operations();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].payload, json!({"title": "v2"}));
  }

  #[test]
  fn distinct_dedupe_keys_do_not_coalesce() {
    let (queue, _monitor, _clock, _store) = manual_queue();
    queue.register_handler("update_task", |_| async { Ok(()) });

    for key in ["a", "b"] {
      queue
        .enqueue(
          "update_task",
          json!({}),
          EnqueueOptions {
            dedupe_key: Some(key.to_string()),
            ..Default::default()
          },
        )
        .unwrap();
    }
    assert_eq!(queue.stats().total, 2);
  }

  #[tokio::test]
  async fn failing_operation_follows_the_backoff_schedule() {
    let (queue, monitor, clock, _store) = manual_queue();
    queue.register_handler("flaky", |_| async { Err(eyre!("boom")) });

    go_online(&monitor);
    let start = clock.now();
    queue.enqueue("flaky", json!({}), EnqueueOptions::default()).unwrap();

    // First failure: retry 1s out
    queue.drain().await.unwrap();
    let op = &queue.operations()[0];
    assert_eq!(op.attempt, 1);
    assert_eq!(op.next_attempt_at, start + chrono::Duration::seconds(1));
    assert_eq!(op.last_error.as_deref(), Some("boom"));

    // Not due yet: drain does nothing
    let summary = queue.drain().await.unwrap();
    assert_eq!(summary.attempted, 0);

    // Second failure: retry 2s after it ran
    clock.advance(chrono::Duration::seconds(1));
    queue.drain().await.unwrap();
    let op = &queue.operations()[0];
    assert_eq!(op.attempt, 2);
    assert_eq!(op.next_attempt_at, start + chrono::Duration::seconds(3));

    // Third failure: retry 4s after it ran
    clock.advance(chrono::Duration::seconds(2));
    queue.drain().await.unwrap();
    let op = &queue.operations()[0];
    assert_eq!(op.attempt, 3);
    assert_eq!(op.next_attempt_at, start + chrono::Duration::seconds(7));
  }

  #[tokio::test]
  async fn operation_fails_terminally_after_max_retries() {
    let (queue, monitor, clock, _store) = manual_queue();
    let calls = Arc::new(AtomicU32::new(0));

    let calls2 = Arc::clone(&calls);
    queue.register_handler("doomed", move |_| {
      let calls = Arc::clone(&calls2);
      async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(eyre!("remote rejects this"))
      }
    });

    go_online(&monitor);
    queue
      .enqueue(
        "doomed",
        json!({}),
        EnqueueOptions {
          max_retries: Some(3),
          ..Default::default()
        },
      )
      .unwrap();

    for _ in 0..10 {
      queue.drain().await.unwrap();
      clock.advance(chrono::Duration::seconds(60));
    }

    // Exactly max_retries attempts, then retained as failed
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let stats = queue.stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.total, 1);

    let failed = queue.failed_operations();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].attempt, 3);
    assert_eq!(failed[0].last_error.as_deref(), Some("remote rejects this"));

    assert_eq!(queue.clear_failed().unwrap(), 1);
    assert_eq!(queue.stats().total, 0);
  }

  #[tokio::test]
  async fn queue_state_survives_restart() {
    let store = Arc::new(MemoryStore::new());
    let monitor = NetworkMonitor::new();
    let clock = Arc::new(ManualClock::new(Utc::now()));

    {
      let queue = SyncQueue::open(
        Arc::clone(&store),
        monitor.clone(),
        QueueConfig::default(),
        clock.clone() as Arc<dyn Clock>,
      )
      .unwrap();
      queue.register_handler("doomed", |_| async { Err(eyre!("no")) });
      queue.register_handler("later", |_| async { Ok(()) });

      go_online(&monitor);
      queue
        .enqueue(
          "doomed",
          json!({"id": 1}),
          EnqueueOptions {
            max_retries: Some(1),
            ..Default::default()
          },
        )
        .unwrap();
      queue.drain().await.unwrap();

      monitor.report(NetworkStatus::offline());
      queue.enqueue("later", json!({"id": 2}), EnqueueOptions::default()).unwrap();
      queue.enqueue("later", json!({"id": 3}), EnqueueOptions::default()).unwrap();
    }

    // "Restart": reload from the same backing store
    let queue = SyncQueue::open(
      store,
      monitor,
      QueueConfig::default(),
      clock as Arc<dyn Clock>,
    )
    .unwrap();

    let stats = queue.stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.pending, 2);
    assert_eq!(stats.total, 3);

    let ops = queue.operations();
    assert_eq!(ops[0].status, OperationStatus::Failed);
    assert_eq!(ops[0].attempt, 1);
    assert_eq!(ops[1].payload, json!({"id": 2}));
    assert_eq!(ops[2].payload, json!({"id": 3}));
  }

  #[test]
  fn interrupted_in_flight_entries_reload_as_pending() {
    let store = Arc::new(MemoryStore::new());
    let now = Utc::now();
    let op = QueuedOperation {
      operation_id: "op-1".to_string(),
      operation_type: "push".to_string(),
      payload: json!({}),
      dedupe_key: None,
      attempt: 2,
      max_retries: 5,
      next_attempt_at: now,
      created_at: now,
      status: OperationStatus::InFlight,
      last_error: None,
    };
    store.set(NAMESPACE, "op-1", &op).unwrap();
    store
      .set(NAMESPACE, INDEX_KEY, &vec!["op-1".to_string()])
      .unwrap();

    let queue = SyncQueue::open(
      store,
      NetworkMonitor::new(),
      QueueConfig::default(),
      Arc::new(SystemClock) as Arc<dyn Clock>,
    )
    .unwrap();

    let ops = queue.operations();
    assert_eq!(ops[0].status, OperationStatus::Pending);
    assert_eq!(ops[0].attempt, 2);
  }

  #[tokio::test]
  async fn reentrant_drain_is_a_no_op() {
    let (queue, monitor, _clock, _store) = manual_queue();

    let gate = Arc::new(Notify::new());
    let started = Arc::new(Notify::new());
    let gate2 = Arc::clone(&gate);
    let started2 = Arc::clone(&started);
    queue.register_handler("slow", move |_| {
      let gate = Arc::clone(&gate2);
      let started = Arc::clone(&started2);
      async move {
        started.notify_one();
        gate.notified().await;
        Ok(())
      }
    });

    go_online(&monitor);
    queue.enqueue("slow", json!({}), EnqueueOptions::default()).unwrap();

    let first = tokio::spawn({
      let queue = queue.clone();
      async move { queue.drain().await.unwrap() }
    });
    started.notified().await;

    // The first pass is mid-handler; a second trigger must not run it again
    let second = queue.drain().await.unwrap();
    assert_eq!(second, DrainSummary::default());

    gate.notify_one();
    let first = first.await.unwrap();
    assert_eq!(first.succeeded, 1);
    assert_eq!(queue.stats().total, 0);
  }

  #[tokio::test]
  async fn cancel_removes_pending_entries_only() {
    let (queue, _monitor, _clock, store) = manual_queue();
    queue.register_handler("op", |_| async { Ok(()) });

    let id = queue.enqueue("op", json!({}), EnqueueOptions::default()).unwrap();
    assert!(queue.cancel(&id).unwrap());
    assert!(!queue.cancel(&id).unwrap());
    assert_eq!(queue.stats().total, 0);

    // Removal was persisted too
    let index: Vec<String> = store.get(NAMESPACE, INDEX_KEY).unwrap().unwrap();
    assert!(index.is_empty());
    assert!(store.get::<QueuedOperation>(NAMESPACE, &id).unwrap().is_none());
  }

  #[tokio::test]
  async fn start_drains_when_connectivity_returns() {
    let store = Arc::new(MemoryStore::new());
    let monitor = NetworkMonitor::new();
    let queue = SyncQueue::open(
      store,
      monitor.clone(),
      QueueConfig::default(),
      Arc::new(SystemClock) as Arc<dyn Clock>,
    )
    .unwrap();

    let done = Arc::new(Notify::new());
    let done2 = Arc::clone(&done);
    queue.register_handler("push", move |_| {
      let done = Arc::clone(&done2);
      async move {
        done.notify_one();
        Ok(())
      }
    });

    queue.enqueue("push", json!({}), EnqueueOptions::default()).unwrap();
    queue.start();

    go_online(&monitor);
    tokio::time::timeout(Duration::from_secs(2), done.notified())
      .await
      .expect("handler was not invoked after reconnect");

    // The entry is removed shortly after the handler resolves
    for _ in 0..200 {
      if queue.stats().total == 0 {
        break;
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(queue.stats().total, 0);
    queue.shutdown();
  }

  #[tokio::test]
  async fn periodic_timer_drains_without_a_connectivity_edge() {
    let store = Arc::new(MemoryStore::new());
    let monitor = NetworkMonitor::new();
    go_online(&monitor);

    let config = QueueConfig {
      drain_interval_ms: 20,
      ..Default::default()
    };
    let queue = SyncQueue::open(
      store,
      monitor,
      config,
      Arc::new(SystemClock) as Arc<dyn Clock>,
    )
    .unwrap();

    let done = Arc::new(Notify::new());
    let done2 = Arc::clone(&done);
    queue.register_handler("push", move |_| {
      let done = Arc::clone(&done2);
      async move {
        done.notify_one();
        Ok(())
      }
    });

    // Already online when this lands, so only the timer will pick it up
    queue.enqueue("push", json!({}), EnqueueOptions::default()).unwrap();
    queue.start();

    tokio::time::timeout(Duration::from_secs(2), done.notified())
      .await
      .expect("handler was not invoked by the periodic drain");
    queue.shutdown();
  }
}
