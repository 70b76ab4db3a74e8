//! Connectivity state, change notifications, and the wait-for-connection
//! primitive.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Connection medium reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
  Wifi,
  Cellular,
  None,
  Other,
}

/// Last-known connectivity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkStatus {
  pub is_connected: bool,
  pub connection_type: ConnectionType,
  /// None when reachability has not been determined.
  pub is_internet_reachable: Option<bool>,
}

impl NetworkStatus {
  /// Disconnected state; also what the monitor assumes until the platform
  /// first reports.
  pub fn offline() -> Self {
    Self {
      is_connected: false,
      connection_type: ConnectionType::None,
      is_internet_reachable: Some(false),
    }
  }

  pub fn online(connection_type: ConnectionType) -> Self {
    Self {
      is_connected: true,
      connection_type,
      is_internet_reachable: Some(true),
    }
  }
}

type SubscriberFn = Arc<dyn Fn(&NetworkStatus) + Send + Sync>;

struct MonitorShared {
  status: Mutex<NetworkStatus>,
  subscribers: Mutex<HashMap<u64, SubscriberFn>>,
  next_subscriber_id: AtomicU64,
  connected_tx: watch::Sender<bool>,
}

/// Single source of truth for connectivity.
///
/// Construct one instance at startup and clone the handle into consumers;
/// clones share state.
#[derive(Clone)]
pub struct NetworkMonitor {
  shared: Arc<MonitorShared>,
}

impl Default for NetworkMonitor {
  fn default() -> Self {
    Self::new()
  }
}

impl NetworkMonitor {
  pub fn new() -> Self {
    let (connected_tx, _) = watch::channel(false);
    Self {
      shared: Arc::new(MonitorShared {
        status: Mutex::new(NetworkStatus::offline()),
        subscribers: Mutex::new(HashMap::new()),
        next_subscriber_id: AtomicU64::new(0),
        connected_tx,
      }),
    }
  }

  /// Feed a status observed from the platform connectivity API.
  ///
  /// Subscribers are notified synchronously when any field changed,
  /// including connection-type changes while still connected. Reporting an
  /// identical status is a no-op.
  pub fn report(&self, status: NetworkStatus) {
    let changed = {
      let mut current = self
        .shared
        .status
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
      if *current == status {
        false
      } else {
        *current = status;
        true
      }
    };
    if !changed {
      return;
    }

    debug!(
      is_connected = status.is_connected,
      connection_type = ?status.connection_type,
      "network status changed"
    );
    let _ = self.shared.connected_tx.send(status.is_connected);

    // Snapshot under the lock, invoke outside it, so a callback may
    // subscribe or cancel without deadlocking.
    let snapshot: Vec<SubscriberFn> = {
      let subscribers = self
        .shared
        .subscribers
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
      subscribers.values().cloned().collect()
    };
    for callback in snapshot {
      callback(&status);
    }
  }

  /// Treat a failed platform probe as being offline.
  pub fn report_probe_failure(&self) {
    self.report(NetworkStatus::offline());
  }

  /// Last-known status; cached, never re-probed.
  pub fn current(&self) -> NetworkStatus {
    *self
      .shared
      .status
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  pub fn is_online(&self) -> bool {
    self.current().is_connected
  }

  pub fn is_wifi(&self) -> bool {
    let status = self.current();
    status.is_connected && status.connection_type == ConnectionType::Wifi
  }

  /// Register a callback invoked on every status change. Cancel (or drop)
  /// the returned subscription to stop receiving notifications.
  pub fn subscribe<F>(&self, callback: F) -> Subscription
  where
    F: Fn(&NetworkStatus) + Send + Sync + 'static,
  {
    let id = self.shared.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
    self
      .shared
      .subscribers
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(id, Arc::new(callback));

    Subscription {
      id,
      shared: Arc::downgrade(&self.shared),
    }
  }

  /// Watch channel carrying the connected flag, for tasks that want edges
  /// rather than callbacks.
  pub(crate) fn connected_watch(&self) -> watch::Receiver<bool> {
    self.shared.connected_tx.subscribe()
  }

  /// Suspend until connected or until `timeout` elapses.
  ///
  /// Returns true when connected, false on timeout. The watch receiver is
  /// dropped either way, so a caller that times out or is cancelled leaves
  /// nothing behind.
  pub async fn wait_for_connection(&self, timeout: Duration) -> bool {
    let mut rx = self.shared.connected_tx.subscribe();
    if self.is_online() {
      return true;
    }
    tokio::time::timeout(timeout, rx.wait_for(|connected| *connected))
      .await
      .is_ok_and(|result| result.is_ok())
  }
}

/// Handle for a registered subscriber.
///
/// `cancel` is idempotent and safe to call any number of times; dropping
/// the handle cancels as well.
pub struct Subscription {
  id: u64,
  shared: Weak<MonitorShared>,
}

impl Subscription {
  pub fn cancel(&self) {
    if let Some(shared) = self.shared.upgrade() {
      shared
        .subscribers
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&self.id);
    }
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.cancel();
  }
}
