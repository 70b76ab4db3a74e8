//! Queued operation model and the retry backoff policy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Lifecycle of a queued operation.
///
/// `Pending -> InFlight`, then removed on success, back to `Pending` with
/// a later `next_attempt_at` on a failed attempt with retries left, or
/// `Failed` once the retry ceiling is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
  Pending,
  InFlight,
  Failed,
}

/// A locally-originated mutation waiting for delivery to the remote side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedOperation {
  /// Unique id, generated at enqueue time.
  pub operation_id: String,
  /// Selects the registered handler that will deliver this operation.
  pub operation_type: String,
  pub payload: Value,
  /// Coalescing key: while an operation with this key is live, a new
  /// enqueue replaces its payload instead of adding a second entry.
  pub dedupe_key: Option<String>,
  /// Number of delivery attempts made so far.
  pub attempt: u32,
  pub max_retries: u32,
  pub next_attempt_at: DateTime<Utc>,
  pub created_at: DateTime<Utc>,
  pub status: OperationStatus,
  /// Most recent handler failure, kept so failed entries are inspectable.
  pub last_error: Option<String>,
}

impl QueuedOperation {
  /// Live entries participate in dedupe-key coalescing.
  pub(crate) fn is_live(&self) -> bool {
    matches!(self.status, OperationStatus::Pending | OperationStatus::InFlight)
  }

  pub(crate) fn is_due(&self, now: DateTime<Utc>) -> bool {
    self.status == OperationStatus::Pending && self.next_attempt_at <= now
  }
}

/// Exponential backoff with a ceiling.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
}

impl BackoffPolicy {
  /// Delay before the retry following failed attempt number `attempt`
  /// (0-based): `min(base * 2^attempt, max)`.
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let delay_ms = 2u64
      .checked_pow(attempt)
      .and_then(|factor| factor.checked_mul(self.base_delay_ms))
      .map_or(self.max_delay_ms, |ms| ms.min(self.max_delay_ms));
    Duration::from_millis(delay_ms)
  }
}
