//! Network connectivity monitoring.
//!
//! A single [`NetworkMonitor`] instance is the process-wide source of truth
//! for connectivity. The host platform feeds observed status changes in via
//! [`NetworkMonitor::report`]; consumers read the cached status, subscribe
//! to change notifications, or suspend on [`NetworkMonitor::wait_for_connection`].
//!
//! The monitor starts offline and stays offline until the platform reports
//! otherwise: a broken or silent connectivity API fails closed.

mod monitor;

pub use monitor::{ConnectionType, NetworkMonitor, NetworkStatus, Subscription};
