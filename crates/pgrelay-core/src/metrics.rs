//! Dispatcher metrics.
//!
//! Counters are incremented synchronously inside the dispatcher loop, so a
//! reader that has observed a later inbox message observes every increment
//! caused by earlier ones.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters maintained by the dispatcher.
#[derive(Debug, Default)]
pub struct DispatcherMetrics {
    /// Total commands processed.
    pub commands_total: AtomicU64,
    /// Commands and subscriptions rejected for an unknown connection id.
    pub invalid_id_errors: AtomicU64,
    /// Total completions routed.
    pub completions_total: AtomicU64,
    /// Native operation failures delivered to error handlers.
    pub driver_errors: AtomicU64,
    /// LISTEN operations issued by reconciliation.
    pub listens_issued: AtomicU64,
    /// UNLISTEN operations issued by reconciliation.
    pub unlistens_issued: AtomicU64,
    /// Notifications delivered to handlers.
    pub notifications_total: AtomicU64,
    /// Connections removed after driver-initiated loss.
    pub connections_lost: AtomicU64,
}

impl DispatcherMetrics {
    /// Creates zeroed metrics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time snapshot.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            commands_total: self.commands_total.load(Ordering::Relaxed),
            invalid_id_errors: self.invalid_id_errors.load(Ordering::Relaxed),
            completions_total: self.completions_total.load(Ordering::Relaxed),
            driver_errors: self.driver_errors.load(Ordering::Relaxed),
            listens_issued: self.listens_issued.load(Ordering::Relaxed),
            unlistens_issued: self.unlistens_issued.load(Ordering::Relaxed),
            notifications_total: self.notifications_total.load(Ordering::Relaxed),
            connections_lost: self.connections_lost.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of [`DispatcherMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Total commands processed.
    pub commands_total: u64,
    /// Commands and subscriptions rejected for an unknown connection id.
    pub invalid_id_errors: u64,
    /// Total completions routed.
    pub completions_total: u64,
    /// Native operation failures delivered to error handlers.
    pub driver_errors: u64,
    /// LISTEN operations issued by reconciliation.
    pub listens_issued: u64,
    /// UNLISTEN operations issued by reconciliation.
    pub unlistens_issued: u64,
    /// Notifications delivered to handlers.
    pub notifications_total: u64,
    /// Connections removed after driver-initiated loss.
    pub connections_lost: u64,
}
