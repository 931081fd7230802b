//! Store metrics.
//!
//! Counters are kept locally for snapshots and also emitted through the
//! `metrics` facade, so any installed recorder (Prometheus or otherwise)
//! picks them up.

use metrics::counter;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use varbridge_core::{LockEvent, Permission};

/// Counter names
pub mod names {
    /// Access checks, labelled by permission and outcome
    pub const ACCESS_CHECKS: &str = "varbridge_access_checks_total";
    /// Variables registered
    pub const REGISTRATIONS: &str = "varbridge_registrations_total";
    /// Committed updates
    pub const UPDATES: &str = "varbridge_updates_total";
    /// Variables deleted
    pub const DELETIONS: &str = "varbridge_deletions_total";
    /// Lock events, labelled by event type
    pub const LOCK_EVENTS: &str = "varbridge_lock_events_total";
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Granted access checks
    pub access_granted: u64,
    /// Denied access checks
    pub access_denied: u64,
    /// Registrations
    pub registrations: u64,
    /// Committed updates
    pub updates: u64,
    /// Deletions
    pub deletions: u64,
    /// Locks acquired
    pub locks_acquired: u64,
    /// Locks released
    pub locks_released: u64,
    /// Locks preempted
    pub locks_preempted: u64,
    /// Locks reclaimed from dead or stale holders
    pub locks_reclaimed: u64,
}

/// Counters for store activity
#[derive(Debug, Default)]
pub struct StoreMetrics {
    access_granted: AtomicU64,
    access_denied: AtomicU64,
    registrations: AtomicU64,
    updates: AtomicU64,
    deletions: AtomicU64,
    locks_acquired: AtomicU64,
    locks_released: AtomicU64,
    locks_preempted: AtomicU64,
    locks_reclaimed: AtomicU64,
}

impl StoreMetrics {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an access check
    pub fn record_access_check(&self, permission: Permission, granted: bool) {
        let local = if granted { &self.access_granted } else { &self.access_denied };
        local.fetch_add(1, Ordering::Relaxed);
        counter!(
            names::ACCESS_CHECKS,
            1,
            "permission" => permission.to_string(),
            "granted" => granted.to_string()
        );
    }

    /// Record a registration
    pub fn record_registration(&self) {
        self.registrations.fetch_add(1, Ordering::Relaxed);
        counter!(names::REGISTRATIONS, 1);
    }

    /// Record a committed update
    pub fn record_update(&self) {
        self.updates.fetch_add(1, Ordering::Relaxed);
        counter!(names::UPDATES, 1);
    }

    /// Record a deletion
    pub fn record_deletion(&self) {
        self.deletions.fetch_add(1, Ordering::Relaxed);
        counter!(names::DELETIONS, 1);
    }

    /// Record a lock event
    pub fn record_lock_event(&self, event: &LockEvent) {
        let local = match event {
            LockEvent::Acquired { .. } => &self.locks_acquired,
            LockEvent::Released { .. } => &self.locks_released,
            LockEvent::Preempted { .. } => &self.locks_preempted,
            LockEvent::Reclaimed { .. } => &self.locks_reclaimed,
        };
        local.fetch_add(1, Ordering::Relaxed);
        counter!(names::LOCK_EVENTS, 1, "event" => event.event_type());
    }

    /// Copy the current counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            access_granted: self.access_granted.load(Ordering::Relaxed),
            access_denied: self.access_denied.load(Ordering::Relaxed),
            registrations: self.registrations.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            deletions: self.deletions.load(Ordering::Relaxed),
            locks_acquired: self.locks_acquired.load(Ordering::Relaxed),
            locks_released: self.locks_released.load(Ordering::Relaxed),
            locks_preempted: self.locks_preempted.load(Ordering::Relaxed),
            locks_reclaimed: self.locks_reclaimed.load(Ordering::Relaxed),
        }
    }
}
