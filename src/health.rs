//! ==============================================================================
//! health.rs - operator-facing counters
//! ==============================================================================
//!
//! purpose:
//!     keeps "persistence is broken" separate from "a sensor is broken".
//!     the poller writes these counters, the web layer reports them.
//!
//! ==============================================================================

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct HostHealth {
    pub uptime_seconds: u64,
    /// durable writes are currently failing
    pub persistence_degraded: bool,
    pub persistence_failures: u64,
    pub cycles_completed: u64,
    /// schedule boundaries skipped because a cycle overran
    pub cycles_skipped: u64,
    /// absent readings per source since start-up
    pub source_failures: BTreeMap<String, u64>,
    pub history_len: usize,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    persistence_degraded: Arc<AtomicBool>,
    persistence_failures: Arc<AtomicU64>,
    cycles_completed: Arc<AtomicU64>,
    cycles_skipped: Arc<AtomicU64>,
    source_failures: Arc<Mutex<BTreeMap<String, u64>>>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            persistence_degraded: Arc::new(AtomicBool::new(false)),
            persistence_failures: Arc::new(AtomicU64::new(0)),
            cycles_completed: Arc::new(AtomicU64::new(0)),
            cycles_skipped: Arc::new(AtomicU64::new(0)),
            source_failures: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Returns true when this clears a degraded state.
    pub fn mark_persist_ok(&self) -> bool {
        self.persistence_degraded.swap(false, Ordering::SeqCst)
    }

    /// Returns true when this enters the degraded state.
    pub fn mark_persist_failed(&self) -> bool {
        self.persistence_failures.fetch_add(1, Ordering::Relaxed);
        !self.persistence_degraded.swap(true, Ordering::SeqCst)
    }

    pub fn is_degraded(&self) -> bool {
        self.persistence_degraded.load(Ordering::SeqCst)
    }

    pub fn record_cycle(&self) {
        self.cycles_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self, count: u64) {
        self.cycles_skipped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_source_failure(&self, source_id: &str) {
        *self.source_failures.lock().entry(source_id.to_string()).or_insert(0) += 1;
    }

    pub fn get_health(&self, history_len: usize) -> HostHealth {
        HostHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            persistence_degraded: self.is_degraded(),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
            cycles_completed: self.cycles_completed.load(Ordering::Relaxed),
            cycles_skipped: self.cycles_skipped.load(Ordering::Relaxed),
            source_failures: self.source_failures.lock().clone(),
            history_len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degraded_flag_transitions() {
        let health = HealthTracker::new();
        assert!(!health.is_degraded());

        assert!(health.mark_persist_failed());
        assert!(!health.mark_persist_failed());
        assert!(health.is_degraded());

        assert!(health.mark_persist_ok());
        assert!(!health.mark_persist_ok());

        let h = health.get_health(0);
        assert!(!h.persistence_degraded);
        assert_eq!(h.persistence_failures, 2);
    }

    #[test]
    fn source_failures_are_counted_per_source() {
        let health = HealthTracker::new();
        let clone = health.clone();
        health.record_source_failure("sensor-B");
        clone.record_source_failure("sensor-B");
        health.record_source_failure("weather");
        health.record_cycle();

        let h = health.get_health(7);
        assert_eq!(h.source_failures["sensor-B"], 2);
        assert_eq!(h.source_failures["weather"], 1);
        assert_eq!(h.cycles_completed, 1);
        assert_eq!(h.history_len, 7);
        assert!(!h.persistence_degraded);
    }
}
