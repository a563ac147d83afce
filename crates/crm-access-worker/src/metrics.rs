use std::sync::atomic::{AtomicU64, Ordering};

/// Running totals for one dispatcher process.
#[derive(Debug, Default)]
pub struct DispatcherMetrics {
    sweeps: AtomicU64,
    events_processed: AtomicU64,
    events_failed: AtomicU64,
    events_unknown: AtomicU64,
}

impl DispatcherMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sweep(&self) {
        self.sweeps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processed(&self) {
        self.events_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.events_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unknown(&self) {
        self.events_unknown.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sweeps(&self) -> u64 {
        self.sweeps.load(Ordering::Relaxed)
    }

    pub fn events_processed(&self) -> u64 {
        self.events_processed.load(Ordering::Relaxed)
    }

    pub fn events_failed(&self) -> u64 {
        self.events_failed.load(Ordering::Relaxed)
    }

    pub fn events_unknown(&self) -> u64 {
        self.events_unknown.load(Ordering::Relaxed)
    }
}
