//! Engine counters.

use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Atomic counter for thread-safe increment operations.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// What the read loop did with the frames it pulled.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    /// Frames returned by the backend
    pub read: Counter,
    /// Frames handed to the worker
    pub dispatched: Counter,
    /// Dropped for missing an inclusion substring
    pub not_included: Counter,
    /// Dropped for containing an exclusion substring
    pub excluded: Counter,
    /// Frames queued for the dump file
    pub persisted: Counter,
    /// Read deadlines that passed without data
    pub timeouts: Counter,
    /// Capture file passes started after the first
    pub reopened: Counter,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log_summary(&self) {
        info!(
            read = self.read.get(),
            dispatched = self.dispatched.get(),
            not_included = self.not_included.get(),
            excluded = self.excluded.get(),
            persisted = self.persisted.get(),
            timeouts = self.timeouts.get(),
            reopened = self.reopened.get(),
            "capture summary"
        );
    }
}
