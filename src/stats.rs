//! Atomic counters describing what an observer has done.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub struct ObserverStats {
    batches_seen: AtomicU64,
    batches_ignored: AtomicU64,
    diffs_computed: AtomicU64,
    records_dispatched: AtomicU64,
    callbacks_fired: AtomicU64,
    records_dropped: AtomicU64,
    callback_panics: AtomicU64,
    sweeps: AtomicU64,
}

/// Point-in-time copy of [`ObserverStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub batches_seen: u64,
    /// Batches from another store.
    pub batches_ignored: u64,
    /// Entity deltas normalized by the classifier.
    pub diffs_computed: u64,
    pub records_dispatched: u64,
    /// Lifecycle and field-path callbacks that ran, panicking ones included.
    pub callbacks_fired: u64,
    /// Records whose entity could not be resolved.
    pub records_dropped: u64,
    pub callback_panics: u64,
    pub sweeps: u64,
}

impl ObserverStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn batch_seen(&self) {
        self.batches_seen.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn batch_ignored(&self) {
        self.batches_ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn diffs(&self, n: usize) {
        self.diffs_computed.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_dispatched(&self) {
        self.records_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn callback_fired(&self) {
        self.callbacks_fired.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.records_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn callback_panicked(&self) {
        self.callback_panics.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn sweep(&self) {
        self.sweeps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            batches_seen: self.batches_seen.load(Ordering::Relaxed),
            batches_ignored: self.batches_ignored.load(Ordering::Relaxed),
            diffs_computed: self.diffs_computed.load(Ordering::Relaxed),
            records_dispatched: self.records_dispatched.load(Ordering::Relaxed),
            callbacks_fired: self.callbacks_fired.load(Ordering::Relaxed),
            records_dropped: self.records_dropped.load(Ordering::Relaxed),
            callback_panics: self.callback_panics.load(Ordering::Relaxed),
            sweeps: self.sweeps.load(Ordering::Relaxed),
        }
    }
}
