//! Global atomic counters for Strata observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (end of a reconcile pass, daemon tick, etc.).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters, no allocations and no locking.
pub struct Metrics {
    keys_committed: AtomicU64,
    keys_failed: AtomicU64,
    records_skipped: AtomicU64,
    runs_succeeded: AtomicU64,
    runs_failed: AtomicU64,
    runs_retried: AtomicU64,
    tables_maintained: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            keys_committed: AtomicU64::new(0),
            keys_failed: AtomicU64::new(0),
            records_skipped: AtomicU64::new(0),
            runs_succeeded: AtomicU64::new(0),
            runs_failed: AtomicU64::new(0),
            runs_retried: AtomicU64::new(0),
            tables_maintained: AtomicU64::new(0),
        }
    }

    /// A manifest key reached `committed`.
    pub fn inc_keys_committed(&self) {
        self.keys_committed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "keys_committed", "counter incremented");
    }

    /// A manifest key attempt failed.
    pub fn inc_keys_failed(&self) {
        self.keys_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "keys_failed", "counter incremented");
    }

    /// An unparseable record or file was skipped.
    pub fn inc_records_skipped(&self) {
        self.records_skipped.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "records_skipped", "counter incremented");
    }

    pub fn inc_runs_succeeded(&self) {
        self.runs_succeeded.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "runs_succeeded", "counter incremented");
    }

    pub fn inc_runs_failed(&self) {
        self.runs_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "runs_failed", "counter incremented");
    }

    pub fn inc_runs_retried(&self) {
        self.runs_retried.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "runs_retried", "counter incremented");
    }

    pub fn inc_tables_maintained(&self) {
        self.tables_maintained.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "tables_maintained", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    ///
    /// Call this at natural boundaries rather than on every increment.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            keys_committed = self.keys_committed(),
            keys_failed = self.keys_failed(),
            records_skipped = self.records_skipped(),
            runs_succeeded = self.runs_succeeded(),
            runs_failed = self.runs_failed(),
            runs_retried = self.runs_retried(),
            tables_maintained = self.tables_maintained(),
        );
    }

    pub fn keys_committed(&self) -> u64 {
        self.keys_committed.load(Ordering::Relaxed)
    }

    pub fn keys_failed(&self) -> u64 {
        self.keys_failed.load(Ordering::Relaxed)
    }

    pub fn records_skipped(&self) -> u64 {
        self.records_skipped.load(Ordering::Relaxed)
    }

    pub fn runs_succeeded(&self) -> u64 {
        self.runs_succeeded.load(Ordering::Relaxed)
    }

    pub fn runs_failed(&self) -> u64 {
        self.runs_failed.load(Ordering::Relaxed)
    }

    pub fn runs_retried(&self) -> u64 {
        self.runs_retried.load(Ordering::Relaxed)
    }

    pub fn tables_maintained(&self) -> u64 {
        self.tables_maintained.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.keys_committed,
            &self.keys_failed,
            &self.records_skipped,
            &self.runs_succeeded,
            &self.runs_failed,
            &self.runs_retried,
            &self.tables_maintained,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
