//! Meta-service metrics.
//!
//! Every event is reported twice: to the `metrics` facade (exported by
//! whatever recorder the process installs) and to an injectable
//! [`MetaServiceMetrics`] sink holding plain atomic counters. Components
//! receive the sink explicitly, so tests can assert on counts without
//! installing a global recorder.

use std::sync::atomic::{AtomicU64, Ordering};

use metrics::{counter, describe_counter, describe_histogram, histogram};

// ============================================================================
// Retry Metrics
// ============================================================================

/// Retried handler attempts.
pub const TXN_RETRY: &str = "nimbus_meta_txn_retry_total";

/// Calls that exhausted their retry budget.
pub const TXN_RETRY_EXHAUSTED: &str = "nimbus_meta_txn_retry_exhausted_total";

/// Backoff slept before a retry.
pub const TXN_RETRY_BACKOFF: &str = "nimbus_meta_txn_retry_backoff_seconds";

// ============================================================================
// Lock Metrics
// ============================================================================

/// Lock transitions, labelled by outcome.
pub const DELETE_BITMAP_LOCK: &str = "nimbus_meta_delete_bitmap_lock_total";

// ============================================================================
// Replay Metrics
// ============================================================================

/// Idempotent replays scheduled.
pub const IDEMPOTENT_REPLAY: &str = "nimbus_meta_idempotent_replay_total";

// ============================================================================
// Metric Registration
// ============================================================================

/// Registers all meta-service metric descriptions.
///
/// Call this once at application startup after initializing the metrics recorder.
pub fn register_metrics() {
    describe_counter!(TXN_RETRY, "Handler attempts retried after a transient store error");
    describe_counter!(TXN_RETRY_EXHAUSTED, "Calls that exhausted their retry budget");
    describe_histogram!(TXN_RETRY_BACKOFF, "Backoff slept before a retry in seconds");
    describe_counter!(DELETE_BITMAP_LOCK, "Delete bitmap update lock transitions");
    describe_counter!(IDEMPOTENT_REPLAY, "Requests replayed to check idempotence");
}

/// Outcome of a lock operation, used as a metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// A free scope was taken.
    Acquired,
    /// An expired record was overwritten.
    TakenOver,
    /// A compatible load joined, or a holder refreshed its lease.
    Joined,
    /// An incompatible holder owns the scope.
    Busy,
    /// The caller's lock or initiator was removed.
    Released,
    /// The release found someone else's lock, or nothing.
    StaleRelease,
}

impl LockOutcome {
    /// Label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Acquired => "acquired",
            Self::TakenOver => "taken_over",
            Self::Joined => "joined",
            Self::Busy => "busy",
            Self::Released => "released",
            Self::StaleRelease => "stale_release",
        }
    }
}

/// Point-in-time copy of [`MetaServiceMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetaMetricsSnapshot {
    /// Retried attempts.
    pub retries: u64,
    /// Exhausted calls.
    pub retries_exhausted: u64,
    /// Free scopes acquired.
    pub locks_acquired: u64,
    /// Expired records overwritten.
    pub locks_taken_over: u64,
    /// Joins and lease refreshes.
    pub locks_joined: u64,
    /// Acquisitions refused with lock-busy.
    pub locks_busy: u64,
    /// Successful releases.
    pub locks_released: u64,
    /// Releases that found nothing to release.
    pub stale_releases: u64,
    /// Replays scheduled.
    pub replays_scheduled: u64,
}

/// Process-lifetime counters for one meta service.
#[derive(Debug, Default)]
pub struct MetaServiceMetrics {
    retries: AtomicU64,
    retries_exhausted: AtomicU64,
    locks_acquired: AtomicU64,
    locks_taken_over: AtomicU64,
    locks_joined: AtomicU64,
    locks_busy: AtomicU64,
    locks_released: AtomicU64,
    stale_releases: AtomicU64,
    replays_scheduled: AtomicU64,
}

impl MetaServiceMetrics {
    /// Creates a zeroed sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one retried attempt and the backoff slept before it.
    pub fn record_retry(&self, method: &'static str, backoff_ms: u64) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        counter!(TXN_RETRY, "method" => method).increment(1);
        #[allow(clippy::cast_precision_loss)]
        histogram!(TXN_RETRY_BACKOFF, "method" => method).record(backoff_ms as f64 / 1000.0);
    }

    /// Records a call that ran out of retries.
    pub fn record_retry_exhausted(&self, method: &'static str, code: &'static str) {
        self.retries_exhausted.fetch_add(1, Ordering::Relaxed);
        counter!(TXN_RETRY_EXHAUSTED, "method" => method, "code" => code).increment(1);
    }

    /// Records a lock transition.
    pub fn record_lock(&self, outcome: LockOutcome) {
        let slot = match outcome {
            LockOutcome::Acquired => &self.locks_acquired,
            LockOutcome::TakenOver => &self.locks_taken_over,
            LockOutcome::Joined => &self.locks_joined,
            LockOutcome::Busy => &self.locks_busy,
            LockOutcome::Released => &self.locks_released,
            LockOutcome::StaleRelease => &self.stale_releases,
        };
        slot.fetch_add(1, Ordering::Relaxed);
        counter!(DELETE_BITMAP_LOCK, "outcome" => outcome.as_str()).increment(1);
    }

    /// Records a scheduled replay.
    pub fn record_replay(&self, method: &'static str) {
        self.replays_scheduled.fetch_add(1, Ordering::Relaxed);
        counter!(IDEMPOTENT_REPLAY, "method" => method).increment(1);
    }

    /// Returns the current counter values.
    #[must_use]
    pub fn snapshot(&self) -> MetaMetricsSnapshot {
        MetaMetricsSnapshot {
            retries: self.retries.load(Ordering::Relaxed),
            retries_exhausted: self.retries_exhausted.load(Ordering::Relaxed),
            locks_acquired: self.locks_acquired.load(Ordering::Relaxed),
            locks_taken_over: self.locks_taken_over.load(Ordering::Relaxed),
            locks_joined: self.locks_joined.load(Ordering::Relaxed),
            locks_busy: self.locks_busy.load(Ordering::Relaxed),
            locks_released: self.locks_released.load(Ordering::Relaxed),
            stale_releases: self.stale_releases.load(Ordering::Relaxed),
            replays_scheduled: self.replays_scheduled.load(Ordering::Relaxed),
        }
    }
}
