//! Worker metrics.
//!
//! As on the meta side, events go both to the `metrics` facade and to an
//! injectable [`WorkerMetrics`] sink that tests read directly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

// ============================================================================
// Executor Metrics
// ============================================================================

/// Tasks accepted by a token.
pub const CALC_TASKS_SUBMITTED: &str = "nimbus_worker_calc_tasks_submitted_total";

/// Tasks that finished, labelled by result.
pub const CALC_TASKS_FINISHED: &str = "nimbus_worker_calc_tasks_finished_total";

/// Time a task spent computing.
pub const CALC_TASK_DURATION: &str = "nimbus_worker_calc_task_duration_seconds";

/// Tokens alive.
pub const CALC_ACTIVE_TOKENS: &str = "nimbus_worker_calc_active_tokens";

// ============================================================================
// Sender Metrics
// ============================================================================

/// Senders registered with a close barrier that have not closed yet.
pub const OPEN_SENDERS: &str = "nimbus_worker_open_senders";

/// Close waits that timed out.
pub const SENDER_CLOSE_TIMEOUTS: &str = "nimbus_worker_sender_close_timeouts_total";

/// Registers all worker metric descriptions.
pub fn register_metrics() {
    describe_counter!(CALC_TASKS_SUBMITTED, "Delete bitmap calculation tasks accepted");
    describe_counter!(CALC_TASKS_FINISHED, "Delete bitmap calculation tasks finished");
    describe_histogram!(CALC_TASK_DURATION, "Delete bitmap calculation time in seconds");
    describe_gauge!(CALC_ACTIVE_TOKENS, "Calculation tokens alive");
    describe_gauge!(OPEN_SENDERS, "Senders not yet closed");
    describe_counter!(SENDER_CLOSE_TIMEOUTS, "Sender close waits that timed out");
}

/// How a task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskResult {
    /// Computed and merged.
    Succeeded,
    /// Computation failed.
    Failed,
    /// Dropped from the queue after cancel or shutdown.
    Abandoned,
}

impl TaskResult {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        }
    }
}

/// Point-in-time copy of [`WorkerMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerMetricsSnapshot {
    /// Tasks accepted.
    pub tasks_submitted: u64,
    /// Tasks that succeeded.
    pub tasks_succeeded: u64,
    /// Tasks that failed.
    pub tasks_failed: u64,
    /// Tasks abandoned.
    pub tasks_abandoned: u64,
    /// Tokens alive.
    pub active_tokens: u64,
    /// Senders not yet closed.
    pub open_senders: u64,
    /// Close waits that timed out.
    pub close_timeouts: u64,
}

/// Process-lifetime counters for one worker.
#[derive(Debug, Default)]
pub struct WorkerMetrics {
    tasks_submitted: AtomicU64,
    tasks_succeeded: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_abandoned: AtomicU64,
    active_tokens: AtomicU64,
    open_senders: AtomicU64,
    close_timeouts: AtomicU64,
}

impl WorkerMetrics {
    /// Creates a zeroed sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn task_submitted(&self, kind: &'static str) {
        self.tasks_submitted.fetch_add(1, Ordering::Relaxed);
        counter!(CALC_TASKS_SUBMITTED, "kind" => kind).increment(1);
    }

    pub(crate) fn task_finished(&self, kind: &'static str, result: TaskResult, elapsed: Duration) {
        let slot = match result {
            TaskResult::Succeeded => &self.tasks_succeeded,
            TaskResult::Failed => &self.tasks_failed,
            TaskResult::Abandoned => &self.tasks_abandoned,
        };
        slot.fetch_add(1, Ordering::Relaxed);
        counter!(CALC_TASKS_FINISHED, "kind" => kind, "result" => result.as_str()).increment(1);
        if result != TaskResult::Abandoned {
            histogram!(CALC_TASK_DURATION, "kind" => kind).record(elapsed.as_secs_f64());
        }
    }

    pub(crate) fn token_opened(&self) {
        let n = self.active_tokens.fetch_add(1, Ordering::Relaxed) + 1;
        #[allow(clippy::cast_precision_loss)]
        gauge!(CALC_ACTIVE_TOKENS).set(n as f64);
    }

    pub(crate) fn token_closed(&self) {
        let n = self.active_tokens.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        #[allow(clippy::cast_precision_loss)]
        gauge!(CALC_ACTIVE_TOKENS).set(n as f64);
    }

    pub(crate) fn senders_opened(&self, count: u64) {
        let n = self.open_senders.fetch_add(count, Ordering::Relaxed) + count;
        #[allow(clippy::cast_precision_loss)]
        gauge!(OPEN_SENDERS).set(n as f64);
    }

    pub(crate) fn sender_closed(&self) {
        let n = self.open_senders.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        #[allow(clippy::cast_precision_loss)]
        gauge!(OPEN_SENDERS).set(n as f64);
    }

    pub(crate) fn close_timed_out(&self) {
        self.close_timeouts.fetch_add(1, Ordering::Relaxed);
        counter!(SENDER_CLOSE_TIMEOUTS).increment(1);
    }

    /// Returns the current counter values.
    #[must_use]
    pub fn snapshot(&self) -> WorkerMetricsSnapshot {
        WorkerMetricsSnapshot {
            tasks_submitted: self.tasks_submitted.load(Ordering::Relaxed),
            tasks_succeeded: self.tasks_succeeded.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            tasks_abandoned: self.tasks_abandoned.load(Ordering::Relaxed),
            active_tokens: self.active_tokens.load(Ordering::Relaxed),
            open_senders: self.open_senders.load(Ordering::Relaxed),
            close_timeouts: self.close_timeouts.load(Ordering::Relaxed),
        }
    }
}
