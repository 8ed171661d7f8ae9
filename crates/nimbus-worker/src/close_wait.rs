//! Close barrier for the senders of an index channel.
//!
//! Every sender of a channel closes its side once it has sent its last
//! batch. A closing sender may ask to hang until all of its peers have
//! closed as well, bounded by a timeout.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{CalcError, Result};
use crate::metrics::WorkerMetrics;

/// Tracks which of a fixed set of senders are still open.
#[derive(Debug)]
pub struct SenderCloseBarrier {
    expected: BTreeSet<i64>,
    open: Mutex<BTreeSet<i64>>,
    pending: watch::Sender<usize>,
    metrics: Arc<WorkerMetrics>,
}

impl SenderCloseBarrier {
    /// Creates a barrier expecting `senders` to close.
    #[must_use]
    pub fn new(senders: impl IntoIterator<Item = i64>, metrics: Arc<WorkerMetrics>) -> Self {
        let expected: BTreeSet<i64> = senders.into_iter().collect();
        let count = expected.len();
        metrics.senders_opened(u64::try_from(count).unwrap_or(u64::MAX));
        let (pending, _) = watch::channel(count);
        Self {
            open: Mutex::new(expected.clone()),
            expected,
            pending,
            metrics,
        }
    }

    /// Senders that have not closed yet.
    #[must_use]
    pub fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    /// Returns true once every sender has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.pending() == 0
    }

    /// Closes `sender`.
    ///
    /// Closing twice is a no-op. With `hang_wait`, the call then waits up
    /// to that long for the remaining senders.
    ///
    /// # Errors
    ///
    /// Returns `UnknownSender` for a sender the barrier was not created
    /// with, and `CloseTimeout` if peers are still open when `hang_wait`
    /// elapses. The sender stays closed in both timeout and success cases.
    pub async fn close(&self, sender: i64, hang_wait: Option<Duration>) -> Result<()> {
        if !self.expected.contains(&sender) {
            return Err(CalcError::UnknownSender { sender });
        }

        let closed_now = {
            let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
            let removed = open.remove(&sender);
            if removed {
                self.pending.send_replace(open.len());
            }
            removed
        };
        if closed_now {
            self.metrics.sender_closed();
            debug!(sender, pending = self.pending(), "sender closed");
        }

        let Some(limit) = hang_wait else {
            return Ok(());
        };
        let mut rx = self.pending.subscribe();
        match tokio::time::timeout(limit, rx.wait_for(|pending| *pending == 0)).await {
            Ok(_) => {
                info!(sender, "all senders closed");
                Ok(())
            }
            Err(_) => {
                let pending = self.pending();
                let waited_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
                self.metrics.close_timed_out();
                warn!(sender, pending, waited_ms, "timed out waiting for senders to close");
                Err(CalcError::CloseTimeout { pending, waited_ms })
            }
        }
    }
}
