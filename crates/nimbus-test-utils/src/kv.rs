//! Transactional KV wrapper with operation tracing and fault scripting.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use nimbus_core::txn_kv::{KvStats, MemoryTxnKv, Transaction, TxnErrorCode, TxnKv, TxnResult};

/// Record of a store operation for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvOp {
    /// A transaction was opened (or refused).
    Begin {
        /// Outcome of the begin call.
        result: TxnResult<()>,
    },
    /// Point read.
    Get {
        /// Key read, lossily decoded.
        key: String,
    },
    /// Prefix scan.
    Scan {
        /// Prefix scanned, lossily decoded.
        prefix: String,
    },
    /// Buffered write.
    Put {
        /// Key written.
        key: String,
    },
    /// Buffered delete.
    Remove {
        /// Key deleted.
        key: String,
    },
    /// Commit attempt.
    Commit {
        /// Outcome of the commit.
        result: TxnResult<()>,
    },
}

#[derive(Debug, Default)]
struct Script {
    begin_errors: VecDeque<TxnErrorCode>,
    commit_errors: VecDeque<TxnErrorCode>,
    always_fail_commit: Option<TxnErrorCode>,
}

/// [`MemoryTxnKv`] wrapper that records every operation and injects
/// scripted store errors.
///
/// Injected commit errors discard the transaction's writes, matching a
/// store that reports a definite "not committed".
#[derive(Debug, Clone, Default)]
pub struct ScriptedTxnKv {
    inner: MemoryTxnKv,
    operations: Arc<Mutex<Vec<KvOp>>>,
    script: Arc<Mutex<Script>>,
    latency: Option<Duration>,
}

impl ScriptedTxnKv {
    /// Creates an empty scripted store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an existing in-memory store.
    #[must_use]
    pub fn wrap(inner: MemoryTxnKv) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    /// Adds simulated latency to every read and commit.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Returns the wrapped store.
    #[must_use]
    pub fn inner(&self) -> &MemoryTxnKv {
        &self.inner
    }

    /// Queues errors returned by the next commits, one per commit.
    pub fn fail_next_commits(&self, codes: impl IntoIterator<Item = TxnErrorCode>) {
        self.script
            .lock()
            .expect("lock")
            .commit_errors
            .extend(codes);
    }

    /// Queues errors returned by the next `begin` calls.
    pub fn fail_next_begins(&self, codes: impl IntoIterator<Item = TxnErrorCode>) {
        self.script
            .lock()
            .expect("lock")
            .begin_errors
            .extend(codes);
    }

    /// Makes every commit fail with `code` until cleared.
    pub fn fail_all_commits(&self, code: TxnErrorCode) {
        self.script.lock().expect("lock").always_fail_commit = Some(code);
    }

    /// Clears every scripted failure.
    pub fn clear_failures(&self) {
        *self.script.lock().expect("lock") = Script::default();
    }

    /// Returns all recorded operations.
    #[must_use]
    pub fn operations(&self) -> Vec<KvOp> {
        self.operations.lock().expect("lock").clone()
    }

    /// Clears recorded operations.
    pub fn clear_operations(&self) {
        self.operations.lock().expect("lock").clear();
    }

    /// Number of commit attempts recorded.
    #[must_use]
    pub fn commit_attempts(&self) -> usize {
        self.operations()
            .iter()
            .filter(|op| matches!(op, KvOp::Commit { .. }))
            .count()
    }

    /// Number of successful commits recorded.
    #[must_use]
    pub fn successful_commits(&self) -> usize {
        self.operations()
            .iter()
            .filter(|op| matches!(op, KvOp::Commit { result: Ok(()) }))
            .count()
    }

    /// Live key-value pairs of the wrapped store.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(Vec<u8>, Bytes)> {
        self.inner.live_entries().expect("store poisoned")
    }

    fn record(&self, op: KvOp) {
        self.operations.lock().expect("lock").push(op);
    }
}

#[async_trait]
impl TxnKv for ScriptedTxnKv {
    async fn begin(&self) -> TxnResult<Box<dyn Transaction>> {
        let injected = self.script.lock().expect("lock").begin_errors.pop_front();
        if let Some(code) = injected {
            self.record(KvOp::Begin { result: Err(code) });
            return Err(code);
        }
        let inner = self.inner.begin().await?;
        self.record(KvOp::Begin { result: Ok(()) });
        Ok(Box::new(ScriptedTransaction {
            inner,
            kv: self.clone(),
        }))
    }
}

struct ScriptedTransaction {
    inner: Box<dyn Transaction>,
    kv: ScriptedTxnKv,
}

async fn maybe_delay(latency: Option<Duration>) {
    if let Some(latency) = latency {
        tokio::time::sleep(latency).await;
    }
}

#[async_trait]
impl Transaction for ScriptedTransaction {
    async fn get(&mut self, key: &[u8]) -> TxnResult<Option<Bytes>> {
        maybe_delay(self.kv.latency).await;
        self.kv.record(KvOp::Get {
            key: String::from_utf8_lossy(key).into_owned(),
        });
        self.inner.get(key).await
    }

    async fn scan_prefix(&mut self, prefix: &[u8]) -> TxnResult<Vec<(Vec<u8>, Bytes)>> {
        maybe_delay(self.kv.latency).await;
        self.kv.record(KvOp::Scan {
            prefix: String::from_utf8_lossy(prefix).into_owned(),
        });
        self.inner.scan_prefix(prefix).await
    }

    fn put(&mut self, key: &[u8], value: Bytes) {
        self.kv.record(KvOp::Put {
            key: String::from_utf8_lossy(key).into_owned(),
        });
        self.inner.put(key, value);
    }

    fn remove(&mut self, key: &[u8]) {
        self.kv.record(KvOp::Remove {
            key: String::from_utf8_lossy(key).into_owned(),
        });
        self.inner.remove(key);
    }

    fn stats(&self) -> KvStats {
        self.inner.stats()
    }

    async fn commit(self: Box<Self>) -> TxnResult<()> {
        let ScriptedTransaction { inner, kv } = *self;
        maybe_delay(kv.latency).await;
        let injected = {
            let mut script = kv.script.lock().expect("lock");
            script
                .commit_errors
                .pop_front()
                .or(script.always_fail_commit)
        };
        let result = match injected {
            Some(code) => Err(code),
            None => inner.commit().await,
        };
        kv.record(KvOp::Commit { result });
        result
    }
}
