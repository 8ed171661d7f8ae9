//! Transactional key-value store contract.
//!
//! Every piece of meta-service state (lock records, delete bitmaps, tablet
//! stats) lives in an ordered, transactional key-value store. This module
//! defines the contract the handlers consume and an in-memory optimistic
//! implementation used by tests and simulations.
//!
//! # Semantics
//!
//! | Operation | Behaviour |
//! |-----------|-----------|
//! | `begin` | Opens a transaction pinned to the latest committed version |
//! | `get` / `scan_prefix` | Snapshot reads; buffered writes of the same transaction are visible |
//! | `put` / `remove` | Buffered until commit |
//! | `commit` | Validates every key and prefix read; fails with [`TxnErrorCode::Conflict`] when another transaction committed a write to any of them after the snapshot |
//!
//! A transaction that stays open longer than the store's validity window
//! fails with [`TxnErrorCode::TooOld`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Bound;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;

/// Error codes reported by the transactional store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxnErrorCode {
    /// Another transaction committed a conflicting write.
    Conflict,
    /// The transaction outlived the store's validity window.
    TooOld,
    /// A read failed transiently.
    RetryableGet,
    /// The commit failed transiently; the outcome is known to be "not applied".
    RetryableCommit,
    /// Creating the transaction failed transiently.
    RetryableCreate,
    /// A non-retryable store failure.
    Other,
}

impl TxnErrorCode {
    /// Returns true for codes that may succeed when the whole transaction is retried.
    #[must_use]
    pub const fn is_transient(self) -> bool {
        !matches!(self, Self::Other)
    }
}

impl fmt::Display for TxnErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Conflict => "transaction conflict",
            Self::TooOld => "transaction too old",
            Self::RetryableGet => "retryable get",
            Self::RetryableCommit => "retryable commit",
            Self::RetryableCreate => "retryable create",
            Self::Other => "store failure",
        };
        f.write_str(s)
    }
}

/// Result of a store operation.
pub type TxnResult<T> = std::result::Result<T, TxnErrorCode>;

/// Counters describing the work one transaction did against the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KvStats {
    /// Number of point reads and scanned entries.
    pub get_count: u64,
    /// Number of buffered puts.
    pub put_count: u64,
    /// Number of buffered removes.
    pub delete_count: u64,
    /// Key plus value bytes read.
    pub get_bytes: u64,
    /// Key plus value bytes written.
    pub put_bytes: u64,
}

impl KvStats {
    /// Adds another set of counters into this one.
    pub fn merge(&mut self, other: &Self) {
        self.get_count += other.get_count;
        self.put_count += other.put_count;
        self.delete_count += other.delete_count;
        self.get_bytes += other.get_bytes;
        self.put_bytes += other.put_bytes;
    }
}

/// Factory for store transactions.
#[async_trait]
pub trait TxnKv: Send + Sync + 'static {
    /// Opens a new transaction.
    ///
    /// # Errors
    ///
    /// Returns [`TxnErrorCode::RetryableCreate`] when the store cannot open a
    /// transaction right now.
    async fn begin(&self) -> TxnResult<Box<dyn Transaction>>;
}

/// One optimistic read-modify-write transaction.
#[async_trait]
pub trait Transaction: Send {
    /// Reads a key at the transaction snapshot.
    async fn get(&mut self, key: &[u8]) -> TxnResult<Option<Bytes>>;

    /// Reads every key starting with `prefix`, in key order.
    async fn scan_prefix(&mut self, prefix: &[u8]) -> TxnResult<Vec<(Vec<u8>, Bytes)>>;

    /// Buffers a write.
    fn put(&mut self, key: &[u8], value: Bytes);

    /// Buffers a delete.
    fn remove(&mut self, key: &[u8]);

    /// Returns the counters accumulated so far.
    fn stats(&self) -> KvStats;

    /// Validates the read set and applies buffered writes atomically.
    async fn commit(self: Box<Self>) -> TxnResult<()>;
}

// ============================================================================
// MemoryTxnKv
// ============================================================================

/// In-memory multi-version store with optimistic conflict detection.
///
/// Thread-safe via `Mutex`. Keeps the full version history of every key,
/// which makes it unsuitable for anything but tests and simulations.
#[derive(Debug, Clone, Default)]
pub struct MemoryTxnKv {
    inner: Arc<Mutex<VersionedStore>>,
    max_txn_age: Option<Duration>,
}

#[derive(Debug, Default)]
struct VersionedStore {
    committed_version: u64,
    /// Key history as (commit version, value) pairs; `None` is a tombstone.
    data: BTreeMap<Vec<u8>, Vec<(u64, Option<Bytes>)>>,
}

impl VersionedStore {
    fn read_at(&self, key: &[u8], version: u64) -> Option<Bytes> {
        self.data.get(key).and_then(|history| value_at(history, version))
    }

    fn latest_write(&self, key: &[u8]) -> u64 {
        self.data
            .get(key)
            .and_then(|history| history.last())
            .map_or(0, |(v, _)| *v)
    }
}

fn value_at(history: &[(u64, Option<Bytes>)], version: u64) -> Option<Bytes> {
    history
        .iter()
        .rev()
        .find(|(v, _)| *v <= version)
        .and_then(|(_, value)| value.clone())
}

fn prefix_range(prefix: &[u8]) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
    let start = Bound::Included(prefix.to_vec());
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return (start, Bound::Excluded(end));
        }
    }
    (start, Bound::Unbounded)
}

impl MemoryTxnKv {
    /// Creates an empty store with no transaction age limit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the validity window after which open transactions fail with
    /// [`TxnErrorCode::TooOld`].
    #[must_use]
    pub fn with_max_txn_age(mut self, max_age: Duration) -> Self {
        self.max_txn_age = Some(max_age);
        self
    }

    /// Returns every live key-value pair at the latest committed version.
    ///
    /// # Errors
    ///
    /// Returns [`TxnErrorCode::Other`] if the store mutex is poisoned.
    pub fn live_entries(&self) -> TxnResult<Vec<(Vec<u8>, Bytes)>> {
        let store = self.inner.lock().map_err(|_| TxnErrorCode::Other)?;
        let version = store.committed_version;
        Ok(store
            .data
            .iter()
            .filter_map(|(k, history)| value_at(history, version).map(|v| (k.clone(), v)))
            .collect())
    }
}

#[async_trait]
impl TxnKv for MemoryTxnKv {
    async fn begin(&self) -> TxnResult<Box<dyn Transaction>> {
        let read_version = self
            .inner
            .lock()
            .map_err(|_| TxnErrorCode::Other)?
            .committed_version;
        Ok(Box::new(MemoryTransaction {
            store: Arc::clone(&self.inner),
            read_version,
            started: Instant::now(),
            max_age: self.max_txn_age,
            read_keys: BTreeSet::new(),
            read_prefixes: Vec::new(),
            writes: BTreeMap::new(),
            stats: KvStats::default(),
        }))
    }
}

/// Transaction over a [`MemoryTxnKv`].
#[derive(Debug)]
pub struct MemoryTransaction {
    store: Arc<Mutex<VersionedStore>>,
    read_version: u64,
    started: Instant,
    max_age: Option<Duration>,
    read_keys: BTreeSet<Vec<u8>>,
    read_prefixes: Vec<Vec<u8>>,
    writes: BTreeMap<Vec<u8>, Option<Bytes>>,
    stats: KvStats,
}

impl MemoryTransaction {
    fn check_age(&self) -> TxnResult<()> {
        match self.max_age {
            Some(max_age) if self.started.elapsed() > max_age => Err(TxnErrorCode::TooOld),
            _ => Ok(()),
        }
    }

    fn record_read(&mut self, key: &[u8], value: Option<&Bytes>) {
        self.stats.get_count += 1;
        self.stats.get_bytes += (key.len() + value.map_or(0, Bytes::len)) as u64;
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn get(&mut self, key: &[u8]) -> TxnResult<Option<Bytes>> {
        self.check_age()?;
        let value = match self.writes.get(key) {
            Some(buffered) => buffered.clone(),
            None => {
                let store = self.store.lock().map_err(|_| TxnErrorCode::Other)?;
                let value = store.read_at(key, self.read_version);
                drop(store);
                self.read_keys.insert(key.to_vec());
                value
            }
        };
        self.record_read(key, value.as_ref());
        Ok(value)
    }

    async fn scan_prefix(&mut self, prefix: &[u8]) -> TxnResult<Vec<(Vec<u8>, Bytes)>> {
        self.check_age()?;
        let mut merged: BTreeMap<Vec<u8>, Option<Bytes>> = {
            let store = self.store.lock().map_err(|_| TxnErrorCode::Other)?;
            store
                .data
                .range(prefix_range(prefix))
                .map(|(k, history)| (k.clone(), value_at(history, self.read_version)))
                .collect()
        };
        for (k, v) in self.writes.range(prefix_range(prefix)) {
            merged.insert(k.clone(), v.clone());
        }
        self.read_prefixes.push(prefix.to_vec());

        let entries: Vec<(Vec<u8>, Bytes)> = merged
            .into_iter()
            .filter_map(|(k, v)| v.map(|v| (k, v)))
            .collect();
        for (k, v) in &entries {
            self.record_read(k, Some(v));
        }
        Ok(entries)
    }

    fn put(&mut self, key: &[u8], value: Bytes) {
        self.stats.put_count += 1;
        self.stats.put_bytes += (key.len() + value.len()) as u64;
        self.writes.insert(key.to_vec(), Some(value));
    }

    fn remove(&mut self, key: &[u8]) {
        self.stats.delete_count += 1;
        self.stats.put_bytes += key.len() as u64;
        self.writes.insert(key.to_vec(), None);
    }

    fn stats(&self) -> KvStats {
        self.stats
    }

    async fn commit(self: Box<Self>) -> TxnResult<()> {
        self.check_age()?;
        let MemoryTransaction {
            store,
            read_version,
            read_keys,
            read_prefixes,
            writes,
            ..
        } = *self;
        let mut store = store.lock().map_err(|_| TxnErrorCode::Other)?;

        let stale_key = read_keys
            .iter()
            .any(|k| store.latest_write(k) > read_version);
        let stale_prefix = read_prefixes.iter().any(|p| {
            store
                .data
                .range(prefix_range(p))
                .any(|(_, history)| history.last().is_some_and(|(v, _)| *v > read_version))
        });
        if stale_key || stale_prefix {
            return Err(TxnErrorCode::Conflict);
        }

        if writes.is_empty() {
            return Ok(());
        }
        store.committed_version += 1;
        let version = store.committed_version;
        for (key, value) in writes {
            store.data.entry(key).or_default().push((version, value));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn put_one(kv: &MemoryTxnKv, key: &[u8], value: &'static [u8]) {
        let mut txn = kv.begin().await.expect("begin");
        txn.put(key, Bytes::from_static(value));
        txn.commit().await.expect("commit");
    }

    #[tokio::test]
    async fn reads_see_own_writes() {
        let kv = MemoryTxnKv::new();
        let mut txn = kv.begin().await.expect("begin");
        txn.put(b"a", Bytes::from_static(b"1"));
        assert_eq!(txn.get(b"a").await.expect("get"), Some(Bytes::from_static(b"1")));
        txn.remove(b"a");
        assert_eq!(txn.get(b"a").await.expect("get"), None);
    }

    #[tokio::test]
    async fn concurrent_read_modify_write_conflicts() {
        let kv = MemoryTxnKv::new();
        put_one(&kv, b"lock", b"v0").await;

        let mut t1 = kv.begin().await.expect("begin");
        let mut t2 = kv.begin().await.expect("begin");
        t1.get(b"lock").await.expect("get");
        t2.get(b"lock").await.expect("get");
        t1.put(b"lock", Bytes::from_static(b"t1"));
        t2.put(b"lock", Bytes::from_static(b"t2"));

        t1.commit().await.expect("first commit wins");
        assert_eq!(t2.commit().await, Err(TxnErrorCode::Conflict));
    }

    #[tokio::test]
    async fn snapshot_hides_later_commits() {
        let kv = MemoryTxnKv::new();
        put_one(&kv, b"k", b"old").await;
        let mut reader = kv.begin().await.expect("begin");
        put_one(&kv, b"k", b"new").await;
        assert_eq!(
            reader.get(b"k").await.expect("get"),
            Some(Bytes::from_static(b"old"))
        );
    }

    #[tokio::test]
    async fn prefix_scan_detects_phantom_insert() {
        let kv = MemoryTxnKv::new();
        put_one(&kv, b"p/1", b"x").await;

        let mut scanner = kv.begin().await.expect("begin");
        let rows = scanner.scan_prefix(b"p/").await.expect("scan");
        assert_eq!(rows.len(), 1);
        put_one(&kv, b"p/2", b"y").await;
        put_one(&kv, b"q/1", b"z").await;

        scanner.put(b"summary", Bytes::from_static(b"1"));
        assert_eq!(scanner.commit().await, Err(TxnErrorCode::Conflict));
    }

    #[tokio::test]
    async fn stats_count_reads_and_writes() {
        let kv = MemoryTxnKv::new();
        put_one(&kv, b"k", b"abc").await;
        let mut txn = kv.begin().await.expect("begin");
        txn.get(b"k").await.expect("get");
        txn.put(b"k2", Bytes::from_static(b"de"));
        txn.remove(b"k");
        let stats = txn.stats();
        assert_eq!(stats.get_count, 1);
        assert_eq!(stats.get_bytes, 4);
        assert_eq!(stats.put_count, 1);
        assert_eq!(stats.delete_count, 1);
        assert_eq!(stats.put_bytes, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn long_running_transaction_is_too_old() {
        let kv = MemoryTxnKv::new().with_max_txn_age(Duration::from_secs(5));
        let mut txn = kv.begin().await.expect("begin");
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(txn.get(b"k").await, Err(TxnErrorCode::TooOld));
    }

    #[tokio::test]
    async fn live_entries_skip_tombstones() {
        let kv = MemoryTxnKv::new();
        put_one(&kv, b"a", b"1").await;
        put_one(&kv, b"b", b"2").await;
        let mut txn = kv.begin().await.expect("begin");
        txn.remove(b"a");
        txn.commit().await.expect("commit");

        let live = kv.live_entries().expect("entries");
        assert_eq!(live, vec![(b"b".to_vec(), Bytes::from_static(b"2"))]);
    }

    #[test]
    fn prefix_range_handles_trailing_max_byte() {
        let (_, end) = prefix_range(&[0x01, 0xFF]);
        assert_eq!(end, Bound::Excluded(vec![0x02]));
        let (_, end) = prefix_range(&[0xFF]);
        assert_eq!(end, Bound::Unbounded);
    }
}
