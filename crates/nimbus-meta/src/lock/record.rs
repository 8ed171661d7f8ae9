//! Lock records and the pure transitions over them.
//!
//! The functions here decide what to write; the handlers in
//! [`crate::service`] perform the read and the write inside one store
//! transaction.

use std::collections::BTreeSet;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::LockKind;
use crate::error::Result;
use crate::metrics::LockOutcome;

/// Stored state of one lock scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Holder class: a reserved negative id or the first load's txn id.
    pub lock_id: i64,
    /// Participants currently holding the lock.
    pub initiators: BTreeSet<i64>,
    /// Deadline after which the next acquirer may overwrite the record.
    pub expiration: DateTime<Utc>,
}

impl LockRecord {
    /// Record held by a single initiator.
    #[must_use]
    pub fn new(lock_id: i64, initiator: i64, expiration: DateTime<Utc>) -> Self {
        Self {
            lock_id,
            initiators: BTreeSet::from([initiator]),
            expiration,
        }
    }

    /// Returns true once the lease has run out.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration <= now
    }

    /// Returns true if the stored holder is a load.
    #[must_use]
    pub fn is_load(&self) -> bool {
        self.lock_id > 0
    }

    /// Encodes the record for the store.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if encoding fails.
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Decodes a stored record.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the bytes are not a lock record.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn same_class(&self, kind: LockKind) -> bool {
        if kind.is_load() {
            self.is_load()
        } else {
            self.lock_id == kind.lock_id()
        }
    }
}

/// What an acquisition should do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireDecision {
    /// Write this record.
    Write {
        /// New record state.
        record: LockRecord,
        /// How the scope changed hands.
        outcome: LockOutcome,
    },
    /// An incompatible holder owns the scope.
    Busy {
        /// Current holder.
        holder: LockRecord,
    },
}

/// Decides an acquisition of one scope.
///
/// - absent or expired record: write a fresh record for the caller
/// - caller already in the initiator set under the same lock id: refresh
///   the lease
/// - stored load and requesting load: join the initiator set and keep the
///   stored lock id
/// - anything else: busy
#[must_use]
pub fn acquire(
    current: Option<&LockRecord>,
    kind: LockKind,
    initiator: i64,
    now: DateTime<Utc>,
    expiration: DateTime<Utc>,
) -> AcquireDecision {
    let Some(record) = current else {
        return AcquireDecision::Write {
            record: LockRecord::new(kind.lock_id(), initiator, expiration),
            outcome: LockOutcome::Acquired,
        };
    };

    if record.is_expired(now) {
        return AcquireDecision::Write {
            record: LockRecord::new(kind.lock_id(), initiator, expiration),
            outcome: LockOutcome::TakenOver,
        };
    }

    let reentrant = record.lock_id == kind.lock_id() && record.initiators.contains(&initiator);
    if reentrant || (kind.is_load() && record.is_load()) {
        let mut joined = record.clone();
        joined.initiators.insert(initiator);
        joined.expiration = joined.expiration.max(expiration);
        return AcquireDecision::Write {
            record: joined,
            outcome: LockOutcome::Joined,
        };
    }

    AcquireDecision::Busy {
        holder: record.clone(),
    }
}

/// What a release should do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseDecision {
    /// The caller was the last initiator; delete the record.
    Delete,
    /// Other initiators remain; write the reduced record.
    Rewrite(LockRecord),
    /// The caller holds nothing here; leave the record alone.
    Stale {
        /// Why the release was ignored.
        reason: &'static str,
    },
}

/// Decides a release of one scope.
#[must_use]
pub fn release(current: Option<&LockRecord>, kind: LockKind, initiator: i64) -> ReleaseDecision {
    let Some(record) = current else {
        return ReleaseDecision::Stale {
            reason: "no lock record",
        };
    };
    if !record.same_class(kind) {
        return ReleaseDecision::Stale {
            reason: "lock is held by another holder",
        };
    }
    if !record.initiators.contains(&initiator) {
        return ReleaseDecision::Stale {
            reason: "initiator does not hold the lock",
        };
    }

    let mut reduced = record.clone();
    reduced.initiators.remove(&initiator);
    if reduced.initiators.is_empty() {
        ReleaseDecision::Delete
    } else {
        ReleaseDecision::Rewrite(reduced)
    }
}

/// Returns true if `initiator` still holds an unexpired lock of `kind`.
#[must_use]
pub fn holds(
    current: Option<&LockRecord>,
    kind: LockKind,
    initiator: i64,
    now: DateTime<Utc>,
) -> bool {
    current.is_some_and(|record| {
        !record.is_expired(now) && record.same_class(kind) && record.initiators.contains(&initiator)
    })
}
