//! Delete-bitmap update lock protocol.
//!
//! The lock serializes structural operations (loads, compactions, schema
//! changes) that rewrite the delete bitmaps of the same scope. It has no
//! lock service of its own: each lock is a [`LockRecord`] in the
//! transactional store, and every transition is a single read-modify-write
//! transaction, so the store's optimistic conflict detection decides races
//! between acquirers.
//!
//! ## Protocol versions
//!
//! | Version | Scope | Key |
//! |---------|-------|-----|
//! | v1 | table | `DeleteBitmapLockKey::table` |
//! | v2 | tablet | `DeleteBitmapLockKey::tablet` |
//!
//! Instances are routed to a version by [`LockVersionAllowList`]. All
//! participants of one instance must agree on the version; otherwise two
//! disjoint records could both be "the lock" for overlapping scopes.
//!
//! ## Holders
//!
//! | Kind | Lock id | Compatible with |
//! |------|---------|-----------------|
//! | Compaction | `-1` | nothing |
//! | Schema change | `-2` | nothing |
//! | Lock-free compaction | `-3` | never takes the lock |
//! | Load | txn id (`> 0`) | other loads, which join the initiator set |

mod allow_list;
mod record;

use std::fmt;

use nimbus_core::id::{InstanceId, TableId, TabletId};
use nimbus_core::keys::DeleteBitmapLockKey;
use serde::{Deserialize, Serialize};

use crate::error::{MetaError, Result};

pub use allow_list::LockVersionAllowList;
pub use record::{AcquireDecision, LockRecord, ReleaseDecision, acquire, holds, release};

/// Lock id reserved for compaction.
pub const COMPACTION_LOCK_ID: i64 = -1;
/// Lock id reserved for schema change.
pub const SCHEMA_CHANGE_LOCK_ID: i64 = -2;
/// Lock id of compactions that never take the update lock.
pub const LOCK_FREE_COMPACTION_LOCK_ID: i64 = -3;

/// Delete-bitmap lock protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockVersion {
    /// Table-scoped records.
    V1,
    /// Tablet-scoped records.
    V2,
}

impl LockVersion {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::V1 => "v1",
            Self::V2 => "v2",
        }
    }
}

impl fmt::Display for LockVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Class of lock holder, decoded from a raw lock id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
    /// Cumulative or base compaction.
    Compaction,
    /// Schema change job.
    SchemaChange,
    /// Compaction that computes bitmaps without taking the lock.
    LockFreeCompaction,
    /// A load transaction.
    Load {
        /// Transaction id, used as the lock id.
        txn_id: i64,
    },
}

impl LockKind {
    /// Decodes a raw lock id.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for `0` and for negative ids that are not
    /// reserved.
    pub fn from_lock_id(lock_id: i64) -> Result<Self> {
        match lock_id {
            COMPACTION_LOCK_ID => Ok(Self::Compaction),
            SCHEMA_CHANGE_LOCK_ID => Ok(Self::SchemaChange),
            LOCK_FREE_COMPACTION_LOCK_ID => Ok(Self::LockFreeCompaction),
            id if id > 0 => Ok(Self::Load { txn_id: id }),
            id => Err(MetaError::InvalidArgument(format!("invalid lock id {id}"))),
        }
    }

    /// Raw lock id.
    #[must_use]
    pub const fn lock_id(self) -> i64 {
        match self {
            Self::Compaction => COMPACTION_LOCK_ID,
            Self::SchemaChange => SCHEMA_CHANGE_LOCK_ID,
            Self::LockFreeCompaction => LOCK_FREE_COMPACTION_LOCK_ID,
            Self::Load { txn_id } => txn_id,
        }
    }

    /// Returns true for load locks.
    #[must_use]
    pub const fn is_load(self) -> bool {
        matches!(self, Self::Load { .. })
    }
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compaction => f.write_str("compaction"),
            Self::SchemaChange => f.write_str("schema_change"),
            Self::LockFreeCompaction => f.write_str("lock_free_compaction"),
            Self::Load { txn_id } => write!(f, "load({txn_id})"),
        }
    }
}

/// Granularity at which one lock record is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockScope {
    /// Whole table (v1).
    Table {
        /// Table id.
        table: TableId,
    },
    /// One tablet (v2).
    Tablet {
        /// Table owning the tablet.
        table: TableId,
        /// Tablet id.
        tablet: TabletId,
    },
}

impl LockScope {
    /// Scopes touched by a request under the given protocol version.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when a v2 request names no tablets.
    pub fn for_request(
        version: LockVersion,
        table: TableId,
        tablets: &[TabletId],
    ) -> Result<Vec<Self>> {
        match version {
            LockVersion::V1 => Ok(vec![Self::Table { table }]),
            LockVersion::V2 => {
                if tablets.is_empty() {
                    return Err(MetaError::InvalidArgument(format!(
                        "v2 lock request for table {table} names no tablets"
                    )));
                }
                let mut scopes: Vec<Self> = tablets
                    .iter()
                    .map(|&tablet| Self::Tablet { table, tablet })
                    .collect();
                scopes.sort_unstable();
                scopes.dedup();
                Ok(scopes)
            }
        }
    }

    /// Store key of this scope's record.
    #[must_use]
    pub fn key(&self, instance: &InstanceId) -> DeleteBitmapLockKey {
        match *self {
            Self::Table { table } => DeleteBitmapLockKey::table(instance, table),
            Self::Tablet { table, tablet } => DeleteBitmapLockKey::tablet(instance, table, tablet),
        }
    }
}

impl fmt::Display for LockScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Table { table } => write!(f, "table {table}"),
            Self::Tablet { table, tablet } => write!(f, "table {table} tablet {tablet}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_ids_decode_into_kinds() {
        assert_eq!(LockKind::from_lock_id(-1).expect("kind"), LockKind::Compaction);
        assert_eq!(LockKind::from_lock_id(-2).expect("kind"), LockKind::SchemaChange);
        assert_eq!(
            LockKind::from_lock_id(-3).expect("kind"),
            LockKind::LockFreeCompaction
        );
        assert_eq!(
            LockKind::from_lock_id(101).expect("kind"),
            LockKind::Load { txn_id: 101 }
        );
        assert!(LockKind::from_lock_id(0).is_err());
        assert!(LockKind::from_lock_id(-4).is_err());
        assert_eq!(LockKind::Load { txn_id: 9 }.lock_id(), 9);
    }

    #[test]
    fn v2_scopes_are_sorted_and_deduplicated() {
        let scopes = LockScope::for_request(
            LockVersion::V2,
            TableId::new(1),
            &[TabletId::new(3), TabletId::new(2), TabletId::new(3)],
        )
        .expect("scopes");
        assert_eq!(scopes.len(), 2);
        assert!(scopes[0] < scopes[1]);

        assert!(LockScope::for_request(LockVersion::V2, TableId::new(1), &[]).is_err());
        let v1 = LockScope::for_request(LockVersion::V1, TableId::new(1), &[]).expect("v1");
        assert_eq!(v1, vec![LockScope::Table { table: TableId::new(1) }]);
    }
}
