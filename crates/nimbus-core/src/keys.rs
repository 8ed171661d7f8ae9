//! Typed store keys.
//!
//! Every record the meta service keeps in the transactional store is
//! addressed by one of the key types below. Keys are ordered byte strings
//! built from scope identifiers joined with `/`. Numeric components are
//! zero-padded so that lexical order matches numeric order, which keeps
//! prefix scans over a tablet's bitmaps sorted by rowset, segment and
//! version.
//!
//! # Key Types
//!
//! | Key Type | Layout |
//! |----------|--------|
//! | `DeleteBitmapLockKey` (v1) | `{instance}/delete_bitmap_lock/v1/{table}` |
//! | `DeleteBitmapLockKey` (v2) | `{instance}/delete_bitmap_lock/v2/{table}/{tablet}` |
//! | `DeleteBitmapKey` | `{instance}/delete_bitmap/{tablet}/{rowset}/{segment}/{version}` |
//! | `TabletStatsKey` | `{instance}/tablet_stats/{table}/{tablet}` |
//!
//! # Example
//!
//! ```rust
//! use nimbus_core::id::{InstanceId, TableId};
//! use nimbus_core::keys::{DeleteBitmapLockKey, StorageKey};
//!
//! let instance = InstanceId::new("warehouse-1").unwrap();
//! let key = DeleteBitmapLockKey::table(&instance, TableId::new(42));
//! assert!(key.as_ref().starts_with("warehouse-1/delete_bitmap_lock/v1/"));
//! ```

use crate::id::{InstanceId, RowsetId, SegmentId, TableId, TabletId, Version};

/// A typed store key.
pub trait StorageKey: AsRef<str> {
    /// Returns the key bytes used against the store.
    fn as_bytes(&self) -> &[u8] {
        self.as_ref().as_bytes()
    }
}

/// Formats a signed id so lexical order follows numeric order for non-negative ids.
fn padded(value: i64) -> String {
    format!("{value:020}")
}

// ============================================================================
// DeleteBitmapLockKey
// ============================================================================

/// Key of one delete-bitmap update lock record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeleteBitmapLockKey(String);

impl DeleteBitmapLockKey {
    /// Table-scoped lock record (protocol v1).
    #[must_use]
    pub fn table(instance: &InstanceId, table: TableId) -> Self {
        Self(format!(
            "{instance}/delete_bitmap_lock/v1/{}",
            padded(table.get())
        ))
    }

    /// Tablet-scoped lock record (protocol v2).
    #[must_use]
    pub fn tablet(instance: &InstanceId, table: TableId, tablet: TabletId) -> Self {
        Self(format!(
            "{instance}/delete_bitmap_lock/v2/{}/{}",
            padded(table.get()),
            padded(tablet.get())
        ))
    }
}

impl AsRef<str> for DeleteBitmapLockKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl StorageKey for DeleteBitmapLockKey {}

// ============================================================================
// DeleteBitmapKey
// ============================================================================

/// Key of one delete-bitmap entry, or a prefix over a tablet's entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeleteBitmapKey(String);

impl DeleteBitmapKey {
    /// Key of the bitmap for one `(rowset, segment, version)` of a tablet.
    #[must_use]
    pub fn entry(
        instance: &InstanceId,
        tablet: TabletId,
        rowset: &RowsetId,
        segment: SegmentId,
        version: Version,
    ) -> Self {
        Self(format!(
            "{}{:010}/{}",
            Self::rowset_prefix(instance, tablet, rowset).0,
            segment.get(),
            padded(version.get())
        ))
    }

    /// Prefix covering every entry of one rowset of a tablet.
    #[must_use]
    pub fn rowset_prefix(instance: &InstanceId, tablet: TabletId, rowset: &RowsetId) -> Self {
        Self(format!(
            "{}{rowset}/",
            Self::tablet_prefix(instance, tablet).0
        ))
    }

    /// Prefix covering every entry of a tablet.
    #[must_use]
    pub fn tablet_prefix(instance: &InstanceId, tablet: TabletId) -> Self {
        Self(format!("{instance}/delete_bitmap/{}/", padded(tablet.get())))
    }

    /// Splits an entry key back into `(rowset, segment, version)`.
    ///
    /// Returns `None` when the key was not produced by [`DeleteBitmapKey::entry`].
    #[must_use]
    pub fn parse_entry(key: &[u8]) -> Option<(RowsetId, SegmentId, Version)> {
        let key = std::str::from_utf8(key).ok()?;
        let mut parts = key.rsplitn(4, '/');
        let version = parts.next()?.parse::<i64>().ok()?;
        let segment = parts.next()?.parse::<u32>().ok()?;
        let rowset = RowsetId::new(parts.next()?).ok()?;
        Some((rowset, SegmentId::new(segment), Version::new(version)))
    }
}

impl AsRef<str> for DeleteBitmapKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl StorageKey for DeleteBitmapKey {}

// ============================================================================
// TabletStatsKey
// ============================================================================

/// Key of a tablet's statistics record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TabletStatsKey(String);

impl TabletStatsKey {
    /// Stats record of one tablet.
    #[must_use]
    pub fn tablet(instance: &InstanceId, table: TableId, tablet: TabletId) -> Self {
        Self(format!(
            "{instance}/tablet_stats/{}/{}",
            padded(table.get()),
            padded(tablet.get())
        ))
    }
}

impl AsRef<str> for TabletStatsKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl StorageKey for TabletStatsKey {}
