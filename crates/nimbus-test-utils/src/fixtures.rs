//! Factory functions for ids and bitmaps with sensible defaults.

use nimbus_core::delete_bitmap::BitmapKey;
use nimbus_core::id::{InstanceId, RowsetId, SegmentId, TableId, TabletId, Version};
use roaring::RoaringBitmap;

/// Ids of one table with a handful of tablets.
#[derive(Debug, Clone)]
pub struct TestTable {
    /// Instance owning the table.
    pub instance: InstanceId,
    /// Table id.
    pub table: TableId,
    /// Tablets of the table.
    pub tablets: Vec<TabletId>,
}

impl TestTable {
    /// Table `10001` with tablets `20001..=20000+n` in the given instance.
    #[must_use]
    pub fn new(instance: &str, tablets: usize) -> Self {
        Self {
            instance: instance_id(instance),
            table: TableId::new(10_001),
            tablets: (1..=tablets as i64).map(|i| TabletId::new(20_000 + i)).collect(),
        }
    }

    /// First tablet.
    #[must_use]
    pub fn tablet(&self) -> TabletId {
        self.tablets[0]
    }
}

/// Builds an instance id, panicking on invalid input.
#[must_use]
pub fn instance_id(name: &str) -> InstanceId {
    InstanceId::new(name).expect("valid instance id")
}

/// Builds a rowset id, panicking on invalid input.
#[must_use]
pub fn rowset_id(name: &str) -> RowsetId {
    RowsetId::new(name).expect("valid rowset id")
}

/// Builds a bitmap key.
#[must_use]
pub fn bitmap_key(rowset: &str, segment: u32, version: i64) -> BitmapKey {
    BitmapKey::new(rowset_id(rowset), SegmentId::new(segment), Version::new(version))
}

/// Builds a roaring bitmap from row ordinals.
#[must_use]
pub fn rows(ordinals: &[u32]) -> RoaringBitmap {
    ordinals.iter().copied().collect()
}
