//! Per-segment deletion markers for merge-on-write tables.
//!
//! A [`DeleteBitmap`] maps `(rowset, segment, version)` to the set of row
//! ordinals of that segment deleted as of that version. The full deletion
//! view of a segment at version `v` is the union of every entry whose
//! version is `<= v`.
//!
//! Bitmaps are stored in the transactional store using the portable roaring
//! serialization format.

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::{RowsetId, SegmentId, Version};

/// Identifies one bitmap entry within a tablet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BitmapKey {
    /// Rowset owning the segment.
    pub rowset: RowsetId,
    /// Segment ordinal within the rowset.
    pub segment: SegmentId,
    /// Version at which the rows became deleted.
    pub version: Version,
}

impl BitmapKey {
    /// Builds a key.
    #[must_use]
    pub fn new(rowset: RowsetId, segment: SegmentId, version: Version) -> Self {
        Self {
            rowset,
            segment,
            version,
        }
    }
}

/// Delete bitmap of one tablet, or a subset of it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeleteBitmap {
    entries: BTreeMap<BitmapKey, RoaringBitmap>,
}

impl DeleteBitmap {
    /// Creates an empty bitmap.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks one row deleted. Returns false if it was already marked under this key.
    pub fn add(&mut self, key: BitmapKey, row: u32) -> bool {
        self.entries.entry(key).or_default().insert(row)
    }

    /// Unions `rows` into the entry at `key`.
    pub fn merge_entry(&mut self, key: BitmapKey, rows: &RoaringBitmap) {
        *self.entries.entry(key).or_default() |= rows;
    }

    /// Unions every entry of `other` into this bitmap.
    pub fn merge(&mut self, other: &Self) {
        for (key, rows) in &other.entries {
            self.merge_entry(key.clone(), rows);
        }
    }

    /// Returns the rows stored under exactly `key`.
    #[must_use]
    pub fn get(&self, key: &BitmapKey) -> Option<&RoaringBitmap> {
        self.entries.get(key)
    }

    /// Returns true if `row` of the segment is deleted at or before `max_version`.
    #[must_use]
    pub fn contains_at(
        &self,
        rowset: &RowsetId,
        segment: SegmentId,
        row: u32,
        max_version: Version,
    ) -> bool {
        self.segment_entries(rowset, segment)
            .any(|(key, rows)| key.version <= max_version && rows.contains(row))
    }

    /// Unions every version of one segment up to `max_version`.
    #[must_use]
    pub fn aggregate(&self, rowset: &RowsetId, segment: SegmentId, max_version: Version) -> RoaringBitmap {
        let mut result = RoaringBitmap::new();
        for (key, rows) in self.segment_entries(rowset, segment) {
            if key.version <= max_version {
                result |= rows;
            }
        }
        result
    }

    fn segment_entries<'a>(
        &'a self,
        rowset: &'a RowsetId,
        segment: SegmentId,
    ) -> impl Iterator<Item = (&'a BitmapKey, &'a RoaringBitmap)> + 'a {
        let start = BitmapKey::new(rowset.clone(), segment, Version::new(i64::MIN));
        self.entries
            .range(start..)
            .take_while(move |(key, _)| &key.rowset == rowset && key.segment == segment)
    }

    /// Iterates entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&BitmapKey, &RoaringBitmap)> {
        self.entries.iter()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of marked rows across all entries.
    #[must_use]
    pub fn cardinality(&self) -> u64 {
        self.entries.values().map(RoaringBitmap::len).sum()
    }
}

impl FromIterator<(BitmapKey, RoaringBitmap)> for DeleteBitmap {
    fn from_iter<I: IntoIterator<Item = (BitmapKey, RoaringBitmap)>>(iter: I) -> Self {
        let mut bitmap = Self::new();
        for (key, rows) in iter {
            bitmap.merge_entry(key, &rows);
        }
        bitmap
    }
}

impl IntoIterator for DeleteBitmap {
    type Item = (BitmapKey, RoaringBitmap);
    type IntoIter = std::collections::btree_map::IntoIter<BitmapKey, RoaringBitmap>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Serializes a roaring bitmap to its portable byte format.
///
/// # Errors
///
/// Returns a serialization error if the bitmap cannot be written.
pub fn encode_rows(rows: &RoaringBitmap) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(rows.serialized_size()).writer();
    rows.serialize_into(&mut buf)
        .map_err(|e| Error::serialization(format!("encode delete bitmap: {e}")))?;
    Ok(buf.into_inner().freeze())
}

/// Parses a roaring bitmap from its portable byte format.
///
/// # Errors
///
/// Returns a serialization error if the bytes are not a valid bitmap.
pub fn decode_rows(bytes: &[u8]) -> Result<RoaringBitmap> {
    RoaringBitmap::deserialize_from(bytes)
        .map_err(|e| Error::serialization(format!("decode delete bitmap: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(rowset: &str, segment: u32, version: i64) -> BitmapKey {
        BitmapKey::new(
            RowsetId::new(rowset).expect("rowset"),
            SegmentId::new(segment),
            Version::new(version),
        )
    }

    #[test]
    fn visibility_follows_version() {
        let mut bitmap = DeleteBitmap::new();
        bitmap.add(key("r1", 0, 5), 10);
        bitmap.add(key("r1", 0, 8), 11);
        bitmap.add(key("r1", 1, 3), 10);

        let rowset = RowsetId::new("r1").expect("rowset");
        assert!(bitmap.contains_at(&rowset, SegmentId::new(0), 10, Version::new(5)));
        assert!(!bitmap.contains_at(&rowset, SegmentId::new(0), 11, Version::new(7)));
        assert!(bitmap.contains_at(&rowset, SegmentId::new(0), 11, Version::new(8)));
        assert!(!bitmap.contains_at(&rowset, SegmentId::new(0), 12, Version::new(100)));

        let agg = bitmap.aggregate(&rowset, SegmentId::new(0), Version::new(100));
        assert_eq!(agg.iter().collect::<Vec<_>>(), vec![10, 11]);
    }

    #[test]
    fn merge_unions_matching_entries() {
        let mut a = DeleteBitmap::new();
        a.add(key("r1", 0, 5), 1);
        let mut b = DeleteBitmap::new();
        b.add(key("r1", 0, 5), 2);
        b.add(key("r2", 0, 5), 3);

        a.merge(&b);
        assert_eq!(a.len(), 2);
        assert_eq!(a.cardinality(), 3);
    }

    #[test]
    fn portable_encoding_roundtrips() {
        let rows: RoaringBitmap = [1u32, 5, 70_000].into_iter().collect();
        let bytes = encode_rows(&rows).expect("encode");
        assert_eq!(decode_rows(&bytes).expect("decode"), rows);
        assert!(decode_rows(b"not a bitmap").is_err());
    }

    proptest::proptest! {
        #[test]
        fn aggregate_matches_point_lookups(
            marks in proptest::collection::vec((0u32..3, 0i64..10, 0u32..64), 0..40),
            probe_version in 0i64..10,
        ) {
            let mut bitmap = DeleteBitmap::new();
            for (segment, version, row) in &marks {
                bitmap.add(key("r1", *segment, *version), *row);
            }
            let rowset = RowsetId::new("r1").expect("rowset");
            for segment in 0..3 {
                let agg = bitmap.aggregate(&rowset, SegmentId::new(segment), Version::new(probe_version));
                for row in 0..64 {
                    proptest::prop_assert_eq!(
                        agg.contains(row),
                        bitmap.contains_at(&rowset, SegmentId::new(segment), row, Version::new(probe_version))
                    );
                }
            }
        }
    }
}
