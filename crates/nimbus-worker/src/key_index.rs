//! Primary-key based delete bitmap calculation.
//!
//! A row is superseded when a newer row carries the same primary key. The
//! calculator reads each segment's keys (in row order) through a
//! [`SegmentKeyProvider`] and compares them with a hash index of the new
//! segment.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use nimbus_core::delete_bitmap::{BitmapKey, DeleteBitmap};
use nimbus_core::id::{RowsetId, SegmentId, TabletId};
use roaring::RoaringBitmap;

use crate::calculator::{CrossRowsetTask, DeleteBitmapCalculator, IntraRowsetTask, PENDING_VERSION};
use crate::error::{CalcError, Result};

/// Source of segment primary keys.
pub trait SegmentKeyProvider: Send + Sync + 'static {
    /// Segments of a rowset, in write order.
    ///
    /// # Errors
    ///
    /// Returns `RowsetNotFound` if the rowset is unknown.
    fn segments(&self, tablet: TabletId, rowset: &RowsetId) -> Result<Vec<SegmentId>>;

    /// Primary keys of a segment, one per row.
    ///
    /// # Errors
    ///
    /// Returns `SegmentNotFound` or `Corrupt`.
    fn keys(&self, tablet: TabletId, rowset: &RowsetId, segment: SegmentId) -> Result<Arc<Vec<Bytes>>>;
}

type SegmentMap = BTreeMap<SegmentId, std::result::Result<Arc<Vec<Bytes>>, String>>;

/// In-memory key index, for embedded use and tests.
#[derive(Debug, Default)]
pub struct MemoryKeyIndex {
    rowsets: RwLock<HashMap<(TabletId, RowsetId), SegmentMap>>,
}

impl MemoryKeyIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the keys of one segment.
    pub fn insert_segment<K: Into<Bytes>>(
        &self,
        tablet: TabletId,
        rowset: &RowsetId,
        segment: SegmentId,
        keys: impl IntoIterator<Item = K>,
    ) {
        let keys = Arc::new(keys.into_iter().map(Into::into).collect());
        self.rowsets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry((tablet, rowset.clone()))
            .or_default()
            .insert(segment, Ok(keys));
    }

    /// Makes reads of one segment fail as corrupt.
    pub fn corrupt_segment(
        &self,
        tablet: TabletId,
        rowset: &RowsetId,
        segment: SegmentId,
        message: impl Into<String>,
    ) {
        self.rowsets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry((tablet, rowset.clone()))
            .or_default()
            .insert(segment, Err(message.into()));
    }
}

impl SegmentKeyProvider for MemoryKeyIndex {
    fn segments(&self, tablet: TabletId, rowset: &RowsetId) -> Result<Vec<SegmentId>> {
        let rowsets = self.rowsets.read().unwrap_or_else(PoisonError::into_inner);
        rowsets
            .get(&(tablet, rowset.clone()))
            .map(|segments| segments.keys().copied().collect())
            .ok_or_else(|| CalcError::RowsetNotFound {
                tablet: tablet.get(),
                rowset: rowset.to_string(),
            })
    }

    fn keys(&self, tablet: TabletId, rowset: &RowsetId, segment: SegmentId) -> Result<Arc<Vec<Bytes>>> {
        let rowsets = self.rowsets.read().unwrap_or_else(PoisonError::into_inner);
        match rowsets
            .get(&(tablet, rowset.clone()))
            .and_then(|segments| segments.get(&segment))
        {
            Some(Ok(keys)) => Ok(Arc::clone(keys)),
            Some(Err(message)) => Err(CalcError::Corrupt {
                tablet: tablet.get(),
                rowset: rowset.to_string(),
                segment: segment.get(),
                message: message.clone(),
            }),
            None => Err(CalcError::SegmentNotFound {
                tablet: tablet.get(),
                rowset: rowset.to_string(),
                segment: segment.get(),
            }),
        }
    }
}

/// Calculator comparing primary keys.
#[derive(Debug)]
pub struct PrimaryKeyCalculator<P> {
    provider: Arc<P>,
}

impl<P: SegmentKeyProvider> PrimaryKeyCalculator<P> {
    /// Creates a calculator reading keys from `provider`.
    #[must_use]
    pub fn new(provider: Arc<P>) -> Self {
        Self { provider }
    }
}

impl<P: SegmentKeyProvider> DeleteBitmapCalculator for PrimaryKeyCalculator<P> {
    fn calc_cross(&self, task: &CrossRowsetTask) -> Result<DeleteBitmap> {
        let new_keys = self.provider.keys(task.tablet, &task.rowset, task.segment)?;
        let mut index: HashMap<&[u8], u32> = HashMap::with_capacity(new_keys.len());
        for (row, key) in new_keys.iter().enumerate() {
            index.insert(key.as_ref(), ordinal(task.tablet, &task.rowset, task.segment, row)?);
        }

        let mut marks = DeleteBitmap::new();
        let mut replaced = RoaringBitmap::new();
        for target in &task.targets {
            for segment in self.provider.segments(task.tablet, target)? {
                let keys = self.provider.keys(task.tablet, target, segment)?;
                for (row, key) in keys.iter().enumerate() {
                    let Some(&new_row) = index.get(key.as_ref()) else {
                        continue;
                    };
                    let row = ordinal(task.tablet, target, segment, row)?;
                    let already_deleted = task
                        .tablet_bitmap
                        .as_ref()
                        .is_some_and(|b| b.contains_at(target, segment, row, task.end_version));
                    if already_deleted {
                        continue;
                    }
                    marks.add(BitmapKey::new(target.clone(), segment, PENDING_VERSION), row);
                    replaced.insert(new_row);
                }
            }
        }

        if let Some(writer) = &task.rowset_writer {
            if !replaced.is_empty() {
                writer.rewrite_segment(task.segment, &replaced)?;
            }
        }
        Ok(marks)
    }

    fn calc_intra(&self, task: &IntraRowsetTask) -> Result<DeleteBitmap> {
        let mut marks = DeleteBitmap::new();
        let mut newer: HashSet<Bytes> = HashSet::new();
        for &segment in task.segments.iter().rev() {
            let keys = self.provider.keys(task.tablet, &task.rowset, segment)?;
            for (row, key) in keys.iter().enumerate().rev() {
                if !newer.insert(key.clone()) {
                    let row = ordinal(task.tablet, &task.rowset, segment, row)?;
                    marks.add(BitmapKey::new(task.rowset.clone(), segment, PENDING_VERSION), row);
                }
            }
        }
        Ok(marks)
    }
}

fn ordinal(tablet: TabletId, rowset: &RowsetId, segment: SegmentId, row: usize) -> Result<u32> {
    u32::try_from(row).map_err(|_| CalcError::Corrupt {
        tablet: tablet.get(),
        rowset: rowset.to_string(),
        segment: segment.get(),
        message: format!("row ordinal {row} exceeds u32"),
    })
}
