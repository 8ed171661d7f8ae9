//! Calculation tasks and the calculator seam.
//!
//! A task names what to compare; a [`DeleteBitmapCalculator`] does the
//! comparison and returns the rows it found deleted. The executor merges the
//! result into the task's destination bitmap, so calculators never touch
//! shared state.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use nimbus_core::delete_bitmap::DeleteBitmap;
use nimbus_core::id::{RowsetId, SegmentId, TabletId, Version};
use roaring::RoaringBitmap;

use crate::error::Result;

/// Destination bitmap shared by the tasks of one load.
pub type SharedBitmap = Arc<Mutex<DeleteBitmap>>;

/// Creates an empty destination bitmap.
#[must_use]
pub fn shared_bitmap() -> SharedBitmap {
    Arc::new(Mutex::new(DeleteBitmap::new()))
}

/// Copies the current content of a destination bitmap.
#[must_use]
pub fn snapshot(bitmap: &SharedBitmap) -> DeleteBitmap {
    bitmap.lock().unwrap_or_else(PoisonError::into_inner).clone()
}

/// Version carried by marks computed before the load is published.
pub const PENDING_VERSION: Version = Version::new(0);

/// Rewrites segments of the rowset being loaded.
pub trait RowsetWriter: Send + Sync + fmt::Debug {
    /// Called with the rows of `segment` that replaced an older version of
    /// their key; partial-update writers fill the missing columns of those
    /// rows from the replaced rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment cannot be rewritten.
    fn rewrite_segment(&self, segment: SegmentId, replaced_rows: &RoaringBitmap) -> Result<()>;
}

/// Compare one new segment against historical rowsets of its tablet.
#[derive(Debug, Clone)]
pub struct CrossRowsetTask {
    /// Tablet being loaded.
    pub tablet: TabletId,
    /// Rowset being loaded.
    pub rowset: RowsetId,
    /// Segment of `rowset` to compare.
    pub segment: SegmentId,
    /// Historical rowsets whose rows may be superseded.
    pub targets: Vec<RowsetId>,
    /// Highest tablet version the comparison may observe.
    pub end_version: Version,
    /// Where found marks are merged.
    pub bitmap: SharedBitmap,
    /// Writer for inline segment rewriting, when the load needs it.
    pub rowset_writer: Option<Arc<dyn RowsetWriter>>,
    /// Marks already stored for the tablet; rows deleted there are skipped.
    pub tablet_bitmap: Option<Arc<DeleteBitmap>>,
}

/// Compare the sibling segments of one freshly written rowset.
#[derive(Debug, Clone)]
pub struct IntraRowsetTask {
    /// Tablet being loaded.
    pub tablet: TabletId,
    /// Rowset being loaded.
    pub rowset: RowsetId,
    /// Segments of `rowset`, in write order.
    pub segments: Vec<SegmentId>,
    /// Where found marks are merged.
    pub bitmap: SharedBitmap,
}

/// Either kind of task.
#[derive(Debug, Clone)]
pub enum CalcTask {
    /// Cross-rowset comparison.
    Cross(CrossRowsetTask),
    /// Intra-rowset comparison.
    Intra(IntraRowsetTask),
}

impl CalcTask {
    /// Metric and span label.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Cross(_) => "cross_rowset",
            Self::Intra(_) => "intra_rowset",
        }
    }

    /// Tablet the task belongs to.
    #[must_use]
    pub fn tablet(&self) -> TabletId {
        match self {
            Self::Cross(t) => t.tablet,
            Self::Intra(t) => t.tablet,
        }
    }

    /// Rowset being loaded.
    #[must_use]
    pub fn rowset(&self) -> &RowsetId {
        match self {
            Self::Cross(t) => &t.rowset,
            Self::Intra(t) => &t.rowset,
        }
    }

    /// Segment the task is about; the first segment for intra tasks.
    #[must_use]
    pub fn segment(&self) -> SegmentId {
        match self {
            Self::Cross(t) => t.segment,
            Self::Intra(t) => t.segments.first().copied().unwrap_or_default(),
        }
    }

    pub(crate) fn destination(&self) -> &SharedBitmap {
        match self {
            Self::Cross(t) => &t.bitmap,
            Self::Intra(t) => &t.bitmap,
        }
    }

    pub(crate) fn compute(&self, calculator: &dyn DeleteBitmapCalculator) -> Result<DeleteBitmap> {
        match self {
            Self::Cross(t) => calculator.calc_cross(t),
            Self::Intra(t) => calculator.calc_intra(t),
        }
    }
}

/// Computes delete marks.
///
/// Methods are synchronous and may block; the executor runs them on the
/// blocking pool.
pub trait DeleteBitmapCalculator: Send + Sync + 'static {
    /// Marks rows of `task.targets` superseded by rows of the new segment.
    ///
    /// # Errors
    ///
    /// Returns an error if a segment is missing or unreadable.
    fn calc_cross(&self, task: &CrossRowsetTask) -> Result<DeleteBitmap>;

    /// Marks rows of earlier segments superseded by later segments of the
    /// same rowset.
    ///
    /// # Errors
    ///
    /// Returns an error if a segment is missing or unreadable.
    fn calc_intra(&self, task: &IntraRowsetTask) -> Result<DeleteBitmap>;
}
