//! Request and response types of the delete-bitmap RPCs.
//!
//! Fields carry raw wire values (strings and integers); handlers validate
//! them into typed ids. Every response carries a [`MetaStatus`].

use std::fmt;

use nimbus_core::delete_bitmap::DeleteBitmap;
use serde::{Deserialize, Serialize};

use crate::error::MetaStatus;
use crate::lock::LockVersion;

/// A request accepted by the meta service.
pub trait MetaRequest: Clone + Send + Sync + fmt::Debug + 'static {
    /// RPC name, used for logging, metrics and the replay exclusion list.
    const NAME: &'static str;

    /// Instance the request targets.
    fn instance_id(&self) -> &str;
}

/// A response produced by the meta service.
///
/// `Default` is the cleared state each attempt starts from.
pub trait MetaResponse: Default + Send + fmt::Debug + 'static {
    /// Outcome of the call.
    fn status(&self) -> &MetaStatus;

    /// Mutable outcome, for the retry wrapper's terminal code mapping.
    fn status_mut(&mut self) -> &mut MetaStatus;
}

macro_rules! impl_meta_response {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl MetaResponse for $ty {
                fn status(&self) -> &MetaStatus {
                    &self.status
                }

                fn status_mut(&mut self) -> &mut MetaStatus {
                    &mut self.status
                }
            }
        )+
    };
}

// ============================================================================
// Update lock
// ============================================================================

/// Acquire (or join, or refresh) the delete-bitmap update lock.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GetDeleteBitmapUpdateLockRequest {
    /// Target instance.
    pub instance_id: String,
    /// Table whose bitmaps will be updated.
    pub table_id: i64,
    /// Tablets touched; required under v2, used for stats under both versions.
    pub tablet_ids: Vec<i64>,
    /// `-1` compaction, `-2` schema change, or a load txn id.
    pub lock_id: i64,
    /// Participant id within the holder.
    pub initiator: i64,
    /// Lease length; the configured default applies when absent.
    pub expiration_secs: Option<u64>,
    /// Protocol version the caller believes its instance uses.
    pub lock_version: Option<LockVersion>,
    /// Return the stats of `tablet_ids` along with the lock.
    pub require_tablet_stats: bool,
}

impl MetaRequest for GetDeleteBitmapUpdateLockRequest {
    const NAME: &'static str = "get_delete_bitmap_update_lock";

    fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

/// Delete-bitmap statistics of one tablet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TabletStats {
    /// Tablet id.
    pub tablet_id: i64,
    /// Stored bitmap entries.
    pub delete_bitmap_entries: u64,
    /// Rows marked across the stored entries.
    pub deleted_rows: u64,
}

/// Response to [`GetDeleteBitmapUpdateLockRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GetDeleteBitmapUpdateLockResponse {
    /// Outcome.
    pub status: MetaStatus,
    /// Stats of the requested tablets, when asked for.
    pub tablet_stats: Vec<TabletStats>,
}

/// Release the delete-bitmap update lock.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RemoveDeleteBitmapUpdateLockRequest {
    /// Target instance.
    pub instance_id: String,
    /// Table of the lock.
    pub table_id: i64,
    /// Tablets of the lock; required under v2.
    pub tablet_ids: Vec<i64>,
    /// Lock id used to acquire.
    pub lock_id: i64,
    /// Participant id used to acquire.
    pub initiator: i64,
    /// Protocol version the caller believes its instance uses.
    pub lock_version: Option<LockVersion>,
}

impl MetaRequest for RemoveDeleteBitmapUpdateLockRequest {
    const NAME: &'static str = "remove_delete_bitmap_update_lock";

    fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

/// Response to [`RemoveDeleteBitmapUpdateLockRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RemoveDeleteBitmapUpdateLockResponse {
    /// Outcome.
    pub status: MetaStatus,
}

// ============================================================================
// Delete bitmaps
// ============================================================================

/// Write delete-bitmap entries of one tablet under the update lock.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpdateDeleteBitmapRequest {
    /// Target instance.
    pub instance_id: String,
    /// Table of the tablet.
    pub table_id: i64,
    /// Tablet whose bitmaps are written.
    pub tablet_id: i64,
    /// Lock id the caller holds; `-3` skips the ownership check.
    pub lock_id: i64,
    /// Participant id the caller holds the lock under.
    pub initiator: i64,
    /// Entries to store; each replaces any stored entry with the same key.
    pub bitmap: DeleteBitmap,
}

impl MetaRequest for UpdateDeleteBitmapRequest {
    const NAME: &'static str = "update_delete_bitmap";

    fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

/// Response to [`UpdateDeleteBitmapRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UpdateDeleteBitmapResponse {
    /// Outcome.
    pub status: MetaStatus,
}

/// Read delete-bitmap entries of some rowsets within a version range.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GetDeleteBitmapRequest {
    /// Target instance.
    pub instance_id: String,
    /// Tablet to read.
    pub tablet_id: i64,
    /// Rowsets to read.
    pub rowset_ids: Vec<String>,
    /// Inclusive lower version bound.
    pub begin_version: i64,
    /// Inclusive upper version bound.
    pub end_version: i64,
}

impl MetaRequest for GetDeleteBitmapRequest {
    const NAME: &'static str = "get_delete_bitmap";

    fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

/// Response to [`GetDeleteBitmapRequest`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GetDeleteBitmapResponse {
    /// Outcome.
    pub status: MetaStatus,
    /// Matching entries.
    pub bitmap: DeleteBitmap,
}

/// Drop every stored entry of some rowsets.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RemoveDeleteBitmapRequest {
    /// Target instance.
    pub instance_id: String,
    /// Table of the tablet.
    pub table_id: i64,
    /// Tablet to clean.
    pub tablet_id: i64,
    /// Rowsets whose entries are removed.
    pub rowset_ids: Vec<String>,
}

impl MetaRequest for RemoveDeleteBitmapRequest {
    const NAME: &'static str = "remove_delete_bitmap";

    fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

/// Response to [`RemoveDeleteBitmapRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RemoveDeleteBitmapResponse {
    /// Outcome.
    pub status: MetaStatus,
}

impl_meta_response!(
    GetDeleteBitmapUpdateLockResponse,
    RemoveDeleteBitmapUpdateLockResponse,
    UpdateDeleteBitmapResponse,
    GetDeleteBitmapResponse,
    RemoveDeleteBitmapResponse,
);
