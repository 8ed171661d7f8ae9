//! # nimbus-core
//!
//! Shared primitives for the nimbus meta service and its workers.
//!
//! - **Identifiers**: typed ids for instances, tables, tablets, rowsets and segments
//! - **Transactional KV**: the store contract every handler runs against, plus an
//!   in-memory optimistic implementation
//! - **Keys**: the byte layout of lock, bitmap and stats records
//! - **Delete bitmaps**: roaring-backed per-segment deletion markers
//! - **Observability**: logging initialisation and span helpers
//!
//! ## Example
//!
//! ```rust
//! use nimbus_core::prelude::*;
//!
//! let instance = InstanceId::new("warehouse-1").unwrap();
//! let key = DeleteBitmapLockKey::tablet(&instance, TableId::new(1), TabletId::new(2));
//! assert!(key.as_ref().contains("/v2/"));
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod clock;
pub mod delete_bitmap;
pub mod env;
pub mod error;
pub mod id;
pub mod keys;
pub mod observability;
pub mod txn_kv;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::clock::{Clock, SystemClock};
    pub use crate::delete_bitmap::{BitmapKey, DeleteBitmap};
    pub use crate::error::{Error, Result};
    pub use crate::id::{InstanceId, RowsetId, SegmentId, TableId, TabletId, Version};
    pub use crate::keys::{DeleteBitmapKey, DeleteBitmapLockKey, StorageKey, TabletStatsKey};
    pub use crate::txn_kv::{KvStats, MemoryTxnKv, Transaction, TxnErrorCode, TxnKv, TxnResult};
}

pub use error::{Error, Result};
