//! # nimbus-worker
//!
//! Worker-side delete bitmap calculation for merge-on-write tables.
//!
//! - **Executor**: a fixed pool of calculation slots shared by every load
//! - **Tokens**: one lane per load, capping its share of the pool and
//!   keeping the first task failure as the load's terminal status
//! - **Calculators**: the seam that actually compares primary keys
//! - **Close barrier**: lets a closing sender wait for its peers
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use nimbus_worker::prelude::*;
//!
//! let keys = Arc::new(MemoryKeyIndex::new());
//! let executor = CalcDeleteBitmapExecutor::new(
//!     WorkerConfig::from_env()?,
//!     Arc::new(PrimaryKeyCalculator::new(keys)),
//!     Arc::new(WorkerMetrics::new()),
//! )?;
//!
//! let token = executor.create_token()?;
//! token.submit_cross(task)?;
//! token.wait().await?;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod calc_executor;
pub mod calculator;
pub mod close_wait;
pub mod config;
pub mod error;
pub mod key_index;
pub mod metrics;

pub use calc_executor::{CalcDeleteBitmapExecutor, CalcDeleteBitmapToken};
pub use config::WorkerConfig;
pub use error::{CalcError, Result};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::calc_executor::{
        CalcDeleteBitmapExecutor, CalcDeleteBitmapToken, CompletionHandle, TaskOutcome,
    };
    pub use crate::calculator::{
        CalcTask, CrossRowsetTask, DeleteBitmapCalculator, IntraRowsetTask, PENDING_VERSION,
        RowsetWriter, SharedBitmap, shared_bitmap, snapshot,
    };
    pub use crate::close_wait::SenderCloseBarrier;
    pub use crate::config::WorkerConfig;
    pub use crate::error::{CalcError, Result};
    pub use crate::key_index::{MemoryKeyIndex, PrimaryKeyCalculator, SegmentKeyProvider};
    pub use crate::metrics::{WorkerMetrics, WorkerMetricsSnapshot};
}
