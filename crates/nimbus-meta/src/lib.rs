//! # nimbus-meta
//!
//! Concurrency control of the meta service for merge-on-write delete bitmaps.
//!
//! - **Update lock**: mutual exclusion between loads, compactions and schema
//!   changes, kept as records in the transactional store (v1 per table, v2
//!   per tablet)
//! - **Handlers**: one store transaction per invocation, every failure
//!   reported as a [`MetaStatus`]
//! - **Retry wrapper**: transparent retry of transient store failures with
//!   exponential backoff and distinct exhaustion codes
//! - **Idempotent replay**: optional detached replay of successful requests
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use nimbus_core::prelude::*;
//! use nimbus_meta::prelude::*;
//!
//! let service = MetaServiceImpl::new(
//!     Arc::new(MemoryTxnKv::new()),
//!     Arc::new(SystemClock),
//!     MetaServiceConfig::from_env()?,
//!     Arc::new(MetaServiceMetrics::new()),
//! )?;
//! let proxy = MetaServiceProxy::new(Arc::new(service));
//!
//! let resp = proxy
//!     .get_delete_bitmap_update_lock(&GetDeleteBitmapUpdateLockRequest {
//!         instance_id: "warehouse-1".into(),
//!         table_id: 10001,
//!         lock_id: COMPACTION_LOCK_ID,
//!         initiator: 7,
//!         ..Default::default()
//!     })
//!     .await;
//! assert!(resp.status.is_ok());
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod proxy;
pub mod replay;
pub mod retry;
pub mod rpc;
pub mod service;

pub use config::MetaServiceConfig;
pub use error::{MetaError, MetaServiceCode, MetaStatus, Result};
pub use proxy::MetaServiceProxy;
pub use service::MetaServiceImpl;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{LockConfig, MetaServiceConfig, ReplayConfig, RetryConfig};
    pub use crate::error::{MetaError, MetaServiceCode, MetaStatus};
    pub use crate::lock::{
        COMPACTION_LOCK_ID, LOCK_FREE_COMPACTION_LOCK_ID, LockKind, LockScope, LockVersion,
        SCHEMA_CHANGE_LOCK_ID,
    };
    pub use crate::metrics::{MetaMetricsSnapshot, MetaServiceMetrics};
    pub use crate::proxy::MetaServiceProxy;
    pub use crate::replay::IdempotentReplayInjector;
    pub use crate::retry::{Jitter, RetryPolicy, Sleeper, TokioSleeper, call_with_policy};
    pub use crate::rpc::*;
    pub use crate::service::MetaServiceImpl;
}
