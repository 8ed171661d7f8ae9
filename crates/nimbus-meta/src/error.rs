//! Status codes and errors for the meta service.
//!
//! Handlers never surface faults: every failure becomes a [`MetaStatus`]
//! carried on the response. [`MetaError`] is the internal error type and
//! maps one-to-one onto a [`MetaServiceCode`].
//!
//! ## Taxonomy
//!
//! | Category | Codes | Retried by the wrapper |
//! |----------|-------|------------------------|
//! | Store transient | `KV_TXN_CONFLICT`, `KV_TXN_TOO_OLD`, `KV_TXN_STORE_*_RETRYABLE` | yes |
//! | Lock busy | `LOCK_CONFLICT` | no, callers retry at the application layer |
//! | Malformed request | `INVALID_ARGUMENT`, `PROTOCOL_VERSION_MISMATCH` | no |
//! | Retry exhaustion | `KV_TXN_*_ERR`, `KV_TXN_CONFLICT_RETRY_EXCEEDED_MAX_TIMES` | no |

use std::fmt;

use nimbus_core::txn_kv::TxnErrorCode;
use serde::{Deserialize, Serialize};

/// Result type for meta-service internals.
pub type Result<T> = std::result::Result<T, MetaError>;

/// Status code returned on every meta-service response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetaServiceCode {
    /// Success.
    #[default]
    Ok,
    /// The request is malformed.
    InvalidArgument,
    /// The request's lock protocol version disagrees with the instance routing.
    ProtocolVersionMismatch,
    /// An incompatible holder owns the lock scope.
    LockConflict,
    /// The caller no longer holds the lock it claims.
    LockExpired,
    /// A requested record does not exist.
    NotFound,
    /// Optimistic store conflict.
    KvTxnConflict,
    /// The store transaction outlived its validity window.
    KvTxnTooOld,
    /// Transient read failure.
    KvTxnStoreGetRetryable,
    /// Transient commit failure.
    KvTxnStoreCommitRetryable,
    /// Transient failure creating a transaction.
    KvTxnStoreCreateRetryable,
    /// Read failures persisted past the retry budget.
    KvTxnGetErr,
    /// Commit failures persisted past the retry budget.
    KvTxnCommitErr,
    /// Transaction creation failures persisted past the retry budget.
    KvTxnCreateErr,
    /// Conflicts persisted past the retry budget.
    KvTxnConflictRetryExceededMaxTimes,
    /// Unexpected failure.
    InternalError,
}

impl MetaServiceCode {
    /// Returns the wire name of the code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::ProtocolVersionMismatch => "PROTOCOL_VERSION_MISMATCH",
            Self::LockConflict => "LOCK_CONFLICT",
            Self::LockExpired => "LOCK_EXPIRED",
            Self::NotFound => "NOT_FOUND",
            Self::KvTxnConflict => "KV_TXN_CONFLICT",
            Self::KvTxnTooOld => "KV_TXN_TOO_OLD",
            Self::KvTxnStoreGetRetryable => "KV_TXN_STORE_GET_RETRYABLE",
            Self::KvTxnStoreCommitRetryable => "KV_TXN_STORE_COMMIT_RETRYABLE",
            Self::KvTxnStoreCreateRetryable => "KV_TXN_STORE_CREATE_RETRYABLE",
            Self::KvTxnGetErr => "KV_TXN_GET_ERR",
            Self::KvTxnCommitErr => "KV_TXN_COMMIT_ERR",
            Self::KvTxnCreateErr => "KV_TXN_CREATE_ERR",
            Self::KvTxnConflictRetryExceededMaxTimes => "KV_TXN_CONFLICT_RETRY_EXCEEDED_MAX_TIMES",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Returns true for codes the store reports transiently.
    #[must_use]
    pub const fn is_store_transient(self) -> bool {
        matches!(
            self,
            Self::KvTxnConflict
                | Self::KvTxnTooOld
                | Self::KvTxnStoreGetRetryable
                | Self::KvTxnStoreCommitRetryable
                | Self::KvTxnStoreCreateRetryable
        )
    }

    /// Terminal code reported once a transient code exhausts its retry budget.
    ///
    /// Non-transient codes map to themselves.
    #[must_use]
    pub const fn exhausted(self) -> Self {
        match self {
            Self::KvTxnStoreGetRetryable => Self::KvTxnGetErr,
            Self::KvTxnStoreCommitRetryable => Self::KvTxnCommitErr,
            Self::KvTxnStoreCreateRetryable => Self::KvTxnCreateErr,
            Self::KvTxnConflict => Self::KvTxnConflictRetryExceededMaxTimes,
            other => other,
        }
    }
}

impl fmt::Display for MetaServiceCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<TxnErrorCode> for MetaServiceCode {
    fn from(code: TxnErrorCode) -> Self {
        match code {
            TxnErrorCode::Conflict => Self::KvTxnConflict,
            TxnErrorCode::TooOld => Self::KvTxnTooOld,
            TxnErrorCode::RetryableGet => Self::KvTxnStoreGetRetryable,
            TxnErrorCode::RetryableCommit => Self::KvTxnStoreCommitRetryable,
            TxnErrorCode::RetryableCreate => Self::KvTxnStoreCreateRetryable,
            TxnErrorCode::Other => Self::InternalError,
        }
    }
}

/// Code plus human-readable message, carried on every response.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MetaStatus {
    /// Outcome code.
    pub code: MetaServiceCode,
    /// Detail for non-OK codes; empty on success.
    pub msg: String,
}

impl MetaStatus {
    /// Successful status.
    #[must_use]
    pub fn ok() -> Self {
        Self::default()
    }

    /// Status with the given code and message.
    #[must_use]
    pub fn new(code: MetaServiceCode, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
        }
    }

    /// Returns true when the code is `OK`.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.code == MetaServiceCode::Ok
    }
}

impl From<&MetaError> for MetaStatus {
    fn from(err: &MetaError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

/// Errors raised inside meta-service handlers.
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    /// The request is malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The caller's lock protocol version disagrees with the routing.
    #[error("lock version mismatch: {message}")]
    VersionMismatch {
        /// Expected and requested versions.
        message: String,
    },

    /// An incompatible holder owns the lock scope.
    #[error("lock is busy: {message}")]
    LockBusy {
        /// Who holds the lock and until when.
        message: String,
    },

    /// The caller does not hold the lock it claims.
    #[error("lock expired: {message}")]
    LockExpired {
        /// What was found in place of the caller's lock.
        message: String,
    },

    /// A requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The transactional store failed.
    #[error("{context}: {code}")]
    Store {
        /// Store error code.
        code: TxnErrorCode,
        /// Operation that failed.
        context: String,
    },

    /// A stored record could not be encoded or decoded.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the failure.
        message: String,
    },

    /// Unexpected failure.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the failure.
        message: String,
    },
}

impl MetaError {
    /// Creates a store error with the failing operation as context.
    #[must_use]
    pub fn store(code: TxnErrorCode, context: impl Into<String>) -> Self {
        Self::Store {
            code,
            context: context.into(),
        }
    }

    /// Creates a lock-busy error.
    #[must_use]
    pub fn lock_busy(message: impl Into<String>) -> Self {
        Self::LockBusy {
            message: message.into(),
        }
    }

    /// Creates a lock-expired error.
    #[must_use]
    pub fn lock_expired(message: impl Into<String>) -> Self {
        Self::LockExpired {
            message: message.into(),
        }
    }

    /// Status code for this error.
    #[must_use]
    pub fn code(&self) -> MetaServiceCode {
        match self {
            Self::InvalidArgument(_) => MetaServiceCode::InvalidArgument,
            Self::VersionMismatch { .. } => MetaServiceCode::ProtocolVersionMismatch,
            Self::LockBusy { .. } => MetaServiceCode::LockConflict,
            Self::LockExpired { .. } => MetaServiceCode::LockExpired,
            Self::NotFound(_) => MetaServiceCode::NotFound,
            Self::Store { code, .. } => MetaServiceCode::from(*code),
            Self::Serialization { .. } | Self::Internal { .. } => MetaServiceCode::InternalError,
        }
    }
}

impl From<nimbus_core::Error> for MetaError {
    fn from(err: nimbus_core::Error) -> Self {
        use nimbus_core::Error as CoreError;
        match err {
            CoreError::InvalidId { message } => Self::InvalidArgument(message),
            CoreError::InvalidInput(message) => Self::InvalidArgument(message),
            CoreError::Txn { code, context } => Self::Store { code, context },
            CoreError::Serialization { message } => Self::Serialization { message },
            CoreError::NotFound(what) => Self::NotFound(what),
            CoreError::Internal { message } => Self::Internal { message },
        }
    }
}

impl From<serde_json::Error> for MetaError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}
