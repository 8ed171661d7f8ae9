//! Error types and result aliases for nimbus.
//!
//! This module defines the shared error types used across all nimbus components.
//! Errors are structured for programmatic handling and include context for debugging.

use crate::txn_kv::TxnErrorCode;

/// The result type used throughout nimbus.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in nimbus core operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the ID invalid.
        message: String,
    },

    /// A transactional store operation failed.
    #[error("txn kv error: {code} ({context})")]
    Txn {
        /// The store error code.
        code: TxnErrorCode,
        /// What the caller was doing when the store failed.
        context: String,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// A key or record was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a store error carrying the failing operation as context.
    #[must_use]
    pub fn txn(code: TxnErrorCode, context: impl Into<String>) -> Self {
        Self::Txn {
            code,
            context: context.into(),
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Returns the store error code if this error came from the transactional store.
    #[must_use]
    pub fn txn_code(&self) -> Option<TxnErrorCode> {
        match self {
            Self::Txn { code, .. } => Some(*code),
            _ => None,
        }
    }
}
