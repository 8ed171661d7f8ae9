//! Error types for worker-side delete bitmap calculation.

/// Result type for worker operations.
pub type Result<T> = std::result::Result<T, CalcError>;

/// Failure of a calculation task or of the executor itself.
///
/// Errors are `Clone` because a token's first failure is both kept as its
/// terminal status and handed to the failing task's completion handle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CalcError {
    /// A rowset the task compares against is unknown.
    #[error("rowset not found: tablet {tablet} rowset {rowset}")]
    RowsetNotFound {
        /// Tablet id.
        tablet: i64,
        /// Rowset id.
        rowset: String,
    },

    /// A segment the task needs could not be found.
    #[error("segment not found: tablet {tablet} rowset {rowset} segment {segment}")]
    SegmentNotFound {
        /// Tablet id.
        tablet: i64,
        /// Rowset id.
        rowset: String,
        /// Segment id.
        segment: u32,
    },

    /// A segment's primary-key index is unreadable.
    #[error("corrupt key index: tablet {tablet} rowset {rowset} segment {segment}: {message}")]
    Corrupt {
        /// Tablet id.
        tablet: i64,
        /// Rowset id.
        rowset: String,
        /// Segment id.
        segment: u32,
        /// Description of the corruption.
        message: String,
    },

    /// The token was cancelled before the task ran.
    #[error("delete bitmap calculation cancelled")]
    Cancelled,

    /// The executor no longer accepts work.
    #[error("delete bitmap calculation executor is shut down")]
    ShutDown,

    /// Waiting for senders to close timed out.
    #[error("timed out after {waited_ms}ms waiting for {pending} senders to close")]
    CloseTimeout {
        /// Senders still open.
        pending: usize,
        /// Time waited.
        waited_ms: u64,
    },

    /// A sender id the barrier was not created with.
    #[error("unknown sender {sender}")]
    UnknownSender {
        /// Offending sender id.
        sender: i64,
    },

    /// Invalid worker configuration.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the problem.
        message: String,
    },

    /// Task panicked or the runtime failed.
    #[error("runtime error: {message}")]
    Runtime {
        /// Description of the failure.
        message: String,
    },
}

impl CalcError {
    /// Creates a runtime error.
    #[must_use]
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
        }
    }
}

impl From<nimbus_core::Error> for CalcError {
    fn from(err: nimbus_core::Error) -> Self {
        Self::Config {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offending_segment() {
        let err = CalcError::SegmentNotFound {
            tablet: 20_001,
            rowset: "rs_9".into(),
            segment: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains("20001"));
        assert!(msg.contains("rs_9"));
        assert!(msg.contains("segment 2"));
    }
}
