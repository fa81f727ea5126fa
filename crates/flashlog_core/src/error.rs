//! Error types for the flashlog engine.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in flashlog core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// File store error.
    #[error("storage error: {0}")]
    Storage(#[from] flashlog_storage::StorageError),

    /// A caller supplied an invalid argument. Nothing was changed.
    #[error("validation failed: {message}")]
    Validation {
        /// Description of the rejected input.
        message: String,
    },

    /// A session or byte quota is used up.
    #[error("resource exhausted: {message}")]
    ResourceExhausted {
        /// Which resource ran out.
        message: String,
    },

    /// Flash I/O failed for a session.
    ///
    /// The live engine contains these itself; only maintenance paths such as
    /// rebuild surface them.
    #[error("storage fault in session {session}: {message}")]
    StorageFault {
        /// Affected session id.
        session: u8,
        /// Description of the fault.
        message: String,
    },

    /// The session cannot take this operation right now. Retry later.
    #[error("session {session} is busy")]
    Busy {
        /// Affected session id.
        session: u8,
    },

    /// The session is no longer active.
    #[error("session {session} is closed")]
    SessionClosed {
        /// Affected session id.
        session: u8,
    },

    /// No live session matches the handle.
    #[error("unknown session {session}")]
    UnknownSession {
        /// Requested session id.
        session: u8,
    },

    /// A comm state machine received an event that is illegal in its phase.
    #[error("invalid transition: {event} while {phase}")]
    InvalidStateTransition {
        /// Phase the machine was in.
        phase: &'static str,
        /// Rejected event.
        event: &'static str,
    },

    /// On-flash data does not follow the log format.
    #[error("corrupted log: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch detected.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },
}

impl CoreError {
    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a resource exhausted error.
    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            message: message.into(),
        }
    }

    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }

    /// Creates a storage fault error.
    pub fn storage_fault(session: u8, message: impl Into<String>) -> Self {
        Self::StorageFault {
            session,
            message: message.into(),
        }
    }

    /// Returns true if the caller may retry the same call later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }

    /// Returns true for input validation failures.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }
}
