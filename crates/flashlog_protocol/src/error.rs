//! Error types for wire decoding.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while decoding a message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The buffer was empty.
    #[error("empty message")]
    Empty,

    /// The command byte is not part of the protocol.
    #[error("unknown command 0x{0:02x}")]
    UnknownCommand(u8),

    /// The body is shorter than the command requires.
    #[error("truncated {command} message: need {needed} bytes, got {actual}")]
    Truncated {
        /// Command name.
        command: &'static str,
        /// Minimum body length.
        needed: usize,
        /// Actual body length.
        actual: usize,
    },

    /// The body is longer than the command allows.
    #[error("trailing bytes after {command} message: {extra}")]
    TrailingBytes {
        /// Command name.
        command: &'static str,
        /// Number of unexpected bytes.
        extra: usize,
    },

    /// A field holds a value outside its domain.
    #[error("invalid {field}: {value}")]
    InvalidField {
        /// Field name.
        field: &'static str,
        /// Offending value.
        value: u32,
    },
}
