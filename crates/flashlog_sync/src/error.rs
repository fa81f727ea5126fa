//! Error types for the sync endpoint and service.

use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while syncing with the host.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The transport failed to carry a message.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// A message from the host could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] flashlog_protocol::ProtocolError),

    /// Storage engine or session registry error.
    #[error("engine error: {0}")]
    Core(#[from] flashlog_core::CoreError),

    /// A runtime collaborator could not be started.
    #[error("runtime error: {0}")]
    Runtime(#[from] std::io::Error),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// No host is connected.
    #[error("not connected to host")]
    NotConnected,

    /// Sending is switched off by the host or by the power policy.
    #[error("sending is disabled")]
    SendDisabled,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Core(err) => err.is_retryable(),
            SyncError::NotConnected | SyncError::SendDisabled => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flashlog_core::CoreError;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("link busy").is_retryable());
        assert!(!SyncError::transport_fatal("endpoint closed").is_retryable());
        assert!(SyncError::NotConnected.is_retryable());
        assert!(SyncError::from(CoreError::Busy { session: 3 }).is_retryable());
        assert!(!SyncError::from(CoreError::validation("bad")).is_retryable());
    }

    #[test]
    fn error_display() {
        let err = SyncError::NotConnected;
        assert_eq!(err.to_string(), "not connected to host");

        let err = SyncError::from(flashlog_protocol::ProtocolError::UnknownCommand(0x42));
        assert!(err.to_string().contains("0x42"));
    }
}
