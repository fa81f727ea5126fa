//! Error types for file store operations.

use std::io;
use thiserror::Error;

/// Result type for file store operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during file store operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No file with the given name exists.
    #[error("file not found: {0}")]
    NotFound(String),

    /// Access outside the allocated size of a file.
    #[error("access out of bounds: offset {offset}, len {len}, size {size}")]
    OutOfBounds {
        /// The requested offset.
        offset: u64,
        /// The requested length.
        len: usize,
        /// The allocated file size.
        size: u64,
    },

    /// The file name is not usable in this store.
    #[error("invalid file name: {0}")]
    InvalidName(String),

    /// Another process holds the store directory.
    #[error("store locked: another process has exclusive access")]
    Locked,
}

impl StorageError {
    /// Returns true if the error means the file does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
