//! Engine configuration.

use crate::error::{CoreError, CoreResult};
use crate::storage::format::HEADER_SIZE;

/// Configuration for the storage engine and session registry.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Total bytes all session files together may occupy.
    pub quota_bytes: u64,

    /// Size of a freshly created session file.
    pub initial_file_size: u64,

    /// Smallest free space a grown or compacted file keeps.
    pub min_free_bytes: u64,

    /// Largest free space a grown file is given.
    pub max_free_bytes: u64,

    /// Maximum number of live sessions.
    pub max_sessions: usize,

    /// Largest byte array item for buffered sessions.
    pub max_buffered_item_size: u16,

    /// Largest byte array item for unbuffered sessions.
    pub max_unbuffered_item_size: u16,

    /// Capacity of an engine-allocated staging buffer.
    pub engine_buffer_size: usize,

    /// Random draws tried before id allocation is declared broken.
    pub id_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            quota_bytes: 256 * 1024,
            initial_file_size: 4096,
            min_free_bytes: 256,
            max_free_bytes: 4096,
            max_sessions: 20,
            max_buffered_item_size: 300,
            max_unbuffered_item_size: 256,
            engine_buffer_size: 640,
            id_attempts: 256,
        }
    }
}

impl EngineConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the global byte quota.
    #[must_use]
    pub const fn quota_bytes(mut self, bytes: u64) -> Self {
        self.quota_bytes = bytes;
        self
    }

    /// Sets the size of new session files.
    #[must_use]
    pub const fn initial_file_size(mut self, bytes: u64) -> Self {
        self.initial_file_size = bytes;
        self
    }

    /// Sets the free-space band for grown and compacted files.
    #[must_use]
    pub const fn free_band(mut self, min: u64, max: u64) -> Self {
        self.min_free_bytes = min;
        self.max_free_bytes = max;
        self
    }

    /// Sets the maximum number of live sessions.
    #[must_use]
    pub const fn max_sessions(mut self, count: usize) -> Self {
        self.max_sessions = count;
        self
    }

    /// Sets the capacity of engine-allocated staging buffers.
    #[must_use]
    pub const fn engine_buffer_size(mut self, bytes: usize) -> Self {
        self.engine_buffer_size = bytes;
        self
    }

    /// Checks the values for consistency.
    pub fn validate(&self) -> CoreResult<()> {
        if self.initial_file_size <= HEADER_SIZE as u64 {
            return Err(CoreError::validation(format!(
                "initial file size {} leaves no room after the {HEADER_SIZE}-byte header",
                self.initial_file_size
            )));
        }
        if self.quota_bytes < self.initial_file_size {
            return Err(CoreError::validation(
                "quota is smaller than one session file",
            ));
        }
        if self.min_free_bytes > self.max_free_bytes {
            return Err(CoreError::validation(
                "minimum free band exceeds maximum free band",
            ));
        }
        if self.max_sessions == 0 || self.max_sessions > usize::from(u8::MAX) {
            return Err(CoreError::validation(format!(
                "max sessions must be 1..=255, got {}",
                self.max_sessions
            )));
        }
        if self.engine_buffer_size < usize::from(self.max_buffered_item_size) {
            return Err(CoreError::validation(
                "engine buffer cannot hold the largest buffered item",
            ));
        }
        if self.id_attempts == 0 {
            return Err(CoreError::validation("id attempts must be non-zero"));
        }
        Ok(())
    }
}
