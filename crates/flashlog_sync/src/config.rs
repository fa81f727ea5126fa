//! Configuration for the sync endpoint and service.

use crate::error::{SyncError, SyncResult};
use std::time::Duration;

/// Configuration for host sync.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Endpoint the host routes data logging traffic to.
    pub endpoint_id: u16,
    /// How long the host has to answer `Open` or `Data`.
    pub ack_timeout: Duration,
    /// Nacks tolerated per session before its unread bytes are dropped.
    pub max_nacks: u8,
    /// Period of the background sweep that pushes pending data.
    pub sweep_interval: Duration,
    /// Every n-th sweep sends regardless of `min_send_bytes`.
    pub forced_sweep_every: u32,
    /// Unread bytes a session needs before an unforced send.
    pub min_send_bytes: usize,
    /// Largest payload carried by one `Data` message.
    pub max_payload: usize,
    /// Whether `create` hands back an Active session with the same tag and
    /// owner instead of finishing it.
    pub resume_existing: bool,
    /// Initial value of the host's send-enable switch.
    pub send_enabled: bool,
}

impl SyncConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            endpoint_id: flashlog_protocol::ENDPOINT_ID,
            ack_timeout: Duration::from_secs(30),
            max_nacks: 3,
            sweep_interval: Duration::from_secs(5 * 60),
            forced_sweep_every: 3,
            min_send_bytes: 256,
            max_payload: 512,
            resume_existing: true,
            send_enabled: true,
        }
    }

    /// Sets the ack timeout.
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Sets the nack bound.
    pub fn with_max_nacks(mut self, count: u8) -> Self {
        self.max_nacks = count;
        self
    }

    /// Sets the sweep period.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Sets the minimum batch for unforced sends.
    pub fn with_min_send_bytes(mut self, bytes: usize) -> Self {
        self.min_send_bytes = bytes;
        self
    }

    /// Sets the largest `Data` payload.
    pub fn with_max_payload(mut self, bytes: usize) -> Self {
        self.max_payload = bytes;
        self
    }

    /// Sets whether matching Active sessions are resumed by `create`.
    pub fn with_resume_existing(mut self, resume: bool) -> Self {
        self.resume_existing = resume;
        self
    }

    /// Sets the initial host send-enable switch.
    pub fn with_send_enabled(mut self, enabled: bool) -> Self {
        self.send_enabled = enabled;
        self
    }

    /// Checks the values for consistency. `max_item_size` is the largest
    /// item the engine accepts; one must fit in a `Data` payload.
    pub fn validate(&self, max_item_size: usize) -> SyncResult<()> {
        if self.ack_timeout.is_zero() {
            return Err(SyncError::Config("ack timeout must be non-zero".into()));
        }
        if self.sweep_interval.is_zero() {
            return Err(SyncError::Config("sweep interval must be non-zero".into()));
        }
        if self.forced_sweep_every == 0 {
            return Err(SyncError::Config("forced sweep cadence must be non-zero".into()));
        }
        if self.max_payload < max_item_size {
            return Err(SyncError::Config(format!(
                "max payload {} cannot carry a {max_item_size}-byte item",
                self.max_payload
            )));
        }
        Ok(())
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new()
            .with_ack_timeout(Duration::from_secs(5))
            .with_max_nacks(2)
            .with_min_send_bytes(0)
            .with_max_payload(300);

        assert_eq!(config.endpoint_id, 0x1A7A);
        assert_eq!(config.ack_timeout, Duration::from_secs(5));
        assert_eq!(config.max_nacks, 2);
        assert_eq!(config.forced_sweep_every, 3);
        assert!(config.validate(300).is_ok());
    }

    #[test]
    fn payload_must_fit_an_item() {
        let config = SyncConfig::new().with_max_payload(100);
        assert!(matches!(config.validate(300), Err(SyncError::Config(_))));
    }

    #[test]
    fn zero_durations_are_rejected() {
        assert!(SyncConfig::new()
            .with_ack_timeout(Duration::ZERO)
            .validate(1)
            .is_err());
        assert!(SyncConfig::new()
            .with_sweep_interval(Duration::ZERO)
            .validate(1)
            .is_err());
    }
}
