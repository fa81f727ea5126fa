//! Engine statistics.
//!
//! Counters are shared by the storage engine and the sync endpoint so that a
//! single snapshot describes both flash and host traffic.
//!
//! # Usage
//!
//! ```rust
//! use flashlog_core::EngineStats;
//!
//! let stats = EngineStats::new();
//! let snap = stats.snapshot();
//! assert_eq!(snap.bytes_dropped, 0);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Engine statistics.
///
/// All counters are atomic and monotonically increasing.
#[derive(Debug, Default)]
pub struct EngineStats {
    // Flash counters
    bytes_written: AtomicU64,
    bytes_consumed: AtomicU64,
    bytes_dropped: AtomicU64,
    compactions: AtomicU64,
    storage_faults: AtomicU64,

    // Host counters
    sends: AtomicU64,
    nacks: AtomicU64,
    timeouts: AtomicU64,
}

impl EngineStats {
    /// Creates a new stats instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records payload bytes appended to flash.
    pub fn record_write(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records payload bytes retired after delivery.
    pub fn record_consume(&self, bytes: u64) {
        self.bytes_consumed.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records payload bytes discarded without delivery.
    pub fn record_drop(&self, bytes: u64) {
        self.bytes_dropped.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records one file rewrite.
    pub fn record_compaction(&self) {
        self.compactions.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a contained flash failure.
    pub fn record_storage_fault(&self) {
        self.storage_faults.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a message sent to the host.
    pub fn record_send(&self) {
        self.sends.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a negative acknowledgement.
    pub fn record_nack(&self) {
        self.nacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an acknowledgement timeout.
    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the total payload bytes written.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Returns the total payload bytes dropped.
    pub fn bytes_dropped(&self) -> u64 {
        self.bytes_dropped.load(Ordering::Relaxed)
    }

    /// Returns the number of contained flash failures.
    pub fn storage_faults(&self) -> u64 {
        self.storage_faults.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all stats.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_consumed: self.bytes_consumed.load(Ordering::Relaxed),
            bytes_dropped: self.bytes_dropped.load(Ordering::Relaxed),
            compactions: self.compactions.load(Ordering::Relaxed),
            storage_faults: self.storage_faults.load(Ordering::Relaxed),
            sends: self.sends.load(Ordering::Relaxed),
            nacks: self.nacks.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of engine statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Payload bytes appended to flash.
    pub bytes_written: u64,
    /// Payload bytes retired after delivery.
    pub bytes_consumed: u64,
    /// Payload bytes discarded without delivery.
    pub bytes_dropped: u64,
    /// File rewrites performed.
    pub compactions: u64,
    /// Flash failures contained by deleting a session file.
    pub storage_faults: u64,
    /// Messages sent to the host.
    pub sends: u64,
    /// Negative acknowledgements received.
    pub nacks: u64,
    /// Acknowledgement timeouts.
    pub timeouts: u64,
}
