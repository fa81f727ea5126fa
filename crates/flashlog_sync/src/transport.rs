//! Transport layer abstraction for the host link.

use crate::error::{SyncError, SyncResult};
use bytes::Bytes;
use flashlog_protocol::Message;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Carries encoded messages to the host.
///
/// Inbound traffic does not go through this trait; whoever owns the link
/// hands received bytes to the service.
pub trait HostTransport: Send + Sync {
    /// Returns true while a host is connected.
    fn is_connected(&self) -> bool;

    /// Sends one encoded message to `endpoint`.
    fn send(&self, endpoint: u16, payload: Bytes) -> SyncResult<()>;
}

/// A mock transport for testing. Records every message it is asked to send.
#[derive(Debug)]
pub struct MockTransport {
    connected: AtomicBool,
    sent: Mutex<Vec<(u16, Bytes)>>,
    failures: Mutex<Vec<SyncError>>,
}

impl MockTransport {
    /// Creates a connected mock transport.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
        }
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Makes the next send fail with `error`.
    pub fn fail_next_send(&self, error: SyncError) {
        self.failures.lock().push(error);
    }

    /// Returns every message sent so far, decoded.
    pub fn sent(&self) -> Vec<Message> {
        self.sent
            .lock()
            .iter()
            .filter_map(|(_, bytes)| Message::decode(bytes).ok())
            .collect()
    }

    /// Returns and forgets every message sent so far, decoded.
    pub fn take_sent(&self) -> Vec<Message> {
        std::mem::take(&mut *self.sent.lock())
            .into_iter()
            .filter_map(|(_, bytes)| Message::decode(&bytes).ok())
            .collect()
    }

    /// Returns the endpoints of every send so far.
    pub fn endpoints(&self) -> Vec<u16> {
        self.sent.lock().iter().map(|(endpoint, _)| *endpoint).collect()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HostTransport for MockTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send(&self, endpoint: u16, payload: Bytes) -> SyncResult<()> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        if let Some(error) = self.failures.lock().pop() {
            return Err(error);
        }
        self.sent.lock().push((endpoint, payload));
        Ok(())
    }
}
