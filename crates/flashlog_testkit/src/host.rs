//! A scripted host for end-to-end service tests.
//!
//! [`ServiceHarness`] runs a [`DataLogService`] on manual collaborators.
//! [`HostSimulator`] plays the host side: it reads what the device sent,
//! keeps the payload it accepted per session and answers according to a
//! [`HostPolicy`].

use flashlog_core::{Clock, ManualScheduler, ManualTimers, OwnerTask, Scheduler, TimerService};
use flashlog_protocol::Message;
use flashlog_storage::FileStore;
use flashlog_sync::{DataLogService, FixedOwner, HostTransport, MockTransport, SyncConfig};
use rand::RngCore;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use uuid::Uuid;

/// Owner used by harness-created sessions.
pub const HARNESS_OWNER: Uuid = Uuid::from_u128(0x0057_A6E0);

/// A service wired to manual collaborators and a mock transport.
pub struct ServiceHarness {
    /// The service.
    pub service: Arc<DataLogService>,
    /// Everything the device sent.
    pub transport: Arc<MockTransport>,
    /// Runs queued jobs on demand.
    pub scheduler: Arc<ManualScheduler>,
    /// Timers and clock.
    pub timers: Arc<ManualTimers>,
}

impl ServiceHarness {
    /// Builds a service over `store`.
    ///
    /// # Panics
    ///
    /// Panics if the service cannot be built.
    pub fn new(store: Arc<dyn FileStore>, config: SyncConfig) -> Self {
        Self::build(store, config, None)
    }

    /// Builds a service that draws session ids from `rng`.
    ///
    /// # Panics
    ///
    /// Panics if the service cannot be built.
    pub fn with_rng(
        store: Arc<dyn FileStore>,
        config: SyncConfig,
        rng: impl RngCore + Send + 'static,
    ) -> Self {
        Self::build(store, config, Some(Box::new(rng)))
    }

    fn build(
        store: Arc<dyn FileStore>,
        config: SyncConfig,
        rng: Option<Box<dyn RngCore + Send>>,
    ) -> Self {
        let transport = Arc::new(MockTransport::new());
        let scheduler = Arc::new(ManualScheduler::new());
        let timers = Arc::new(ManualTimers::default());
        let mut builder =
            DataLogService::builder(store, Arc::clone(&transport) as Arc<dyn HostTransport>)
                .sync_config(config)
                .scheduler(Arc::clone(&scheduler) as Arc<dyn Scheduler>)
                .timers(Arc::clone(&timers) as Arc<dyn TimerService>)
                .clock(Arc::clone(&timers) as Arc<dyn Clock>)
                .owner_resolver(Arc::new(FixedOwner {
                    owner: HARNESS_OWNER,
                    task: OwnerTask::App,
                }));
        if let Some(rng) = rng {
            builder = builder.rng(rng);
        }
        let service = builder.build().expect("Failed to build service");
        Self {
            service,
            transport,
            scheduler,
            timers,
        }
    }

    /// Hands a host message to the service and runs the resulting jobs.
    pub fn deliver(&self, message: &Message) {
        self.service.on_host_message(&message.encode());
        self.settle();
    }

    /// Runs queued jobs until none are left.
    pub fn settle(&self) -> usize {
        self.scheduler.run_until_idle()
    }
}

/// How the simulated host answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPolicy {
    /// Acknowledge everything.
    AckAll,
    /// Reject the first `n` Data messages, then acknowledge.
    NackFirst(u32),
    /// Never answer.
    Silent,
}

/// The host side of the protocol.
#[derive(Debug)]
pub struct HostSimulator {
    policy: HostPolicy,
    nacks_left: u32,
    open: BTreeSet<u8>,
    received: BTreeMap<u8, Vec<u8>>,
    closed: Vec<u8>,
    timeouts: Vec<u8>,
}

/// Upper bound on pump rounds; reaching it means the exchange never settles.
const MAX_ROUNDS: usize = 10_000;

impl HostSimulator {
    /// Creates a host that follows `policy`.
    pub fn new(policy: HostPolicy) -> Self {
        let nacks_left = match policy {
            HostPolicy::NackFirst(n) => n,
            _ => 0,
        };
        Self {
            policy,
            nacks_left,
            open: BTreeSet::new(),
            received: BTreeMap::new(),
            closed: Vec::new(),
            timeouts: Vec::new(),
        }
    }

    /// Answers device messages until the device stops sending. Returns the
    /// number of device messages handled.
    ///
    /// # Panics
    ///
    /// Panics if the exchange does not settle, or a Data message arrives for
    /// a session that was never opened or carries a bad checksum.
    pub fn pump(&mut self, harness: &ServiceHarness) -> usize {
        harness.settle();
        let mut handled = 0;
        for _ in 0..MAX_ROUNDS {
            let sent = harness.transport.take_sent();
            if sent.is_empty() {
                return handled;
            }
            for message in sent {
                handled += 1;
                if let Some(reply) = self.answer(message) {
                    harness.service.on_host_message(&reply.encode());
                }
            }
            harness.settle();
        }
        panic!("host exchange did not settle after {MAX_ROUNDS} rounds");
    }

    fn answer(&mut self, message: Message) -> Option<Message> {
        match message {
            Message::Open(open) => {
                self.open.insert(open.session_id);
                self.reply(open.session_id)
            }
            Message::Data(data) => {
                assert!(
                    self.open.contains(&data.session_id),
                    "data for unopened session {}",
                    data.session_id
                );
                assert!(data.checksum_ok(), "bad checksum from session {}", data.session_id);
                if self.policy == HostPolicy::Silent {
                    return None;
                }
                if self.nacks_left > 0 {
                    self.nacks_left -= 1;
                    return Some(Message::Nack {
                        session_id: data.session_id,
                    });
                }
                self.received
                    .entry(data.session_id)
                    .or_default()
                    .extend_from_slice(&data.payload);
                self.reply(data.session_id)
            }
            Message::Close { session_id } => {
                self.open.remove(&session_id);
                self.closed.push(session_id);
                None
            }
            Message::Timeout { session_id } => {
                self.timeouts.push(session_id);
                None
            }
            _ => None,
        }
    }

    fn reply(&self, session_id: u8) -> Option<Message> {
        match self.policy {
            HostPolicy::Silent => None,
            HostPolicy::AckAll | HostPolicy::NackFirst(_) => Some(Message::Ack { session_id }),
        }
    }

    /// Payload accepted for a session, in delivery order.
    pub fn received(&self, session_id: u8) -> &[u8] {
        self.received.get(&session_id).map_or(&[][..], Vec::as_slice)
    }

    /// Sessions the host believes are open.
    pub fn open_sessions(&self) -> Vec<u8> {
        self.open.iter().copied().collect()
    }

    /// Sessions the device closed, in order.
    pub fn closed(&self) -> &[u8] {
        &self.closed
    }

    /// Sessions the device reported as timed out.
    pub fn timeouts(&self) -> &[u8] {
        &self.timeouts
    }

    /// Sends the host's view of open sessions, as after a reconnect.
    pub fn report(&self, harness: &ServiceHarness) {
        harness.deliver(&Message::Report {
            session_ids: self.open_sessions(),
        });
    }

    /// Forgets everything, as a host that restarted.
    pub fn restart(&mut self) {
        self.open.clear();
        self.received.clear();
        self.closed.clear();
        self.timeouts.clear();
    }
}
