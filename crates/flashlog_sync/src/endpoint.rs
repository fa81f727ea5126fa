//! The host-facing side of the data logging service.
//!
//! ## Protocol
//!
//! ```text
//! device                         host
//!   | Open(session, owner, ...)    |
//!   |----------------------------->|
//!   |                    Ack/Nack  |
//!   |<-----------------------------|
//!   | Data(session, crc, payload)  |
//!   |----------------------------->|
//!   |                    Ack/Nack  |
//!   |<-----------------------------|
//!   | Close(session)               |
//!   |----------------------------->|
//! ```
//!
//! Each session has at most one message awaiting an answer. One timer is
//! kept armed for the earliest answer deadline across all sessions; when it
//! fires, every overdue session is timed out and the host is told.
//!
//! Every method here expects to run on the service's serial worker, so an
//! answer from the host and the deadline check never interleave.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::reconcile::{ReopenQueue, Step, Ticket};
use crate::transport::HostTransport;
use bytes::Bytes;
use flashlog_core::{
    Clock, CommEvent, CommOutcome, EngineStats, ItemKind, Scheduler, Session, SessionId,
    SessionMeta, SessionRegistry, TimerId, TimerService,
};
use flashlog_protocol::{ItemKindCode, Message, OpenSession, SendData};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, trace, warn};

/// What a send attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// `Open` went out.
    Opened,
    /// `Data` went out.
    Data {
        /// Payload bytes sent.
        bytes: usize,
    },
    /// A message is already awaiting an answer.
    Busy,
    /// Nothing worth sending.
    Nothing,
    /// The session was finished and fully delivered, so it was deleted.
    Deleted,
}

/// Per-session host protocol driver.
pub struct SyncEndpoint {
    me: Weak<SyncEndpoint>,
    registry: Arc<SessionRegistry>,
    transport: Arc<dyn HostTransport>,
    scheduler: Arc<dyn Scheduler>,
    timers: Arc<dyn TimerService>,
    clock: Arc<dyn Clock>,
    stats: Arc<EngineStats>,
    config: SyncConfig,
    ack_timer: TimerId,
    reopen: Mutex<ReopenQueue>,
    host_enabled: AtomicBool,
    run_enabled: AtomicBool,
}

impl SyncEndpoint {
    /// Creates an endpoint and its answer deadline timer.
    pub fn new(
        registry: Arc<SessionRegistry>,
        transport: Arc<dyn HostTransport>,
        scheduler: Arc<dyn Scheduler>,
        timers: Arc<dyn TimerService>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Arc<Self> {
        let stats = Arc::clone(registry.engine().stats());
        Arc::new_cyclic(|me: &Weak<Self>| {
            let weak = me.clone();
            let job_scheduler = Arc::clone(&scheduler);
            let ack_timer = timers.create(Arc::new(move || {
                let weak = weak.clone();
                job_scheduler.submit(Box::new(move || {
                    if let Some(endpoint) = weak.upgrade() {
                        endpoint.check_deadlines();
                    }
                }));
            }));
            Self {
                me: me.clone(),
                host_enabled: AtomicBool::new(config.send_enabled),
                run_enabled: AtomicBool::new(true),
                registry,
                transport,
                scheduler,
                timers,
                clock,
                stats,
                config,
                ack_timer,
                reopen: Mutex::new(ReopenQueue::default()),
            }
        })
    }

    /// Returns the endpoint configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Returns true if both the host and the power policy allow sending.
    pub fn send_enabled(&self) -> bool {
        self.host_enabled.load(Ordering::SeqCst) && self.run_enabled.load(Ordering::SeqCst)
    }

    /// Sets the power/run-level send switch. Logging is never gated.
    pub fn set_run_enabled(&self, enabled: bool) {
        self.run_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Returns true while a reopen run is in progress.
    pub fn is_reconciling(&self) -> bool {
        self.reopen.lock().is_running()
    }

    /// Sends the next message a session needs, if any.
    ///
    /// A session the host has not opened gets `Open` first. Otherwise unread
    /// bytes go out as `Data` once there are at least `min_send_bytes` of
    /// them, or any amount if `force` is set or a forced drain is underway.
    /// A forced request that finds the session busy or unopened is carried
    /// over to the sends that follow the host's answer.
    ///
    /// A finished session with nothing left to deliver is deleted instead,
    /// whether or not the link is up; the host gets `Close` if it had opened
    /// the session.
    ///
    /// # Errors
    ///
    /// - [`SyncError::SendDisabled`] or [`SyncError::NotConnected`] when the
    ///   link is unusable
    /// - [`SyncError::Transport`] if the transport refused the message; the
    ///   session's state is unchanged
    pub fn send_session(&self, session: &Session, force: bool) -> SyncResult<SendOutcome> {
        let id = session.id();
        let mut comm = session.comm();
        if comm.is_idle() && self.registry.delete_if_drained(id) {
            let opened = !comm.needs_open();
            drop(comm);
            if opened {
                self.send_close(id);
            }
            return Ok(SendOutcome::Deleted);
        }
        if !self.send_enabled() {
            return Err(SyncError::SendDisabled);
        }
        if !self.transport.is_connected() {
            return Err(SyncError::NotConnected);
        }
        if !comm.is_idle() {
            if force {
                comm.set_draining(true);
            }
            trace!(session = %id, "send skipped, answer outstanding");
            return Ok(SendOutcome::Busy);
        }
        let deadline = self.clock.now() + self.config.ack_timeout;

        if comm.needs_open() {
            self.send_message(&open_message(session.meta()))?;
            comm.apply(CommEvent::OpenSent { deadline }, self.config.max_nacks)?;
            if force {
                comm.set_draining(true);
            }
            drop(comm);
            self.stats.record_send();
            debug!(session = %id, "open sent");
            self.arm_ack_timer();
            return Ok(SendOutcome::Opened);
        }

        let engine = self.registry.engine();
        let unread = engine.num_bytes(id) as usize;
        let force = force || comm.is_draining();
        if unread == 0 {
            comm.set_draining(false);
            return Ok(SendOutcome::Nothing);
        }
        if !force && unread < self.config.min_send_bytes {
            return Ok(SendOutcome::Nothing);
        }

        let mut payload = vec![0u8; self.config.max_payload];
        let read = engine.read(id, Some(&mut payload), self.config.max_payload)?;
        if read.len == 0 {
            return Ok(SendOutcome::Nothing);
        }
        payload.truncate(read.len);
        let item = usize::from(session.meta().item.size);
        let items_left = u32::try_from((unread - read.len) / item).unwrap_or(u32::MAX);
        let message = Message::Data(SendData::new(id.as_u8(), items_left, Bytes::from(payload)));
        self.send_message(&message)?;
        comm.apply(
            CommEvent::DataSent {
                deadline,
                bytes: read.len,
                generation: read.generation,
            },
            self.config.max_nacks,
        )?;
        comm.set_draining(force);
        drop(comm);
        self.stats.record_send();
        debug!(session = %id, bytes = read.len, items_left, "data sent");
        self.arm_ack_timer();
        Ok(SendOutcome::Data { bytes: read.len })
    }

    /// Offers every session a send, in id order. Stops early if the link
    /// becomes unusable.
    pub fn send_all(&self, force: bool) {
        for session in self.registry.sessions() {
            match self.send_session(&session, force) {
                Ok(_) => {}
                Err(SyncError::SendDisabled | SyncError::NotConnected) => return,
                Err(err) => {
                    warn!(session = %session.id(), error = %err, "send failed");
                    if matches!(err, SyncError::Transport { .. }) {
                        return;
                    }
                }
            }
        }
    }

    /// Handles one decoded message from the host.
    pub fn handle_message(&self, message: Message) {
        trace!(command = message.command().name(), "host message");
        match message {
            Message::Ack { session_id } => self.handle_ack(SessionId::new(session_id)),
            Message::Nack { session_id } => self.handle_nack(SessionId::new(session_id)),
            Message::Report { session_ids } => self.handle_report(&session_ids),
            Message::EmptySession { session_id } => {
                self.handle_empty_session(SessionId::new(session_id));
            }
            Message::GetSendEnableRequest => {
                let enabled = self.host_enabled.load(Ordering::SeqCst);
                if let Err(err) = self.send_message(&Message::GetSendEnableResponse { enabled }) {
                    debug!(error = %err, "send-enable response not sent");
                }
            }
            Message::SetSendEnable { enabled } => {
                info!(enabled, "host changed send enable");
                self.host_enabled.store(enabled, Ordering::SeqCst);
                if enabled {
                    self.send_all(false);
                }
            }
            other => warn!(
                command = other.command().name(),
                "device-side command received from host, ignored"
            ),
        }
    }

    fn handle_ack(&self, id: SessionId) {
        let Some(session) = self.registry.find(id) else {
            debug!(session = %id, "ack for unknown session");
            return;
        };
        let mut comm = session.comm();
        let outcome = match comm.apply(CommEvent::Acked, self.config.max_nacks) {
            Ok(outcome) => outcome,
            Err(err) => {
                debug!(session = %id, error = %err, "stray ack ignored");
                return;
            }
        };
        let engine = self.registry.engine();
        if let CommOutcome::Delivered { bytes, generation } = outcome {
            match engine.acknowledge(id, bytes, generation) {
                Ok(true) => debug!(session = %id, bytes, "delivery acknowledged"),
                Ok(false) => debug!(session = %id, "acknowledged bytes were already dropped"),
                Err(err) => warn!(session = %id, error = %err, "acknowledge failed"),
            }
        }
        let draining = comm.is_draining();
        let delete = comm.is_idle() && self.registry.delete_if_drained(id);
        drop(comm);

        if delete {
            self.send_close(id);
        } else {
            self.submit_send(id, draining);
        }
        self.arm_ack_timer();
    }

    fn handle_nack(&self, id: SessionId) {
        let Some(session) = self.registry.find(id) else {
            debug!(session = %id, "nack for unknown session");
            return;
        };
        let mut comm = session.comm();
        let outcome = match comm.apply(CommEvent::Nacked, self.config.max_nacks) {
            Ok(outcome) => outcome,
            Err(err) => {
                debug!(session = %id, error = %err, "stray nack ignored");
                return;
            }
        };
        self.stats.record_nack();
        let mut delete = false;
        if let CommOutcome::Rejected { exhausted: true } = outcome {
            match self.registry.engine().drop_unread(id) {
                Ok(dropped) => warn!(
                    session = %id,
                    bytes = dropped,
                    "host kept rejecting, dropped unread bytes"
                ),
                Err(err) => warn!(session = %id, error = %err, "drop after nacks failed"),
            }
            delete = self.registry.delete_if_drained(id);
        } else {
            debug!(session = %id, nacks = comm.nack_count(), "host rejected, retry on next sweep");
        }
        drop(comm);

        if delete {
            self.send_close(id);
        }
        self.arm_ack_timer();
    }

    fn handle_empty_session(&self, id: SessionId) {
        let Some(session) = self.registry.find(id) else {
            debug!(session = %id, "empty request for unknown session");
            return;
        };
        match self.send_session(&session, true) {
            Ok(outcome) => debug!(session = %id, ?outcome, "host asked for pending data"),
            Err(err) => debug!(session = %id, error = %err, "pending data not sent"),
        }
    }

    fn handle_report(&self, reported: &[u8]) {
        let sessions = self.registry.sessions();
        let tickets: Vec<Ticket> = sessions
            .iter()
            .map(|session| Ticket::for_session(session.meta()))
            .collect();
        let epoch = {
            let mut queue = self.reopen.lock();
            match queue.begin(tickets) {
                Some(epoch) => epoch,
                None => {
                    debug!("report ignored, reconciliation already running");
                    return;
                }
            }
        };

        for &raw in reported {
            let id = SessionId::new(raw);
            if !sessions.iter().any(|session| session.id() == id) {
                info!(session = %id, "host has a session we do not, closing");
                self.send_close(id);
            }
        }
        info!(sessions = sessions.len(), "reconciling with host");
        self.submit_reopen_step(epoch);
    }

    /// Processes one reopen ticket of run `epoch`, then schedules the next.
    fn reopen_step(&self, epoch: u64) {
        let (step, remaining) = {
            let mut queue = self.reopen.lock();
            let step = queue.next(epoch);
            (step, queue.pending())
        };
        let ticket = match step {
            Step::Reopen(ticket) => ticket,
            Step::Done => {
                debug!("reconciliation complete");
                return;
            }
            Step::Stale => return,
        };

        match self.registry.find(ticket.id) {
            Some(session) if ticket.matches(session.meta()) => {
                let deleted = {
                    let mut comm = session.comm();
                    if !comm.is_idle() {
                        let _ = comm.apply(CommEvent::Reset, self.config.max_nacks);
                    }
                    let deleted = self.registry.delete_if_drained(ticket.id);
                    if !deleted {
                        comm.request_open();
                    }
                    deleted
                };
                if deleted {
                    self.send_close(ticket.id);
                } else {
                    match self.send_session(&session, false) {
                        Ok(_) => debug!(session = %ticket.id, remaining, "session reopened"),
                        Err(err) => debug!(session = %ticket.id, error = %err, "reopen deferred"),
                    }
                }
            }
            Some(_) => debug!(session = %ticket.id, "id now belongs to another session, skipped"),
            None => debug!(session = %ticket.id, "session gone before reopen, skipped"),
        }
        self.submit_reopen_step(epoch);
    }

    /// Times out every session whose answer deadline has passed.
    pub fn check_deadlines(&self) {
        let now = self.clock.now();
        for session in self.registry.sessions() {
            let timed_out = {
                let mut comm = session.comm();
                match comm.phase().deadline() {
                    Some(deadline) if deadline <= now => comm
                        .apply(CommEvent::TimedOut, self.config.max_nacks)
                        .is_ok(),
                    _ => false,
                }
            };
            if timed_out {
                self.stats.record_timeout();
                warn!(session = %session.id(), "host did not answer in time");
                let message = Message::Timeout {
                    session_id: session.id().as_u8(),
                };
                if let Err(err) = self.send_message(&message) {
                    debug!(session = %session.id(), error = %err, "timeout notice not sent");
                }
            }
        }
        self.arm_ack_timer();
    }

    /// Forgets all in-flight exchanges after the link went away.
    pub fn on_disconnected(&self) {
        let dropped = self.reopen.lock().cancel();
        for session in self.registry.sessions() {
            let _ = session.comm().apply(CommEvent::Reset, self.config.max_nacks);
        }
        self.timers.stop(self.ack_timer);
        info!(cancelled_reopens = dropped, "host disconnected");
    }

    /// Pushes pending data after the link came back.
    pub fn on_connected(&self) {
        info!("host connected");
        self.send_all(false);
    }

    /// Tells the host a session is gone.
    pub fn send_close(&self, id: SessionId) {
        let message = Message::Close {
            session_id: id.as_u8(),
        };
        match self.send_message(&message) {
            Ok(()) => debug!(session = %id, "close sent"),
            Err(err) => debug!(session = %id, error = %err, "close not sent"),
        }
    }

    fn send_message(&self, message: &Message) -> SyncResult<()> {
        if !self.transport.is_connected() {
            return Err(SyncError::NotConnected);
        }
        self.transport.send(self.config.endpoint_id, message.encode())
    }

    /// Re-arms the deadline timer for the earliest outstanding answer.
    fn arm_ack_timer(&self) {
        let earliest = self
            .registry
            .sessions()
            .iter()
            .filter_map(|session| session.comm().phase().deadline())
            .min();
        match earliest {
            Some(deadline) => {
                let delay = deadline.saturating_sub(self.clock.now());
                self.timers.start(self.ack_timer, delay, false);
            }
            None => self.timers.stop(self.ack_timer),
        }
    }

    fn submit_send(&self, id: SessionId, force: bool) {
        let me = self.me.clone();
        self.scheduler.submit(Box::new(move || {
            let Some(endpoint) = me.upgrade() else {
                return;
            };
            let Some(session) = endpoint.registry.find(id) else {
                return;
            };
            if let Err(err) = endpoint.send_session(&session, force) {
                debug!(session = %id, error = %err, "follow-up send deferred");
            }
        }));
    }

    fn submit_reopen_step(&self, epoch: u64) {
        let me = self.me.clone();
        self.scheduler.submit(Box::new(move || {
            if let Some(endpoint) = me.upgrade() {
                endpoint.reopen_step(epoch);
            }
        }));
    }
}

impl Drop for SyncEndpoint {
    fn drop(&mut self) {
        self.timers.delete(self.ack_timer);
    }
}

impl std::fmt::Debug for SyncEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEndpoint")
            .field("endpoint_id", &self.config.endpoint_id)
            .field("send_enabled", &self.send_enabled())
            .field("reconciling", &self.is_reconciling())
            .finish_non_exhaustive()
    }
}

fn open_message(meta: &SessionMeta) -> Message {
    Message::Open(OpenSession {
        session_id: meta.id.as_u8(),
        owner: *meta.owner.as_bytes(),
        timestamp: meta.timestamp,
        tag: meta.tag,
        item_kind: match meta.item.kind {
            ItemKind::ByteArray => ItemKindCode::ByteArray,
            ItemKind::Unsigned => ItemKindCode::Unsigned,
            ItemKind::Signed => ItemKindCode::Signed,
        },
        item_size: meta.item.size,
    })
}
