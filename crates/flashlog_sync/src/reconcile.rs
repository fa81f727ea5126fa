//! Reopen queue used after the host reports which sessions it has open.
//!
//! The queue is consumed one ticket per scheduler job. A ticket remembers
//! the logical identity of the session it was made for, because the id may
//! be reused by an unrelated session before the ticket is processed.

use flashlog_core::{SessionId, SessionMeta};
use std::collections::VecDeque;
use uuid::Uuid;

/// One session to reopen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Ticket {
    pub(crate) id: SessionId,
    owner: Uuid,
    timestamp: u32,
    tag: u32,
}

impl Ticket {
    pub(crate) fn for_session(meta: &SessionMeta) -> Self {
        Self {
            id: meta.id,
            owner: meta.owner,
            timestamp: meta.timestamp,
            tag: meta.tag,
        }
    }

    /// Returns true if `meta` is still the session this ticket was made for.
    pub(crate) fn matches(&self, meta: &SessionMeta) -> bool {
        meta.id == self.id && meta.same_logical_session(&self.owner, self.timestamp, self.tag)
    }
}

/// What the next reconciliation job should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    /// Reopen this session, then schedule another step.
    Reopen(Ticket),
    /// The queue is exhausted; reconciliation is over.
    Done,
    /// The job belongs to a cancelled run and must do nothing.
    Stale,
}

/// Cancellable queue of pending reopens.
#[derive(Debug, Default)]
pub(crate) struct ReopenQueue {
    tickets: VecDeque<Ticket>,
    epoch: u64,
    running: bool,
}

impl ReopenQueue {
    /// Returns true while a run is in progress.
    pub(crate) fn is_running(&self) -> bool {
        self.running
    }

    /// Starts a run over `tickets`. Returns the run's epoch, or `None` if a
    /// run is already in progress.
    pub(crate) fn begin(&mut self, tickets: impl IntoIterator<Item = Ticket>) -> Option<u64> {
        if self.running {
            return None;
        }
        self.epoch += 1;
        self.running = true;
        self.tickets = tickets.into_iter().collect();
        Some(self.epoch)
    }

    /// Takes the next ticket for a job scheduled by run `epoch`.
    pub(crate) fn next(&mut self, epoch: u64) -> Step {
        if !self.running || epoch != self.epoch {
            return Step::Stale;
        }
        match self.tickets.pop_front() {
            Some(ticket) => Step::Reopen(ticket),
            None => {
                self.running = false;
                Step::Done
            }
        }
    }

    /// Abandons the current run. Jobs already scheduled for it become stale.
    pub(crate) fn cancel(&mut self) -> usize {
        let dropped = self.tickets.len();
        self.tickets.clear();
        if self.running {
            self.running = false;
            self.epoch += 1;
        }
        dropped
    }

    pub(crate) fn pending(&self) -> usize {
        self.tickets.len()
    }
}
