//! Per-session host communication state.
//!
//! Every session has at most one message awaiting an answer from the host.
//! All changes go through [`CommState::apply`], which rejects illegal edges
//! instead of asserting.
//!
//! ```text
//!            OpenSent              DataSent
//!   Idle ───────────▶ Opening   Idle ───────▶ Sending
//!    ▲                  │         ▲              │
//!    └── Acked/Nacked/TimedOut ───┴── Acked/Nacked/TimedOut
//! ```

use crate::error::{CoreError, CoreResult};
use std::time::Duration;

/// Where a session is in its exchange with the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommPhase {
    /// `Open` sent, waiting for the host.
    Opening {
        /// When the wait gives up.
        deadline: Duration,
    },
    /// Nothing outstanding.
    Idle,
    /// `Data` sent, waiting for the host.
    Sending {
        /// When the wait gives up.
        deadline: Duration,
        /// Payload bytes in flight.
        bytes: usize,
        /// Log drop generation the payload was read at.
        generation: u64,
    },
}

impl CommPhase {
    /// Returns the deadline of the outstanding message, if any.
    #[must_use]
    pub const fn deadline(&self) -> Option<Duration> {
        match self {
            Self::Opening { deadline } | Self::Sending { deadline, .. } => Some(*deadline),
            Self::Idle => None,
        }
    }

    /// Returns a short name for diagnostics.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Opening { .. } => "opening",
            Self::Idle => "idle",
            Self::Sending { .. } => "sending",
        }
    }
}

/// Something that happened to a session's exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommEvent {
    /// `Open` was sent.
    OpenSent {
        /// Answer deadline.
        deadline: Duration,
    },
    /// `Data` was sent.
    DataSent {
        /// Answer deadline.
        deadline: Duration,
        /// Payload bytes sent.
        bytes: usize,
        /// Log drop generation the payload was read at.
        generation: u64,
    },
    /// The host acknowledged.
    Acked,
    /// The host rejected.
    Nacked,
    /// The deadline passed.
    TimedOut,
    /// The transport went away.
    Reset,
}

impl CommEvent {
    const fn name(&self) -> &'static str {
        match self {
            Self::OpenSent { .. } => "open-sent",
            Self::DataSent { .. } => "data-sent",
            Self::Acked => "acked",
            Self::Nacked => "nacked",
            Self::TimedOut => "timed-out",
            Self::Reset => "reset",
        }
    }
}

/// What a successful transition means for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommOutcome {
    /// A message is now outstanding.
    Sent,
    /// The host accepted the session.
    Opened,
    /// The host accepted a payload.
    Delivered {
        /// Payload bytes to retire.
        bytes: usize,
        /// Log drop generation the payload was read at.
        generation: u64,
    },
    /// The host rejected the outstanding message.
    Rejected {
        /// True once the nack bound is exceeded; pending bytes must be
        /// dropped.
        exhausted: bool,
    },
    /// The outstanding message was abandoned.
    TimedOut,
    /// All state was cleared.
    Reset,
}

/// Host communication state of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommState {
    phase: CommPhase,
    needs_open: bool,
    nack_count: u8,
    draining: bool,
}

impl Default for CommState {
    fn default() -> Self {
        Self::new()
    }
}

impl CommState {
    /// A session the host has not been told about yet.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            phase: CommPhase::Idle,
            needs_open: true,
            nack_count: 0,
            draining: false,
        }
    }

    /// Returns the current phase.
    #[must_use]
    pub const fn phase(&self) -> CommPhase {
        self.phase
    }

    /// Returns true if nothing is outstanding.
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        matches!(self.phase, CommPhase::Idle)
    }

    /// Returns true if `Open` must precede the next `Data`.
    #[must_use]
    pub const fn needs_open(&self) -> bool {
        self.needs_open
    }

    /// Requests a fresh `Open` before the next `Data`.
    pub fn request_open(&mut self) {
        self.needs_open = true;
    }

    /// Returns the number of consecutive nacks.
    #[must_use]
    pub const fn nack_count(&self) -> u8 {
        self.nack_count
    }

    /// Returns true while a forced flush should continue past the batching
    /// threshold.
    #[must_use]
    pub const fn is_draining(&self) -> bool {
        self.draining
    }

    /// Marks or clears a forced flush.
    pub fn set_draining(&mut self, draining: bool) {
        self.draining = draining;
    }

    /// Applies `event`, returning what it means or an error for illegal
    /// edges. `max_nacks` is the number of nacks tolerated before pending
    /// bytes are dropped.
    pub fn apply(&mut self, event: CommEvent, max_nacks: u8) -> CoreResult<CommOutcome> {
        let outcome = match (self.phase, event) {
            (_, CommEvent::Reset) => {
                *self = Self::new();
                CommOutcome::Reset
            }
            (CommPhase::Idle, CommEvent::OpenSent { deadline }) => {
                self.phase = CommPhase::Opening { deadline };
                self.needs_open = false;
                CommOutcome::Sent
            }
            (
                CommPhase::Idle,
                CommEvent::DataSent {
                    deadline,
                    bytes,
                    generation,
                },
            ) if !self.needs_open => {
                self.phase = CommPhase::Sending {
                    deadline,
                    bytes,
                    generation,
                };
                CommOutcome::Sent
            }
            (CommPhase::Opening { .. }, CommEvent::Acked) => {
                self.phase = CommPhase::Idle;
                self.nack_count = 0;
                CommOutcome::Opened
            }
            (
                CommPhase::Sending {
                    bytes, generation, ..
                },
                CommEvent::Acked,
            ) => {
                self.phase = CommPhase::Idle;
                self.nack_count = 0;
                CommOutcome::Delivered { bytes, generation }
            }
            (CommPhase::Opening { .. } | CommPhase::Sending { .. }, CommEvent::Nacked) => {
                if matches!(self.phase, CommPhase::Opening { .. }) {
                    self.needs_open = true;
                }
                self.phase = CommPhase::Idle;
                self.nack_count = self.nack_count.saturating_add(1);
                let exhausted = self.nack_count > max_nacks;
                if exhausted {
                    self.nack_count = 0;
                    self.draining = false;
                }
                CommOutcome::Rejected { exhausted }
            }
            (CommPhase::Opening { .. } | CommPhase::Sending { .. }, CommEvent::TimedOut) => {
                if matches!(self.phase, CommPhase::Opening { .. }) {
                    self.needs_open = true;
                }
                self.phase = CommPhase::Idle;
                CommOutcome::TimedOut
            }
            (phase, event) => {
                return Err(CoreError::InvalidStateTransition {
                    phase: if matches!(event, CommEvent::DataSent { .. }) && self.needs_open {
                        "unopened"
                    } else {
                        phase.name()
                    },
                    event: event.name(),
                });
            }
        };
        Ok(outcome)
    }
}
