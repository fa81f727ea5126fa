//! # flashlog core
//!
//! Storage engine and session lifecycle for flashlog.
//!
//! This crate provides:
//! - A chunked, append-only session log on flash with in-place tombstoning
//! - Quota enforcement with compaction and a last-resort drop of old data
//! - Boot-time rebuild of session logs from the file store
//! - The session registry with guarded, reference-counted access
//! - In-memory staging buffers for buffered sessions
//! - The per-session host communication state machine
//! - Scheduler, clock and timer collaborators
//!
//! ## Key Invariants
//!
//! - A session's unread byte count equals the live chunk payload between its
//!   read and write offsets
//! - Reads never hand out a partial item
//! - Session files never knowingly exceed the quota after a write completes
//! - Staging state is destroyed only when no producer references it
//! - At most one flash operation runs at a time
//!
//! ## Example
//!
//! ```rust
//! use flashlog_core::{
//!     BufferMode, CreateParams, EngineConfig, EngineStats, ItemType, OwnerTask,
//!     SessionRegistry, StorageEngine,
//! };
//! use flashlog_storage::InMemoryStore;
//! use std::sync::Arc;
//! use uuid::Uuid;
//!
//! let engine = Arc::new(StorageEngine::new(
//!     Arc::new(InMemoryStore::new()),
//!     EngineConfig::default(),
//!     Arc::new(EngineStats::new()),
//! ));
//! let registry = SessionRegistry::new(Arc::clone(&engine));
//!
//! let meta = registry
//!     .create(
//!         CreateParams {
//!             tag: 7,
//!             owner: Uuid::new_v4(),
//!             task: OwnerTask::App,
//!             item: ItemType::unsigned(2),
//!             buffer: BufferMode::Unbuffered,
//!         },
//!         1_700_000_000,
//!     )
//!     .unwrap();
//! registry.log(meta.handle(), &[1, 0, 2, 0]).unwrap();
//! assert_eq!(engine.num_bytes(meta.id), 4);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod buffer;
mod comm;
mod config;
mod error;
mod registry;
pub mod runtime;
mod stats;
pub mod storage;
mod types;

pub use buffer::ActiveBuffer;
pub use comm::{CommEvent, CommOutcome, CommPhase, CommState};
pub use config::EngineConfig;
pub use error::{CoreError, CoreResult};
pub use registry::{ActiveState, CreateOutcome, LogOutcome, Session, SessionRegistry};
pub use runtime::{
    Clock, Job, ManualScheduler, ManualTimers, Scheduler, SystemClock, ThreadScheduler,
    ThreadTimers, TimerCallback, TimerId, TimerService,
};
pub use stats::{EngineStats, StatsSnapshot};
pub use storage::{
    scan_log, CompactionResult, FileHeader, LogScan, ReadOutcome, StorageCursor, StorageEngine,
};
pub use types::{
    BufferMode, CreateParams, ItemKind, ItemType, OwnerTask, SessionHandle, SessionId,
    SessionMeta, SessionStatus,
};
