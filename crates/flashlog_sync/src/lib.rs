//! # flashlog sync
//!
//! Host synchronization and the service facade for flashlog.
//!
//! This crate provides:
//! - `SyncEndpoint`: the per-session Open/Data/Close exchange with the host,
//!   including acknowledgement deadlines, nack limits and reconciliation
//!   after the host reports its open sessions
//! - `DataLogService`: the entry point producers and the platform call
//! - `HostTransport`: the outbound link abstraction, with a mock for tests
//!
//! ## Example
//!
//! ```rust
//! use flashlog_core::{
//!     BufferMode, ItemType, ManualScheduler, ManualTimers, OwnerTask, Scheduler,
//!     TimerService, Clock,
//! };
//! use flashlog_storage::InMemoryStore;
//! use flashlog_sync::{DataLogService, FixedOwner, HostTransport, MockTransport};
//! use std::sync::Arc;
//! use uuid::Uuid;
//!
//! let transport = Arc::new(MockTransport::new());
//! let scheduler = Arc::new(ManualScheduler::new());
//! let timers = Arc::new(ManualTimers::default());
//! let service = DataLogService::builder(
//!     Arc::new(InMemoryStore::new()),
//!     Arc::clone(&transport) as Arc<dyn HostTransport>,
//! )
//! .scheduler(Arc::clone(&scheduler) as Arc<dyn Scheduler>)
//! .timers(Arc::clone(&timers) as Arc<dyn TimerService>)
//! .clock(timers as Arc<dyn Clock>)
//! .owner_resolver(Arc::new(FixedOwner { owner: Uuid::new_v4(), task: OwnerTask::App }))
//! .build()
//! .unwrap();
//!
//! let handle = service
//!     .create_for_current_owner(1, ItemType::unsigned(4), BufferMode::Unbuffered)
//!     .unwrap();
//! service.log(handle, &7u32.to_le_bytes()).unwrap();
//! scheduler.run_until_idle();
//! assert_eq!(transport.sent().len(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod endpoint;
mod error;
mod reconcile;
mod service;
mod transport;

pub use config::SyncConfig;
pub use endpoint::{SendOutcome, SyncEndpoint};
pub use error::{SyncError, SyncResult};
pub use service::{DataLogService, DataLogServiceBuilder, FixedOwner, OwnerResolver};
pub use transport::{HostTransport, MockTransport};
