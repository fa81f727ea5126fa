//! # flashlog Testkit
//!
//! Test utilities for flashlog.
//!
//! This crate provides:
//! - Engine fixtures that can reboot onto the files they wrote
//! - A fault-injecting file store
//! - Property-based test generators using proptest
//! - A service harness and a scripted host for end-to-end tests
//!
//! ## Usage
//!
//! ```rust
//! use flashlog_testkit::prelude::*;
//! use flashlog_core::{EngineConfig, ItemType};
//!
//! let fixture = EngineFixture::memory(EngineConfig::default());
//! let id = fixture.add_session(1, ItemType::unsigned(1));
//! fixture.engine.write(id, &[1, 2, 3]).unwrap();
//! assert_eq!(fixture.read_all(id), vec![1, 2, 3]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod faulty;
pub mod fixtures;
pub mod generators;
pub mod host;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::faulty::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::host::*;
}

pub use faulty::*;
pub use fixtures::*;
pub use generators::*;
pub use host::*;
