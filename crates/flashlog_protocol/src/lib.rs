//! # flashlog protocol
//!
//! Wire messages exchanged between the device and the host on the data
//! logging endpoint.
//!
//! This crate provides:
//! - [`Message`], one variant per command, with fixed little-endian layouts
//! - [`ItemKindCode`] for the item kind byte shared with the on-flash header
//! - [`crc32`] for the payload checksum carried by `Data`
//!
//! This is a pure protocol crate with no I/O operations.
//!
//! ## Framing
//!
//! ```text
//! | command (1) | body (N) |
//! ```
//!
//! Commands sent by the host have bit 7 set.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod checksum;
mod error;
mod messages;

pub use checksum::crc32;
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{Command, ItemKindCode, Message, OpenSession, SendData, DATA_HEADER_SIZE};

/// Endpoint identifier the host routes data logging traffic to.
pub const ENDPOINT_ID: u16 = 0x1A7A;
