//! # flashlog storage
//!
//! The flash file store that flashlog session logs live in.
//!
//! Stores are **opaque, named, fixed-size files**. They know nothing about
//! chunks, tombstones or sessions; the engine in `flashlog_core` owns all
//! format interpretation.
//!
//! ## Design Principles
//!
//! - Files are pre-sized at creation and start out erased (`0xFF`)
//! - All I/O is positional (`read_at` / `write_at`), there is no cursor
//! - Closing a file is dropping its handle
//! - Stores must be `Send + Sync`; file handles must be `Send`
//!
//! ## Available Stores
//!
//! - [`InMemoryStore`] - For testing and ephemeral storage
//! - [`DirectoryStore`] - Files in an advisory-locked OS directory
//!
//! ## Example
//!
//! ```rust
//! use flashlog_storage::{FileStore, InMemoryStore, ERASED_BYTE};
//!
//! let store = InMemoryStore::new();
//! let mut file = store.create("flog_001", 64).unwrap();
//! file.write_at(0, b"hello").unwrap();
//!
//! let mut buf = [0u8; 6];
//! file.read_at(0, &mut buf).unwrap();
//! assert_eq!(&buf[..5], b"hello");
//! assert_eq!(buf[5], ERASED_BYTE);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod directory;
mod error;
mod memory;
mod store;

pub use directory::DirectoryStore;
pub use error::{StorageError, StorageResult};
pub use memory::InMemoryStore;
pub use store::{FileStore, FlashFile, ERASED_BYTE};
