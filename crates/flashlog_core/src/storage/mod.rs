//! Chunked session logs on flash.
//!
//! Each session owns one file: a fixed header followed by chunks of at most
//! 100 payload bytes. Delivered chunks are tombstoned in place; compaction
//! rewrites a file without them.

mod compaction;
mod engine;
pub mod format;
mod log;

pub use compaction::CompactionResult;
pub use engine::StorageEngine;
pub use format::{FileHeader, HEADER_SIZE};
pub use log::{scan_log, LogScan, ReadOutcome, StorageCursor};
