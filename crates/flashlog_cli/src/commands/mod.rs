//! CLI command implementations.

pub mod compact;
pub mod dump;
pub mod inspect;
pub mod verify;

use flashlog_core::storage::format::{classify, FileKind, FILE_PREFIX};
use flashlog_core::storage::{scan_log, FileHeader, LogScan, HEADER_SIZE};
use flashlog_core::CoreError;
use flashlog_storage::{DirectoryStore, FileStore, StorageError};
use std::path::Path;
use thiserror::Error;

/// Errors raised by the maintenance commands.
#[derive(Debug, Error)]
pub enum CliError {
    /// The directory holds no session files.
    #[error("no session logs found at {0}")]
    NoLogs(String),

    /// The store could not be opened or read.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A session file could not be interpreted.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// `verify` found problems.
    #[error("verification failed: {0} problem(s)")]
    VerifyFailed(usize),

    /// An option value was not understood.
    #[error("unknown output format {0:?}")]
    Format(String),
}

/// Output format shared by the reporting commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Human-readable report.
    Text,
    /// Pretty-printed JSON.
    Json,
}

impl Format {
    /// Parses a `--format` value.
    pub fn parse(value: &str) -> Result<Self, CliError> {
        match value {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(CliError::Format(other.to_string())),
        }
    }
}

/// A session data file, read from the store.
pub struct LogFile {
    /// File name in the store.
    pub name: String,
    /// File size in bytes.
    pub size: u64,
    /// Decoded header, or why it did not verify.
    pub header: Result<FileHeader, CoreError>,
    /// Chunk totals, or why the file could not be walked.
    pub scan: Result<LogScan, CoreError>,
    /// Raw bytes after the header.
    pub region: Vec<u8>,
}

/// Opens an existing log directory read-write.
pub fn open_store(path: &Path) -> Result<DirectoryStore, CliError> {
    Ok(DirectoryStore::open(path, false)?)
}

/// Loads every session data file, in name order. Scratch files are skipped.
pub fn load_logs(store: &DirectoryStore) -> Result<Vec<LogFile>, CliError> {
    let mut logs = Vec::new();
    for name in store.list_by_prefix(FILE_PREFIX)? {
        if !matches!(classify(&name), FileKind::Data(_)) {
            continue;
        }
        let file = store.open(&name)?;
        let size = file.size();
        let header_len = HEADER_SIZE.min(size as usize);
        let header = file
            .read_vec(0, header_len)
            .map_err(CoreError::from)
            .and_then(|raw| FileHeader::decode(&raw));
        let scan = scan_log(file.as_ref());
        let region = if size > HEADER_SIZE as u64 {
            file.read_vec(HEADER_SIZE as u64, (size - HEADER_SIZE as u64) as usize)?
        } else {
            Vec::new()
        };
        logs.push(LogFile {
            name,
            size,
            header,
            scan,
            region,
        });
    }
    Ok(logs)
}

/// Formats a byte count for text output.
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes}")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
