//! Compact command implementation.
//!
//! Opens the directory with a storage engine, which first rebuilds the
//! session set: scratch files, corrupt files and fully delivered files are
//! removed. Every remaining file is then rewritten to its unread bytes plus
//! the minimum free band.

use super::{format_size, load_logs, open_store, CliError};
use flashlog_core::storage::format::chunked_len;
use flashlog_core::storage::HEADER_SIZE;
use flashlog_core::{EngineConfig, EngineStats, StorageEngine};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Outcome of a compaction run.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CompactOutcome {
    /// Session files before the run.
    pub files_before: usize,
    /// Sessions restored by the rebuild.
    pub sessions: usize,
    /// Files rewritten.
    pub files_rewritten: usize,
    /// Bytes occupied before the run.
    pub bytes_before: u64,
    /// Bytes occupied after the run, or the estimate for a dry run.
    pub bytes_after: u64,
}

/// Runs the compact command.
pub fn run(path: &Path, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    let outcome = compact(path, dry_run)?;
    if dry_run {
        println!("Dry run - no files changed");
    }
    println!(
        "{} session file(s), {} live session(s), {} rewritten",
        outcome.files_before, outcome.sessions, outcome.files_rewritten
    );
    println!(
        "Size: {} -> {} bytes",
        format_size(outcome.bytes_before),
        format_size(outcome.bytes_after)
    );
    Ok(())
}

/// Compacts the session files in `path`.
pub fn compact(path: &Path, dry_run: bool) -> Result<CompactOutcome, CliError> {
    let config = EngineConfig::default();
    let store = open_store(path)?;
    let logs = load_logs(&store)?;
    if logs.is_empty() {
        return Err(CliError::NoLogs(path.display().to_string()));
    }
    let mut outcome = CompactOutcome {
        files_before: logs.len(),
        bytes_before: logs.iter().map(|log| log.size).sum(),
        ..CompactOutcome::default()
    };

    if dry_run {
        for log in &logs {
            let Ok(scan) = &log.scan else { continue };
            if log.header.is_err() || scan.live_bytes == 0 {
                continue;
            }
            outcome.sessions += 1;
            let target = (HEADER_SIZE + chunked_len(scan.live_bytes as usize)) as u64
                + config.min_free_bytes;
            if target < log.size {
                outcome.files_rewritten += 1;
                outcome.bytes_after += target;
            } else {
                outcome.bytes_after += log.size;
            }
        }
        return Ok(outcome);
    }

    let engine = StorageEngine::new(Arc::new(store), config, Arc::new(EngineStats::new()));
    outcome.sessions = engine.rebuild()?.len();
    let result = engine.compact_all()?;
    outcome.files_rewritten = result.files_rewritten;
    outcome.bytes_after = engine.quota_used()?;
    info!(
        sessions = outcome.sessions,
        reclaimed = outcome.bytes_before.saturating_sub(outcome.bytes_after),
        "directory compacted"
    );
    Ok(outcome)
}
