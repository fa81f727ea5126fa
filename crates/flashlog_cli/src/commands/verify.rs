//! Verify command implementation.

use super::{load_logs, open_store, CliError, LogFile};
use flashlog_core::storage::format::{classify, FileKind, WalkEnd, FILE_PREFIX};
use flashlog_storage::FileStore;
use std::path::Path;

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of session files checked.
    pub files_checked: usize,
    /// Number of files without problems.
    pub valid_files: usize,
    /// Leftover rewrite scratch files. Rebuild removes these.
    pub scratch_files: usize,
    /// List of problems found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying session logs at {}", path.display());
    println!();

    let result = verify(path)?;
    println!(
        "Checked {} file(s): {} valid",
        result.files_checked, result.valid_files
    );
    if result.scratch_files > 0 {
        println!(
            "{} leftover scratch file(s), removed on next boot",
            result.scratch_files
        );
    }
    for error in &result.errors {
        println!("  - {error}");
    }

    println!();
    if result.is_ok() {
        println!("✓ Verification passed");
        Ok(())
    } else {
        println!("✗ Verification failed");
        Err(CliError::VerifyFailed(result.errors.len()).into())
    }
}

/// Checks every session file in `path`.
pub fn verify(path: &Path) -> Result<VerifyResult, CliError> {
    let store = open_store(path)?;
    let mut result = VerifyResult {
        scratch_files: store
            .list_by_prefix(FILE_PREFIX)?
            .iter()
            .filter(|name| classify(name) == FileKind::Scratch)
            .count(),
        ..VerifyResult::default()
    };

    for log in load_logs(&store)? {
        result.files_checked += 1;
        let before = result.errors.len();
        check_file(&log, &mut result.errors);
        if result.errors.len() == before {
            result.valid_files += 1;
        }
    }
    Ok(result)
}

fn check_file(log: &LogFile, errors: &mut Vec<String>) {
    match &log.header {
        Ok(header) => {
            if classify(&log.name) != FileKind::Data(header.session_id) {
                errors.push(format!(
                    "{}: header names session {}",
                    log.name, header.session_id
                ));
            }
            if let Ok(scan) = &log.scan {
                let item = u64::from(header.item.size);
                let total = scan.live_bytes + scan.tombstoned_bytes;
                if total % item != 0 {
                    errors.push(format!(
                        "{}: {total} payload bytes is not a whole number of {item}-byte items",
                        log.name
                    ));
                }
            }
        }
        Err(err) => errors.push(format!("{}: bad header: {err}", log.name)),
    }

    match &log.scan {
        Ok(scan) => match scan.end {
            WalkEnd::Erased | WalkEnd::EndOfRegion | WalkEnd::Running => {}
            WalkEnd::Truncated => errors.push(format!(
                "{}: chunk at offset {} runs past the end of the file",
                log.name, scan.write_offset
            )),
            WalkEnd::Invalid(byte) => errors.push(format!(
                "{}: invalid chunk header 0x{byte:02X} at offset {}",
                log.name, scan.write_offset
            )),
        },
        Err(err) => errors.push(format!("{}: chunks unreadable: {err}", log.name)),
    }
}
