//! Dump command implementation.

use super::{load_logs, open_store, CliError, Format, LogFile};
use flashlog_core::storage::format::ChunkWalker;
use flashlog_core::storage::HEADER_SIZE;
use serde::Serialize;
use std::path::Path;

/// Unread payload of one session file.
#[derive(Debug, Serialize)]
pub struct SessionDump {
    /// File name.
    pub file: String,
    /// Session id from the header.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<u8>,
    /// Payload bytes in live chunks.
    pub live_bytes: usize,
    /// Dumped bytes, hex-encoded.
    pub hex: String,
    /// True if `limit` cut the dump short.
    pub truncated: bool,
}

/// Runs the dump command.
pub fn run(
    path: &Path,
    session: Option<u8>,
    limit: Option<usize>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let format = Format::parse(format)?;
    let dumps = dump(path, session, limit)?;
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&dumps)?),
        Format::Text => print_text_output(&dumps),
    }
    Ok(())
}

/// Collects the live payload of the selected session files.
pub fn dump(
    path: &Path,
    session: Option<u8>,
    limit: Option<usize>,
) -> Result<Vec<SessionDump>, CliError> {
    let store = open_store(path)?;
    let dumps: Vec<SessionDump> = load_logs(&store)?
        .iter()
        .filter(|log| match (session, &log.header) {
            (Some(wanted), Ok(header)) => header.session_id.as_u8() == wanted,
            (Some(_), Err(_)) => false,
            (None, _) => true,
        })
        .map(|log| dump_one(log, limit.unwrap_or(usize::MAX)))
        .collect();
    if dumps.is_empty() {
        return Err(CliError::NoLogs(path.display().to_string()));
    }
    Ok(dumps)
}

fn dump_one(log: &LogFile, limit: usize) -> SessionDump {
    let mut walker = ChunkWalker::new(&log.region, HEADER_SIZE as u64);
    let chunks: Vec<_> = walker.by_ref().collect();
    let mut payload = Vec::new();
    let mut live_bytes = 0;
    for chunk in chunks.iter().filter(|chunk| chunk.live) {
        live_bytes += chunk.len;
        payload.extend_from_slice(walker.payload(chunk));
    }
    let truncated = payload.len() > limit;
    payload.truncate(limit);
    SessionDump {
        file: log.name.clone(),
        session_id: log.header.as_ref().ok().map(|h| h.session_id.as_u8()),
        live_bytes,
        hex: to_hex(&payload),
        truncated,
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn print_text_output(dumps: &[SessionDump]) {
    for dump in dumps {
        match dump.session_id {
            Some(id) => println!("{} (session {id}), {} live bytes", dump.file, dump.live_bytes),
            None => println!("{}, {} live bytes", dump.file, dump.live_bytes),
        }
        // 16 bytes per line
        for (i, line) in dump.hex.as_bytes().chunks(32).enumerate() {
            let text = String::from_utf8_lossy(line);
            println!("  {:06x}  {text}", i * 16);
        }
        if dump.truncated {
            println!("  ...");
        }
    }
}
