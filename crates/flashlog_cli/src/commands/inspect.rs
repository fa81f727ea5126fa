//! Inspect command implementation.

use super::{format_size, load_logs, open_store, CliError, Format, LogFile};
use serde::Serialize;
use std::path::Path;

/// Inspection result for the whole directory.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Directory path.
    pub path: String,
    /// Bytes occupied by session files.
    pub total_size: u64,
    /// Payload bytes not yet delivered, across all files.
    pub unread_bytes: u64,
    /// One entry per session file.
    pub sessions: Vec<SessionInfo>,
}

/// Inspection result for one session file.
#[derive(Debug, Serialize)]
pub struct SessionInfo {
    /// File name.
    pub file: String,
    /// File size in bytes.
    pub size: u64,
    /// Session id from the header.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<u8>,
    /// Producer tag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<u32>,
    /// Owner uuid.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Creation time, seconds since the Unix epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u32>,
    /// Item kind and size, such as `unsigned/4`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item: Option<String>,
    /// End of the chunk sequence.
    pub write_offset: u64,
    /// Payload bytes in live chunks.
    pub live_bytes: u64,
    /// Payload bytes in tombstoned chunks.
    pub tombstoned_bytes: u64,
    /// Live chunk count.
    pub live_chunks: usize,
    /// Tombstoned chunk count.
    pub tombstoned_chunks: usize,
    /// Why the header or chunk walk failed, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let format = Format::parse(format)?;
    let result = inspect(path)?;
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        Format::Text => print_text_output(&result),
    }
    Ok(())
}

/// Collects the inspection result for `path`.
pub fn inspect(path: &Path) -> Result<InspectResult, CliError> {
    let store = open_store(path)?;
    let logs = load_logs(&store)?;
    if logs.is_empty() {
        return Err(CliError::NoLogs(path.display().to_string()));
    }
    let sessions: Vec<SessionInfo> = logs.iter().map(session_info).collect();
    Ok(InspectResult {
        path: path.display().to_string(),
        total_size: sessions.iter().map(|s| s.size).sum(),
        unread_bytes: sessions.iter().map(|s| s.live_bytes).sum(),
        sessions,
    })
}

fn session_info(log: &LogFile) -> SessionInfo {
    let mut info = SessionInfo {
        file: log.name.clone(),
        size: log.size,
        session_id: None,
        tag: None,
        owner: None,
        timestamp: None,
        item: None,
        write_offset: 0,
        live_bytes: 0,
        tombstoned_bytes: 0,
        live_chunks: 0,
        tombstoned_chunks: 0,
        error: None,
    };
    match &log.header {
        Ok(header) => {
            info.session_id = Some(header.session_id.as_u8());
            info.tag = Some(header.tag);
            info.owner = Some(header.owner.to_string());
            info.timestamp = Some(header.timestamp);
            info.item = Some(format!(
                "{}/{}",
                format!("{:?}", header.item.kind).to_lowercase(),
                header.item.size
            ));
        }
        Err(err) => info.error = Some(format!("header: {err}")),
    }
    match &log.scan {
        Ok(scan) => {
            info.write_offset = scan.write_offset;
            info.live_bytes = scan.live_bytes;
            info.tombstoned_bytes = scan.tombstoned_bytes;
            info.live_chunks = scan.live_chunks;
            info.tombstoned_chunks = scan.tombstoned_chunks;
        }
        Err(err) => {
            info.error.get_or_insert_with(|| format!("chunks: {err}"));
        }
    }
    info
}

fn print_text_output(result: &InspectResult) {
    println!("flashlog Directory Inspection");
    println!("=============================");
    println!();
    println!("Path: {}", result.path);
    println!("Total size:   {} bytes", format_size(result.total_size));
    println!("Unread bytes: {}", result.unread_bytes);
    println!();
    for session in &result.sessions {
        match session.session_id {
            Some(id) => println!("{} (session {id})", session.file),
            None => println!("{}", session.file),
        }
        if let (Some(tag), Some(owner), Some(timestamp), Some(item)) = (
            session.tag,
            &session.owner,
            session.timestamp,
            &session.item,
        ) {
            println!("  tag {tag}, owner {owner}, created {timestamp}, items {item}");
        }
        println!(
            "  size {}, write offset {}, live {} bytes in {} chunk(s), tombstoned {} bytes in {} chunk(s)",
            format_size(session.size),
            session.write_offset,
            session.live_bytes,
            session.live_chunks,
            session.tombstoned_bytes,
            session.tombstoned_chunks
        );
        if let Some(error) = &session.error {
            println!("  error: {error}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_support::populate;

    #[test]
    fn inspect_reports_every_session() {
        let dir = tempfile::tempdir().unwrap();
        populate(dir.path());

        let result = inspect(dir.path()).unwrap();
        assert_eq!(result.sessions.len(), 2);
        assert_eq!(result.unread_bytes, 12);

        let first = result
            .sessions
            .iter()
            .find(|s| s.tag == Some(1))
            .unwrap();
        assert_eq!(first.live_bytes, 8);
        assert_eq!(first.tombstoned_bytes, 8);
        assert_eq!(first.item.as_deref(), Some("unsigned/4"));
        assert!(first.error.is_none());

        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"tombstoned_chunks\":1"));
    }

    #[test]
    fn empty_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let _ = flashlog_storage::DirectoryStore::open(dir.path(), true).unwrap();
        assert!(matches!(inspect(dir.path()), Err(CliError::NoLogs(_))));
    }
}
