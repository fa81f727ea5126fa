//! Test fixtures for the storage engine.
//!
//! Provides an engine over an arbitrary file store that can be "rebooted"
//! onto the same files, plus a temporary directory store.

use flashlog_core::{
    CoreResult, EngineConfig, EngineStats, FileHeader, ItemType, SessionId, StorageEngine,
};
use flashlog_storage::{DirectoryStore, FileStore};
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

/// Header for a test session. Everything but the id and item type is fixed.
pub fn test_header(id: u8, item: ItemType) -> FileHeader {
    FileHeader {
        session_id: SessionId::new(id),
        timestamp: 1_700_000_000 + u32::from(id),
        tag: u32::from(id) * 10,
        owner: Uuid::from_u128(0x7E57),
        item,
    }
}

/// A storage engine and the store under it.
pub struct EngineFixture {
    /// The file store.
    pub store: Arc<dyn FileStore>,
    /// The engine.
    pub engine: Arc<StorageEngine>,
    config: EngineConfig,
}

impl EngineFixture {
    /// Creates an engine over `store`.
    pub fn new(store: Arc<dyn FileStore>, config: EngineConfig) -> Self {
        let engine = Arc::new(StorageEngine::new(
            Arc::clone(&store),
            config.clone(),
            Arc::new(EngineStats::new()),
        ));
        Self {
            store,
            engine,
            config,
        }
    }

    /// Creates an engine over a fresh in-memory store.
    pub fn memory(config: EngineConfig) -> Self {
        Self::new(Arc::new(flashlog_storage::InMemoryStore::new()), config)
    }

    /// Registers a session log.
    pub fn add_session(&self, id: u8, item: ItemType) -> SessionId {
        let header = test_header(id, item);
        self.engine.register(header);
        header.session_id
    }

    /// Reads every unread byte without consuming it.
    pub fn read_all(&self, id: SessionId) -> Vec<u8> {
        let unread = self.engine.num_bytes(id) as usize;
        let mut buf = vec![0u8; unread];
        let len = self
            .engine
            .read(id, Some(&mut buf), unread)
            .map_or(0, |outcome| outcome.len);
        buf.truncate(len);
        buf
    }

    /// Starts a new engine over the same files and rebuilds it, as a device
    /// does after a restart. Returns the new fixture and the restored headers.
    ///
    /// # Errors
    ///
    /// Returns the rebuild error.
    pub fn reboot(&self) -> CoreResult<(Self, Vec<FileHeader>)> {
        let fixture = Self::new(Arc::clone(&self.store), self.config.clone());
        let restored = fixture.engine.rebuild()?;
        Ok((fixture, restored))
    }
}

/// A directory store in a temporary directory, removed on drop.
pub struct TempDirStore {
    /// The store.
    pub store: Arc<DirectoryStore>,
    dir: TempDir,
}

impl TempDirStore {
    /// Creates an empty store.
    ///
    /// # Panics
    ///
    /// Panics if the temporary directory cannot be created.
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let store = DirectoryStore::open(dir.path(), true).expect("Failed to open store");
        Self {
            store: Arc::new(store),
            dir,
        }
    }

    /// Returns the directory path.
    pub fn path(&self) -> &std::path::Path {
        self.dir.path()
    }
}

impl Default for TempDirStore {
    fn default() -> Self {
        Self::new()
    }
}
