//! Storage engine over all session logs.

use crate::config::EngineConfig;
use crate::error::{CoreError, CoreResult};
use crate::stats::EngineStats;
use crate::storage::format::{
    chunked_len, classify, file_name, scratch_name, FileHeader, FileKind, FILE_PREFIX,
    HEADER_SIZE,
};
use crate::storage::log::{ReadOutcome, SessionLog, StorageCursor};
use crate::types::SessionId;
use flashlog_storage::FileStore;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Appends, reads and retires session records on flash.
///
/// The engine owns one [`SessionLog`] per registered session. A single lock
/// guards all of them, so at most one flash operation runs at a time. The
/// lock is a leaf: nothing else is acquired while it is held.
///
/// ## Fault containment
///
/// A flash failure while touching a session's file discards that file and
/// resets the session's log. Callers see an empty log, never the error.
pub struct StorageEngine {
    pub(crate) store: Arc<dyn FileStore>,
    pub(crate) config: EngineConfig,
    pub(crate) stats: Arc<EngineStats>,
    pub(crate) logs: Mutex<BTreeMap<SessionId, SessionLog>>,
}

impl StorageEngine {
    /// Creates an engine over `store`.
    pub fn new(store: Arc<dyn FileStore>, config: EngineConfig, stats: Arc<EngineStats>) -> Self {
        Self {
            store,
            config,
            stats,
            logs: Mutex::new(BTreeMap::new()),
        }
    }

    /// Returns the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the shared statistics.
    pub fn stats(&self) -> &Arc<EngineStats> {
        &self.stats
    }

    /// Registers a session. Its file is created on the first write.
    pub fn register(&self, header: FileHeader) {
        let mut logs = self.logs.lock();
        debug_assert!(!logs.contains_key(&header.session_id));
        logs.insert(header.session_id, SessionLog::new(header));
    }

    /// Returns true if the session is registered.
    pub fn contains(&self, id: SessionId) -> bool {
        self.logs.lock().contains_key(&id)
    }

    /// Returns the file header of a registered session.
    pub fn header(&self, id: SessionId) -> Option<FileHeader> {
        self.logs.lock().get(&id).map(|log| log.header)
    }

    /// Returns the cursor of a registered session.
    pub fn cursor(&self, id: SessionId) -> Option<StorageCursor> {
        self.logs.lock().get(&id).map(|log| log.cursor)
    }

    /// Returns the unread byte count, or 0 for unknown sessions.
    pub fn num_bytes(&self, id: SessionId) -> u32 {
        self.logs.lock().get(&id).map_or(0, |log| log.cursor.num_bytes)
    }

    /// Returns the drop generation of a session's log.
    pub fn generation(&self, id: SessionId) -> Option<u64> {
        self.logs.lock().get(&id).map(|log| log.generation)
    }

    /// Appends `data` to a session's log.
    ///
    /// Makes room first, growing the file, compacting other sessions or
    /// finally dropping old unread bytes of this session.
    ///
    /// # Errors
    ///
    /// - [`CoreError::UnknownSession`] if the session is not registered
    /// - [`CoreError::ResourceExhausted`] if `data` cannot fit in the quota
    ///   even with this session emptied
    pub fn write(&self, id: SessionId, data: &[u8]) -> CoreResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut logs = self.logs.lock();
        if !logs.contains_key(&id) {
            return Err(CoreError::UnknownSession { session: id.as_u8() });
        }

        let need = chunked_len(data.len()) as u64;
        if let Err(err) = self.ensure_room(&mut logs, id, need) {
            return self.contain(&mut logs, id, err);
        }

        let Some(log) = logs.get_mut(&id) else {
            return Err(CoreError::UnknownSession { session: id.as_u8() });
        };
        match log.append(data) {
            Ok(()) => {
                self.stats.record_write(data.len() as u64);
                debug!(session = %id, bytes = data.len(), "appended");
                Ok(())
            }
            Err(err) => self.contain(&mut logs, id, err),
        }
    }

    /// Reads up to `max` unread bytes into `buf`, or measures them when
    /// `buf` is `None`. Never returns a partial item.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownSession`] if the session is not registered.
    pub fn read(&self, id: SessionId, buf: Option<&mut [u8]>, max: usize) -> CoreResult<ReadOutcome> {
        let mut logs = self.logs.lock();
        let log = logs
            .get(&id)
            .ok_or(CoreError::UnknownSession { session: id.as_u8() })?;
        match log.read(buf, max) {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.contain(&mut logs, id, err)?;
                Ok(ReadOutcome {
                    generation: logs.get(&id).map_or(0, |log| log.generation),
                    ..ReadOutcome::default()
                })
            }
        }
    }

    /// Retires `n` unread bytes. `consume(0)` only resynchronizes.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownSession`] if the session is not registered.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the unread byte count.
    pub fn consume(&self, id: SessionId, n: usize) -> CoreResult<()> {
        let mut logs = self.logs.lock();
        let log = logs
            .get_mut(&id)
            .ok_or(CoreError::UnknownSession { session: id.as_u8() })?;
        match log.consume(n) {
            Ok(()) => {
                self.stats.record_consume(n as u64);
                Ok(())
            }
            Err(err) => self.contain(&mut logs, id, err),
        }
    }

    /// Retires bytes the host acknowledged, unless the log dropped data
    /// since they were read.
    ///
    /// Returns false if the acknowledgement was stale and nothing was retired.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownSession`] if the session is not registered.
    pub fn acknowledge(&self, id: SessionId, n: usize, generation: u64) -> CoreResult<bool> {
        let mut logs = self.logs.lock();
        let log = logs
            .get_mut(&id)
            .ok_or(CoreError::UnknownSession { session: id.as_u8() })?;
        if log.generation != generation || n > log.cursor.num_bytes as usize {
            debug!(session = %id, bytes = n, "stale acknowledgement ignored");
            return Ok(false);
        }
        match log.consume(n) {
            Ok(()) => {
                self.stats.record_consume(n as u64);
                Ok(true)
            }
            Err(err) => self.contain(&mut logs, id, err).map(|()| false),
        }
    }

    /// Discards every unread byte of a session.
    ///
    /// Returns the number of bytes dropped.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownSession`] if the session is not registered.
    pub fn drop_unread(&self, id: SessionId) -> CoreResult<u32> {
        let mut logs = self.logs.lock();
        let log = logs
            .get_mut(&id)
            .ok_or(CoreError::UnknownSession { session: id.as_u8() })?;
        let n = log.cursor.num_bytes;
        if n == 0 {
            return Ok(0);
        }
        match log.consume(n as usize) {
            Ok(()) => {
                log.generation += 1;
                self.stats.record_drop(u64::from(n));
                warn!(session = %id, bytes = n, "dropped undelivered bytes");
                Ok(n)
            }
            Err(err) => self.contain(&mut logs, id, err).map(|()| n),
        }
    }

    /// Unregisters a session and removes its file.
    pub fn remove(&self, id: SessionId) {
        let mut logs = self.logs.lock();
        if let Some(log) = logs.remove(&id) {
            if log.file.is_some() {
                self.remove_files(id);
            }
            debug!(session = %id, "session log removed");
        }
    }

    /// Returns the bytes occupied by all session files.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be enumerated.
    pub fn quota_used(&self) -> CoreResult<u64> {
        let mut used = 0u64;
        for name in self.store.list_by_prefix(FILE_PREFIX)? {
            match self.store.file_size(&name) {
                Ok(size) => used += size,
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(used)
    }

    /// Restores the logs found in the store.
    ///
    /// Scratch files, files whose header does not verify, and files with
    /// nothing left to deliver are removed. Returns the headers of restored
    /// sessions in id order.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be enumerated.
    pub fn rebuild(&self) -> CoreResult<Vec<FileHeader>> {
        let mut logs = self.logs.lock();
        let mut restored = Vec::new();

        for name in self.store.list_by_prefix(FILE_PREFIX)? {
            let id = match classify(&name) {
                FileKind::Data(id) => id,
                FileKind::Scratch => {
                    info!(file = %name, "removing leftover scratch file");
                    self.remove_file(&name);
                    continue;
                }
                FileKind::Unknown => continue,
            };
            if logs.contains_key(&id) {
                continue;
            }

            match self.recover_file(&name, id) {
                Ok(Some(log)) => {
                    debug!(
                        session = %id,
                        bytes = log.cursor.num_bytes,
                        "restored session log"
                    );
                    restored.push(log.header);
                    logs.insert(id, log);
                }
                Ok(None) => {
                    debug!(session = %id, "session fully delivered, removing file");
                    self.remove_file(&name);
                }
                Err(err) => {
                    warn!(file = %name, error = %err, "removing unreadable session file");
                    self.stats.record_storage_fault();
                    self.remove_file(&name);
                }
            }
        }

        info!(sessions = restored.len(), "rebuild complete");
        Ok(restored)
    }

    fn recover_file(&self, name: &str, id: SessionId) -> CoreResult<Option<SessionLog>> {
        let file = self.store.open(name)?;
        if file.size() < HEADER_SIZE as u64 {
            return Err(CoreError::corrupted("file shorter than its header"));
        }
        let header = FileHeader::decode(&file.read_vec(0, HEADER_SIZE)?)?;
        if header.session_id != id {
            return Err(CoreError::corrupted(format!(
                "header names {} but file is {name}",
                header.session_id
            )));
        }
        let log = SessionLog::recover(header, file)?;
        if log.cursor.num_bytes == 0 {
            return Ok(None);
        }
        Ok(Some(log))
    }

    /// Makes sure `need` bytes can be appended to the session's file.
    fn ensure_room(
        &self,
        logs: &mut BTreeMap<SessionId, SessionLog>,
        id: SessionId,
        need: u64,
    ) -> CoreResult<()> {
        let mut compacted_others = false;
        loop {
            let log = logs
                .get(&id)
                .ok_or(CoreError::UnknownSession { session: id.as_u8() })?;
            if log.file.is_some() && log.free_space() >= need {
                return Ok(());
            }

            for size in self.size_candidates(log, need) {
                if self.fits(log, size)? {
                    return self.materialize(logs, id, size);
                }
            }

            if !compacted_others {
                compacted_others = true;
                let required = log.live_footprint() + need;
                self.compact_others(logs, id, required)?;
                continue;
            }

            if log.cursor.num_bytes > 0 {
                self.drop_oldest_half(logs, id)?;
                continue;
            }

            return Err(CoreError::resource_exhausted(format!(
                "{need} bytes do not fit in the {}-byte quota",
                self.config.quota_bytes
            )));
        }
    }

    /// File sizes to try for a log needing `need` more bytes, preferred first.
    fn size_candidates(&self, log: &SessionLog, need: u64) -> Vec<u64> {
        let live = log.live_footprint();
        let required = live + need;
        let preferred = if log.file.is_none() {
            required.max(self.config.initial_file_size)
        } else {
            let target = required.max(live * 3 / 2);
            let free = (target - required).clamp(self.config.min_free_bytes, self.config.max_free_bytes);
            required + free
        };
        if preferred == required {
            vec![required]
        } else {
            vec![preferred, required]
        }
    }

    /// Returns true if replacing the session's file with one of `size` bytes
    /// keeps all files within the quota.
    fn fits(&self, log: &SessionLog, size: u64) -> CoreResult<bool> {
        let others = self.quota_used()?.saturating_sub(log.file_size());
        Ok(others + size <= self.config.quota_bytes)
    }

    /// Creates the session's file or rewrites it at `size` bytes.
    fn materialize(
        &self,
        logs: &mut BTreeMap<SessionId, SessionLog>,
        id: SessionId,
        size: u64,
    ) -> CoreResult<()> {
        let log = logs
            .get_mut(&id)
            .ok_or(CoreError::UnknownSession { session: id.as_u8() })?;
        if log.file.is_none() {
            let file = self.store.create(&file_name(id), size)?;
            log.initialize(file)?;
            debug!(session = %id, size, "created session file");
            return Ok(());
        }
        self.rewrite(log, size)?;
        debug!(session = %id, size, "resized session file");
        Ok(())
    }

    /// Rewrites a log into a new file of `size` bytes holding only unread
    /// bytes, then swaps it in.
    pub(crate) fn rewrite(&self, log: &mut SessionLog, size: u64) -> CoreResult<()> {
        let id = log.header.session_id;
        let scratch = scratch_name(id);
        let mut file = self.store.create(&scratch, size)?;
        let cursor = match log.rewrite_into(file.as_mut()) {
            Ok(cursor) => cursor,
            Err(err) => {
                drop(file);
                self.remove_file(&scratch);
                return Err(err);
            }
        };
        log.file = None;
        self.store.rename(&scratch, &file_name(id))?;
        log.file = Some(file);
        log.cursor = cursor;
        Ok(())
    }

    /// Drops about half of the session's unread bytes, oldest first.
    fn drop_oldest_half(
        &self,
        logs: &mut BTreeMap<SessionId, SessionLog>,
        id: SessionId,
    ) -> CoreResult<()> {
        let log = logs
            .get_mut(&id)
            .ok_or(CoreError::UnknownSession { session: id.as_u8() })?;
        let unread = log.cursor.num_bytes as usize;
        let item = log.item_size();
        let mut n = unread / 2;
        n -= n % item;
        if n == 0 {
            n = unread;
        }
        log.consume(n)?;
        log.generation += 1;
        self.stats.record_drop(n as u64);
        warn!(
            session = %id,
            bytes = n,
            remaining = log.cursor.num_bytes,
            "quota exhausted, dropped oldest unread bytes"
        );
        Ok(())
    }

    /// Handles a failure while touching a session's log.
    ///
    /// Flash and format errors are contained by discarding the log. Every
    /// other error is returned to the caller.
    fn contain(
        &self,
        logs: &mut BTreeMap<SessionId, SessionLog>,
        id: SessionId,
        err: CoreError,
    ) -> CoreResult<()> {
        if !is_fault(&err) {
            return Err(err);
        }
        if let Some(log) = logs.get_mut(&id) {
            let lost = log.cursor.num_bytes;
            error!(
                session = %id,
                error = %err,
                lost_bytes = lost,
                "flash fault, discarding session log"
            );
            self.stats.record_storage_fault();
            self.stats.record_drop(u64::from(lost));
            log.reset();
            self.remove_files(id);
        }
        Ok(())
    }

    pub(crate) fn contain_fault(&self, log: &mut SessionLog, err: &CoreError) {
        let id = log.header.session_id;
        error!(session = %id, error = %err, "flash fault during compaction, discarding session log");
        self.stats.record_storage_fault();
        self.stats.record_drop(u64::from(log.cursor.num_bytes));
        log.reset();
        self.remove_files(id);
    }

    fn remove_files(&self, id: SessionId) {
        self.remove_file(&file_name(id));
        self.remove_file(&scratch_name(id));
    }

    fn remove_file(&self, name: &str) {
        match self.store.remove(name) {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => warn!(file = %name, error = %err, "failed to remove file"),
        }
    }
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("sessions", &self.logs.lock().len())
            .field("quota_bytes", &self.config.quota_bytes)
            .finish()
    }
}

/// Returns true for errors caused by flash I/O or on-flash data.
pub(crate) fn is_fault(err: &CoreError) -> bool {
    matches!(
        err,
        CoreError::Storage(_)
            | CoreError::Corrupted { .. }
            | CoreError::ChecksumMismatch { .. }
            | CoreError::StorageFault { .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ItemType;
    use flashlog_storage::InMemoryStore;
    use uuid::Uuid;

    fn header(id: u8, item: ItemType, timestamp: u32) -> FileHeader {
        FileHeader {
            session_id: SessionId::new(id),
            timestamp,
            tag: u32::from(id),
            owner: Uuid::nil(),
            item,
        }
    }

    fn engine_with(store: &InMemoryStore, config: EngineConfig) -> StorageEngine {
        StorageEngine::new(Arc::new(store.clone()), config, Arc::new(EngineStats::new()))
    }

    fn read_all(engine: &StorageEngine, id: SessionId) -> Vec<u8> {
        let mut buf = vec![0u8; 1 << 16];
        let outcome = engine.read(id, Some(&mut buf), 1 << 16).unwrap();
        buf.truncate(outcome.len);
        buf
    }

    #[test]
    fn file_is_created_lazily() {
        let store = InMemoryStore::new();
        let engine = engine_with(&store, EngineConfig::default());
        let id = SessionId::new(3);
        engine.register(header(3, ItemType::unsigned(1), 0));
        assert_eq!(store.file_count(), 0);

        engine.write(id, &[1, 2, 3]).unwrap();
        assert_eq!(store.file_count(), 1);
        assert_eq!(store.total_size(), 4096);
        assert_eq!(read_all(&engine, id), vec![1, 2, 3]);
    }

    #[test]
    fn unknown_session_is_an_error() {
        let store = InMemoryStore::new();
        let engine = engine_with(&store, EngineConfig::default());
        assert!(matches!(
            engine.write(SessionId::new(1), &[1]),
            Err(CoreError::UnknownSession { session: 1 })
        ));
        assert!(engine.read(SessionId::new(1), None, 10).is_err());
    }

    #[test]
    fn growth_rewrites_with_free_band() {
        let store = InMemoryStore::new();
        let config = EngineConfig::new()
            .initial_file_size(128)
            .free_band(32, 64)
            .quota_bytes(4096);
        let engine = engine_with(&store, config);
        let id = SessionId::new(1);
        engine.register(header(1, ItemType::byte_array(10), 0));

        let data: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
        for piece in data.chunks(50) {
            engine.write(id, piece).unwrap();
        }

        let size = store.file_size("flog_001").unwrap();
        let cursor = engine.cursor(id).unwrap();
        assert!(cursor.write_offset <= size);
        assert!(size <= 4096);
        assert_eq!(read_all(&engine, id), data);
        assert!(store.contents("flog_001.tmp").is_none());
    }

    #[test]
    fn consumed_bytes_are_reclaimed_on_growth() {
        let store = InMemoryStore::new();
        let config = EngineConfig::new()
            .initial_file_size(128)
            .free_band(16, 16)
            .quota_bytes(4096);
        let engine = engine_with(&store, config);
        let id = SessionId::new(1);
        engine.register(header(1, ItemType::unsigned(1), 0));

        engine.write(id, &[1u8; 80]).unwrap();
        engine.consume(id, 80).unwrap();
        engine.write(id, &[2u8; 40]).unwrap();

        let cursor = engine.cursor(id).unwrap();
        assert_eq!(cursor.num_bytes, 40);
        assert_eq!(cursor.read_offset, HEADER_SIZE as u64);
        assert_eq!(read_all(&engine, id), vec![2u8; 40]);
    }

    #[test]
    fn quota_pressure_compacts_other_sessions() {
        let store = InMemoryStore::new();
        let config = EngineConfig::new()
            .initial_file_size(200)
            .free_band(8, 64)
            .quota_bytes(400);
        let engine = engine_with(&store, config);
        let a = SessionId::new(1);
        let b = SessionId::new(2);
        engine.register(header(1, ItemType::unsigned(1), 10));
        engine.register(header(2, ItemType::unsigned(1), 20));

        engine.write(a, &[1u8; 10]).unwrap();
        engine.write(b, &[2u8; 10]).unwrap();
        assert_eq!(engine.quota_used().unwrap(), 400);

        engine.write(b, &[3u8; 170]).unwrap();

        assert!(engine.quota_used().unwrap() <= 400);
        assert_eq!(store.file_size("flog_001").unwrap(), 52);
        assert_eq!(read_all(&engine, a), vec![1u8; 10]);
        let mut expected = vec![2u8; 10];
        expected.extend_from_slice(&[3u8; 170]);
        assert_eq!(read_all(&engine, b), expected);
        assert_eq!(engine.stats().bytes_dropped(), 0);
        assert_eq!(engine.stats().snapshot().compactions, 1);
    }

    #[test]
    fn quota_exhaustion_drops_oldest_half() {
        let store = InMemoryStore::new();
        let config = EngineConfig::new()
            .initial_file_size(128)
            .free_band(0, 0)
            .quota_bytes(256);
        let engine = engine_with(&store, config);
        let id = SessionId::new(1);
        engine.register(header(1, ItemType::unsigned(2), 0));

        let data: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
        engine.write(id, &data).unwrap();
        engine.write(id, &[0xAA; 40]).unwrap();

        assert!(engine.quota_used().unwrap() <= 256);
        assert!(engine.stats().bytes_dropped() > 0);
        let remaining = read_all(&engine, id);
        assert!(remaining.ends_with(&[0xAA; 40]));
        assert_eq!(remaining.len() % 2, 0);
    }

    #[test]
    fn oversized_write_is_resource_exhausted() {
        let store = InMemoryStore::new();
        let config = EngineConfig::new().initial_file_size(64).quota_bytes(128);
        let engine = engine_with(&store, config);
        engine.register(header(1, ItemType::unsigned(1), 0));
        assert!(matches!(
            engine.write(SessionId::new(1), &[0u8; 200]),
            Err(CoreError::ResourceExhausted { .. })
        ));
    }

    #[test]
    fn drop_unread_bumps_generation() {
        let store = InMemoryStore::new();
        let engine = engine_with(&store, EngineConfig::default());
        let id = SessionId::new(4);
        engine.register(header(4, ItemType::unsigned(4), 0));
        engine.write(id, &[0u8; 16]).unwrap();

        let outcome = engine.read(id, None, 8).unwrap();
        assert_eq!(engine.drop_unread(id).unwrap(), 16);
        assert_eq!(engine.num_bytes(id), 0);
        assert!(!engine.acknowledge(id, outcome.len, outcome.generation).unwrap());
        assert_eq!(engine.stats().bytes_dropped(), 16);
    }

    #[test]
    fn acknowledge_retires_read_bytes() {
        let store = InMemoryStore::new();
        let engine = engine_with(&store, EngineConfig::default());
        let id = SessionId::new(4);
        engine.register(header(4, ItemType::unsigned(4), 0));
        engine.write(id, &[0u8; 16]).unwrap();

        let outcome = engine.read(id, None, 8).unwrap();
        assert!(engine.acknowledge(id, outcome.len, outcome.generation).unwrap());
        assert_eq!(engine.num_bytes(id), 8);
    }

    #[test]
    fn corrupted_log_is_contained() {
        let store = InMemoryStore::new();
        let engine = engine_with(&store, EngineConfig::default());
        let id = SessionId::new(5);
        engine.register(header(5, ItemType::unsigned(1), 0));
        engine.write(id, &[1, 2, 3]).unwrap();

        let mut raw = store.contents("flog_005").unwrap();
        raw[HEADER_SIZE] = 0x00;
        store.insert("flog_005", raw);

        let outcome = engine.read(id, None, 10).unwrap();
        assert_eq!(outcome.len, 0);
        assert_eq!(engine.num_bytes(id), 0);
        assert!(store.contents("flog_005").is_none());
        assert_eq!(engine.stats().storage_faults(), 1);

        // The session keeps working with a fresh file.
        engine.write(id, &[9]).unwrap();
        assert_eq!(read_all(&engine, id), vec![9]);
    }

    #[test]
    fn rebuild_restores_undelivered_sessions() {
        let store = InMemoryStore::new();
        {
            let engine = engine_with(&store, EngineConfig::default());
            engine.register(header(1, ItemType::unsigned(1), 0));
            engine.register(header(2, ItemType::unsigned(1), 0));
            engine.write(SessionId::new(1), &[1]).unwrap();
            engine.write(SessionId::new(1), &[2, 3, 4]).unwrap();
            engine.consume(SessionId::new(1), 1).unwrap();
            engine.write(SessionId::new(2), &[5]).unwrap();
            engine.consume(SessionId::new(2), 1).unwrap();
        }
        store.insert("flog_009.tmp", vec![0xFF; 16]);
        store.insert("flog_010", vec![0x00; 64]);

        let engine = engine_with(&store, EngineConfig::default());
        let restored = engine.rebuild().unwrap();

        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].session_id, SessionId::new(1));
        assert_eq!(read_all(&engine, SessionId::new(1)), vec![2, 3, 4]);
        assert!(store.contents("flog_002").is_none());
        assert!(store.contents("flog_009.tmp").is_none());
        assert!(store.contents("flog_010").is_none());
    }

    #[test]
    fn remove_deletes_file() {
        let store = InMemoryStore::new();
        let engine = engine_with(&store, EngineConfig::default());
        engine.register(header(8, ItemType::unsigned(1), 0));
        engine.write(SessionId::new(8), &[1]).unwrap();
        engine.remove(SessionId::new(8));
        assert!(!engine.contains(SessionId::new(8)));
        assert_eq!(store.file_count(), 0);
    }
}
