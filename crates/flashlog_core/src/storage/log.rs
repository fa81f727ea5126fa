//! One session's log file and its read cursor.

use crate::error::{CoreError, CoreResult};
use crate::storage::format::{
    chunked_len, encode_chunks, ChunkHeader, ChunkWalker, FileHeader, WalkEnd, HEADER_SIZE,
};
use flashlog_storage::{FlashFile, ERASED_BYTE};

/// Position and accounting of a session's log.
///
/// # Invariant
///
/// `num_bytes + read_skip` equals the live payload between `read_offset` and
/// `write_offset`. `read_skip` counts live bytes at `read_offset` that were
/// already delivered but whose chunk is not yet tombstoned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageCursor {
    /// Offset of the first unwritten byte.
    pub write_offset: u64,
    /// Offset of the first chunk that may hold unread bytes.
    pub read_offset: u64,
    /// Delivered live bytes at `read_offset`.
    pub read_skip: u32,
    /// Unread payload bytes.
    pub num_bytes: u32,
}

/// Result of [`SessionLog::read`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Bytes returned, always a whole number of items.
    pub len: usize,
    /// Chunk offset just past the returned bytes.
    pub offset: u64,
    /// Live bytes to skip at `offset`.
    pub skip: u32,
    /// Drop generation of the log when the bytes were read.
    pub generation: u64,
}

/// Totals from a forward scan of a log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogScan {
    /// Offset where the chunk sequence ends.
    pub write_offset: u64,
    /// Payload bytes in live chunks.
    pub live_bytes: u64,
    /// Payload bytes in tombstoned chunks.
    pub tombstoned_bytes: u64,
    /// Number of live chunks.
    pub live_chunks: usize,
    /// Number of tombstoned chunks.
    pub tombstoned_chunks: usize,
    /// Why the scan stopped.
    pub end: WalkEnd,
}

impl LogScan {
    /// Returns true if the chunk sequence ends cleanly.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        matches!(self.end, WalkEnd::Erased | WalkEnd::EndOfRegion)
    }
}

/// Walks every chunk after the header of `file`.
pub fn scan_log(file: &dyn FlashFile) -> CoreResult<LogScan> {
    let size = file.size();
    if size < HEADER_SIZE as u64 {
        return Err(CoreError::corrupted("file shorter than its header"));
    }
    let region = file.read_vec(HEADER_SIZE as u64, (size - HEADER_SIZE as u64) as usize)?;
    let mut walker = ChunkWalker::new(&region, HEADER_SIZE as u64);
    let mut scan = LogScan {
        write_offset: HEADER_SIZE as u64,
        live_bytes: 0,
        tombstoned_bytes: 0,
        live_chunks: 0,
        tombstoned_chunks: 0,
        end: WalkEnd::Running,
    };
    for chunk in walker.by_ref() {
        if chunk.live {
            scan.live_bytes += chunk.len as u64;
            scan.live_chunks += 1;
        } else {
            scan.tombstoned_bytes += chunk.len as u64;
            scan.tombstoned_chunks += 1;
        }
    }
    scan.write_offset = walker.offset();
    scan.end = walker.end();
    Ok(scan)
}

/// A session's log: header, lazily created file and cursor.
pub(crate) struct SessionLog {
    pub(crate) header: FileHeader,
    pub(crate) file: Option<Box<dyn FlashFile>>,
    pub(crate) cursor: StorageCursor,
    /// Bumped whenever unread bytes are discarded without delivery.
    pub(crate) generation: u64,
}

impl SessionLog {
    pub(crate) fn new(header: FileHeader) -> Self {
        Self {
            header,
            file: None,
            cursor: StorageCursor::default(),
            generation: 0,
        }
    }

    /// Restores a log from an existing file and resynchronizes its cursor.
    ///
    /// Tombstones only record whole chunks, so the delivered part of a
    /// partially consumed chunk is inferred from item alignment. Delivery
    /// always retires whole items, which makes the smallest item-aligned
    /// total not below the tombstoned bytes the best estimate.
    pub(crate) fn recover(header: FileHeader, file: Box<dyn FlashFile>) -> CoreResult<Self> {
        let scan = scan_log(file.as_ref())?;
        let item = u64::from(header.item.size);
        let skip = ((item - scan.tombstoned_bytes % item) % item).min(scan.live_bytes);
        let unread = scan.live_bytes - skip;
        let unread = unread - unread % item;

        let mut log = Self {
            header,
            file: Some(file),
            cursor: StorageCursor {
                write_offset: scan.write_offset,
                read_offset: HEADER_SIZE as u64,
                read_skip: (scan.live_bytes - unread) as u32,
                num_bytes: unread as u32,
            },
            generation: 0,
        };
        log.consume(0)?;
        Ok(log)
    }

    pub(crate) fn item_size(&self) -> usize {
        usize::from(self.header.item.size)
    }

    pub(crate) fn file_size(&self) -> u64 {
        self.file.as_ref().map_or(0, |f| f.size())
    }

    pub(crate) fn free_space(&self) -> u64 {
        self.file_size().saturating_sub(self.cursor.write_offset)
    }

    /// Bytes a rewrite needs for the header and the unread bytes.
    pub(crate) fn live_footprint(&self) -> u64 {
        (HEADER_SIZE + chunked_len(self.cursor.num_bytes as usize)) as u64
    }

    /// Forgets the file and all bytes in it.
    pub(crate) fn reset(&mut self) {
        self.file = None;
        self.cursor = StorageCursor::default();
        self.generation += 1;
    }

    /// Creates the file contents for a fresh log.
    pub(crate) fn initialize(&mut self, mut file: Box<dyn FlashFile>) -> CoreResult<()> {
        file.write_at(0, &self.header.encode())?;
        file.sync()?;
        self.file = Some(file);
        self.cursor = StorageCursor {
            write_offset: HEADER_SIZE as u64,
            read_offset: HEADER_SIZE as u64,
            read_skip: 0,
            num_bytes: 0,
        };
        Ok(())
    }

    /// Appends `data` as live chunks. The caller ensures there is room.
    ///
    /// The first header byte is written last, so a torn append leaves an
    /// erased byte where the new chunks begin.
    pub(crate) fn append(&mut self, data: &[u8]) -> CoreResult<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| CoreError::corrupted("append without a file"))?;
        let mut region = encode_chunks(data);
        let Some(first) = region.first().copied() else {
            return Ok(());
        };
        region[0] = ERASED_BYTE;

        let offset = self.cursor.write_offset;
        file.write_at(offset, &region)?;
        file.write_at(offset, &[first])?;
        file.sync()?;

        self.cursor.write_offset += region.len() as u64;
        self.cursor.num_bytes += data.len() as u32;
        Ok(())
    }

    /// Reads the unread region, growing the window until it holds at least
    /// `live_needed` live bytes or reaches `write_offset`.
    fn load_region(&self, live_needed: usize) -> CoreResult<Vec<u8>> {
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| CoreError::corrupted("read without a file"))?;
        let region_len = (self.cursor.write_offset - self.cursor.read_offset) as usize;
        let mut window = region_len.min(2 * live_needed + 2);
        loop {
            let region = file.read_vec(self.cursor.read_offset, window)?;
            if window == region_len {
                return Ok(region);
            }
            let live: usize = ChunkWalker::new(&region, self.cursor.read_offset)
                .filter(|c| c.live)
                .map(|c| c.len)
                .sum();
            if live >= live_needed {
                return Ok(region);
            }
            window = region_len.min(window * 2);
        }
    }

    /// Copies up to `max` unread bytes into `buf`, or only measures them if
    /// `buf` is `None`. The count is rounded down to whole items.
    pub(crate) fn read(&self, buf: Option<&mut [u8]>, max: usize) -> CoreResult<ReadOutcome> {
        let mut want = max.min(self.cursor.num_bytes as usize);
        if let Some(buf) = buf.as_deref() {
            want = want.min(buf.len());
        }
        want -= want % self.item_size();

        let mut outcome = ReadOutcome {
            len: 0,
            offset: self.cursor.read_offset,
            skip: self.cursor.read_skip,
            generation: self.generation,
        };
        if want == 0 {
            return Ok(outcome);
        }

        let skip = self.cursor.read_skip as usize;
        let region = self.load_region(skip + want)?;
        let base = self.cursor.read_offset;
        let mut to_skip = skip;
        let mut copied = 0usize;
        let mut out = buf;

        for chunk in ChunkWalker::new(&region, base) {
            if !chunk.live {
                continue;
            }
            let at = (chunk.payload_offset() - base) as usize;
            let payload = &region[at..at + chunk.len];
            let start = to_skip.min(chunk.len);
            to_skip -= start;
            let take = (chunk.len - start).min(want - copied);
            if let Some(out) = out.as_deref_mut() {
                out[copied..copied + take].copy_from_slice(&payload[start..start + take]);
            }
            copied += take;

            if copied == want {
                let used = start + take;
                if used == chunk.len {
                    outcome.offset = chunk.end();
                    outcome.skip = 0;
                } else {
                    outcome.offset = chunk.offset;
                    outcome.skip = used as u32;
                }
                outcome.len = copied;
                return Ok(outcome);
            }
        }

        Err(CoreError::corrupted(format!(
            "log ended after {copied} of {want} unread bytes"
        )))
    }

    /// Retires `n` unread bytes, tombstoning every chunk they empty.
    ///
    /// `consume(0)` only resynchronizes: it tombstones chunks that hold no
    /// undelivered bytes and moves `read_offset` to the first chunk that
    /// does. `num_bytes` is unchanged.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds `num_bytes`.
    pub(crate) fn consume(&mut self, n: usize) -> CoreResult<()> {
        assert!(
            n <= self.cursor.num_bytes as usize,
            "consume({n}) exceeds {} unread bytes in {}",
            self.cursor.num_bytes,
            self.header.session_id
        );
        if self.file.is_none() {
            return Ok(());
        }

        let mut remaining = self.cursor.read_skip as usize + n;
        let region = self.load_region(remaining + 1)?;
        let mut walker = ChunkWalker::new(&region, self.cursor.read_offset);
        let mut tombstones = Vec::new();
        let mut position = None;

        for chunk in walker.by_ref() {
            if !chunk.live {
                continue;
            }
            if remaining < chunk.len {
                position = Some((chunk.offset, remaining));
                break;
            }
            tombstones.push((chunk.offset, chunk.len));
            remaining -= chunk.len;
        }

        let (offset, skip) = position.unwrap_or((walker.offset(), 0));
        if position.is_none() && remaining > 0 {
            return Err(CoreError::corrupted(format!(
                "log ended {remaining} bytes short while consuming"
            )));
        }

        if let Some(file) = self.file.as_mut() {
            for &(offset, len) in &tombstones {
                file.write_at(offset, &[ChunkHeader::tombstone_byte(len as u8)])?;
            }
            if !tombstones.is_empty() {
                file.sync()?;
            }
        }

        self.cursor.read_offset = offset;
        self.cursor.read_skip = skip as u32;
        self.cursor.num_bytes -= n as u32;
        Ok(())
    }

    /// Returns every unread byte.
    pub(crate) fn unread(&self) -> CoreResult<Vec<u8>> {
        let len = self.cursor.num_bytes as usize;
        let mut buf = vec![0u8; len];
        let outcome = self.read(Some(&mut buf), len)?;
        buf.truncate(outcome.len);
        Ok(buf)
    }

    /// Rewrites the log into `file`, keeping only unread bytes.
    ///
    /// `file` must be a freshly created scratch file of sufficient size.
    pub(crate) fn rewrite_into(&self, file: &mut dyn FlashFile) -> CoreResult<StorageCursor> {
        let unread = self.unread()?;
        let chunks = encode_chunks(&unread);
        file.write_at(0, &self.header.encode())?;
        file.write_at(HEADER_SIZE as u64, &chunks)?;
        file.sync()?;
        Ok(StorageCursor {
            write_offset: (HEADER_SIZE + chunks.len()) as u64,
            read_offset: HEADER_SIZE as u64,
            read_skip: 0,
            num_bytes: unread.len() as u32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ItemType, SessionId};
    use flashlog_storage::{FileStore, InMemoryStore};
    use uuid::Uuid;

    fn new_log(store: &InMemoryStore, item: ItemType, size: u64) -> SessionLog {
        let header = FileHeader {
            session_id: SessionId::new(1),
            timestamp: 100,
            tag: 9,
            owner: Uuid::nil(),
            item,
        };
        let mut log = SessionLog::new(header);
        log.initialize(store.create("flog_001", size).unwrap()).unwrap();
        log
    }

    fn read_all(log: &SessionLog) -> Vec<u8> {
        let mut buf = vec![0u8; 4096];
        let outcome = log.read(Some(&mut buf), 4096).unwrap();
        buf.truncate(outcome.len);
        buf
    }

    #[test]
    fn append_then_read() {
        let store = InMemoryStore::new();
        let mut log = new_log(&store, ItemType::unsigned(1), 512);
        log.append(&[1, 2, 3]).unwrap();
        log.append(&[4, 5]).unwrap();

        assert_eq!(log.cursor.num_bytes, 5);
        assert_eq!(log.cursor.write_offset, (HEADER_SIZE + 7) as u64);
        assert_eq!(read_all(&log), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn read_rounds_down_to_whole_items() {
        let store = InMemoryStore::new();
        let mut log = new_log(&store, ItemType::unsigned(4), 512);
        log.append(&[0u8; 12]).unwrap();

        let outcome = log.read(None, 10).unwrap();
        assert_eq!(outcome.len, 8);
        assert_eq!(outcome.skip, 8);
        assert_eq!(outcome.offset, HEADER_SIZE as u64);

        assert_eq!(log.read(None, 3).unwrap().len, 0);
    }

    #[test]
    fn read_spans_chunks() {
        let store = InMemoryStore::new();
        let mut log = new_log(&store, ItemType::byte_array(50), 1024);
        let data: Vec<u8> = (0..250u32).map(|i| i as u8).collect();
        log.append(&data).unwrap();

        assert_eq!(read_all(&log), data);
        let outcome = log.read(None, 200).unwrap();
        assert_eq!(outcome.len, 200);
        // 200 bytes end exactly after the second chunk.
        assert_eq!(outcome.offset, (HEADER_SIZE + 202) as u64);
        assert_eq!(outcome.skip, 0);
    }

    #[test]
    fn consume_tombstones_whole_chunks_only() {
        let store = InMemoryStore::new();
        let mut log = new_log(&store, ItemType::byte_array(50), 1024);
        let data: Vec<u8> = (0..250u32).map(|i| i as u8).collect();
        log.append(&data).unwrap();

        log.consume(150).unwrap();
        assert_eq!(log.cursor.num_bytes, 100);
        assert_eq!(log.cursor.read_offset, (HEADER_SIZE + 101) as u64);
        assert_eq!(log.cursor.read_skip, 50);
        assert_eq!(read_all(&log), data[150..].to_vec());

        let contents = store.contents("flog_001").unwrap();
        assert_eq!(contents[HEADER_SIZE], ChunkHeader::tombstone_byte(100));
        assert_eq!(contents[HEADER_SIZE + 101], ChunkHeader::live_byte(100));
    }

    #[test]
    fn consume_everything_leaves_nothing_to_read() {
        let store = InMemoryStore::new();
        let mut log = new_log(&store, ItemType::unsigned(2), 512);
        log.append(&[1, 0, 2, 0]).unwrap();
        log.consume(4).unwrap();

        assert_eq!(log.cursor.num_bytes, 0);
        assert_eq!(log.cursor.read_offset, log.cursor.write_offset);
        assert_eq!(log.read(None, 100).unwrap().len, 0);
    }

    #[test]
    #[should_panic(expected = "exceeds")]
    fn consume_more_than_available_panics() {
        let store = InMemoryStore::new();
        let mut log = new_log(&store, ItemType::unsigned(1), 512);
        log.append(&[1]).unwrap();
        let _ = log.consume(2);
    }

    #[test]
    fn resync_is_idempotent() {
        let store = InMemoryStore::new();
        let mut log = new_log(&store, ItemType::byte_array(30), 1024);
        log.append(&[7u8; 240]).unwrap();
        log.consume(120).unwrap();

        let before = log.cursor;
        log.consume(0).unwrap();
        let once = log.cursor;
        log.consume(0).unwrap();

        assert_eq!(once.num_bytes, before.num_bytes);
        assert_eq!(log.cursor, once);
    }

    #[test]
    fn recover_matches_live_cursor() {
        let store = InMemoryStore::new();
        let mut log = new_log(&store, ItemType::byte_array(25), 1024);
        let data: Vec<u8> = (0..300u32).map(|i| (i % 251) as u8).collect();
        log.append(&data).unwrap();
        log.consume(200).unwrap();

        let header = log.header;
        let file = store.open("flog_001").unwrap();
        let recovered = SessionLog::recover(header, file).unwrap();

        assert_eq!(recovered.cursor.num_bytes, 100);
        assert_eq!(recovered.cursor.write_offset, log.cursor.write_offset);
        assert_eq!(read_all(&recovered), data[200..].to_vec());
    }

    #[test]
    fn recover_redelivers_partial_chunk_up_to_item_boundary() {
        let store = InMemoryStore::new();
        let mut log = new_log(&store, ItemType::unsigned(4), 1024);
        log.append(&[1u8; 120]).unwrap();
        // 40 bytes consumed inside the first chunk, nothing tombstoned.
        log.consume(40).unwrap();

        let file = store.open("flog_001").unwrap();
        let recovered = SessionLog::recover(log.header, file).unwrap();
        assert_eq!(recovered.cursor.num_bytes, 120);
    }

    #[test]
    fn torn_append_is_invisible() {
        let store = InMemoryStore::new();
        let mut log = new_log(&store, ItemType::unsigned(1), 512);
        log.append(&[1, 2]).unwrap();

        // Payload written but header byte never committed.
        let mut raw = store.contents("flog_001").unwrap();
        let at = log.cursor.write_offset as usize;
        raw[at] = ERASED_BYTE;
        raw[at + 1] = 3;
        store.insert("flog_001", raw);

        let scan = scan_log(store.open("flog_001").unwrap().as_ref()).unwrap();
        assert_eq!(scan.live_bytes, 2);
        assert_eq!(scan.write_offset, log.cursor.write_offset);
        assert!(scan.is_clean());
    }

    #[test]
    fn rewrite_keeps_only_unread_bytes() {
        let store = InMemoryStore::new();
        let mut log = new_log(&store, ItemType::unsigned(1), 512);
        log.append(&[1, 2, 3, 4, 5]).unwrap();
        log.consume(3).unwrap();

        let mut scratch = store.create("flog_001.tmp", 64).unwrap();
        let cursor = log.rewrite_into(scratch.as_mut()).unwrap();
        assert_eq!(cursor.num_bytes, 2);
        assert_eq!(cursor.write_offset, (HEADER_SIZE + 3) as u64);

        log.file = Some(scratch);
        log.cursor = cursor;
        assert_eq!(read_all(&log), vec![4, 5]);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn appends_and_consumes_follow_a_byte_queue(
                steps in prop::collection::vec(
                    (prop::collection::vec(any::<u8>(), 1..=150), 0usize..=200),
                    1..=12,
                )
            ) {
                let store = InMemoryStore::new();
                let mut log = new_log(&store, ItemType::unsigned(1), 4096);
                let mut model: Vec<u8> = Vec::new();
                for (data, consume) in &steps {
                    log.append(data).unwrap();
                    model.extend_from_slice(data);
                    let n = (*consume).min(model.len());
                    log.consume(n).unwrap();
                    model.drain(..n);
                }
                prop_assert_eq!(log.cursor.num_bytes as usize, model.len());
                prop_assert_eq!(read_all(&log), model.clone());

                let file = store.open("flog_001").unwrap();
                let recovered = SessionLog::recover(log.header, file).unwrap();
                prop_assert!(read_all(&recovered).ends_with(&model));
            }
        }
    }
}
