//! On-flash session log format.
//!
//! ```text
//! | file header (33) | chunk | chunk | ... | 0xFF 0xFF ... |
//!
//! file header, little-endian:
//! | version (1) | session (1) | timestamp (4) | tag (4) | owner (16) |
//! | item kind (1) | item size (2) | crc32 (4) |
//!
//! chunk:
//! | header (1) | payload (1..=100) |
//!   bit 7 of the header is the valid bit, bits 0..6 the payload length
//! ```
//!
//! An erased header byte (`0xFF`) marks the end of the log. Tombstoning a
//! chunk only clears its valid bit.

use crate::error::{CoreError, CoreResult};
use crate::types::{ItemKind, ItemType, SessionId};
use flashlog_protocol::crc32;
use flashlog_storage::ERASED_BYTE;
use uuid::Uuid;

/// Current file format version.
pub const FORMAT_VERSION: u8 = 1;

/// Size of the file header.
pub const HEADER_SIZE: usize = 33;

/// Largest payload one chunk holds.
pub const MAX_CHUNK_PAYLOAD: usize = 100;

/// Name prefix shared by all session files.
pub const FILE_PREFIX: &str = "flog_";

const SCRATCH_SUFFIX: &str = ".tmp";
const VALID_BIT: u8 = 0x80;
const LEN_MASK: u8 = 0x7F;

/// Header at the start of every session file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    /// Session id.
    pub session_id: SessionId,
    /// Creation time, seconds since the Unix epoch.
    pub timestamp: u32,
    /// Producer-chosen topic tag.
    pub tag: u32,
    /// Owner identity.
    pub owner: Uuid,
    /// Record type.
    pub item: ItemType,
}

impl FileHeader {
    /// Encodes the header to bytes.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = FORMAT_VERSION;
        buf[1] = self.session_id.as_u8();
        buf[2..6].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[6..10].copy_from_slice(&self.tag.to_le_bytes());
        buf[10..26].copy_from_slice(self.owner.as_bytes());
        buf[26] = self.item.kind.as_byte();
        buf[27..29].copy_from_slice(&self.item.size.to_le_bytes());
        let crc = crc32(&buf[..HEADER_SIZE - 4]);
        buf[29..33].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decodes and verifies a header.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        if data.len() < HEADER_SIZE {
            return Err(CoreError::corrupted("file header too short"));
        }

        let stored_crc = u32::from_le_bytes([data[29], data[30], data[31], data[32]]);
        let computed_crc = crc32(&data[..HEADER_SIZE - 4]);
        if stored_crc != computed_crc {
            return Err(CoreError::ChecksumMismatch {
                expected: stored_crc,
                actual: computed_crc,
            });
        }

        if data[0] != FORMAT_VERSION {
            return Err(CoreError::corrupted(format!(
                "unsupported format version {}",
                data[0]
            )));
        }

        let kind = ItemKind::from_byte(data[26])
            .ok_or_else(|| CoreError::corrupted(format!("unknown item kind {}", data[26])))?;
        let size = u16::from_le_bytes([data[27], data[28]]);
        if size == 0 {
            return Err(CoreError::corrupted("zero item size"));
        }

        let owner: [u8; 16] = data[10..26]
            .try_into()
            .map_err(|_| CoreError::corrupted("invalid owner"))?;

        Ok(Self {
            session_id: SessionId::new(data[1]),
            timestamp: u32::from_le_bytes([data[2], data[3], data[4], data[5]]),
            tag: u32::from_le_bytes([data[6], data[7], data[8], data[9]]),
            owner: Uuid::from_bytes(owner),
            item: ItemType::new(kind, size),
        })
    }
}

/// Decoded chunk header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkHeader {
    /// Never written; end of the log.
    Erased,
    /// A chunk whose payload is still unread.
    Live(u8),
    /// A chunk whose payload was delivered.
    Tombstone(u8),
    /// Not a legal header byte.
    Invalid(u8),
}

impl ChunkHeader {
    /// Parses a header byte.
    #[must_use]
    pub const fn parse(byte: u8) -> Self {
        if byte == ERASED_BYTE {
            return Self::Erased;
        }
        let len = byte & LEN_MASK;
        if len == 0 || len as usize > MAX_CHUNK_PAYLOAD {
            return Self::Invalid(byte);
        }
        if byte & VALID_BIT != 0 {
            Self::Live(len)
        } else {
            Self::Tombstone(len)
        }
    }

    /// Header byte of a live chunk with `len` payload bytes.
    #[must_use]
    pub const fn live_byte(len: u8) -> u8 {
        len | VALID_BIT
    }

    /// Header byte of a tombstoned chunk with `len` payload bytes.
    #[must_use]
    pub const fn tombstone_byte(len: u8) -> u8 {
        len & LEN_MASK
    }
}

/// Returns the on-flash size of `n` payload bytes once chunked.
#[must_use]
pub const fn chunked_len(n: usize) -> usize {
    n + n.div_ceil(MAX_CHUNK_PAYLOAD)
}

/// Splits `data` into live chunks.
#[must_use]
pub fn encode_chunks(data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(chunked_len(data.len()));
    for piece in data.chunks(MAX_CHUNK_PAYLOAD) {
        // Pieces are at most MAX_CHUNK_PAYLOAD long.
        buf.push(ChunkHeader::live_byte(piece.len() as u8));
        buf.extend_from_slice(piece);
    }
    buf
}

/// Name of a session's data file.
#[must_use]
pub fn file_name(id: SessionId) -> String {
    format!("{FILE_PREFIX}{:03}", id.as_u8())
}

/// Name of the scratch file used while rewriting a session's data file.
#[must_use]
pub fn scratch_name(id: SessionId) -> String {
    format!("{}{SCRATCH_SUFFIX}", file_name(id))
}

/// Kind of file found under [`FILE_PREFIX`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// A session data file.
    Data(SessionId),
    /// A leftover rewrite scratch file.
    Scratch,
    /// Anything else.
    Unknown,
}

/// Classifies a file name.
#[must_use]
pub fn classify(name: &str) -> FileKind {
    let Some(rest) = name.strip_prefix(FILE_PREFIX) else {
        return FileKind::Unknown;
    };
    if rest.ends_with(SCRATCH_SUFFIX) {
        return FileKind::Scratch;
    }
    if rest.len() != 3 || !rest.bytes().all(|b| b.is_ascii_digit()) {
        return FileKind::Unknown;
    }
    match rest.parse::<u8>() {
        Ok(id) => FileKind::Data(SessionId::new(id)),
        Err(_) => FileKind::Unknown,
    }
}

/// A chunk found by [`ChunkWalker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkEntry {
    /// File offset of the header byte.
    pub offset: u64,
    /// Payload length.
    pub len: usize,
    /// False once tombstoned.
    pub live: bool,
}

impl ChunkEntry {
    /// File offset of the first payload byte.
    #[must_use]
    pub const fn payload_offset(&self) -> u64 {
        self.offset + 1
    }

    /// File offset just past the payload.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.offset + 1 + self.len as u64
    }
}

/// Why a [`ChunkWalker`] stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkEnd {
    /// Not stopped yet.
    Running,
    /// Reached an erased header byte.
    Erased,
    /// Reached the end of the region.
    EndOfRegion,
    /// The region ends inside a chunk.
    Truncated,
    /// Found an illegal header byte.
    Invalid(u8),
}

/// Iterates the chunks of an in-memory copy of a log region.
#[derive(Debug)]
pub struct ChunkWalker<'a> {
    region: &'a [u8],
    base: u64,
    pos: usize,
    end: WalkEnd,
}

impl<'a> ChunkWalker<'a> {
    /// Walks `region`, which was read from file offset `base`.
    #[must_use]
    pub const fn new(region: &'a [u8], base: u64) -> Self {
        Self {
            region,
            base,
            pos: 0,
            end: WalkEnd::Running,
        }
    }

    /// File offset of the next unread header byte.
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.base + self.pos as u64
    }

    /// Reason the walk stopped.
    #[must_use]
    pub const fn end(&self) -> WalkEnd {
        self.end
    }

    /// Payload bytes of `entry`.
    #[must_use]
    pub fn payload(&self, entry: &ChunkEntry) -> &'a [u8] {
        let start = (entry.payload_offset() - self.base) as usize;
        &self.region[start..start + entry.len]
    }
}

impl Iterator for ChunkWalker<'_> {
    type Item = ChunkEntry;

    fn next(&mut self) -> Option<ChunkEntry> {
        if self.end != WalkEnd::Running {
            return None;
        }
        let Some(&byte) = self.region.get(self.pos) else {
            self.end = WalkEnd::EndOfRegion;
            return None;
        };
        let (len, live) = match ChunkHeader::parse(byte) {
            ChunkHeader::Erased => {
                self.end = WalkEnd::Erased;
                return None;
            }
            ChunkHeader::Invalid(byte) => {
                self.end = WalkEnd::Invalid(byte);
                return None;
            }
            ChunkHeader::Live(len) => (len as usize, true),
            ChunkHeader::Tombstone(len) => (len as usize, false),
        };
        if self.pos + 1 + len > self.region.len() {
            self.end = WalkEnd::Truncated;
            return None;
        }
        let entry = ChunkEntry {
            offset: self.offset(),
            len,
            live,
        };
        self.pos += 1 + len;
        Some(entry)
    }
}
