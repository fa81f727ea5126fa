//! Core type definitions for flashlog.

use crate::config::EngineConfig;
use crate::error::{CoreError, CoreResult};
use std::fmt;
use uuid::Uuid;

/// Identifier of a live session.
///
/// Ids are drawn at random and are unique among live sessions only. A
/// deleted session's id may be handed to an unrelated session later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u8);

impl SessionId {
    /// Creates a new session ID.
    #[must_use]
    pub const fn new(id: u8) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session:{}", self.0)
    }
}

/// How record bytes are interpreted by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemKind {
    /// Opaque fixed-size byte records.
    ByteArray,
    /// Unsigned little-endian integers.
    Unsigned,
    /// Signed little-endian integers.
    Signed,
}

impl ItemKind {
    /// Returns the byte stored in file headers and sent in `Open`.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::ByteArray => 0,
            Self::Unsigned => 2,
            Self::Signed => 3,
        }
    }

    /// Parses a stored item kind byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::ByteArray),
            2 => Some(Self::Unsigned),
            3 => Some(Self::Signed),
            _ => None,
        }
    }
}

/// Kind and size of every record in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ItemType {
    /// Record interpretation.
    pub kind: ItemKind,
    /// Size of one record in bytes.
    pub size: u16,
}

impl ItemType {
    /// Creates an item type without validating it.
    #[must_use]
    pub const fn new(kind: ItemKind, size: u16) -> Self {
        Self { kind, size }
    }

    /// Unsigned integers of `size` bytes.
    #[must_use]
    pub const fn unsigned(size: u16) -> Self {
        Self::new(ItemKind::Unsigned, size)
    }

    /// Signed integers of `size` bytes.
    #[must_use]
    pub const fn signed(size: u16) -> Self {
        Self::new(ItemKind::Signed, size)
    }

    /// Byte records of `size` bytes.
    #[must_use]
    pub const fn byte_array(size: u16) -> Self {
        Self::new(ItemKind::ByteArray, size)
    }

    /// Checks the size against the kind and the session's buffering mode.
    ///
    /// Integers must be 1, 2 or 4 bytes. Byte arrays are limited by the
    /// configured buffered or unbuffered maximum.
    pub fn validate(self, buffered: bool, config: &EngineConfig) -> CoreResult<()> {
        match self.kind {
            ItemKind::Unsigned | ItemKind::Signed => {
                if !matches!(self.size, 1 | 2 | 4) {
                    return Err(CoreError::validation(format!(
                        "integer items must be 1, 2 or 4 bytes, got {}",
                        self.size
                    )));
                }
            }
            ItemKind::ByteArray => {
                let max = if buffered {
                    config.max_buffered_item_size
                } else {
                    config.max_unbuffered_item_size
                };
                if self.size == 0 || self.size > max {
                    return Err(CoreError::validation(format!(
                        "byte array items must be 1..={max} bytes, got {}",
                        self.size
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Task class that owns a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OwnerTask {
    /// A user application.
    App,
    /// A background worker belonging to an application.
    Worker,
    /// A lightweight system service.
    System,
}

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    /// Accepting records.
    Active,
    /// Closed to producers; waiting for delivery of remaining bytes.
    Inactive,
}

/// Handle a producer keeps for a session.
///
/// The serial distinguishes sessions that reused the same id, so a handle
/// to a deleted session never reaches its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    /// Session id.
    pub id: SessionId,
    /// Registry-wide creation serial.
    pub serial: u64,
}

/// Staging buffer choice for a new session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferMode {
    /// Every `log` writes straight to flash.
    Unbuffered,
    /// The engine allocates the staging buffer. System owners only.
    EngineAllocated,
    /// The producer hands over the memory used as the staging buffer.
    Provided(Vec<u8>),
}

impl BufferMode {
    /// Returns true unless the session writes straight to flash.
    #[must_use]
    pub fn is_buffered(&self) -> bool {
        !matches!(self, Self::Unbuffered)
    }
}

/// Parameters for creating a session.
#[derive(Debug, Clone)]
pub struct CreateParams {
    /// Producer-chosen topic tag.
    pub tag: u32,
    /// Owner identity.
    pub owner: Uuid,
    /// Owning task class.
    pub task: OwnerTask,
    /// Record type.
    pub item: ItemType,
    /// Staging buffer choice.
    pub buffer: BufferMode,
}

/// Immutable description of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMeta {
    /// Session id.
    pub id: SessionId,
    /// Registry-wide creation serial.
    pub serial: u64,
    /// Producer-chosen topic tag.
    pub tag: u32,
    /// Owner identity.
    pub owner: Uuid,
    /// Owning task class.
    pub task: OwnerTask,
    /// Record type.
    pub item: ItemType,
    /// Creation time, seconds since the Unix epoch.
    pub timestamp: u32,
    /// Whether `log` stages records in memory.
    pub buffered: bool,
}

impl SessionMeta {
    /// Returns the producer handle for this session.
    #[must_use]
    pub const fn handle(&self) -> SessionHandle {
        SessionHandle {
            id: self.id,
            serial: self.serial,
        }
    }

    /// Returns true if both describe the same logical session.
    #[must_use]
    pub fn same_logical_session(&self, owner: &Uuid, timestamp: u32, tag: u32) -> bool {
        self.owner == *owner && self.timestamp == timestamp && self.tag == tag
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_sizes() {
        let config = EngineConfig::default();
        for size in [1, 2, 4] {
            assert!(ItemType::unsigned(size).validate(true, &config).is_ok());
            assert!(ItemType::signed(size).validate(false, &config).is_ok());
        }
        for size in [0, 3, 5, 8] {
            let err = ItemType::signed(size).validate(true, &config).unwrap_err();
            assert!(err.is_validation());
        }
    }

    #[test]
    fn byte_array_limits_depend_on_buffering() {
        let config = EngineConfig::default();
        assert!(ItemType::byte_array(300).validate(true, &config).is_ok());
        assert!(ItemType::byte_array(301).validate(true, &config).is_err());
        assert!(ItemType::byte_array(256).validate(false, &config).is_ok());
        assert!(ItemType::byte_array(257).validate(false, &config).is_err());
        assert!(ItemType::byte_array(0).validate(false, &config).is_err());
    }

    #[test]
    fn item_kind_bytes() {
        for kind in [ItemKind::ByteArray, ItemKind::Unsigned, ItemKind::Signed] {
            assert_eq!(ItemKind::from_byte(kind.as_byte()), Some(kind));
        }
        assert_eq!(ItemKind::from_byte(1), None);
    }

    #[test]
    fn session_id_display() {
        assert_eq!(SessionId::new(7).to_string(), "session:7");
    }
}
