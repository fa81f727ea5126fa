//! Data logging endpoint messages.

use crate::checksum::crc32;
use crate::error::{ProtocolError, ProtocolResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of a `Data` message before its payload.
pub const DATA_HEADER_SIZE: usize = 1 + 1 + 4 + 4;

/// Body length of an `Open` message.
const OPEN_BODY_SIZE: usize = 1 + 16 + 4 + 4 + 1 + 2;

/// Bit set on every command the host originates.
const HOST_ORIGIN: u8 = 0x80;

/// Command byte leading every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Device announces a session.
    Open = 0x01,
    /// Device sends a batch of records.
    Data = 0x02,
    /// Device closes a session.
    Close = 0x03,
    /// Host reports the sessions it believes are open.
    Report = 0x84,
    /// Host acknowledges the last message for a session.
    Ack = 0x85,
    /// Host rejects the last message for a session.
    Nack = 0x86,
    /// Device gave up waiting for an acknowledgement.
    Timeout = 0x07,
    /// Host asks for a session's pending data right away.
    EmptySession = 0x88,
    /// Host queries the send-enable flag.
    GetSendEnableRequest = 0x89,
    /// Device answers a send-enable query.
    GetSendEnableResponse = 0x0A,
    /// Host sets the send-enable flag.
    SetSendEnable = 0x8B,
}

impl Command {
    /// Parses a command byte.
    pub fn from_byte(byte: u8) -> ProtocolResult<Self> {
        Ok(match byte {
            0x01 => Self::Open,
            0x02 => Self::Data,
            0x03 => Self::Close,
            0x84 => Self::Report,
            0x85 => Self::Ack,
            0x86 => Self::Nack,
            0x07 => Self::Timeout,
            0x88 => Self::EmptySession,
            0x89 => Self::GetSendEnableRequest,
            0x0A => Self::GetSendEnableResponse,
            0x8B => Self::SetSendEnable,
            other => return Err(ProtocolError::UnknownCommand(other)),
        })
    }

    /// Returns the raw command byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Returns true for commands the host sends.
    #[must_use]
    pub const fn is_host_origin(self) -> bool {
        self.as_byte() & HOST_ORIGIN != 0
    }

    /// Returns a short name for diagnostics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Data => "data",
            Self::Close => "close",
            Self::Report => "report",
            Self::Ack => "ack",
            Self::Nack => "nack",
            Self::Timeout => "timeout",
            Self::EmptySession => "empty-session",
            Self::GetSendEnableRequest => "get-send-enable-request",
            Self::GetSendEnableResponse => "get-send-enable-response",
            Self::SetSendEnable => "set-send-enable",
        }
    }
}

/// Item kind as carried on the wire and in file headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ItemKindCode {
    /// Opaque fixed-size byte records.
    ByteArray = 0,
    /// Unsigned little-endian integers.
    Unsigned = 2,
    /// Signed little-endian integers.
    Signed = 3,
}

impl ItemKindCode {
    /// Parses an item kind byte.
    pub fn from_byte(byte: u8) -> ProtocolResult<Self> {
        match byte {
            0 => Ok(Self::ByteArray),
            2 => Ok(Self::Unsigned),
            3 => Ok(Self::Signed),
            other => Err(ProtocolError::InvalidField {
                field: "item_kind",
                value: u32::from(other),
            }),
        }
    }

    /// Returns the raw byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Body of an `Open` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenSession {
    /// Session identifier.
    pub session_id: u8,
    /// Owner UUID bytes.
    pub owner: [u8; 16],
    /// Creation time, seconds since the Unix epoch.
    pub timestamp: u32,
    /// Producer-chosen topic tag.
    pub tag: u32,
    /// Kind of each item.
    pub item_kind: ItemKindCode,
    /// Size of each item in bytes.
    pub item_size: u16,
}

/// Body of a `Data` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendData {
    /// Session identifier.
    pub session_id: u8,
    /// Whole items still unsent after this payload.
    pub items_left_hereafter: u32,
    /// CRC-32 of `payload`.
    pub crc32: u32,
    /// Record bytes, always a whole number of items.
    pub payload: Bytes,
}

impl SendData {
    /// Creates a data message, computing the payload checksum.
    pub fn new(session_id: u8, items_left_hereafter: u32, payload: Bytes) -> Self {
        Self {
            session_id,
            items_left_hereafter,
            crc32: crc32(&payload),
            payload,
        }
    }

    /// Returns true if the checksum matches the payload.
    #[must_use]
    pub fn checksum_ok(&self) -> bool {
        crc32(&self.payload) == self.crc32
    }
}

/// A message on the data logging endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Announce a session.
    Open(OpenSession),
    /// Records for a session.
    Data(SendData),
    /// Close a session.
    Close {
        /// Session identifier.
        session_id: u8,
    },
    /// Sessions the host believes are open.
    Report {
        /// Session identifiers, in the order the host listed them.
        session_ids: Vec<u8>,
    },
    /// Positive acknowledgement.
    Ack {
        /// Session identifier.
        session_id: u8,
    },
    /// Negative acknowledgement.
    Nack {
        /// Session identifier.
        session_id: u8,
    },
    /// The device stopped waiting for an acknowledgement.
    Timeout {
        /// Session identifier.
        session_id: u8,
    },
    /// Request to send a session's pending data now.
    EmptySession {
        /// Session identifier.
        session_id: u8,
    },
    /// Query the send-enable flag.
    GetSendEnableRequest,
    /// Reply to a send-enable query.
    GetSendEnableResponse {
        /// Current flag value.
        enabled: bool,
    },
    /// Set the send-enable flag.
    SetSendEnable {
        /// New flag value.
        enabled: bool,
    },
}

impl Message {
    /// Returns the command byte for this message.
    #[must_use]
    pub fn command(&self) -> Command {
        match self {
            Self::Open(_) => Command::Open,
            Self::Data(_) => Command::Data,
            Self::Close { .. } => Command::Close,
            Self::Report { .. } => Command::Report,
            Self::Ack { .. } => Command::Ack,
            Self::Nack { .. } => Command::Nack,
            Self::Timeout { .. } => Command::Timeout,
            Self::EmptySession { .. } => Command::EmptySession,
            Self::GetSendEnableRequest => Command::GetSendEnableRequest,
            Self::GetSendEnableResponse { .. } => Command::GetSendEnableResponse,
            Self::SetSendEnable { .. } => Command::SetSendEnable,
        }
    }

    /// Returns the session this message refers to, if any.
    #[must_use]
    pub fn session_id(&self) -> Option<u8> {
        match self {
            Self::Open(open) => Some(open.session_id),
            Self::Data(data) => Some(data.session_id),
            Self::Close { session_id }
            | Self::Ack { session_id }
            | Self::Nack { session_id }
            | Self::Timeout { session_id }
            | Self::EmptySession { session_id } => Some(*session_id),
            _ => None,
        }
    }

    /// Encodes the message into a wire buffer.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(self.command().as_byte());

        match self {
            Self::Open(open) => {
                buf.put_u8(open.session_id);
                buf.put_slice(&open.owner);
                buf.put_u32_le(open.timestamp);
                buf.put_u32_le(open.tag);
                buf.put_u8(open.item_kind.as_byte());
                buf.put_u16_le(open.item_size);
            }
            Self::Data(data) => {
                buf.put_u8(data.session_id);
                buf.put_u32_le(data.items_left_hereafter);
                buf.put_u32_le(data.crc32);
                buf.put_slice(&data.payload);
            }
            Self::Close { session_id }
            | Self::Ack { session_id }
            | Self::Nack { session_id }
            | Self::Timeout { session_id }
            | Self::EmptySession { session_id } => buf.put_u8(*session_id),
            Self::Report { session_ids } => buf.put_slice(session_ids),
            Self::GetSendEnableRequest => {}
            Self::GetSendEnableResponse { enabled } | Self::SetSendEnable { enabled } => {
                buf.put_u8(u8::from(*enabled));
            }
        }

        buf.freeze()
    }

    /// Returns the encoded size of this message.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        1 + match self {
            Self::Open(_) => OPEN_BODY_SIZE,
            Self::Data(data) => DATA_HEADER_SIZE - 1 + data.payload.len(),
            Self::Report { session_ids } => session_ids.len(),
            Self::GetSendEnableRequest => 0,
            _ => 1,
        }
    }

    /// Decodes a message from a wire buffer.
    pub fn decode(buf: &[u8]) -> ProtocolResult<Self> {
        let (&first, mut body) = buf.split_first().ok_or(ProtocolError::Empty)?;
        let command = Command::from_byte(first)?;

        let message = match command {
            Command::Open => {
                expect_exact(command, body, OPEN_BODY_SIZE)?;
                let session_id = body.get_u8();
                let mut owner = [0u8; 16];
                body.copy_to_slice(&mut owner);
                let timestamp = body.get_u32_le();
                let tag = body.get_u32_le();
                let item_kind = ItemKindCode::from_byte(body.get_u8())?;
                let item_size = body.get_u16_le();
                Self::Open(OpenSession {
                    session_id,
                    owner,
                    timestamp,
                    tag,
                    item_kind,
                    item_size,
                })
            }
            Command::Data => {
                expect_at_least(command, body, DATA_HEADER_SIZE - 1)?;
                let session_id = body.get_u8();
                let items_left_hereafter = body.get_u32_le();
                let crc32 = body.get_u32_le();
                Self::Data(SendData {
                    session_id,
                    items_left_hereafter,
                    crc32,
                    payload: Bytes::copy_from_slice(body),
                })
            }
            Command::Report => Self::Report {
                session_ids: body.to_vec(),
            },
            Command::GetSendEnableRequest => {
                expect_exact(command, body, 0)?;
                Self::GetSendEnableRequest
            }
            Command::GetSendEnableResponse | Command::SetSendEnable => {
                expect_exact(command, body, 1)?;
                let enabled = decode_bool(body.get_u8())?;
                if command == Command::SetSendEnable {
                    Self::SetSendEnable { enabled }
                } else {
                    Self::GetSendEnableResponse { enabled }
                }
            }
            Command::Close
            | Command::Ack
            | Command::Nack
            | Command::Timeout
            | Command::EmptySession => {
                expect_exact(command, body, 1)?;
                let session_id = body.get_u8();
                match command {
                    Command::Close => Self::Close { session_id },
                    Command::Ack => Self::Ack { session_id },
                    Command::Nack => Self::Nack { session_id },
                    Command::Timeout => Self::Timeout { session_id },
                    _ => Self::EmptySession { session_id },
                }
            }
        };

        Ok(message)
    }
}

fn expect_at_least(command: Command, body: &[u8], needed: usize) -> ProtocolResult<()> {
    if body.len() < needed {
        return Err(ProtocolError::Truncated {
            command: command.name(),
            needed,
            actual: body.len(),
        });
    }
    Ok(())
}

fn expect_exact(command: Command, body: &[u8], needed: usize) -> ProtocolResult<()> {
    expect_at_least(command, body, needed)?;
    if body.len() > needed {
        return Err(ProtocolError::TrailingBytes {
            command: command.name(),
            extra: body.len() - needed,
        });
    }
    Ok(())
}

fn decode_bool(byte: u8) -> ProtocolResult<bool> {
    match byte {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(ProtocolError::InvalidField {
            field: "enabled",
            value: u32::from(other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_open() -> OpenSession {
        OpenSession {
            session_id: 7,
            owner: [0xAB; 16],
            timestamp: 1_700_000_000,
            tag: 42,
            item_kind: ItemKindCode::Unsigned,
            item_size: 4,
        }
    }

    #[test]
    fn host_origin_bit() {
        assert!(Command::Ack.is_host_origin());
        assert!(Command::Report.is_host_origin());
        assert!(Command::SetSendEnable.is_host_origin());
        assert!(!Command::Open.is_host_origin());
        assert!(!Command::Timeout.is_host_origin());
        assert!(!Command::GetSendEnableResponse.is_host_origin());
    }

    #[test]
    fn open_layout() {
        let encoded = Message::Open(sample_open()).encode();
        assert_eq!(encoded.len(), 1 + OPEN_BODY_SIZE);
        assert_eq!(encoded[0], 0x01);
        assert_eq!(encoded[1], 7);
        assert_eq!(&encoded[2..18], &[0xAB; 16]);
        assert_eq!(&encoded[18..22], &1_700_000_000u32.to_le_bytes());
        assert_eq!(&encoded[22..26], &42u32.to_le_bytes());
        assert_eq!(encoded[26], 2);
        assert_eq!(&encoded[27..29], &4u16.to_le_bytes());

        assert_eq!(
            Message::decode(&encoded).unwrap(),
            Message::Open(sample_open())
        );
    }

    #[test]
    fn data_carries_checksum() {
        let data = SendData::new(3, 10, Bytes::from_static(&[1, 2, 3, 4]));
        assert!(data.checksum_ok());

        let encoded = Message::Data(data.clone()).encode();
        assert_eq!(encoded.len(), DATA_HEADER_SIZE + 4);
        assert_eq!(&encoded[6..10], &crc32(&[1, 2, 3, 4]).to_le_bytes());

        let Message::Data(decoded) = Message::decode(&encoded).unwrap() else {
            panic!("expected data");
        };
        assert_eq!(decoded, data);
    }

    #[test]
    fn corrupted_payload_fails_checksum() {
        let mut encoded = Message::Data(SendData::new(3, 0, Bytes::from_static(b"abcd")))
            .encode()
            .to_vec();
        encoded[DATA_HEADER_SIZE] ^= 0xFF;

        let Message::Data(decoded) = Message::decode(&encoded).unwrap() else {
            panic!("expected data");
        };
        assert!(!decoded.checksum_ok());
    }

    #[test]
    fn report_lists_sessions() {
        let decoded = Message::decode(&[0x84, 1, 5, 9]).unwrap();
        assert_eq!(
            decoded,
            Message::Report {
                session_ids: vec![1, 5, 9]
            }
        );
        assert_eq!(
            Message::decode(&[0x84]).unwrap(),
            Message::Report {
                session_ids: vec![]
            }
        );
    }

    #[test]
    fn single_session_commands() {
        assert_eq!(
            Message::decode(&[0x85, 4]).unwrap(),
            Message::Ack { session_id: 4 }
        );
        assert_eq!(
            Message::decode(&[0x86, 4]).unwrap(),
            Message::Nack { session_id: 4 }
        );
        assert_eq!(
            Message::decode(&[0x88, 4]).unwrap(),
            Message::EmptySession { session_id: 4 }
        );
        assert_eq!(Message::Timeout { session_id: 9 }.encode().as_ref(), &[0x07, 9]);
        assert_eq!(Message::Close { session_id: 9 }.encode().as_ref(), &[0x03, 9]);
    }

    #[test]
    fn send_enable_messages() {
        assert_eq!(
            Message::decode(&[0x8B, 0]).unwrap(),
            Message::SetSendEnable { enabled: false }
        );
        assert_eq!(
            Message::decode(&[0x89]).unwrap(),
            Message::GetSendEnableRequest
        );
        assert_eq!(
            Message::GetSendEnableResponse { enabled: true }.encode().as_ref(),
            &[0x0A, 1]
        );
        assert!(matches!(
            Message::decode(&[0x8B, 7]),
            Err(ProtocolError::InvalidField { field: "enabled", .. })
        ));
    }

    #[test]
    fn malformed_messages_rejected() {
        assert_eq!(Message::decode(&[]), Err(ProtocolError::Empty));
        assert_eq!(
            Message::decode(&[0x42]),
            Err(ProtocolError::UnknownCommand(0x42))
        );
        assert!(matches!(
            Message::decode(&[0x85]),
            Err(ProtocolError::Truncated { .. })
        ));
        assert!(matches!(
            Message::decode(&[0x85, 1, 2]),
            Err(ProtocolError::TrailingBytes { extra: 1, .. })
        ));
        assert!(matches!(
            Message::decode(&[0x02, 1, 0, 0]),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn invalid_item_kind_rejected() {
        let mut encoded = Message::Open(sample_open()).encode().to_vec();
        encoded[26] = 1;
        assert!(matches!(
            Message::decode(&encoded),
            Err(ProtocolError::InvalidField {
                field: "item_kind",
                value: 1
            })
        ));
    }

    proptest! {
        #[test]
        fn decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
            let _ = Message::decode(&bytes);
        }

        #[test]
        fn decoded_messages_reencode_identically(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
            if let Ok(message) = Message::decode(&bytes) {
                let encoded = message.encode();
                prop_assert_eq!(encoded.as_ref(), bytes.as_slice());
            }
        }
    }
}
