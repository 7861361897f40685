use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::byte_order::{read_le_u16, read_le_u32};
use crate::error::DecodeError;

/// Size of the generic header prefixing every message.
pub const GENERIC_HEADER_LEN: usize = 16;

/// Size of the full game event message header.
pub const GAME_EVENT_HEADER_LEN: usize = 32;

/// Total size of a keepalive message.
pub const KEEPALIVE_LEN: usize = 24;

/// Marker carried at offset 16 of every game event message, little-endian
/// (`14 00` on the wire).
pub const GAME_EVENT_RESERVED_MARKER: u16 = 0x0014;

/// Segment types separate messages into their relevant categories.
///
/// Session and encryption segments are recognized by tag only: they largely
/// carry player identifiers and session-establishment material that should
/// stay private, so their payloads are discarded without decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentType {
    SessionInit,
    SessionRecv,
    GameEvent,
    ServerPing,
    ServerPong,
    EncryptInit,
    EncryptRecv,
    Other(u16),
}

impl SegmentType {
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => SegmentType::SessionInit,
            2 => SegmentType::SessionRecv,
            3 => SegmentType::GameEvent,
            7 => SegmentType::ServerPing,
            8 => SegmentType::ServerPong,
            9 => SegmentType::EncryptInit,
            10 => SegmentType::EncryptRecv,
            other => SegmentType::Other(other),
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            SegmentType::SessionInit => 1,
            SegmentType::SessionRecv => 2,
            SegmentType::GameEvent => 3,
            SegmentType::ServerPing => 7,
            SegmentType::ServerPong => 8,
            SegmentType::EncryptInit => 9,
            SegmentType::EncryptRecv => 10,
            SegmentType::Other(other) => other,
        }
    }
}

/// Metadata prefix shared by every message in a frame body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenericHeader {
    /// Total message size including this header.
    pub length: u32,
    pub source_actor: u32,
    pub target_actor: u32,
    pub segment: SegmentType,
}

impl GenericHeader {
    /// Decode the 16-byte generic header from the front of `data`.
    pub fn decode(data: &[u8]) -> Result<GenericHeader, DecodeError> {
        if data.len() < GENERIC_HEADER_LEN {
            return Err(DecodeError::short(GENERIC_HEADER_LEN, data.len()));
        }

        Ok(GenericHeader {
            length: read_le_u32(data, 0),
            source_actor: read_le_u32(data, 4),
            target_actor: read_le_u32(data, 8),
            segment: SegmentType::from_u16(read_le_u16(data, 12)),
        })
    }
}

impl fmt::Display for GenericHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Segment - size: {}, source: {}, target: {}, segment: {}",
            self.length,
            self.source_actor,
            self.target_actor,
            self.segment.as_u16(),
        )
    }
}

/// A game event carrying an opcode-tagged payload. Segment type 3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameEventMessage {
    pub header: GenericHeader,
    /// Application-level message context identifier.
    pub opcode: u16,
    pub server_id: u16,
    /// Message time, second precision.
    pub timestamp: SystemTime,
    /// Payload past the 32-byte header, copied out of the frame buffer.
    pub body: Vec<u8>,
}

impl GameEventMessage {
    /// Decode a game event message from the front of `data`. Requires the
    /// full declared message length to be present.
    pub fn decode(data: &[u8]) -> Result<GameEventMessage, DecodeError> {
        let header = GenericHeader::decode(data)?;
        let length = header.length as usize;

        if data.len() < length {
            return Err(DecodeError::short(length, data.len()));
        }
        if length < GAME_EVENT_HEADER_LEN {
            return Err(DecodeError::short(GAME_EVENT_HEADER_LEN, length));
        }

        let reserved = read_le_u16(data, 16);
        if reserved != GAME_EVENT_RESERVED_MARKER {
            return Err(DecodeError::ReservedMismatch {
                found: reserved,
                expected: GAME_EVENT_RESERVED_MARKER,
            });
        }

        Ok(GameEventMessage {
            header,
            opcode: read_le_u16(data, 18),
            server_id: read_le_u16(data, 22),
            timestamp: UNIX_EPOCH + Duration::from_secs(u64::from(read_le_u32(data, 24))),
            body: data[GAME_EVENT_HEADER_LEN..length].to_vec(),
        })
    }

    /// Seconds since the Unix epoch, as carried on the wire.
    pub fn timestamp_secs(&self) -> u64 {
        self.timestamp
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

impl fmt::Display for GameEventMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\nMessage - server: {}, opcode: 0x{:X}, timestamp: {}",
            self.header,
            self.server_id,
            self.opcode,
            self.timestamp_secs(),
        )
    }
}

/// A server ping or pong. Segment types 7 and 8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveMessage {
    pub header: GenericHeader,
    pub id: u32,
    /// Message time, second precision.
    pub timestamp: SystemTime,
}

impl KeepaliveMessage {
    /// Decode a keepalive message from the front of `data`.
    pub fn decode(data: &[u8]) -> Result<KeepaliveMessage, DecodeError> {
        let header = GenericHeader::decode(data)?;
        let length = header.length as usize;

        if data.len() < length {
            return Err(DecodeError::short(length, data.len()));
        }
        if length < KEEPALIVE_LEN {
            return Err(DecodeError::short(KEEPALIVE_LEN, length));
        }

        Ok(KeepaliveMessage {
            header,
            id: read_le_u32(data, 16),
            timestamp: UNIX_EPOCH + Duration::from_secs(u64::from(read_le_u32(data, 20))),
        })
    }

    /// Seconds since the Unix epoch, as carried on the wire.
    pub fn timestamp_secs(&self) -> u64 {
        self.timestamp
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

impl fmt::Display for KeepaliveMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\nMessage - ID: {}, timestamp: {}",
            self.header,
            self.id,
            self.timestamp_secs(),
        )
    }
}

/// Tagged sum of everything a frame body can contain. The decoder is the
/// sole dispatch point; subscribers match on the variant they care about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    GameEvent(GameEventMessage),
    Keepalive(KeepaliveMessage),
    /// Session and encryption segments: recognized, consumed, and
    /// discarded.
    Skipped { segment: SegmentType, length: u32 },
}

impl Message {
    pub fn segment(&self) -> SegmentType {
        match self {
            Message::GameEvent(m) => m.header.segment,
            Message::Keepalive(m) => m.header.segment,
            Message::Skipped { segment, .. } => *segment,
        }
    }
}

/// Iterate exactly `count` messages out of a decompressed frame body.
///
/// After each message the cursor advances by exactly the message's declared
/// length, whatever its segment type. Input ending before a declared length
/// is satisfied is `NotEnoughData` and aborts the iteration.
pub fn iterate_messages(body: &[u8], count: u16) -> Result<Vec<Message>, DecodeError> {
    let mut messages = Vec::with_capacity(usize::from(count));
    let mut offset = 0usize;

    for _ in 0..count {
        let rest = &body[offset.min(body.len())..];
        let header = GenericHeader::decode(rest)?;
        let length = header.length as usize;

        if length < GENERIC_HEADER_LEN {
            return Err(DecodeError::short(GENERIC_HEADER_LEN, length));
        }
        if rest.len() < length {
            return Err(DecodeError::short(length, rest.len()));
        }

        let message = match header.segment {
            SegmentType::GameEvent => Message::GameEvent(GameEventMessage::decode(rest)?),
            SegmentType::ServerPing | SegmentType::ServerPong => {
                Message::Keepalive(KeepaliveMessage::decode(rest)?)
            }
            segment => Message::Skipped {
                segment,
                length: header.length,
            },
        };

        offset += length;
        messages.push(message);
    }

    Ok(messages)
}


#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use super::test_fixtures::{inflate, COMPRESSED_GAME_EVENT_BLOB, KEEPALIVE_BLOB};
    use super::*;
    use crate::error::DecodeError;

    #[test]
    fn decodes_generic_header() {
        let header = GenericHeader::decode(&KEEPALIVE_BLOB).unwrap();
        assert_eq!(header.length, 24);
        assert_eq!(header.source_actor, 0x0403_0201);
        assert_eq!(header.target_actor, 0x0807_0605);
        assert_eq!(header.segment, SegmentType::ServerPong);
    }

    #[test]
    fn short_generic_header_reports_eof() {
        let err = GenericHeader::decode(&KEEPALIVE_BLOB[..12]).unwrap_err();
        match err {
            DecodeError::NotEnoughData {
                expected,
                received,
                source,
            } => {
                assert_eq!(expected, 16);
                assert_eq!(received, 12);
                assert_eq!(source.kind(), std::io::ErrorKind::UnexpectedEof);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn generic_header_display() {
        let header = GenericHeader::decode(&KEEPALIVE_BLOB).unwrap();
        assert_eq!(
            header.to_string(),
            "Segment - size: 24, source: 67305985, target: 134678021, segment: 8",
        );
    }

    #[test]
    fn decodes_keepalive() {
        let message = KeepaliveMessage::decode(&KEEPALIVE_BLOB).unwrap();
        assert_eq!(message.header.length, 24);
        assert_eq!(message.header.source_actor, 0x0403_0201);
        assert_eq!(message.header.target_actor, 0x0807_0605);
        assert_eq!(message.header.segment, SegmentType::ServerPong);
        assert_eq!(message.id, 123_456_789);
        assert_eq!(
            message.timestamp,
            UNIX_EPOCH + Duration::from_secs(1_485_430_850)
        );
    }

    #[test]
    fn keepalive_display() {
        let message = KeepaliveMessage::decode(&KEEPALIVE_BLOB).unwrap();
        assert_eq!(
            message.to_string(),
            "Segment - size: 24, source: 67305985, target: 134678021, segment: 8\nMessage - ID: 123456789, timestamp: 1485430850",
        );
    }

    #[test]
    fn decodes_game_event_from_compressed_blob() {
        let body = inflate(&COMPRESSED_GAME_EVENT_BLOB);
        let message = GameEventMessage::decode(&body).unwrap();

        assert_eq!(message.header.length, 48);
        assert_eq!(message.header.source_actor, 0x1058_31E2);
        assert_eq!(message.header.target_actor, 0x1068_DC38);
        assert_eq!(message.header.segment, SegmentType::GameEvent);
        assert_eq!(message.opcode, 0x125);
        assert_eq!(message.server_id, 3);
        assert_eq!(
            message.timestamp,
            UNIX_EPOCH + Duration::from_secs(1_580_625_008)
        );
        assert_eq!(message.body.len(), 16);
        assert_eq!(
            message.body,
            vec![94, 76, 1, 0, 16, 39, 0, 0, 218, 2, 126, 221, 255, 127, 0, 0]
        );
    }

    #[test]
    fn game_event_display() {
        let body = inflate(&COMPRESSED_GAME_EVENT_BLOB);
        let message = GameEventMessage::decode(&body).unwrap();
        assert_eq!(
            message.to_string(),
            "Segment - size: 48, source: 274215394, target: 275307576, segment: 3\nMessage - server: 3, opcode: 0x125, timestamp: 1580625008",
        );
    }

    #[test]
    fn short_game_event_reports_declared_length() {
        let body = inflate(&COMPRESSED_GAME_EVENT_BLOB);
        let err = GameEventMessage::decode(&body[..16]).unwrap_err();
        match err {
            DecodeError::NotEnoughData {
                expected, received, ..
            } => {
                assert_eq!(expected, 48);
                assert_eq!(received, 16);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn game_event_reserved_marker_is_verified() {
        let mut body = inflate(&COMPRESSED_GAME_EVENT_BLOB);
        body[16] = 0x15;
        let err = GameEventMessage::decode(&body).unwrap_err();
        match err {
            DecodeError::ReservedMismatch { found, expected } => {
                assert_eq!(found, 0x0015);
                assert_eq!(expected, GAME_EVENT_RESERVED_MARKER);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn iterates_zero_messages_from_empty_body() {
        assert!(iterate_messages(&[], 0).unwrap().is_empty());
    }

    #[test]
    fn iterates_mixed_segments_and_advances_by_length() {
        // A skipped session message, then a keepalive.
        let mut body = Vec::new();
        body.extend_from_slice(&[
            0x20, 0x00, 0x00, 0x00, // length 32
            0x01, 0x00, 0x00, 0x00, // source actor
            0x02, 0x00, 0x00, 0x00, // target actor
            0x09, 0x00, 0x00, 0x00, // EncryptInit
        ]);
        body.extend_from_slice(&[0u8; 16]); // opaque session payload
        body.extend_from_slice(&KEEPALIVE_BLOB);

        let messages = iterate_messages(&body, 2).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(
            messages[0],
            Message::Skipped {
                segment: SegmentType::EncryptInit,
                length: 32,
            }
        );
        match &messages[1] {
            Message::Keepalive(m) => assert_eq!(m.id, 123_456_789),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn truncated_skipped_segment_is_fatal() {
        // Declared 32 bytes, only the 16-byte header present.
        let body = [
            0x20, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x0A, 0x00,
            0x00, 0x00,
        ];
        let err = iterate_messages(&body, 1).unwrap_err();
        match err {
            DecodeError::NotEnoughData {
                expected, received, ..
            } => {
                assert_eq!(expected, 32);
                assert_eq!(received, 16);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn undersized_declared_length_is_rejected() {
        // Length 8 is smaller than the generic header itself.
        let mut body = KEEPALIVE_BLOB;
        body[0] = 0x08;
        let err = iterate_messages(&body, 1).unwrap_err();
        assert!(matches!(err, DecodeError::NotEnoughData { expected: 16, received: 8, .. }));
    }

    #[test]
    fn segment_types_round_trip() {
        for value in [1u16, 2, 3, 7, 8, 9, 10, 42] {
            assert_eq!(SegmentType::from_u16(value).as_u16(), value);
        }
    }
}
