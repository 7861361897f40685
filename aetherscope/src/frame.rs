use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Buf, Bytes, BytesMut};

use crate::byte_order::{read_le_u16, read_le_u32, read_le_u64, write_le_u16, write_le_u32, write_le_u64};
use crate::error::DecodeError;

/// Magic constant opening every frame, little-endian. The resync anchor.
pub const FRAME_MAGIC: u64 = 0xE246_5DFF_41A0_5252;

/// Size of the fixed frame header in bytes.
pub const FRAME_HEADER_LEN: usize = 40;

/// Logical connection a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    Lobby,
    Zone,
    Chat,
    Other(u16),
}

impl ConnectionType {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => ConnectionType::Lobby,
            1 => ConnectionType::Zone,
            2 => ConnectionType::Chat,
            other => ConnectionType::Other(other),
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            ConnectionType::Lobby => 0,
            ConnectionType::Zone => 1,
            ConnectionType::Chat => 2,
            ConnectionType::Other(other) => other,
        }
    }
}

/// Fixed-layout header of a frame. Bytes 8..16, 32, and 34..40 are unknown
/// and ignored on decode, zeroed on encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// Magic bytes as read off the wire, kept for inspection.
    pub magic: u64,
    /// Frame creation time, millisecond precision.
    pub timestamp: SystemTime,
    /// Total frame size including this header.
    pub length: u32,
    pub connection: ConnectionType,
    /// Number of messages in the body.
    pub count: u16,
    /// Nonzero on the wire means the body is zlib-compressed.
    pub compressed: bool,
}

impl FrameHeader {
    /// Decode the 40-byte header from the front of `data`.
    pub fn decode(data: &[u8]) -> Result<FrameHeader, DecodeError> {
        if data.len() < FRAME_HEADER_LEN {
            return Err(DecodeError::short(FRAME_HEADER_LEN, data.len()));
        }

        let millis = read_le_u64(data, 16);

        Ok(FrameHeader {
            magic: read_le_u64(data, 0),
            timestamp: UNIX_EPOCH + Duration::from_millis(millis),
            length: read_le_u32(data, 24),
            connection: ConnectionType::from_u16(read_le_u16(data, 28)),
            count: read_le_u16(data, 30),
            compressed: data[33] != 0,
        })
    }

    /// Encode the documented header fields back into wire form.
    pub fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut out = [0u8; FRAME_HEADER_LEN];
        write_le_u64(&mut out, 0, self.magic);
        write_le_u64(&mut out, 16, self.timestamp_millis());
        write_le_u32(&mut out, 24, self.length);
        write_le_u16(&mut out, 28, self.connection.as_u16());
        write_le_u16(&mut out, 30, self.count);
        out[33] = u8::from(self.compressed);
        out
    }

    /// Milliseconds since the Unix epoch, as carried on the wire.
    pub fn timestamp_millis(&self) -> u64 {
        self.timestamp
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

impl fmt::Display for FrameHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Frame - magic: 0x{:X}, timestamp: {}, size: {}, count: {}, compressed: {}, connection: {}",
            self.magic,
            self.timestamp_millis() / 1000,
            self.length,
            self.count,
            self.compressed,
            self.connection.as_u16(),
        )
    }
}

/// A complete frame: validated header plus the raw (possibly compressed)
/// body bytes.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: FrameHeader,
    pub body: Bytes,
}

impl Frame {
    /// Parse a full frame blob as emitted by the extractor.
    ///
    /// The blob must be exactly `header.length` bytes; anything else means
    /// the extractor and the header disagree and the frame is unusable.
    pub fn decode(data: &Bytes) -> Result<Frame, DecodeError> {
        let header = FrameHeader::decode(data)?;
        let length = header.length as usize;
        if length != data.len() {
            return Err(DecodeError::short(length, data.len()));
        }

        Ok(Frame {
            header,
            body: data.slice(FRAME_HEADER_LEN..),
        })
    }
}

/// True when `data` opens with the frame magic.
pub fn validate_magic(data: &[u8]) -> bool {
    data.len() >= 8 && read_le_u64(data, 0) == FRAME_MAGIC
}

/// Discard bytes from the front of `src` one at a time until the frame
/// magic aligns. Returns `true` once the magic leads the buffer, `false`
/// when fewer than 8 bytes remain and more input is needed.
///
/// One byte at a time because the magic is 8 bytes of high entropy: resync
/// is quick, and a wider skip could step over a valid frame starting one
/// byte into the skipped region.
pub(crate) fn discard_until_valid(src: &mut BytesMut) -> bool {
    while src.len() >= 8 {
        if validate_magic(src) {
            return true;
        }
        src.advance(1);
    }
    false
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    /// 40-byte frame header: length 92, lobby connection, one message,
    /// compressed, timestamp 2019-02-10 08:02:58.305 UTC.
    pub(crate) const HEADER_BLOB: [u8; 40] = [
        0x52, 0x52, 0xA0, 0x41, 0xFF, 0x5D, 0x46, 0xE2, // magic
        0x7F, 0x2A, 0x64, 0x4D, 0x7B, 0x99, 0xC4, 0x75, // unknown
        0x81, 0x48, 0x6E, 0xD6, 0x68, 0x01, 0x00, 0x00, // time
        0x5C, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, // length, connection, count
        0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // reserved, compressed, padding
    ];

    /// Same header with the magic corrupted.
    pub(crate) const BAD_MAGIC_BLOB: [u8; 40] = {
        let mut blob = HEADER_BLOB;
        blob[0] = 0x69;
        blob[1] = 0x69;
        blob
    };

    /// Zlib body paired with `HEADER_BLOB`; inflates to a 48-byte game
    /// event message.
    pub(crate) const ZLIB_BODY_BLOB: [u8; 52] = [
        0x78, 0x9C, 0x33, 0x60, 0x60, 0x60, 0x28, 0x8B, 0x50, 0x13, 0x58, 0x33, 0x45, 0x51, 0x80,
        0x19, 0xC8, 0x16, 0x61, 0x70, 0x65, 0x64, 0x60, 0x60, 0x65, 0xD8, 0x74, 0x2B, 0x3E, 0x06,
        0xC8, 0x65, 0x88, 0xD9, 0xC8, 0xC0, 0xC0, 0x61, 0xF2, 0x82, 0xD9, 0x5F, 0xD4, 0x81, 0x11,
        0xC4, 0x07, 0x00, 0xCD, 0xC1, 0x08, 0x28,
    ];

    /// The full 92-byte compressed frame.
    pub(crate) fn zlib_frame_blob() -> Vec<u8> {
        let mut blob = HEADER_BLOB.to_vec();
        blob.extend_from_slice(&ZLIB_BODY_BLOB);
        blob
    }
}
