use std::io;

use thiserror::Error;

use crate::capture::CaptureError;

/// Errors raised while decoding frames and messages from a reassembled
/// stream.
///
/// `NotEnoughData` is the short-input case: a header or body read was
/// attempted before the declared number of bytes was available. On a live
/// stream this is usually transient; within a single frame decode it is
/// fatal for that frame only. The remaining variants are decoding failures
/// that likewise abort the current frame without stopping the subscriber.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The input ended before `expected` bytes were available.
    #[error("not enough data: expected {expected} bytes but received {received}: {source}")]
    NotEnoughData {
        expected: usize,
        received: usize,
        #[source]
        source: io::Error,
    },

    /// The zlib stream in a compressed frame body was malformed.
    #[error("unable to decode message: zlib inflate failed: {0}")]
    Inflate(#[from] flate2::DecompressError),

    /// The zlib stream ended before producing a complete body.
    #[error("unable to decode message: zlib stream ended prematurely")]
    InflateTruncated,

    /// A game event message carried an unexpected reserved marker.
    #[error("unable to decode message: reserved marker {found:#06x} does not match {expected:#06x}")]
    ReservedMismatch { found: u16, expected: u16 },

    /// The frame's flow could not be classified as ingress or egress.
    #[error("unable to decode message: unexpected frame direction")]
    UnknownDirection,
}

impl DecodeError {
    /// Short-input error with an `UnexpectedEof` cause, the usual way a
    /// truncated buffer surfaces.
    pub(crate) fn short(expected: usize, received: usize) -> Self {
        DecodeError::NotEnoughData {
            expected,
            received,
            source: io::ErrorKind::UnexpectedEof.into(),
        }
    }
}

/// Top-level error type for the sniffer and its subscribers.
#[derive(Debug, Error)]
pub enum SnifferError {
    /// Frame or message decoding failed.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The capture source could not be opened or read.
    #[error(transparent)]
    Capture(#[from] CaptureError),

    /// The provided sniffer mode is not a known type.
    #[error("unknown sniffer input mode: {0:?}")]
    UnknownInput(String),

    /// `start` was called on a sniffer whose capture loop already ran.
    #[error("sniffer capture loop already started")]
    AlreadyStarted,

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Type alias for Result with SnifferError.
pub type Result<T> = std::result::Result<T, SnifferError>;
