//! Frame extraction from reassembled byte streams.
//!
//! One framer task per flow drives a [`FrameExtractor`] over the flow's
//! byte channel and publishes complete frame blobs to the shared queue.
//! The extractor resynchronizes against the frame magic one byte at a time,
//! so corruption or a capture that starts mid-frame costs at most the bytes
//! up to the next genuine frame boundary.

use std::io;

use bytes::{Buf, Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::io::StreamReader;
use tracing::{trace, warn};

use crate::byte_order::read_le_u32;
use crate::flow::FlowKey;
use crate::frame::{discard_until_valid, FRAME_HEADER_LEN};

/// A complete frame blob with the flow it came from, as carried on the
/// shared queue between framer tasks and a subscriber.
#[derive(Debug, Clone)]
pub struct ReassembledFrame {
    pub bytes: Bytes,
    pub flow: FlowKey,
}

/// Splits a reassembled byte stream into length-delimited frame blobs.
pub(crate) struct FrameExtractor {
    max_frame_length: usize,
}

impl FrameExtractor {
    pub(crate) fn new(max_frame_length: usize) -> Self {
        FrameExtractor { max_frame_length }
    }
}

impl Decoder for FrameExtractor {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, io::Error> {
        loop {
            // Step to the next magic; under 8 bytes buffered means wait.
            if !discard_until_valid(src) {
                return Ok(None);
            }
            if src.len() < FRAME_HEADER_LEN {
                return Ok(None);
            }

            let length = read_le_u32(src, 24) as usize;
            if length < FRAME_HEADER_LEN || length > self.max_frame_length {
                // A real-looking magic with a nonsense length: drop one
                // byte of the false magic and resync.
                trace!(length, "implausible frame length, resyncing");
                src.advance(1);
                continue;
            }

            if src.len() < length {
                src.reserve(length - src.len());
                return Ok(None);
            }

            return Ok(Some(src.split_to(length).freeze()));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, io::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                // Never emit a partial frame; whatever is left is lost with
                // the stream.
                if !src.is_empty() {
                    trace!(remaining = src.len(), "discarding partial frame at EOF");
                    src.clear();
                }
                Ok(None)
            }
        }
    }
}

/// Framer task: owns one flow's buffered reader and emits its frames to
/// the shared queue, in order, until the flow's byte channel closes.
pub(crate) async fn run_flow_framer(
    flow: FlowKey,
    bytes_rx: mpsc::Receiver<Bytes>,
    frame_tx: mpsc::Sender<ReassembledFrame>,
    max_frame_length: usize,
    read_buffer_size: usize,
) {
    let stream = ReceiverStream::new(bytes_rx).map(Ok::<Bytes, io::Error>);
    let reader = StreamReader::new(stream);
    let mut frames = FramedRead::with_capacity(
        reader,
        FrameExtractor::new(max_frame_length),
        read_buffer_size,
    );

    while let Some(next) = frames.next().await {
        match next {
            Ok(bytes) => {
                // A full queue blocks here: the pipeline's backpressure.
                if frame_tx
                    .send(ReassembledFrame { bytes, flow })
                    .await
                    .is_err()
                {
                    trace!(%flow, "frame queue closed, ending framer");
                    return;
                }
            }
            Err(e) => {
                warn!(%flow, error = %e, "error reading frame stream");
                return;
            }
        }
    }

    trace!(%flow, "flow reader exhausted");
}
