//! Subscribers: typed message delivery to consumer channels.
//!
//! A subscriber pulls reassembled frames from the sniffer's shared queue,
//! decodes them, and pushes the messages it cares about onto bounded
//! channels. A slow consumer therefore slows the whole pipeline down, which
//! is the intended alternative to unbounded buffering.
//!
//! Frame decoding reuses a per-subscriber pool of scratch state: the zlib
//! inflater is reset per frame rather than reallocated, and the inflated
//! body lands in a reused buffer. Message payloads are copied out before
//! delivery, so no message borrows pooled memory.

use flate2::{Decompress, FlushDecompress, Status};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{DecodeError, Result};
use crate::extractor::ReassembledFrame;
use crate::flow::{FlowDirection, FlowKey};
use crate::frame::Frame;
use crate::message::{iterate_messages, GameEventMessage, KeepaliveMessage, Message};
use crate::sniffer::Sniffer;

/// Default capacity for subscriber channels.
const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Growth step for the inflate buffer.
const INFLATE_CHUNK: usize = 16 * 1024;

/// Reusable decode state, reset per frame instead of reallocated.
pub(crate) struct DecodePool {
    inflater: Decompress,
    body: Vec<u8>,
}

impl DecodePool {
    pub(crate) fn new() -> Self {
        DecodePool {
            inflater: Decompress::new(true),
            body: Vec::with_capacity(INFLATE_CHUNK),
        }
    }

    /// Borrow the frame's message body, inflating into the pooled buffer
    /// when the frame is compressed. Zlib carries the standard RFC 1950
    /// wrapper.
    fn frame_body<'a>(&'a mut self, frame: &'a Frame) -> std::result::Result<&'a [u8], DecodeError> {
        if !frame.header.compressed {
            return Ok(&frame.body);
        }

        self.inflater.reset(true);
        self.body.clear();

        loop {
            let consumed = self.inflater.total_in() as usize;
            let produced = self.body.len();
            if self.body.len() == self.body.capacity() {
                self.body.reserve(INFLATE_CHUNK);
            }

            let status = self.inflater.decompress_vec(
                &frame.body[consumed..],
                &mut self.body,
                FlushDecompress::Finish,
            )?;

            match status {
                Status::StreamEnd => return Ok(&self.body),
                Status::Ok | Status::BufError => {
                    let stuck = self.inflater.total_in() as usize == consumed
                        && self.body.len() == produced;
                    if stuck {
                        return Err(DecodeError::InflateTruncated);
                    }
                }
            }
        }
    }
}

/// Decode a frame blob into its messages, using pooled scratch state.
pub(crate) fn decode_frame_messages(
    raw: &ReassembledFrame,
    pool: &mut DecodePool,
) -> std::result::Result<Vec<Message>, DecodeError> {
    let frame = Frame::decode(&raw.bytes)?;
    let count = frame.header.count;
    let body = pool.frame_body(&frame)?;
    iterate_messages(body, count)
}

/// Receiving halves of a game event subscription.
pub struct GameEventStream {
    /// Server to client messages.
    pub ingress: mpsc::Receiver<GameEventMessage>,
    /// Client to server messages.
    pub egress: mpsc::Receiver<GameEventMessage>,
}

/// Subscriber for game event segments, routed by frame direction.
pub struct GameEventSubscriber {
    ingress_tx: mpsc::Sender<GameEventMessage>,
    egress_tx: mpsc::Sender<GameEventMessage>,
}

impl GameEventSubscriber {
    /// Subscriber handle plus channels for inbound and outbound messages.
    pub fn new() -> (GameEventSubscriber, GameEventStream) {
        GameEventSubscriber::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (GameEventSubscriber, GameEventStream) {
        let (ingress_tx, ingress) = mpsc::channel(capacity);
        let (egress_tx, egress) = mpsc::channel(capacity);
        (
            GameEventSubscriber {
                ingress_tx,
                egress_tx,
            },
            GameEventStream { ingress, egress },
        )
    }

    /// Consume frames from the sniffer until it stops or its stream ends.
    ///
    /// Frames that fail to decode are logged and dropped; decoding picks
    /// back up with the next frame.
    pub async fn subscribe(&self, sniffer: &Sniffer) -> Result<()> {
        let mut pool = DecodePool::new();
        info!("game event subscriber attached");

        while let Some(raw) = sniffer.next_frame().await {
            match decode_frame_messages(&raw, &mut pool) {
                Ok(messages) => {
                    if !self.dispatch(messages, raw.flow.direction(), &raw.flow).await {
                        return Ok(());
                    }
                }
                Err(e) => warn!(flow = %raw.flow, error = %e, "dropping undecodable frame"),
            }

            if sniffer.stop_requested() {
                debug!("sniffer stopped, game event subscriber returning");
                return Ok(());
            }
        }
        Ok(())
    }

    /// Route one frame's game events. Returns `false` when the consumer has
    /// gone away and the subscription should end.
    async fn dispatch(
        &self,
        messages: Vec<Message>,
        direction: FlowDirection,
        flow: &FlowKey,
    ) -> bool {
        for message in messages {
            let Message::GameEvent(event) = message else {
                continue;
            };

            let tx = match direction {
                FlowDirection::Ingress => &self.ingress_tx,
                FlowDirection::Egress => &self.egress_tx,
                FlowDirection::Unknown => {
                    warn!(
                        %flow,
                        error = %DecodeError::UnknownDirection,
                        "dropping frame with unclassifiable direction",
                    );
                    return true;
                }
            };

            if tx.send(event).await.is_err() {
                debug!("game event stream dropped, ending subscription");
                return false;
            }
        }
        true
    }

    /// Stop the sniffer and close both channels. Consuming the subscriber
    /// drops the sending halves, so the channels close exactly once.
    pub fn close(self, sniffer: &Sniffer) {
        sniffer.stop();
    }
}

/// Receiving half of a keepalive subscription.
pub struct KeepaliveStream {
    /// Ping and pong messages, in both directions.
    pub events: mpsc::Receiver<KeepaliveMessage>,
}

/// Subscriber for server ping and pong segments. Keepalive traffic is
/// minimal, so a single channel carries both directions.
pub struct KeepaliveSubscriber {
    events_tx: mpsc::Sender<KeepaliveMessage>,
}

impl KeepaliveSubscriber {
    pub fn new() -> (KeepaliveSubscriber, KeepaliveStream) {
        KeepaliveSubscriber::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (KeepaliveSubscriber, KeepaliveStream) {
        let (events_tx, events) = mpsc::channel(capacity);
        (KeepaliveSubscriber { events_tx }, KeepaliveStream { events })
    }

    /// Consume frames from the sniffer until it stops or its stream ends.
    pub async fn subscribe(&self, sniffer: &Sniffer) -> Result<()> {
        let mut pool = DecodePool::new();
        info!("keepalive subscriber attached");

        while let Some(raw) = sniffer.next_frame().await {
            match decode_frame_messages(&raw, &mut pool) {
                Ok(messages) => {
                    for message in messages {
                        let Message::Keepalive(keepalive) = message else {
                            continue;
                        };
                        if self.events_tx.send(keepalive).await.is_err() {
                            debug!("keepalive stream dropped, ending subscription");
                            return Ok(());
                        }
                    }
                }
                Err(e) => warn!(flow = %raw.flow, error = %e, "dropping undecodable frame"),
            }

            if sniffer.stop_requested() {
                debug!("sniffer stopped, keepalive subscriber returning");
                return Ok(());
            }
        }
        Ok(())
    }

    /// Stop the sniffer and close the channel exactly once.
    pub fn close(self, sniffer: &Sniffer) {
        sniffer.stop();
    }
}
