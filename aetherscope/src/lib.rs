//! Passive TCP reassembly and message decoding for FFXIV network streams.
//!
//! The game's client and server communicate over RPC: each message carries
//! a segment type identifying its payload category, with opcodes
//! identifying message kinds inside the game event segment. One or more
//! messages are wrapped into a frame, optionally zlib-compressed, and
//! transmitted over TCP.
//!
//! This crate observes that traffic read-only. A [`Sniffer`] owns a capture
//! source (live pcap, offline pcap file, or Linux AF_PACKET) and drives a
//! pipeline: TCP reassembly per flow, frame extraction with magic-based
//! resynchronization, zlib decompression, and message decoding. Subscribers
//! receive typed messages over bounded channels:
//!
//! ```no_run
//! use aetherscope::{CaptureMode, GameEventSubscriber, Sniffer};
//!
//! # async fn run() -> aetherscope::Result<()> {
//! let sniffer = Sniffer::new(CaptureMode::File, "capture.pcap")?;
//! let (subscriber, mut stream) = GameEventSubscriber::new();
//!
//! let (_started, _subscribed, ()) = tokio::join!(
//!     sniffer.start(),
//!     subscriber.subscribe(&sniffer),
//!     async move {
//!         while let Some(event) = stream.ingress.recv().await {
//!             println!("{event}");
//!         }
//!     },
//! );
//! # Ok(())
//! # }
//! ```

mod byte_order;
pub mod capture;
pub mod conf;
pub mod error;
pub mod filter;
pub mod flow;
pub mod frame;
pub mod message;
mod extractor;
mod reassembly;
mod sniffer;
mod subscriber;

pub use capture::{CaptureMode, DEFAULT_BPF_FILTER};
pub use conf::SnifferConf;
pub use error::{DecodeError, Result, SnifferError};
pub use extractor::ReassembledFrame;
pub use flow::{FlowDirection, FlowKey};
pub use frame::{Frame, FrameHeader};
pub use message::{GameEventMessage, KeepaliveMessage, Message, SegmentType};
pub use sniffer::{Sniffer, Status, StopReason};
pub use subscriber::{
    GameEventStream, GameEventSubscriber, KeepaliveStream, KeepaliveSubscriber,
};
