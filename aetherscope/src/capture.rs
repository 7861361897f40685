//! Packet sources feeding the reassembly pipeline.
//!
//! Three capture modes are supported: live libpcap, offline libpcap file,
//! and Linux AF_PACKET. All of them reduce to the same contract: a poll
//! loop yielding TCP segments with their flow tuple and a wall timestamp.
//! Packets lacking an IP or TCP layer are skipped silently.

pub mod afpacket;

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use thiserror::Error;

use crate::conf::SnifferConf;
use crate::error::SnifferError;
use crate::flow::FlowKey;

/// BPF program matching the port ranges the game client uses, across all
/// data centers.
pub const DEFAULT_BPF_FILTER: &str = "tcp portrange 54992-54994 or tcp portrange 55006-55007 or tcp portrange 55021-55040 or tcp portrange 55296-55551";

/// The same port ranges as `DEFAULT_BPF_FILTER`, for sources that cannot
/// carry a compiled BPF program.
pub const GAME_PORT_RANGES: [(u16, u16); 4] = [
    (54992, 54994),
    (55006, 55007),
    (55021, 55040),
    (55296, 55551),
];

/// Poll timeout for live captures, so the loop can observe the stop signal
/// and drive the flush ticker between packets.
const POLL_TIMEOUT_MS: i32 = 100;

/// True when `port` falls inside one of the game's port ranges.
pub fn is_game_port(port: u16) -> bool {
    GAME_PORT_RANGES
        .iter()
        .any(|&(lo, hi)| (lo..=hi).contains(&port))
}

/// Where a sniffer reads packets from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// Live capture through libpcap.
    Pcap,
    /// Offline capture file through libpcap.
    File,
    /// Linux AF_PACKET socket.
    AfPacket,
}

impl FromStr for CaptureMode {
    type Err = SnifferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pcap" => Ok(CaptureMode::Pcap),
            "file" => Ok(CaptureMode::File),
            "afpacket" => Ok(CaptureMode::AfPacket),
            other => Err(SnifferError::UnknownInput(other.to_string())),
        }
    }
}

impl fmt::Display for CaptureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CaptureMode::Pcap => "pcap",
            CaptureMode::File => "file",
            CaptureMode::AfPacket => "afpacket",
        };
        f.write_str(name)
    }
}

/// Errors opening or reading a capture source.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("unable to open capture handle: {0}")]
    Open(#[source] pcap::Error),

    #[error("unable to set up BPF filter: {0}")]
    Filter(#[source] pcap::Error),

    #[error("capture read failed: {0}")]
    Read(#[source] pcap::Error),

    #[error("no such capture interface: {0:?}")]
    NoSuchDevice(String),

    #[error("AF_PACKET ring buffer size too small")]
    BufferTooSmall,

    #[error("AF_PACKET capture is only available on Linux")]
    AfPacketUnsupported,

    #[error("capture I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A TCP segment lifted out of a captured packet.
#[derive(Debug, Clone)]
pub struct SegmentEvent {
    pub flow: FlowKey,
    pub seq: u32,
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
    pub payload: Bytes,
    pub timestamp: SystemTime,
}

/// One poll of a capture source.
#[derive(Debug)]
pub(crate) enum FeedEvent {
    /// A usable TCP segment.
    Segment(SegmentEvent),
    /// Nothing usable this round (timeout, or a skipped packet).
    Idle,
    /// The source is exhausted.
    End,
}

/// An opened capture source.
pub(crate) enum PacketFeed {
    Pcap {
        cap: pcap::Capture<dyn pcap::Activated>,
        ethernet: bool,
    },
    AfPacket(afpacket::AfPacketFeed),
}

/// Open a capture source for the given mode, applying the port filter.
pub(crate) fn open(
    mode: CaptureMode,
    source: &str,
    conf: &SnifferConf,
) -> Result<PacketFeed, CaptureError> {
    match mode {
        CaptureMode::Pcap => {
            let cap = pcap::Capture::from_device(source)
                .map_err(CaptureError::Open)?
                .snaplen(conf.snaplen as i32)
                .promisc(true)
                .timeout(POLL_TIMEOUT_MS)
                .open()
                .map_err(CaptureError::Open)?;
            finish_pcap(cap.into())
        }
        CaptureMode::File => {
            let cap = pcap::Capture::from_file(source).map_err(CaptureError::Open)?;
            finish_pcap(cap.into())
        }
        CaptureMode::AfPacket => Ok(PacketFeed::AfPacket(afpacket::open(source, conf)?)),
    }
}

fn finish_pcap(mut cap: pcap::Capture<dyn pcap::Activated>) -> Result<PacketFeed, CaptureError> {
    cap.filter(DEFAULT_BPF_FILTER, true)
        .map_err(CaptureError::Filter)?;
    let ethernet = cap.get_datalink() == pcap::Linktype::ETHERNET;
    Ok(PacketFeed::Pcap { cap, ethernet })
}

impl PacketFeed {
    /// Poll for the next TCP segment.
    pub(crate) fn poll(&mut self) -> Result<FeedEvent, CaptureError> {
        match self {
            PacketFeed::Pcap { cap, ethernet } => match cap.next_packet() {
                Ok(packet) => {
                    let timestamp = UNIX_EPOCH
                        + Duration::new(
                            packet.header.ts.tv_sec as u64,
                            (packet.header.ts.tv_usec as u32).saturating_mul(1000),
                        );
                    Ok(match parse_segment(packet.data, *ethernet, timestamp) {
                        Some(segment) => FeedEvent::Segment(segment),
                        None => FeedEvent::Idle,
                    })
                }
                Err(pcap::Error::TimeoutExpired) => Ok(FeedEvent::Idle),
                Err(pcap::Error::NoMorePackets) => Ok(FeedEvent::End),
                Err(e) => Err(CaptureError::Read(e)),
            },
            PacketFeed::AfPacket(feed) => feed.poll(),
        }
    }
}

/// Slice a raw packet down to its TCP segment, if it has one.
pub(crate) fn parse_segment(
    data: &[u8],
    ethernet: bool,
    timestamp: SystemTime,
) -> Option<SegmentEvent> {
    let sliced = if ethernet {
        SlicedPacket::from_ethernet(data).ok()?
    } else {
        SlicedPacket::from_ip(data).ok()?
    };

    let (src_addr, dst_addr) = match sliced.net? {
        NetSlice::Ipv4(ipv4) => (
            ipv4.header().source_addr().into(),
            ipv4.header().destination_addr().into(),
        ),
        NetSlice::Ipv6(ipv6) => (
            ipv6.header().source_addr().into(),
            ipv6.header().destination_addr().into(),
        ),
        _ => return None,
    };

    let tcp = match sliced.transport? {
        TransportSlice::Tcp(tcp) => tcp,
        _ => return None,
    };

    Some(SegmentEvent {
        flow: FlowKey {
            src_addr,
            dst_addr,
            src_port: tcp.source_port(),
            dst_port: tcp.destination_port(),
        },
        seq: tcp.sequence_number(),
        syn: tcp.syn(),
        fin: tcp.fin(),
        rst: tcp.rst(),
        payload: Bytes::copy_from_slice(tcp.payload()),
        timestamp,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::time::SystemTime;

    use super::{parse_segment, SegmentEvent};

    /// Build an Ethernet/IPv4/TCP packet and lift its segment back out.
    pub(crate) fn tcp_segment(
        src: [u8; 4],
        dst: [u8; 4],
        src_port: u16,
        dst_port: u16,
        seq: u32,
        payload: &[u8],
    ) -> SegmentEvent {
        let builder = etherparse::PacketBuilder::ethernet2([1; 6], [2; 6])
            .ipv4(src, dst, 64)
            .tcp(src_port, dst_port, seq, 64_240);
        let mut packet = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut packet, payload).expect("packet builds");

        parse_segment(&packet, true, SystemTime::now()).expect("packet parses")
    }
}
