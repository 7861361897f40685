//! AF_PACKET capture for Linux.
//!
//! The kernel ring is sized from a target allocation: the frame size is the
//! snap length rounded against the page size, blocks hold 128 frames, and
//! the block count is however many blocks fit the target. AF_PACKET sockets
//! cannot carry the compiled BPF program, so the game's port ranges are
//! matched in userspace instead.

use crate::capture::CaptureError;

/// Sizing for the AF_PACKET ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingSizing {
    pub frame_size: usize,
    pub block_size: usize,
    pub block_count: usize,
}

/// Calculate the ring sizing for a target allocation. The block size and
/// count should add up to as close as possible to `target_mib`; the frame
/// size must divide evenly into both the block and page sizes.
pub fn calculate_buffers(
    target_mib: usize,
    snaplen: usize,
    page_size: usize,
) -> Result<RingSizing, CaptureError> {
    let frame_size = if snaplen < page_size {
        page_size / (page_size / snaplen)
    } else {
        (snaplen / page_size + 1) * page_size
    };

    let block_size = frame_size * 128;
    let block_count = target_mib * 1024 * 1024 / block_size;

    if block_count == 0 {
        return Err(CaptureError::BufferTooSmall);
    }

    Ok(RingSizing {
        frame_size,
        block_size,
        block_count,
    })
}

#[cfg(target_os = "linux")]
pub(crate) use linux::{open, AfPacketFeed};

#[cfg(target_os = "linux")]
mod linux {
    use std::io;
    use std::time::{Duration, SystemTime};

    use pnet::datalink::{self, Channel, Config, DataLinkReceiver};

    use super::calculate_buffers;
    use crate::capture::{is_game_port, parse_segment, CaptureError, FeedEvent};
    use crate::conf::SnifferConf;

    pub(crate) struct AfPacketFeed {
        rx: Box<dyn DataLinkReceiver>,
    }

    fn page_size() -> usize {
        // SAFETY: sysconf has no preconditions for _SC_PAGESIZE.
        let value = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if value <= 0 { 4096 } else { value as usize }
    }

    pub(crate) fn open(device: &str, conf: &SnifferConf) -> Result<AfPacketFeed, CaptureError> {
        let sizing = calculate_buffers(conf.afpacket_buffer_mib, conf.snaplen, page_size())?;

        let interface = datalink::interfaces()
            .into_iter()
            .find(|iface| iface.name == device)
            .ok_or_else(|| CaptureError::NoSuchDevice(device.to_string()))?;

        let config = Config {
            read_buffer_size: sizing.block_size * sizing.block_count,
            read_timeout: Some(Duration::from_millis(100)),
            promiscuous: true,
            ..Config::default()
        };

        match datalink::channel(&interface, config) {
            Ok(Channel::Ethernet(_tx, rx)) => Ok(AfPacketFeed { rx }),
            Ok(_) => Err(CaptureError::Io(io::Error::other(
                "unsupported datalink channel type",
            ))),
            Err(e) => Err(CaptureError::Io(e)),
        }
    }

    impl AfPacketFeed {
        pub(crate) fn poll(&mut self) -> Result<FeedEvent, CaptureError> {
            match self.rx.next() {
                Ok(data) => {
                    let Some(segment) = parse_segment(data, true, SystemTime::now()) else {
                        return Ok(FeedEvent::Idle);
                    };
                    if !is_game_port(segment.flow.src_port) && !is_game_port(segment.flow.dst_port)
                    {
                        return Ok(FeedEvent::Idle);
                    }
                    Ok(FeedEvent::Segment(segment))
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
                    ) =>
                {
                    Ok(FeedEvent::Idle)
                }
                Err(e) => Err(CaptureError::Io(e)),
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) use fallback::{open, AfPacketFeed};

#[cfg(not(target_os = "linux"))]
mod fallback {
    use crate::capture::{CaptureError, FeedEvent};
    use crate::conf::SnifferConf;

    pub(crate) struct AfPacketFeed {}

    pub(crate) fn open(_device: &str, _conf: &SnifferConf) -> Result<AfPacketFeed, CaptureError> {
        Err(CaptureError::AfPacketUnsupported)
    }

    impl AfPacketFeed {
        pub(crate) fn poll(&mut self) -> Result<FeedEvent, CaptureError> {
            Err(CaptureError::AfPacketUnsupported)
        }
    }
}
