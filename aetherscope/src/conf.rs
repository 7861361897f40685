use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for a sniffer pipeline.
///
/// Every field has a default matching the observed behavior of the game
/// client's traffic, so `SnifferConf::default()` is the configuration most
/// deployments run with. Durations deserialize from humantime strings
/// (`"3s"`, `"500ms"`).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SnifferConf {
    /// The interval between age-based flushes of stalled reassembly gaps,
    /// and the age beyond which a gap is skipped.
    /// - Default Value: `3s`
    #[serde(default = "defaults::flush_interval", with = "duration")]
    pub flush_interval: Duration,

    /// Capacity of the shared frame queue between the per-flow framers and
    /// the subscriber. Producers block when it is full; this is the
    /// pipeline's backpressure.
    /// - Default Value: `200`
    #[serde(default = "defaults::frame_queue_capacity")]
    pub frame_queue_capacity: usize,

    /// Capacity of the per-flow byte channel feeding a framer task.
    /// - Default Value: `64`
    #[serde(default = "defaults::flow_channel_capacity")]
    pub flow_channel_capacity: usize,

    /// Read buffer handed to each per-flow framer. A single frame must fit.
    /// - Default Value: `128 KiB`
    #[serde(default = "defaults::read_buffer_size")]
    pub read_buffer_size: usize,

    /// Cap on the declared length of a frame. Larger lengths are treated as
    /// stream corruption and resynced past.
    /// - Default Value: `1 MiB`
    #[serde(default = "defaults::max_frame_length")]
    pub max_frame_length: usize,

    /// Out-of-order pages buffered per connection before the oldest gap is
    /// dropped.
    /// - Default Value: `32`
    #[serde(default = "defaults::max_buffered_pages_per_flow")]
    pub max_buffered_pages_per_flow: usize,

    /// Out-of-order pages buffered across all connections before the oldest
    /// gap is dropped.
    /// - Default Value: `192`
    #[serde(default = "defaults::max_buffered_pages_total")]
    pub max_buffered_pages_total: usize,

    /// Capture snap length in bytes.
    /// - Default Value: `1600`
    #[serde(default = "defaults::snaplen")]
    pub snaplen: usize,

    /// Target size of the AF_PACKET mmap ring in MiB.
    /// - Default Value: `25`
    #[serde(default = "defaults::afpacket_buffer_mib")]
    pub afpacket_buffer_mib: usize,
}

impl Default for SnifferConf {
    fn default() -> SnifferConf {
        SnifferConf {
            flush_interval: defaults::flush_interval(),
            frame_queue_capacity: defaults::frame_queue_capacity(),
            flow_channel_capacity: defaults::flow_channel_capacity(),
            read_buffer_size: defaults::read_buffer_size(),
            max_frame_length: defaults::max_frame_length(),
            max_buffered_pages_per_flow: defaults::max_buffered_pages_per_flow(),
            max_buffered_pages_total: defaults::max_buffered_pages_total(),
            snaplen: defaults::snaplen(),
            afpacket_buffer_mib: defaults::afpacket_buffer_mib(),
        }
    }
}

mod defaults {
    use std::time::Duration;

    pub fn flush_interval() -> Duration {
        Duration::from_secs(3)
    }

    pub fn frame_queue_capacity() -> usize {
        200
    }

    pub fn flow_channel_capacity() -> usize {
        64
    }

    pub fn read_buffer_size() -> usize {
        128 * 1024
    }

    pub fn max_frame_length() -> usize {
        1024 * 1024
    }

    pub fn max_buffered_pages_per_flow() -> usize {
        32
    }

    pub fn max_buffered_pages_total() -> usize {
        192
    }

    pub fn snaplen() -> usize {
        1600
    }

    pub fn afpacket_buffer_mib() -> usize {
        25
    }
}

pub(crate) mod duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
