use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::Level;

#[derive(Parser, Debug, Serialize, Deserialize)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Capture mode: "pcap", "file", or "afpacket".
    #[arg(
        short,
        long,
        value_name = "MODE",
        env = "AETHERSCOPE_MODE",
        default_value = "pcap"
    )]
    pub mode: String,

    /// Network interface to capture from, or the capture file path in
    /// "file" mode.
    #[arg(
        short,
        long,
        value_name = "SOURCE",
        env = "AETHERSCOPE_SOURCE",
        default_value = "lo"
    )]
    pub source: String,

    /// Set the path to the configuration file (e.g., "aetherscope.yaml").
    #[arg(short, long, value_name = "FILE", env = "AETHERSCOPE_CONFIG_PATH")]
    pub config: Option<PathBuf>,

    /// Only print game events matching these opcodes. Repeatable; accepts
    /// decimal or 0x-prefixed hex.
    #[arg(short, long, value_name = "OPCODE", value_parser = parse_opcode)]
    pub opcodes: Vec<u16>,

    /// Set the application's log level (e.g., "debug", "warn").
    #[arg(
        short,
        long,
        value_name = "LEVEL",
        env = "AETHERSCOPE_LOG_LEVEL",
        default_value = "info"
    )]
    #[serde(with = "level_serde")]
    pub log_level: Level,
}

fn parse_opcode(value: &str) -> Result<u16, String> {
    let parsed = if let Some(hex) = value.strip_prefix("0x") {
        u16::from_str_radix(hex, 16)
    } else {
        value.parse()
    };
    parsed.map_err(|e| format!("invalid opcode {value:?}: {e}"))
}

mod level_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(level.as_str())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse::<Level>().map_err(serde::de::Error::custom)
    }
}
