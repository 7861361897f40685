use std::{error::Error, fmt};

use aetherscope::SnifferConf;
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::cli::Cli;

/// Resolved configuration. CLI flags (which also read their own
/// environment variables) take precedence; the optional YAML file fills in
/// what they leave unset, notably the sniffer tunables.
#[derive(Debug, Deserialize, Serialize)]
pub struct Conf {
    pub mode: String,
    pub source: String,
    #[serde(default)]
    pub opcodes: Vec<u16>,
    #[serde(default)]
    pub sniffer: SnifferConf,
}

impl Conf {
    pub fn load(cli: &Cli) -> Result<Conf, ConfError> {
        let mut figment = Figment::new()
            .merge(Serialized::defaults(cli))
            .join(Env::prefixed("AETHERSCOPE_"));

        if let Some(config_path) = &cli.config {
            figment = figment.join(Yaml::file(config_path));
        }

        let conf: Conf = figment.extract()?;
        Ok(conf)
    }
}

#[derive(Debug)]
pub enum ConfError {
    Extraction(figment::Error),
}

impl fmt::Display for ConfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfError::Extraction(e) => write!(f, "configuration error: {e}"),
        }
    }
}

impl Error for ConfError {}

impl From<figment::Error> for ConfError {
    fn from(e: figment::Error) -> Self {
        ConfError::Extraction(e)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        env, fs,
        path::PathBuf,
        time::{Duration, SystemTime, UNIX_EPOCH},
    };

    use clap::Parser as _;
    use serial_test::serial;

    use super::Conf;
    use crate::cli::Cli;

    fn clear_env_vars() {
        env::remove_var("AETHERSCOPE_MODE");
        env::remove_var("AETHERSCOPE_SOURCE");
        env::remove_var("AETHERSCOPE_CONFIG_PATH");
        env::remove_var("AETHERSCOPE_LOG_LEVEL");
    }

    fn unique_temp_path(filename: &str) -> PathBuf {
        let mut p = env::temp_dir();
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        p.push(format!("{nanos}_{filename}"));
        p
    }

    #[test]
    #[serial]
    fn defaults_come_from_cli() {
        clear_env_vars();
        let cli = Cli::parse_from(["aetherscope"]);
        let conf = Conf::load(&cli).expect("conf loads from defaults");
        assert_eq!(conf.mode, "pcap");
        assert_eq!(conf.source, "lo");
        assert!(conf.opcodes.is_empty());
        assert_eq!(conf.sniffer.frame_queue_capacity, 200);
    }

    #[test]
    #[serial]
    fn yaml_file_provides_sniffer_tunables() {
        clear_env_vars();
        let path = unique_temp_path("aetherscope.yaml");
        fs::write(
            &path,
            b"sniffer:\n  flush_interval: 5s\n  frame_queue_capacity: 32\n",
        )
        .expect("write temp yaml");

        let cli = Cli::parse_from(["aetherscope", "--config", path.to_str().unwrap()]);
        let conf = Conf::load(&cli).expect("conf loads from yaml");
        assert_eq!(conf.sniffer.flush_interval, Duration::from_secs(5));
        assert_eq!(conf.sniffer.frame_queue_capacity, 32);
        // Untouched tunables keep their defaults.
        assert_eq!(conf.sniffer.max_buffered_pages_total, 192);

        fs::remove_file(path).expect("remove temp yaml");
    }

    #[test]
    #[serial]
    fn cli_flags_win_over_yaml() {
        clear_env_vars();
        let path = unique_temp_path("aetherscope_cli.yaml");
        fs::write(&path, b"mode: file\nsource: dump.pcap\n").expect("write temp yaml");

        let cli = Cli::parse_from([
            "aetherscope",
            "--mode",
            "afpacket",
            "--source",
            "eth0",
            "--config",
            path.to_str().unwrap(),
        ]);
        let conf = Conf::load(&cli).expect("conf loads");
        assert_eq!(conf.mode, "afpacket");
        assert_eq!(conf.source, "eth0");

        fs::remove_file(path).expect("remove temp yaml");
    }
}
