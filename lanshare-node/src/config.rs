//! Load config from file and environment.

use serde::Deserialize;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use lanshare_core::wire::MAX_CHUNK_LEN;
use lanshare_core::DEFAULT_CHUNK_SIZE;

/// Node configuration. File: ~/.config/lanshare/config.toml or /etc/lanshare/config.toml.
/// Env overrides: LANSHARE_DISCOVERY_PORT, LANSHARE_CHUNK_PORT, LANSHARE_CONTROL_PORT,
/// LANSHARE_ACK_PORT, LANSHARE_CHUNK_SIZE.
///
/// Ports and `chunk_size` are shared by every node on the LAN: a peer is reached on
/// the same port numbers this node listens on.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Local address every listener binds (default 0.0.0.0).
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,
    /// Destination of discovery broadcasts (default 255.255.255.255).
    #[serde(default = "default_broadcast_addr")]
    pub broadcast_addr: IpAddr,
    /// Discovery UDP port (default 8080).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Chunk TCP port (default 8081).
    #[serde(default = "default_chunk_port")]
    pub chunk_port: u16,
    /// Control/message TCP port (default 50008).
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    /// Whole-file ack TCP port (default 50009).
    #[serde(default = "default_ack_port")]
    pub ack_port: u16,
    /// Chunk size in bytes (default 1 MiB).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Seconds between periodic discovery broadcasts, also the broadcast cooldown (default 5).
    #[serde(default = "default_advertise_interval_secs")]
    pub advertise_interval_secs: u64,
    /// Connect + write timeout for outbound sends (default 10).
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
    /// How long a sender waits for a whole-file ack (default 30).
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,
}

fn default_bind_addr() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}
fn default_broadcast_addr() -> IpAddr {
    IpAddr::from([255, 255, 255, 255])
}
fn default_discovery_port() -> u16 {
    8080
}
fn default_chunk_port() -> u16 {
    8081
}
fn default_control_port() -> u16 {
    50008
}
fn default_ack_port() -> u16 {
    50009
}
fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}
fn default_advertise_interval_secs() -> u64 {
    5
}
fn default_send_timeout_secs() -> u64 {
    10
}
fn default_ack_timeout_secs() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            broadcast_addr: default_broadcast_addr(),
            discovery_port: default_discovery_port(),
            chunk_port: default_chunk_port(),
            control_port: default_control_port(),
            ack_port: default_ack_port(),
            chunk_size: default_chunk_size(),
            advertise_interval_secs: default_advertise_interval_secs(),
            send_timeout_secs: default_send_timeout_secs(),
            ack_timeout_secs: default_ack_timeout_secs(),
        }
    }
}

impl Config {
    pub fn advertise_interval(&self) -> Duration {
        Duration::from_secs(self.advertise_interval_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    check_chunk_size(&mut c);
    c
}

/// Peers reject frames over `MAX_CHUNK_LEN`, and a zero size cannot split anything.
fn check_chunk_size(c: &mut Config) {
    let max = MAX_CHUNK_LEN as usize;
    if c.chunk_size == 0 {
        tracing::warn!("chunk_size 0 is invalid, using {}", DEFAULT_CHUNK_SIZE);
        c.chunk_size = DEFAULT_CHUNK_SIZE;
    } else if c.chunk_size > max {
        tracing::warn!("chunk_size {} exceeds {}, clamping", c.chunk_size, max);
        c.chunk_size = max;
    }
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    let port = |key: &str| var(key).and_then(|s| s.parse::<u16>().ok());
    if let Some(p) = port("LANSHARE_DISCOVERY_PORT") {
        c.discovery_port = p;
    }
    if let Some(p) = port("LANSHARE_CHUNK_PORT") {
        c.chunk_port = p;
    }
    if let Some(p) = port("LANSHARE_CONTROL_PORT") {
        c.control_port = p;
    }
    if let Some(p) = port("LANSHARE_ACK_PORT") {
        c.ack_port = p;
    }
    if let Some(n) = var("LANSHARE_CHUNK_SIZE").and_then(|s| s.parse::<usize>().ok()) {
        c.chunk_size = n;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/lanshare/config.toml"));
    }
    out.push(PathBuf::from("/etc/lanshare/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => tracing::warn!("ignoring {}: {}", p.display(), e),
                },
                Err(e) => tracing::warn!("cannot read {}: {}", p.display(), e),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.discovery_port, 8080);
        assert_eq!(c.chunk_port, 8081);
        assert_eq!(c.chunk_size, 1024 * 1024);
        assert_eq!(c.advertise_interval(), Duration::from_secs(5));
    }

    #[test]
    fn partial_file_fills_defaults() {
        let c: Config = toml::from_str("chunk_port = 9000\nchunk_size = 4096\n").unwrap();
        assert_eq!(c.chunk_port, 9000);
        assert_eq!(c.chunk_size, 4096);
        assert_eq!(c.control_port, 50008);
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128\n").is_err());
    }

    #[test]
    fn env_overrides_valid_values_only() {
        let vars: HashMap<&str, &str> = [
            ("LANSHARE_DISCOVERY_PORT", "9999"),
            ("LANSHARE_CHUNK_PORT", "not-a-port"),
            ("LANSHARE_CHUNK_SIZE", "65536"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        apply_env(&mut c, |k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(c.discovery_port, 9999);
        assert_eq!(c.chunk_port, 8081);
        assert_eq!(c.chunk_size, 65536);
    }

    #[test]
    fn chunk_size_kept_within_frame_limit() {
        let vars: HashMap<&str, &str> =
            [("LANSHARE_CHUNK_SIZE", "104857600")].into_iter().collect();
        let mut c = Config::default();
        apply_env(&mut c, |k| vars.get(k).map(|v| v.to_string()));
        check_chunk_size(&mut c);
        assert_eq!(c.chunk_size, 16 * 1024 * 1024);

        let mut c: Config = toml::from_str("chunk_size = 0\n").unwrap();
        check_chunk_size(&mut c);
        assert_eq!(c.chunk_size, DEFAULT_CHUNK_SIZE);

        let mut c = Config::default();
        check_chunk_size(&mut c);
        assert_eq!(c.chunk_size, 1024 * 1024);
    }
}
