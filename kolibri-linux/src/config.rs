//! Load config from file and environment.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use kolibri_core::protocol::SETTLE_DELAY;
use kolibri_core::{CONTROL_PORT, FILE_PORT};
use tracing::warn;

use crate::mux::MuxConfig;

/// Daemon configuration. File: ~/.config/kolibri/config.toml or /etc/kolibri/config.toml.
/// Env overrides: KOLIBRI_DEVICE_NAME, KOLIBRI_BIND_ADDR, KOLIBRI_CONTROL_PORT,
/// KOLIBRI_FILE_PORT, KOLIBRI_PEER_CONTROL_PORT, KOLIBRI_PEER_FILE_PORT,
/// KOLIBRI_RECEIVE_DIR, KOLIBRI_SETTLE_DELAY_MS.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Name announced in the handshake (default: host name).
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// Address both channels listen on (default 0.0.0.0).
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,
    /// Local control port (default 19810).
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    /// Local file port (default 19811).
    #[serde(default = "default_file_port")]
    pub file_port: u16,
    /// Control port dialed on the peer; defaults to `control_port`.
    #[serde(default)]
    pub peer_control_port: Option<u16>,
    /// File port dialed on the peer; defaults to `file_port`.
    #[serde(default)]
    pub peer_file_port: Option<u16>,
    /// Directory inbound files are written to.
    #[serde(default = "default_receive_dir")]
    pub receive_dir: PathBuf,
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
}

fn default_device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "kolibri".to_owned())
}
fn default_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_control_port() -> u16 {
    CONTROL_PORT
}
fn default_file_port() -> u16 {
    FILE_PORT
}
fn default_receive_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(h) => PathBuf::from(h).join(".local/share/kolibri/received"),
        None => PathBuf::from("/tmp/kolibri/received"),
    }
}
fn default_settle_delay_ms() -> u64 {
    SETTLE_DELAY.as_millis() as u64
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            bind_addr: default_bind_addr(),
            control_port: default_control_port(),
            file_port: default_file_port(),
            peer_control_port: None,
            peer_file_port: None,
            receive_dir: default_receive_dir(),
            settle_delay_ms: default_settle_delay_ms(),
        }
    }
}

impl Config {
    pub fn peer_control_port(&self) -> u16 {
        self.peer_control_port.unwrap_or(self.control_port)
    }

    pub fn peer_file_port(&self) -> u16 {
        self.peer_file_port.unwrap_or(self.file_port)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn mux_config(&self) -> MuxConfig {
        MuxConfig {
            bind_addr: self.bind_addr,
            file_port: self.file_port,
            peer_file_port: self.peer_file_port(),
            receive_dir: self.receive_dir.clone(),
        }
    }

    /// Apply `KOLIBRI_*` overrides. Values that fail to parse are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(s) = lookup("KOLIBRI_DEVICE_NAME").filter(|s| !s.is_empty()) {
            self.device_name = s;
        }
        if let Some(a) = lookup("KOLIBRI_BIND_ADDR").and_then(|s| s.parse().ok()) {
            self.bind_addr = a;
        }
        if let Some(p) = lookup("KOLIBRI_CONTROL_PORT").and_then(|s| s.parse().ok()) {
            self.control_port = p;
        }
        if let Some(p) = lookup("KOLIBRI_FILE_PORT").and_then(|s| s.parse().ok()) {
            self.file_port = p;
        }
        if let Some(p) = lookup("KOLIBRI_PEER_CONTROL_PORT").and_then(|s| s.parse().ok()) {
            self.peer_control_port = Some(p);
        }
        if let Some(p) = lookup("KOLIBRI_PEER_FILE_PORT").and_then(|s| s.parse().ok()) {
            self.peer_file_port = Some(p);
        }
        if let Some(d) = lookup("KOLIBRI_RECEIVE_DIR").filter(|s| !s.is_empty()) {
            self.receive_dir = PathBuf::from(d);
        }
        if let Some(ms) = lookup("KOLIBRI_SETTLE_DELAY_MS").and_then(|s| s.parse().ok()) {
            self.settle_delay_ms = ms;
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    c.apply_overrides(|key| std::env::var(key).ok());
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/kolibri/config.toml"));
    }
    out.push(PathBuf::from("/etc/kolibri/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => warn!(path = %p.display(), error = %e, "ignoring config file"),
                },
                Err(e) => warn!(path = %p.display(), error = %e, "cannot read config file"),
            }
            break;
        }
    }
    None
}
