//! Configuration types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_SNAPLEN: i32 = 65535;
pub const DEFAULT_BUFFER_SIZE_MB: i32 = 32;
pub const DEFAULT_PORT_RANGE: &str = "5060-5090";
pub const DEFAULT_TUNNEL_PORT: u16 = 4789;
pub const DEFAULT_MODE: &str = "SIPRTCP";

/// Capture backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// libpcap handle on a device or an offline file
    #[default]
    Live,
    /// AF_PACKET TPACKET_V3 ring with optional fanout
    RingBuffer,
    /// VXLAN de-encapsulating UDP listener
    Tunnel,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Live => write!(f, "live"),
            BackendKind::RingBuffer => write!(f, "ring-buffer"),
            BackendKind::Tunnel => write!(f, "tunnel"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = crate::Error;

    /// Accepts the config names plus the libpcap/af_packet/vxlan aliases.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "live" | "pcap" => Ok(BackendKind::Live),
            "ring-buffer" | "af_packet" | "afpacket" => Ok(BackendKind::RingBuffer),
            "tunnel" | "vxlan" => Ok(BackendKind::Tunnel),
            other => Err(crate::Error::Config(format!("unknown capture backend: {}", other))),
        }
    }
}

/// How many times a capture file is read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayLoop {
    /// Read the file once
    Once,
    /// Read the file once plus this many extra passes
    Extra(u32),
    /// Reopen the file until stopped
    Forever,
}

impl ReplayLoop {
    /// Returns true if another pass is allowed after `passes_done` complete passes.
    pub fn allows_another(&self, passes_done: u64) -> bool {
        match *self {
            ReplayLoop::Once => false,
            ReplayLoop::Extra(n) => passes_done <= n as u64,
            ReplayLoop::Forever => true,
        }
    }
}

/// Logging section of the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_snaplen() -> i32 {
    DEFAULT_SNAPLEN
}

fn default_buffer_size_mb() -> i32 {
    DEFAULT_BUFFER_SIZE_MB
}

fn default_port_range() -> String {
    DEFAULT_PORT_RANGE.to_string()
}

fn default_tunnel_port() -> u16 {
    DEFAULT_TUNNEL_PORT
}

fn default_mode() -> String {
    DEFAULT_MODE.to_string()
}

/// Capture configuration (sipsniff.toml)
///
/// Treated as immutable once an engine has been built from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default)]
    pub backend: BackendKind,
    /// Filter mode: SIP, SIPDNS, SIPLOG, SIPRTP or SIPRTCP
    #[serde(default = "default_mode")]
    pub mode: String,
    /// Device to capture on (`any` for all devices on Linux)
    #[serde(default)]
    pub device: Option<String>,
    /// Capture file to replay instead of a device
    #[serde(default)]
    pub read_file: Option<PathBuf>,
    #[serde(default = "default_snaplen")]
    pub snaplen: i32,
    #[serde(default = "default_port_range")]
    pub port_range: String,
    #[serde(default)]
    pub with_vlan: bool,
    #[serde(default)]
    pub with_erspan: bool,
    /// Ring-buffer size budget in MB
    #[serde(default = "default_buffer_size_mb")]
    pub buffer_size_mb: i32,
    #[serde(default)]
    pub fanout_id: Option<u32>,
    #[serde(default = "default_tunnel_port")]
    pub tunnel_port: u16,
    /// Extra passes over `read_file`: absent or negative reads once, 0 loops forever
    #[serde(default)]
    pub replay_loop: Option<i64>,
    /// Read the file at maximum speed and keep its timestamps
    #[serde(default)]
    pub read_speed: bool,
    /// Comma-separated substrings every packet must contain
    #[serde(default)]
    pub filter: String,
    /// Comma-separated substrings that drop a packet
    #[serde(default)]
    pub discard: String,
    /// Capture file the persistence writer appends live packets to
    #[serde(default)]
    pub write_file: Option<PathBuf>,
    /// Wait for enter before every read
    #[serde(default)]
    pub step: bool,
    #[serde(default)]
    pub log: LogSection,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            mode: default_mode(),
            device: None,
            read_file: None,
            snaplen: DEFAULT_SNAPLEN,
            port_range: default_port_range(),
            with_vlan: false,
            with_erspan: false,
            buffer_size_mb: DEFAULT_BUFFER_SIZE_MB,
            fanout_id: None,
            tunnel_port: DEFAULT_TUNNEL_PORT,
            replay_loop: None,
            read_speed: false,
            filter: String::new(),
            discard: String::new(),
            write_file: None,
            step: false,
            log: LogSection::default(),
        }
    }
}

impl CaptureConfig {
    /// Snapshot length with non-positive values replaced by the default.
    pub fn effective_snaplen(&self) -> i32 {
        if self.snaplen <= 0 {
            DEFAULT_SNAPLEN
        } else {
            self.snaplen
        }
    }

    /// Ring-buffer budget with non-positive values replaced by the default.
    pub fn effective_buffer_size_mb(&self) -> i32 {
        if self.buffer_size_mb <= 0 {
            DEFAULT_BUFFER_SIZE_MB
        } else {
            self.buffer_size_mb
        }
    }

    pub fn replay_loop(&self) -> ReplayLoop {
        match self.replay_loop {
            None => ReplayLoop::Once,
            Some(n) if n < 0 => ReplayLoop::Once,
            Some(0) => ReplayLoop::Forever,
            Some(n) => ReplayLoop::Extra(n.min(u32::MAX as i64) as u32),
        }
    }

    pub fn inclusions(&self) -> Vec<String> {
        split_list(&self.filter)
    }

    pub fn exclusions(&self) -> Vec<String> {
        split_list(&self.discard)
    }
}

fn split_list(value: &str) -> Vec<String> {
    if value.is_empty() {
        return Vec::new();
    }
    value.split(',').map(str::to_string).collect()
}
