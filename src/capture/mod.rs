//! Packet capture backends
//!
//! Provides one read interface over three structurally different sources:
//! - Live: libpcap handle on a device or a stored capture file
//! - RingBuffer: AF_PACKET TPACKET_V3 zero-copy ring, optionally fanned out
//! - Tunnel: UDP listener stripping VXLAN encapsulation

pub mod filter;
mod live;
#[cfg(target_os = "linux")]
mod ring;
mod tunnel;

pub use filter::{FilterExpression, FilterMode};
pub use live::{ungzip, LiveCapture};
#[cfg(target_os = "linux")]
pub use ring::{compute_geometry, RingBufferCapture, RingGeometry};
pub use tunnel::TunnelCapture;

use crate::config::{BackendKind, CaptureConfig};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use pcap::Linktype;
use tracing::info;

/// Per-packet capture information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureMetadata {
    pub timestamp: DateTime<Utc>,
    /// Length of the frame on the wire
    pub length: usize,
    /// Number of bytes actually captured
    pub capture_length: usize,
}

impl CaptureMetadata {
    /// Metadata for a fully captured frame seen now.
    pub fn now(length: usize) -> Self {
        Self {
            timestamp: Utc::now(),
            length,
            capture_length: length,
        }
    }
}

/// A link-layer frame owned by the caller once read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    pub data: Vec<u8>,
    pub meta: CaptureMetadata,
}

/// Result of a successful read call
#[derive(Debug)]
pub enum ReadOutcome {
    Packet(RawPacket),
    /// No data within the read deadline
    Timeout,
    /// Capture file exhausted
    EndOfStream,
}

/// Backend-reported counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counters {
    Live {
        received: u64,
        dropped_os: u64,
        dropped_if: u64,
    },
    RingBuffer {
        received: u64,
        dropped: u64,
    },
}

/// Packet source abstraction
///
/// Reads block for at most the backend read timeout. Soft conditions are
/// reported through [`ReadOutcome`]; only hard failures are errors.
pub trait CaptureBackend: Send {
    fn read_packet(&mut self) -> Result<ReadOutcome>;

    fn install_filter(&mut self, filter: &FilterExpression) -> Result<()>;

    fn link_type(&self) -> Linktype;

    /// Current counters, or `None` when the backend keeps none.
    fn stats(&mut self) -> Result<Option<Counters>> {
        Ok(None)
    }

    /// Closes and re-opens a file source from its first packet.
    fn reopen(&mut self) -> Result<()> {
        Err(Error::Reopen(
            "reopen is only possible for files in live mode".to_string(),
        ))
    }

    fn is_file_source(&self) -> bool {
        false
    }

    fn close(&mut self);
}

/// The one open backend handle
pub enum ActiveBackend {
    Live(LiveCapture),
    #[cfg(target_os = "linux")]
    RingBuffer(RingBufferCapture),
    Tunnel(TunnelCapture),
}

impl ActiveBackend {
    pub fn kind(&self) -> BackendKind {
        match self {
            ActiveBackend::Live(_) => BackendKind::Live,
            #[cfg(target_os = "linux")]
            ActiveBackend::RingBuffer(_) => BackendKind::RingBuffer,
            ActiveBackend::Tunnel(_) => BackendKind::Tunnel,
        }
    }

    fn inner(&mut self) -> &mut dyn CaptureBackend {
        match self {
            ActiveBackend::Live(b) => b,
            #[cfg(target_os = "linux")]
            ActiveBackend::RingBuffer(b) => b,
            ActiveBackend::Tunnel(b) => b,
        }
    }

    fn inner_ref(&self) -> &dyn CaptureBackend {
        match self {
            ActiveBackend::Live(b) => b,
            #[cfg(target_os = "linux")]
            ActiveBackend::RingBuffer(b) => b,
            ActiveBackend::Tunnel(b) => b,
        }
    }
}

impl CaptureBackend for ActiveBackend {
    fn read_packet(&mut self) -> Result<ReadOutcome> {
        self.inner().read_packet()
    }

    fn install_filter(&mut self, filter: &FilterExpression) -> Result<()> {
        self.inner().install_filter(filter)
    }

    fn link_type(&self) -> Linktype {
        self.inner_ref().link_type()
    }

    fn stats(&mut self) -> Result<Option<Counters>> {
        self.inner().stats()
    }

    fn reopen(&mut self) -> Result<()> {
        self.inner().reopen()
    }

    fn is_file_source(&self) -> bool {
        self.inner_ref().is_file_source()
    }

    fn close(&mut self) {
        self.inner().close()
    }
}

/// Opens the configured backend and installs the filter expression.
///
/// The tunnel backend receives already-selected traffic and takes no
/// filter.
pub fn open(config: &CaptureConfig, filter: &FilterExpression) -> Result<ActiveBackend> {
    let snaplen = config.effective_snaplen();

    let mut backend = match config.backend {
        BackendKind::Live => match &config.read_file {
            Some(path) => ActiveBackend::Live(LiveCapture::open_file(path)?),
            None => {
                let device = config.device.as_deref().ok_or_else(|| {
                    Error::Setup("a device or read_file is required".to_string())
                })?;
                ActiveBackend::Live(LiveCapture::open_device(device, snaplen)?)
            }
        },
        #[cfg(target_os = "linux")]
        BackendKind::RingBuffer => {
            let device = config.device.as_deref().unwrap_or("any");
            let mut ring = RingBufferCapture::open(
                device,
                config.effective_buffer_size_mb() as usize,
                snaplen as usize,
                config.with_vlan,
            )?;
            if let Some(id) = config.fanout_id.filter(|id| *id > 0) {
                let id = u16::try_from(id)
                    .map_err(|_| Error::Setup(format!("fanout id {} does not fit in 16 bits", id)))?;
                ring.set_fanout(id)?;
            }
            ActiveBackend::RingBuffer(ring)
        }
        #[cfg(not(target_os = "linux"))]
        BackendKind::RingBuffer => {
            return Err(Error::Setup(
                "the ring-buffer backend requires Linux".to_string(),
            ))
        }
        BackendKind::Tunnel => {
            let tunnel = TunnelCapture::bind(config.tunnel_port, snaplen as usize)?;
            info!(addr = %tunnel.local_addr()?, "listening for vxlan datagrams");
            return Ok(ActiveBackend::Tunnel(tunnel));
        }
    };

    backend.install_filter(filter)?;
    info!(backend = %config.backend, "capture backend ready");
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_metadata_now() {
        let meta = CaptureMetadata::now(60);
        assert_eq!(meta.length, 60);
        assert_eq!(meta.capture_length, 60);
    }

    #[test]
    fn test_open_missing_file_is_setup_error() {
        let config = CaptureConfig {
            read_file: Some(PathBuf::from("/nonexistent/calls.pcap")),
            ..Default::default()
        };
        let filter = filter::build(FilterMode::Sip, "5060-5090", false, false);
        assert!(open(&config, &filter).is_err());
    }

    #[test]
    fn test_open_live_without_device() {
        let config = CaptureConfig::default();
        let filter = filter::build(FilterMode::Sip, "5060-5090", false, false);
        assert!(matches!(open(&config, &filter), Err(Error::Setup(_))));
    }

    #[test]
    fn test_open_tunnel_is_tunnel() {
        let config = CaptureConfig {
            backend: BackendKind::Tunnel,
            tunnel_port: 0,
            ..Default::default()
        };
        let filter = filter::build(FilterMode::Sip, "5060-5090", false, false);
        let mut backend = open(&config, &filter).unwrap();
        assert_eq!(backend.kind(), BackendKind::Tunnel);
        assert_eq!(backend.link_type(), Linktype::ETHERNET);
        assert!(backend.stats().unwrap().is_none());
        assert!(matches!(backend.reopen(), Err(Error::Reopen(_))));
        backend.close();
    }
}
