//! libpcap backend for live devices and stored capture files

use super::{CaptureBackend, CaptureMetadata, Counters, FilterExpression, RawPacket, ReadOutcome};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use pcap::{Activated, Capture, Linktype};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Read timeout for live devices (milliseconds)
const READ_TIMEOUT_MS: i32 = 1000;

enum Source {
    Device(String),
    File(PathBuf),
}

/// libpcap capture handle
pub struct LiveCapture {
    handle: Option<Capture<dyn Activated>>,
    source: Source,
    filter: Option<FilterExpression>,
    link_type: Linktype,
}

impl LiveCapture {
    /// Open a device in promiscuous mode with a 1 second read timeout
    pub fn open_device(device: &str, snaplen: i32) -> Result<Self> {
        let capture = Capture::from_device(device)
            .map_err(|e| Error::Setup(format!("setting pcap live mode: {}", e)))?
            .promisc(true)
            .snaplen(snaplen)
            .timeout(READ_TIMEOUT_MS)
            .open()
            .map_err(|e| Error::Setup(format!("setting pcap live mode: {}", e)))?;

        let link_type = capture.get_datalink();
        info!(device, snaplen, "opened pcap device");

        Ok(Self {
            handle: Some(capture.into()),
            source: Source::Device(device.to_string()),
            filter: None,
            link_type,
        })
    }

    /// Open a capture file, decompressing `.gz` input to a sibling file first
    pub fn open_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut path = path.as_ref().to_path_buf();
        if has_gz_suffix(&path) {
            path = ungzip(&path)?;
        }

        let capture = open_offline(&path)?;
        let link_type = capture.get_datalink();
        info!(file = %path.display(), "opened capture file");

        Ok(Self {
            handle: Some(capture),
            source: Source::File(path),
            filter: None,
            link_type,
        })
    }

    fn handle(&mut self) -> Result<&mut Capture<dyn Activated>> {
        self.handle
            .as_mut()
            .ok_or_else(|| Error::Capture("capture handle is closed".to_string()))
    }
}

fn open_offline(path: &Path) -> Result<Capture<dyn Activated>> {
    let capture = Capture::from_file(path)
        .map_err(|e| Error::Setup(format!("couldn't open file {}: {}", path.display(), e)))?;
    Ok(capture.into())
}

fn apply_filter(capture: &mut Capture<dyn Activated>, filter: &FilterExpression) -> Result<()> {
    capture
        .filter(filter.as_str(), true)
        .map_err(|e| Error::Setup(format!("SetBPFFilter '{}' for pcap: {}", filter, e)))
}

fn has_gz_suffix(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("gz"))
        .unwrap_or(false)
}

fn timestamp(ts: &libc::timeval) -> DateTime<Utc> {
    DateTime::from_timestamp(ts.tv_sec as i64, (ts.tv_usec as u32).saturating_mul(1000))
        .unwrap_or_else(Utc::now)
}

/// Decompress a gzip capture file next to the input.
///
/// The output is named after the file name stored in the gzip header, or
/// the input name without `.gz` when the header carries none.
pub fn ungzip(input: &Path) -> Result<PathBuf> {
    let file = File::open(input)?;
    let mut decoder = GzDecoder::new(BufReader::new(file));

    let name = decoder
        .header()
        .and_then(|h| h.filename())
        .map(|raw| String::from_utf8_lossy(raw).into_owned())
        .and_then(|name| Path::new(&name).file_name().map(|n| n.to_os_string()))
        .or_else(|| input.file_stem().map(|s| s.to_os_string()))
        .ok_or_else(|| Error::Setup(format!("cannot name output for {}", input.display())))?;

    let dir = input.parent().unwrap_or_else(|| Path::new("."));
    let output = dir.join(name);

    let mut writer = File::create(&output)?;
    io::copy(&mut decoder, &mut writer)?;
    debug!(from = %input.display(), to = %output.display(), "decompressed capture file");

    Ok(output)
}

impl CaptureBackend for LiveCapture {
    fn read_packet(&mut self) -> Result<ReadOutcome> {
        let handle = self.handle()?;
        match handle.next_packet() {
            Ok(packet) => Ok(ReadOutcome::Packet(RawPacket {
                data: packet.data.to_vec(),
                meta: CaptureMetadata {
                    timestamp: timestamp(&packet.header.ts),
                    length: packet.header.len as usize,
                    capture_length: packet.header.caplen as usize,
                },
            })),
            Err(pcap::Error::TimeoutExpired) => Ok(ReadOutcome::Timeout),
            Err(pcap::Error::IoError(io::ErrorKind::Interrupted)) => Ok(ReadOutcome::Timeout),
            Err(pcap::Error::NoMorePackets) => Ok(ReadOutcome::EndOfStream),
            Err(e) => Err(Error::Capture(e.to_string())),
        }
    }

    fn install_filter(&mut self, filter: &FilterExpression) -> Result<()> {
        apply_filter(self.handle()?, filter)?;
        self.filter = Some(filter.clone());
        Ok(())
    }

    fn link_type(&self) -> Linktype {
        self.link_type
    }

    fn stats(&mut self) -> Result<Option<Counters>> {
        if self.is_file_source() {
            return Ok(None);
        }
        let stat = self.handle()?.stats()?;
        Ok(Some(Counters::Live {
            received: stat.received as u64,
            dropped_os: stat.dropped as u64,
            dropped_if: stat.if_dropped as u64,
        }))
    }

    fn reopen(&mut self) -> Result<()> {
        let path = match &self.source {
            Source::File(path) => path.clone(),
            Source::Device(_) => {
                return Err(Error::Reopen(
                    "reopen is only possible for files in live mode".to_string(),
                ))
            }
        };

        self.close();
        let mut capture = open_offline(&path).map_err(|e| Error::Reopen(e.to_string()))?;
        if let Some(filter) = &self.filter {
            apply_filter(&mut capture, filter).map_err(|e| Error::Reopen(e.to_string()))?;
        }
        self.handle = Some(capture);
        Ok(())
    }

    fn is_file_source(&self) -> bool {
        matches!(self.source, Source::File(_))
    }

    fn close(&mut self) {
        if self.handle.take().is_some() {
            match &self.source {
                Source::Device(name) => debug!(device = %name, "closed pcap device"),
                Source::File(path) => debug!(file = %path.display(), "closed capture file"),
            }
        }
    }
}
