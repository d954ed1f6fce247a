//! VXLAN tunnel endpoint backend
//!
//! Mirrored traffic arrives VXLAN-encapsulated over UDP. Each datagram is
//! stripped of its 8 byte header and the inner Ethernet frame is returned.

use super::{CaptureBackend, CaptureMetadata, FilterExpression, RawPacket, ReadOutcome};
use crate::protocol::ethernet::Frame;
use crate::protocol::vxlan::{VxlanHeader, VXLAN_HEADER_LEN};
use crate::{Error, Result};
use pcap::Linktype;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;
use tracing::{debug, warn};

const READ_TIMEOUT: Duration = Duration::from_secs(1);
/// Largest UDP payload we will ever be handed
const MAX_DATAGRAM: usize = 65535;

pub struct TunnelCapture {
    socket: Option<UdpSocket>,
    buffer: Vec<u8>,
    snaplen: usize,
}

impl TunnelCapture {
    /// Listen for VXLAN datagrams on all IPv4 addresses.
    ///
    /// Port 0 binds an ephemeral port, see [`TunnelCapture::local_addr`].
    pub fn bind(port: u16, snaplen: usize) -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))
            .map_err(|e| Error::Setup(format!("vxlan listen on udp port {}: {}", port, e)))?;
        socket
            .set_read_timeout(Some(READ_TIMEOUT))
            .map_err(|e| Error::Setup(format!("vxlan read timeout: {}", e)))?;

        Ok(Self {
            socket: Some(socket),
            buffer: vec![0; MAX_DATAGRAM],
            snaplen,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        match &self.socket {
            Some(socket) => Ok(socket.local_addr()?),
            None => Err(Error::Capture("tunnel socket is closed".to_string())),
        }
    }
}

impl CaptureBackend for TunnelCapture {
    fn read_packet(&mut self) -> Result<ReadOutcome> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| Error::Capture("tunnel socket is closed".to_string()))?;

        let (data, wire_len) = loop {
            let (len, from) = match socket.recv_from(&mut self.buffer) {
                Ok((len, from)) if len < VXLAN_HEADER_LEN => {
                    warn!(%from, len, "received runt vxlan datagram");
                    continue;
                }
                Ok(received) => received,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                    ) =>
                {
                    return Ok(ReadOutcome::Timeout)
                }
                Err(e) => return Err(Error::Capture(e.to_string())),
            };

            let datagram = &self.buffer[..len];
            let header = VxlanHeader::parse(datagram)
                .map_err(|e| Error::Capture(format!("vxlan header from {}: {}", from, e)))?;
            let frame = match Frame::parse(&datagram[VXLAN_HEADER_LEN..]) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(%from, vni = header.vni, error = %e, "dropping truncated inner frame");
                    continue;
                }
            };
            debug!(
                vni = header.vni,
                vlan = ?frame.vlan_id(),
                len = frame.as_bytes().len(),
                "decapsulated vxlan frame"
            );

            let wire_len = frame.as_bytes().len();
            break (frame.as_bytes()[..wire_len.min(self.snaplen)].to_vec(), wire_len);
        };

        let mut meta = CaptureMetadata::now(wire_len);
        meta.capture_length = data.len();

        Ok(ReadOutcome::Packet(RawPacket { data, meta }))
    }

    fn install_filter(&mut self, _filter: &FilterExpression) -> Result<()> {
        Ok(())
    }

    fn link_type(&self) -> Linktype {
        Linktype::ETHERNET
    }

    fn close(&mut self) {
        if self.socket.take().is_some() {
            debug!("closed vxlan listener");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    fn sender() -> UdpSocket {
        UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap()
    }

    fn target(capture: &TunnelCapture) -> SocketAddr {
        let port = capture.local_addr().unwrap().port();
        SocketAddr::from((Ipv4Addr::LOCALHOST, port))
    }

    fn inner_frame() -> Vec<u8> {
        let mut frame = vec![
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0x08, 0x00,
        ];
        frame.extend_from_slice(b"INVITE sip:bob@example.com SIP/2.0");
        frame
    }

    /// VNI 42 with the I flag set
    fn encapsulate(frame: &[u8]) -> Vec<u8> {
        let mut datagram = vec![0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x2a, 0x00];
        datagram.extend_from_slice(frame);
        datagram
    }

    #[test]
    fn test_strips_vxlan_header() {
        let mut capture = TunnelCapture::bind(0, 65535).unwrap();
        let frame = inner_frame();
        sender().send_to(&encapsulate(&frame), target(&capture)).unwrap();

        match capture.read_packet().unwrap() {
            ReadOutcome::Packet(packet) => {
                assert_eq!(packet.data, frame);
                assert_eq!(packet.meta.length, frame.len());
                assert_eq!(packet.meta.capture_length, frame.len());
            }
            other => panic!("expected packet, got {:?}", other),
        }
    }

    #[test]
    fn test_runt_datagram_is_skipped() {
        let mut capture = TunnelCapture::bind(0, 65535).unwrap();
        let to = target(&capture);
        let tx = sender();
        let frame = inner_frame();
        tx.send_to(&[0x08, 0x00, 0x00], to).unwrap();
        tx.send_to(&encapsulate(&frame), to).unwrap();

        match capture.read_packet().unwrap() {
            ReadOutcome::Packet(packet) => assert_eq!(packet.data, frame),
            other => panic!("expected packet, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_inner_frame_is_skipped() {
        let mut capture = TunnelCapture::bind(0, 65535).unwrap();
        let to = target(&capture);
        let tx = sender();
        let frame = inner_frame();
        tx.send_to(&encapsulate(&frame[..13]), to).unwrap();
        tx.send_to(&encapsulate(&frame), to).unwrap();

        match capture.read_packet().unwrap() {
            ReadOutcome::Packet(packet) => assert_eq!(packet.data, frame),
            other => panic!("expected packet, got {:?}", other),
        }
    }

    #[test]
    fn test_snaplen_truncates() {
        let mut capture = TunnelCapture::bind(0, 20).unwrap();
        let frame = inner_frame();
        sender().send_to(&encapsulate(&frame), target(&capture)).unwrap();

        match capture.read_packet().unwrap() {
            ReadOutcome::Packet(packet) => {
                assert_eq!(packet.data, &frame[..20]);
                assert_eq!(packet.meta.length, frame.len());
                assert_eq!(packet.meta.capture_length, 20);
            }
            other => panic!("expected packet, got {:?}", other),
        }
    }

    #[test]
    fn test_idle_socket_times_out() {
        let mut capture = TunnelCapture::bind(0, 65535).unwrap();
        assert!(matches!(capture.read_packet().unwrap(), ReadOutcome::Timeout));
    }

    #[test]
    fn test_read_after_close() {
        let mut capture = TunnelCapture::bind(0, 65535).unwrap();
        capture.close();
        assert!(capture.read_packet().is_err());
        assert!(capture.local_addr().is_err());
    }
}
