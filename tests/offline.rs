//! Replaying real capture files through the libpcap backend

use flate2::{Compression, GzBuilder};
use pcap::{Capture, Linktype, Packet, PacketHeader};
use sipsniff::capture::{self, CaptureBackend, LiveCapture, ReadOutcome};
use sipsniff::config::CaptureConfig;
use sipsniff::engine::{filter_expression, CaptureEngine, EngineState, EngineTimings, RecordingWorker};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

const SIP_PORT: u16 = 5060;

/// Ethernet + IPv4 + UDP frame carrying `payload`
fn udp_frame(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
    frame.extend_from_slice(&[0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb]);
    frame.extend_from_slice(&0x0800u16.to_be_bytes());

    let total_len = (20 + 8 + payload.len()) as u16;
    frame.extend_from_slice(&[0x45, 0x00]);
    frame.extend_from_slice(&total_len.to_be_bytes());
    frame.extend_from_slice(&[0x00, 0x01, 0x00, 0x00, 64, 17, 0x00, 0x00]);
    frame.extend_from_slice(&[10, 0, 0, 1]);
    frame.extend_from_slice(&[10, 0, 0, 2]);

    frame.extend_from_slice(&src_port.to_be_bytes());
    frame.extend_from_slice(&dst_port.to_be_bytes());
    frame.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    frame.extend_from_slice(&[0x00, 0x00]);

    frame.extend_from_slice(payload);
    frame
}

fn sip_payload(method: &str) -> Vec<u8> {
    let mut payload = format!(
        "{} sip:bob@example.com SIP/2.0\r\nVia: SIP/2.0/UDP 10.0.0.1:5060\r\nFrom: <sip:alice@example.com>\r\nTo: <sip:bob@example.com>\r\nCall-ID: a84b4c76e66710\r\n",
        method
    )
    .into_bytes();
    payload.resize(payload.len().max(200), b' ');
    payload
}

/// Writes INVITE, an unrelated UDP datagram and BYE, 10 ms apart.
fn write_capture(path: &Path) -> Vec<Vec<u8>> {
    let frames = vec![
        udp_frame(SIP_PORT, SIP_PORT, &sip_payload("INVITE")),
        udp_frame(40000, 9999, b"not sip"),
        udp_frame(SIP_PORT, SIP_PORT, &sip_payload("BYE")),
    ];

    let mut savefile = Capture::dead(Linktype::ETHERNET)
        .unwrap()
        .savefile(path)
        .unwrap();
    for (i, frame) in frames.iter().enumerate() {
        let header = PacketHeader {
            ts: libc::timeval {
                tv_sec: 1_700_000_000,
                tv_usec: (i as libc::suseconds_t) * 10_000,
            },
            caplen: frame.len() as u32,
            len: frame.len() as u32,
        };
        savefile.write(&Packet::new(&header, frame));
    }
    savefile.flush().unwrap();

    vec![frames[0].clone(), frames[2].clone()]
}

fn gzip_copy(input: &Path, output: &Path, embedded_name: &str) {
    let data = std::fs::read(input).unwrap();
    let mut encoder = GzBuilder::new()
        .filename(embedded_name)
        .write(File::create(output).unwrap(), Compression::default());
    encoder.write_all(&data).unwrap();
    encoder.finish().unwrap();
}

fn sip_config(read_file: PathBuf) -> CaptureConfig {
    CaptureConfig {
        read_file: Some(read_file),
        mode: "SIP".to_string(),
        ..Default::default()
    }
}

fn replay(config: &CaptureConfig) -> (RecordingWorker, EngineState) {
    let worker = RecordingWorker::new();
    let mut engine = CaptureEngine::new(config, Box::new(worker.clone()))
        .unwrap()
        .with_timings(EngineTimings::immediate());
    assert!(engine.is_file_source());
    assert_eq!(engine.link_type(), Linktype::ETHERNET);

    engine.run().unwrap();
    let state = engine.state().clone();
    (worker, state)
}

#[test]
fn test_filter_applies_to_capture_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("calls.pcap");
    let expected = write_capture(&path);

    let (worker, state) = replay(&sip_config(path));

    assert_eq!(state, EngineState::Stopped);
    let data: Vec<_> = worker.packets().into_iter().map(|p| p.data).collect();
    assert_eq!(data, expected);
}

#[test]
fn test_gzip_capture_is_decompressed_first() {
    let dir = tempfile::tempdir().unwrap();
    let plain = dir.path().join("calls.pcap");
    let expected = write_capture(&plain);
    let gz = dir.path().join("upload.PCAP.GZ");
    gzip_copy(&plain, &gz, "restored.pcap");

    let (worker, _) = replay(&sip_config(gz));

    assert!(dir.path().join("restored.pcap").exists());
    assert_eq!(worker.len(), expected.len());
}

#[test]
fn test_loop_reopens_file_with_filter() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("calls.pcap");
    write_capture(&path);
    let config = CaptureConfig {
        replay_loop: Some(2),
        ..sip_config(path)
    };

    let (worker, state) = replay(&config);

    assert_eq!(state, EngineState::Stopped);
    assert_eq!(worker.len(), 6);
}

#[test]
fn test_content_filters_on_capture_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("calls.pcap");
    write_capture(&path);
    let config = CaptureConfig {
        discard: "BYE".to_string(),
        ..sip_config(path)
    };

    let (worker, _) = replay(&config);

    let packets = worker.packets();
    assert_eq!(packets.len(), 1);
    assert!(packets[0].data.windows(6).any(|w| w == b"INVITE"));
}

#[test]
fn test_live_capture_reads_then_ends() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("calls.pcap");
    write_capture(&path);

    let mut backend = LiveCapture::open_file(&path).unwrap();
    assert!(backend.is_file_source());
    assert!(backend.stats().unwrap().is_none());

    let mut packets = 0;
    loop {
        match backend.read_packet().unwrap() {
            ReadOutcome::Packet(packet) => {
                assert_eq!(packet.meta.timestamp.timestamp(), 1_700_000_000);
                assert_eq!(packet.meta.capture_length, packet.data.len());
                packets += 1;
            }
            ReadOutcome::Timeout => continue,
            ReadOutcome::EndOfStream => break,
        }
    }
    assert_eq!(packets, 3);

    backend.reopen().unwrap();
    assert!(matches!(backend.read_packet().unwrap(), ReadOutcome::Packet(_)));
    backend.close();
    assert!(backend.read_packet().is_err());
}

#[test]
fn test_open_uses_configured_filter() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("calls.pcap");
    write_capture(&path);
    let config = sip_config(path);

    let mut backend = capture::open(&config, &filter_expression(&config)).unwrap();
    let mut packets = 0;
    while let ReadOutcome::Packet(_) = backend.read_packet().unwrap() {
        packets += 1;
    }
    assert_eq!(packets, 2);
}
