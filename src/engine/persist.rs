//! Persistence of captured frames to a pcap file

use crate::capture::RawPacket;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use pcap::{Capture, Linktype, Packet, PacketHeader};
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Queue depth between the read loop and the file writer
pub const PERSIST_QUEUE_CAPACITY: usize = 20000;

/// Sending half of the persistence queue, owned by the engine
#[derive(Debug, Clone)]
pub struct PersistQueue {
    tx: mpsc::Sender<RawPacket>,
}

impl PersistQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<RawPacket>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queue a frame for the writer, blocking while the queue is full.
    ///
    /// Must be called from a blocking context, never from an async task.
    pub fn enqueue(&self, packet: RawPacket) -> bool {
        if self.tx.blocking_send(packet).is_err() {
            warn!("persistence writer is gone, dropping packet");
            return false;
        }
        true
    }
}

fn header(packet: &RawPacket) -> PacketHeader {
    PacketHeader {
        ts: timeval(&packet.meta.timestamp),
        caplen: packet.data.len() as u32,
        len: packet.meta.length.max(packet.data.len()) as u32,
    }
}

fn timeval(ts: &DateTime<Utc>) -> libc::timeval {
    libc::timeval {
        tv_sec: ts.timestamp() as libc::time_t,
        tv_usec: ts.timestamp_subsec_micros() as libc::suseconds_t,
    }
}

/// Creates the pcap file at `path`, then drains `rx` into it on a blocking
/// task.
///
/// Returns once the file is open; a file that cannot be created is an
/// [`Error::Setup`]. The task ends once every [`PersistQueue`] clone is
/// dropped and yields the number of frames written.
pub async fn spawn_writer(
    rx: mpsc::Receiver<RawPacket>,
    path: PathBuf,
    link_type: Linktype,
) -> Result<JoinHandle<Result<u64>>> {
    let (opened_tx, opened_rx) = oneshot::channel();
    let handle = tokio::task::spawn_blocking(move || write_all(rx, path, link_type, opened_tx));

    match opened_rx.await {
        Ok(Ok(())) => Ok(handle),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(Error::Setup("packet dump writer exited before opening".to_string())),
    }
}

fn write_all(
    mut rx: mpsc::Receiver<RawPacket>,
    path: PathBuf,
    link_type: Linktype,
    opened: oneshot::Sender<Result<()>>,
) -> Result<u64> {
    let created = Capture::dead(link_type).and_then(|dead| dead.savefile(&path));
    let mut savefile = match created {
        Ok(savefile) => {
            let _ = opened.send(Ok(()));
            savefile
        }
        Err(e) => {
            let message = format!("could not create {}: {}", path.display(), e);
            // close the queue before the caller hears about it
            drop(rx);
            let _ = opened.send(Err(Error::Setup(message.clone())));
            return Err(Error::Setup(message));
        }
    };
    info!(file = %path.display(), "writing captured packets");

    let mut written = 0u64;
    while let Some(packet) = rx.blocking_recv() {
        let header = header(&packet);
        savefile.write(&Packet::new(&header, &packet.data));
        written += 1;
    }

    savefile.flush()?;
    info!(file = %path.display(), written, "closed packet dump");
    Ok(written)
}
