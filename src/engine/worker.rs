//! Packet sinks fed by the capture engine

use crate::capture::CaptureMetadata;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Downstream consumer of captured frames.
///
/// Called synchronously from the read loop, so a slow worker slows capture.
pub trait Worker: Send {
    fn on_packet(&mut self, data: &[u8], meta: &CaptureMetadata);
}

impl<W: Worker + ?Sized> Worker for Box<W> {
    fn on_packet(&mut self, data: &[u8], meta: &CaptureMetadata) {
        (**self).on_packet(data, meta)
    }
}

/// Logs a one-line summary of every frame.
///
/// Stands in for the protocol decoder, which lives outside this crate.
#[derive(Debug, Default)]
pub struct SummaryWorker {
    seen: u64,
}

impl SummaryWorker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Worker for SummaryWorker {
    fn on_packet(&mut self, data: &[u8], meta: &CaptureMetadata) {
        self.seen += 1;
        debug!(
            seq = self.seen,
            ts = %meta.timestamp,
            len = meta.length,
            caplen = meta.capture_length,
            bytes = data.len(),
            "packet"
        );
    }
}

/// A frame as handed to a [`RecordingWorker`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recorded {
    pub data: Vec<u8>,
    pub meta: CaptureMetadata,
}

/// Keeps every dispatched frame in memory.
///
/// Clones share the same record, so a test can keep one clone while the
/// engine owns another.
#[derive(Debug, Clone, Default)]
pub struct RecordingWorker {
    packets: Arc<Mutex<Vec<Recorded>>>,
}

impl RecordingWorker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Recorded>> {
        self.packets.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn packets(&self) -> Vec<Recorded> {
        self.lock().clone()
    }
}

impl Worker for RecordingWorker {
    fn on_packet(&mut self, data: &[u8], meta: &CaptureMetadata) {
        self.lock().push(Recorded {
            data: data.to_vec(),
            meta: meta.clone(),
        });
    }
}
