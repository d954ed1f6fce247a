//! Capture engine
//!
//! Owns the one open capture backend and drives the read loop:
//! read, content filter, replay pacing, persistence, dispatch. File sources
//! are reopened at end of stream while the replay budget allows.
//!
//! The loop is synchronous and blocks for at most one backend read timeout
//! per iteration; run it on a dedicated thread or `spawn_blocking`.

mod persist;
mod step;
mod worker;

pub use persist::{spawn_writer, PersistQueue, PERSIST_QUEUE_CAPACITY};
pub use step::{StdinPrompt, StepPrompt};
pub use worker::{Recorded, RecordingWorker, SummaryWorker, Worker};

use crate::capture::{
    self, filter, ActiveBackend, CaptureBackend, CaptureMetadata, Counters, FilterExpression,
    FilterMode, RawPacket, ReadOutcome,
};
use crate::config::{CaptureConfig, ReplayLoop};
use crate::telemetry::EngineMetrics;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use pcap::Linktype;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Engine lifecycle.
///
/// `Running` and `Draining` cycle while a file is replayed; `Stopped` and
/// `Failed` are terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineState {
    Running,
    Draining,
    Stopped,
    Failed(String),
}

impl EngineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineState::Stopped | EngineState::Failed(_))
    }
}

/// Fixed waits in the read loop
#[derive(Debug, Clone, Copy)]
pub struct EngineTimings {
    /// Wait before a capture file is reopened
    pub reopen_grace: Duration,
    /// Wait after the last pass so in-flight dispatch can finish
    pub flush_grace: Duration,
    /// Minimum gap between backend counter reads
    pub stats_refresh: Duration,
}

impl Default for EngineTimings {
    fn default() -> Self {
        Self {
            reopen_grace: Duration::from_millis(250),
            flush_grace: Duration::from_millis(200),
            stats_refresh: Duration::from_secs(1),
        }
    }
}

impl EngineTimings {
    /// No waits at all.
    pub fn immediate() -> Self {
        Self {
            reopen_grace: Duration::ZERO,
            flush_grace: Duration::ZERO,
            stats_refresh: Duration::ZERO,
        }
    }
}

/// Cancels a running engine.
///
/// Checked once per loop iteration. Clones share the same flag.
#[derive(Debug, Clone)]
pub struct StopHandle {
    alive: Arc<AtomicBool>,
    notify: Arc<watch::Sender<bool>>,
}

impl Default for StopHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StopHandle {
    pub fn new() -> Self {
        let (notify, _) = watch::channel(false);
        Self {
            alive: Arc::new(AtomicBool::new(true)),
            notify: Arc::new(notify),
        }
    }

    pub fn stop(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.notify.send_replace(true);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Resolves once [`StopHandle::stop`] has been called on any clone.
    pub async fn stopped(&self) {
        let mut rx = self.notify.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

/// Last backend counters seen by the engine, shared with the stats reporter
#[derive(Debug, Clone, Default)]
pub struct CounterSnapshot(Arc<Mutex<Option<Counters>>>);

impl CounterSnapshot {
    pub fn get(&self) -> Option<Counters> {
        *self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set(&self, counters: Counters) {
        *self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(counters);
    }
}

/// Read loop over one capture backend
pub struct CaptureEngine<B: CaptureBackend = ActiveBackend> {
    backend: B,
    worker: Box<dyn Worker>,
    inclusions: Vec<Vec<u8>>,
    exclusions: Vec<Vec<u8>>,
    replay: ReplayLoop,
    read_speed: bool,
    file_source: bool,
    persist: Option<PersistQueue>,
    prompt: Option<Box<dyn StepPrompt>>,
    timings: EngineTimings,
    stop: StopHandle,
    state: EngineState,
    metrics: Arc<EngineMetrics>,
    counters: CounterSnapshot,
    last_refresh: Option<Instant>,
    last_timestamp: Option<DateTime<Utc>>,
    passes: u64,
}

impl CaptureEngine<ActiveBackend> {
    /// Builds the filter expression, opens the configured backend and
    /// installs the filter on it.
    pub fn new(config: &CaptureConfig, worker: Box<dyn Worker>) -> Result<Self> {
        let expression = filter_expression(config);
        info!(bpf = %expression, "using filter expression");

        let inclusions = config.inclusions();
        if !inclusions.is_empty() {
            info!(filter = ?inclusions, "keeping only packets containing all of");
        }
        let exclusions = config.exclusions();
        if !exclusions.is_empty() {
            info!(discard = ?exclusions, "discarding packets containing any of");
        }
        info!(
            os = std::env::consts::OS,
            arch = std::env::consts::ARCH,
            "starting capture"
        );

        let backend = capture::open(config, &expression)?;
        Ok(Self::with_backend(backend, config, worker))
    }

    pub fn backend_kind(&self) -> crate::config::BackendKind {
        self.backend.kind()
    }
}

/// Filter expression for the configured mode, ports and wrapping.
pub fn filter_expression(config: &CaptureConfig) -> FilterExpression {
    filter::build(
        FilterMode::from_name(&config.mode),
        &config.port_range,
        config.with_vlan,
        config.with_erspan,
    )
}

impl<B: CaptureBackend> CaptureEngine<B> {
    /// Wraps an already open backend.
    pub fn with_backend(backend: B, config: &CaptureConfig, worker: Box<dyn Worker>) -> Self {
        let prompt: Option<Box<dyn StepPrompt>> = if config.step {
            Some(Box::new(StdinPrompt))
        } else {
            None
        };

        Self {
            file_source: backend.is_file_source(),
            backend,
            worker,
            inclusions: to_needles(config.inclusions()),
            exclusions: to_needles(config.exclusions()),
            replay: config.replay_loop(),
            read_speed: config.read_speed,
            persist: None,
            prompt,
            timings: EngineTimings::default(),
            stop: StopHandle::new(),
            state: EngineState::Running,
            metrics: Arc::new(EngineMetrics::new()),
            counters: CounterSnapshot::default(),
            last_refresh: None,
            last_timestamp: None,
            passes: 0,
        }
    }

    pub fn with_timings(mut self, timings: EngineTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Persists live frames through `queue`; ignored for file sources.
    pub fn with_persist(mut self, queue: PersistQueue) -> Self {
        self.persist = Some(queue);
        self
    }

    pub fn with_step_prompt(mut self, prompt: Box<dyn StepPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn metrics(&self) -> Arc<EngineMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.clone()
    }

    pub fn link_type(&self) -> Linktype {
        self.backend.link_type()
    }

    pub fn is_file_source(&self) -> bool {
        self.file_source
    }

    /// Runs the read loop until stopped, the replay budget is spent or a
    /// hard error occurs. The backend is closed on return either way.
    pub fn run(&mut self) -> Result<()> {
        if self.state.is_terminal() {
            return Err(Error::Capture("engine already finished".to_string()));
        }

        let result = self.read_loop();
        self.backend.close();
        // lets the dump writer drain and finish
        self.persist = None;
        self.metrics.log_summary();

        match &result {
            Ok(()) => info!("capture stopped"),
            Err(e) => error!(error = %e, "capture failed"),
        }
        result
    }

    fn read_loop(&mut self) -> Result<()> {
        while self.state == EngineState::Running {
            if !self.stop.is_alive() {
                self.state = EngineState::Stopped;
                break;
            }

            if let Some(prompt) = self.prompt.as_mut() {
                if let Err(e) = prompt.wait() {
                    return self.fail(e);
                }
            }

            self.refresh_counters();

            match self.backend.read_packet() {
                Ok(ReadOutcome::Timeout) => self.metrics.timeouts.inc(),
                Ok(ReadOutcome::Packet(packet)) => self.process(packet),
                Ok(ReadOutcome::EndOfStream) => self.end_of_stream()?,
                Err(e) => return self.fail(e),
            }
        }
        Ok(())
    }

    fn fail(&mut self, err: Error) -> Result<()> {
        self.state = EngineState::Failed(err.to_string());
        Err(err)
    }

    fn end_of_stream(&mut self) -> Result<()> {
        self.passes += 1;
        debug!(pass = self.passes, "end of file");

        if !self.replay.allows_another(self.passes) {
            self.state = EngineState::Draining;
            sleep(self.timings.flush_grace);
            self.state = EngineState::Stopped;
            return Ok(());
        }

        debug!("reopening the file");
        sleep(self.timings.reopen_grace);
        if let Err(e) = self.backend.reopen() {
            let err = match e {
                Error::Reopen(_) => e,
                other => Error::Reopen(other.to_string()),
            };
            return self.fail(err);
        }
        self.last_timestamp = None;
        self.metrics.reopened.inc();
        Ok(())
    }

    fn process(&mut self, mut packet: RawPacket) {
        if packet.data.is_empty() {
            return;
        }
        self.metrics.read.inc();

        if !self.inclusions.iter().all(|needle| contains(&packet.data, needle)) {
            self.metrics.not_included.inc();
            return;
        }
        if self.exclusions.iter().any(|needle| contains(&packet.data, needle)) {
            self.metrics.excluded.inc();
            return;
        }

        if self.file_source {
            self.pace(&mut packet.meta);
        } else if let Some(queue) = &self.persist {
            if queue.enqueue(packet.clone()) {
                self.metrics.persisted.inc();
            }
        }

        self.worker.on_packet(&packet.data, &packet.meta);
        self.metrics.dispatched.inc();
    }

    /// Sleeps for the original gap to the previous frame, then stamps the
    /// frame with the current time unless original timing was requested.
    fn pace(&mut self, meta: &mut CaptureMetadata) {
        if self.read_speed {
            self.last_timestamp = Some(meta.timestamp);
            return;
        }

        if let Some(previous) = self.last_timestamp {
            match (meta.timestamp - previous).to_std() {
                Ok(gap) => sleep(gap),
                Err(_) => warn!(
                    previous = %previous,
                    current = %meta.timestamp,
                    "time in capture file went backwards"
                ),
            }
        }
        self.last_timestamp = Some(meta.timestamp);
        meta.timestamp = Utc::now();
    }

    fn refresh_counters(&mut self) {
        if self.file_source {
            return;
        }
        let due = self
            .last_refresh
            .map_or(true, |at| at.elapsed() >= self.timings.stats_refresh);
        if !due {
            return;
        }
        self.last_refresh = Some(Instant::now());

        match self.backend.stats() {
            Ok(Some(counters)) => self.counters.set(counters),
            Ok(None) => {}
            Err(e) => debug!(error = %e, "could not read capture counters"),
        }
    }
}

fn to_needles(list: Vec<String>) -> Vec<Vec<u8>> {
    list.into_iter().map(String::into_bytes).collect()
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|window| window == needle)
}

fn sleep(duration: Duration) {
    if !duration.is_zero() {
        std::thread::sleep(duration);
    }
}
