//! Periodic capture counter reports

use crate::capture::Counters;
use crate::config::BackendKind;
use crate::engine::{CounterSnapshot, StopHandle};
use std::time::Duration;
use tokio::time::{interval_at, Instant};
use tracing::info;

pub const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Logs the engine's counter snapshot on a fixed tick until stopped.
pub struct StatsReporter {
    counters: CounterSnapshot,
    stop: StopHandle,
    period: Duration,
}

impl StatsReporter {
    pub fn new(counters: CounterSnapshot, stop: StopHandle) -> Self {
        Self {
            counters,
            stop,
            period: STATS_INTERVAL,
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Whether a source has counters worth reporting.
    ///
    /// Capture files and the tunnel listener keep none.
    pub fn applies_to(kind: BackendKind, file_source: bool) -> bool {
        !file_source && kind != BackendKind::Tunnel
    }

    /// Runs until the stop handle fires; returns how many reports were logged.
    pub async fn run(self) -> u64 {
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        let stopped = self.stop.stopped();
        tokio::pin!(stopped);

        let mut reports = 0;
        loop {
            tokio::select! {
                _ = &mut stopped => break,
                _ = ticker.tick() => {
                    if let Some(counters) = self.counters.get() {
                        info!("{}", report(&counters));
                        reports += 1;
                    }
                }
            }
        }
        reports
    }
}

/// One stats line in the shape of the reporting backend.
pub fn report(counters: &Counters) -> String {
    match counters {
        Counters::Live {
            received,
            dropped_os,
            dropped_if,
        } => format!(
            "Stats {{received dropped-os dropped-int}}: {{{} {} {}}}",
            received, dropped_os, dropped_if
        ),
        Counters::RingBuffer { received, dropped } => {
            format!("Stats {{received dropped}}: {{{} {}}}", received, dropped)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_live() {
        let line = report(&Counters::Live {
            received: 120,
            dropped_os: 3,
            dropped_if: 1,
        });
        assert_eq!(line, "Stats {received dropped-os dropped-int}: {120 3 1}");
    }

    #[test]
    fn test_report_ring_buffer() {
        let line = report(&Counters::RingBuffer {
            received: 42,
            dropped: 0,
        });
        assert_eq!(line, "Stats {received dropped}: {42 0}");
    }

    #[test]
    fn test_applies_to() {
        assert!(StatsReporter::applies_to(BackendKind::Live, false));
        assert!(StatsReporter::applies_to(BackendKind::RingBuffer, false));
        assert!(!StatsReporter::applies_to(BackendKind::Live, true));
        assert!(!StatsReporter::applies_to(BackendKind::Tunnel, false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reports_on_each_tick() {
        let counters = CounterSnapshot::default();
        counters.set(Counters::RingBuffer {
            received: 5,
            dropped: 0,
        });
        let stop = StopHandle::new();
        let reporter = tokio::spawn(StatsReporter::new(counters, stop.clone()).run());

        tokio::time::sleep(Duration::from_secs(150)).await;
        stop.stop();
        assert_eq!(reporter.await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_reported_without_counters() {
        let stop = StopHandle::new();
        let reporter = tokio::spawn(
            StatsReporter::new(CounterSnapshot::default(), stop.clone())
                .with_period(Duration::from_secs(1))
                .run(),
        );

        tokio::time::sleep(Duration::from_secs(10)).await;
        stop.stop();
        assert_eq!(reporter.await.unwrap(), 0);
    }
}
