//! Telemetry: logging, engine counters, periodic stats and shutdown.

mod logging;
mod metrics;
pub mod shutdown;
pub mod stats;

pub use logging::init_logging;
pub use metrics::{Counter, EngineMetrics};
pub use shutdown::shutdown_on_signal;
pub use stats::StatsReporter;
