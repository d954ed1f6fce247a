//! sipsniff - packet acquisition core for a SIP/VoIP capture agent
//!
//! Selects a capture backend, compiles a BPF filter expression, pulls
//! link-layer frames off the wire (or out of a capture file), applies
//! content filters and hands surviving packets to a downstream worker.

pub mod capture;
pub mod config;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod telemetry;

pub use error::{Error, Result};
