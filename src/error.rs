use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("pcap error: {0}")]
    Pcap(#[from] pcap::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("interface {name} not found")]
    InterfaceNotFound { name: String },

    /// Backend open, filter install, ring geometry or listener bind failure.
    #[error("setup error: {0}")]
    Setup(String),

    /// Hard read failure; ends the capture loop.
    #[error("sniffing error: {0}")]
    Capture(String),

    #[error("error reopening file: {0}")]
    Reopen(String),
}

pub type Result<T> = std::result::Result<T, Error>;
