//! Configuration management
//!
//! Loads the capture configuration from a TOML file and validates it
//! before an engine is built from it.

mod types;
mod validation;

pub use types::*;
pub use validation::{validate, ValidationResult};

use crate::{Error, Result};
use std::path::Path;

/// Load configuration from a TOML file
pub fn load<P: AsRef<Path>>(path: P) -> Result<CaptureConfig> {
    let content = std::fs::read_to_string(path).map_err(Error::Io)?;
    parse(&content)
}

/// Parse configuration from TOML text
pub fn parse(content: &str) -> Result<CaptureConfig> {
    toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            backend = "tunnel"
            tunnel_port = 8472
            filter = "INVITE"

            [log]
            level = "debug"
            "#
        )
        .unwrap();

        let cfg = load(file.path()).unwrap();
        assert_eq!(cfg.backend, BackendKind::Tunnel);
        assert_eq!(cfg.tunnel_port, 8472);
        assert_eq!(cfg.inclusions(), vec!["INVITE"]);
        assert_eq!(cfg.log.level, "debug");
        assert_eq!(cfg.log.format, "pretty");
    }

    #[test]
    fn test_parse_rejects_unknown_backend() {
        let err = parse(r#"backend = "dpdk""#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_load_missing_file() {
        let err = load("/nonexistent/sipsniff.toml").unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
