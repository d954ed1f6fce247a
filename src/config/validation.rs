//! Configuration validation

use super::{BackendKind, CaptureConfig};

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn print_diagnostics(&self) {
        for warning in &self.warnings {
            println!("[WARN] {}", warning);
        }
        for error in &self.errors {
            println!("[ERROR] {}", error);
        }
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate configuration and return warnings/errors
pub fn validate(config: &CaptureConfig) -> ValidationResult {
    let mut result = ValidationResult::new();

    validate_source(config, &mut result);
    validate_sizes(config, &mut result);
    validate_port_range(config, &mut result);
    validate_replay(config, &mut result);

    result
}

fn validate_source(config: &CaptureConfig, result: &mut ValidationResult) {
    if config.backend == BackendKind::Tunnel {
        if config.device.is_some() {
            result.warn("device is ignored by the tunnel backend");
        }
        return;
    }

    if config.read_file.is_some() && config.backend != BackendKind::Live {
        result.error(format!(
            "read_file is only supported by the live backend, not {}",
            config.backend
        ));
    }

    if config.read_file.is_none() {
        match config.device.as_deref() {
            None | Some("") => result.error("a device or read_file is required"),
            Some("any") if !cfg!(target_os = "linux") => {
                result.error(format!("device any is not supported on {}", std::env::consts::OS))
            }
            _ => {}
        }
    }

    if config.backend == BackendKind::RingBuffer && !cfg!(target_os = "linux") {
        result.error("the ring-buffer backend requires Linux");
    }
}

fn validate_sizes(config: &CaptureConfig, result: &mut ValidationResult) {
    if config.snaplen <= 0 {
        result.warn(format!(
            "snaplen {} is not positive, using default {}",
            config.snaplen,
            config.effective_snaplen()
        ));
    }

    if config.backend == BackendKind::RingBuffer {
        if config.buffer_size_mb <= 0 {
            result.warn(format!(
                "buffer_size_mb {} is not positive, using default {}",
                config.buffer_size_mb,
                config.effective_buffer_size_mb()
            ));
        }
        if let Some(id) = config.fanout_id {
            if id > u16::MAX as u32 {
                result.error(format!("fanout_id {} does not fit in 16 bits", id));
            }
        }
    } else if config.fanout_id.is_some() {
        result.warn("fanout_id is only used by the ring-buffer backend");
    }
}

fn validate_port_range(config: &CaptureConfig, result: &mut ValidationResult) {
    let parsed = config
        .port_range
        .split_once('-')
        .and_then(|(lo, hi)| Some((lo.trim().parse::<u16>().ok()?, hi.trim().parse::<u16>().ok()?)));

    match parsed {
        Some((lo, hi)) if lo <= hi => {}
        Some((lo, hi)) => result.error(format!("port_range {}-{}: start is above end", lo, hi)),
        None => result.error(format!(
            "port_range {:?} must look like 5060-5090",
            config.port_range
        )),
    }
}

fn validate_replay(config: &CaptureConfig, result: &mut ValidationResult) {
    if config.read_file.is_none() {
        if config.replay_loop.is_some() {
            result.warn("replay_loop has no effect without read_file");
        }
        return;
    }

    if config.write_file.is_some() {
        result.warn("write_file is ignored while replaying a file");
    }
}
