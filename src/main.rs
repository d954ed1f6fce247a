use clap::{Args, Parser, Subcommand};
use sipsniff::config::{self, BackendKind, CaptureConfig};
use sipsniff::engine::{spawn_writer, CaptureEngine, PersistQueue, SummaryWorker, PERSIST_QUEUE_CAPACITY};
use sipsniff::telemetry::{init_logging, shutdown_on_signal, StatsReporter};
use std::path::PathBuf;
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::{error, info, warn};

/// How long the runtime waits for blocking tasks once capture is over
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "sipsniff")]
#[command(about = "Captures SIP/VoIP traffic from a device, a capture file or a VXLAN tunnel")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the capture engine
    Run(RunArgs),
    /// Validate a config file without capturing
    Validate {
        /// Path to the TOML config
        #[arg(short, long, default_value = "sipsniff.toml")]
        config: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Path to the TOML config; flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Device to listen on, `any` for every interface
    #[arg(short = 'i', long)]
    device: Option<String>,

    /// Read packets from a pcap file (.gz is decompressed first)
    #[arg(short = 'r', long)]
    read_file: Option<PathBuf>,

    /// Capture backend: live, ring-buffer or tunnel
    #[arg(short = 't', long)]
    backend: Option<BackendKind>,

    /// Filter mode: SIP, SIPDNS, SIPLOG, SIPRTP or SIPRTCP
    #[arg(short = 'm', long)]
    mode: Option<String>,

    /// Extra passes over the capture file, 0 loops forever
    #[arg(long = "loop", allow_negative_numbers = true)]
    replay_loop: Option<i64>,

    /// Keep original timestamps and skip replay pacing
    #[arg(long)]
    read_speed: bool,

    /// Wait for enter before every packet
    #[arg(long)]
    step: bool,

    /// Comma separated substrings that must all be present
    #[arg(long)]
    filter: Option<String>,

    /// Comma separated substrings that drop a packet
    #[arg(long)]
    discard: Option<String>,

    /// Dump captured packets to this pcap file
    #[arg(long)]
    write: Option<PathBuf>,
}

impl RunArgs {
    fn apply(&self, cfg: &mut CaptureConfig) {
        if let Some(device) = &self.device {
            cfg.device = Some(device.clone());
        }
        if let Some(path) = &self.read_file {
            cfg.read_file = Some(path.clone());
        }
        if let Some(backend) = self.backend {
            cfg.backend = backend;
        }
        if let Some(mode) = &self.mode {
            cfg.mode = mode.clone();
        }
        if self.replay_loop.is_some() {
            cfg.replay_loop = self.replay_loop;
        }
        cfg.read_speed |= self.read_speed;
        cfg.step |= self.step;
        if let Some(filter) = &self.filter {
            cfg.filter = filter.clone();
        }
        if let Some(discard) = &self.discard {
            cfg.discard = discard.clone();
        }
        if let Some(path) = &self.write {
            cfg.write_file = Some(path.clone());
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run(args) => cmd_run(&args),
        Commands::Validate { config } => {
            init_logging(None);
            cmd_validate(&config)
        }
    };

    if let Err(e) = result {
        eprintln!("[ERROR] {}", e);
        std::process::exit(1);
    }
}

fn cmd_run(args: &RunArgs) -> Result<(), String> {
    let mut cfg = match &args.config {
        Some(path) => config::load(path).map_err(|e| format!("Failed to load config: {}", e))?,
        None => CaptureConfig::default(),
    };
    args.apply(&mut cfg);
    init_logging(Some(&cfg.log));

    let validation = config::validate(&cfg);
    for warning in &validation.warnings {
        warn!("{}", warning);
    }
    if validation.has_errors() {
        validation.print_diagnostics();
        return Err("Invalid configuration".to_string());
    }

    let rt = Runtime::new().map_err(|e| format!("Failed to create runtime: {}", e))?;
    let result = rt.block_on(capture(cfg));
    rt.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
    result
}

async fn capture(cfg: CaptureConfig) -> Result<(), String> {
    let mut engine =
        CaptureEngine::new(&cfg, Box::new(SummaryWorker::new())).map_err(|e| e.to_string())?;
    let stop = engine.stop_handle();

    let writer = match &cfg.write_file {
        Some(path) if !engine.is_file_source() => {
            let (queue, rx) = PersistQueue::new(PERSIST_QUEUE_CAPACITY);
            let handle = spawn_writer(rx, path.clone(), engine.link_type())
                .await
                .map_err(|e| e.to_string())?;
            engine = engine.with_persist(queue);
            Some(handle)
        }
        _ => None,
    };

    if StatsReporter::applies_to(engine.backend_kind(), engine.is_file_source()) {
        tokio::spawn(StatsReporter::new(engine.counters(), stop.clone()).run());
    } else {
        info!("Read in pcap file or tunnel. Stats won't be generated.");
    }

    let mut capture = tokio::task::spawn_blocking(move || engine.run());

    tokio::select! {
        joined = &mut capture => {
            stop.stop();
            if let Some(writer) = writer {
                match writer.await {
                    Ok(Ok(written)) => info!(written, "packet dump complete"),
                    Ok(Err(e)) => error!(error = %e, "packet dump failed"),
                    Err(e) => error!(error = %e, "packet dump task panicked"),
                }
            }
            joined
                .map_err(|e| format!("capture task panicked: {}", e))?
                .map_err(|e| e.to_string())
        }
        signalled = shutdown_on_signal(stop.clone()) => {
            signalled.map_err(|e| format!("Failed to listen for signals: {}", e))?;
            info!("shutting down");
            Ok(())
        }
    }
}

fn cmd_validate(config_path: &PathBuf) -> Result<(), String> {
    println!("[INFO] Validating {}...", config_path.display());

    let cfg = config::load(config_path).map_err(|e| format!("Failed to parse config: {}", e))?;

    let validation = config::validate(&cfg);
    validation.print_diagnostics();

    if validation.has_errors() {
        Err("Validation failed".to_string())
    } else {
        println!("[INFO] Configuration is valid");
        Ok(())
    }
}
