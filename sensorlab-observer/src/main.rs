//! SensorLab Observer CLI Application
//!
//! Runs the observer daemon for one node: a console on stdin drives the node
//! and experiment state machines, and every record they produce goes through
//! the configured transport. The `decode` mode turns a capture file back into
//! JSON lines.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sensorlab_codec::{CaptureReader, Decoder};
use sensorlab_observer::command::Command;
use sensorlab_observer::config::{self, ObserverConfig, TransportKind};
use sensorlab_observer::node::controller::ShellRunner;
use sensorlab_observer::node::serial::PortOpener;
use sensorlab_observer::node::Node;
use sensorlab_observer::observer::Observer;
use sensorlab_observer::output::{self, Emitter, FileTransport, LogTransport, Transport};
use sensorlab_observer::persistence::Persistence;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// SensorLab Observer - drive a sensor node and record what it reports
#[derive(Parser, Debug)]
#[command(name = "sensorlab-observer")]
#[command(about = "Observer daemon for SensorLab nodes", long_about = None)]
#[command(version)]
struct Args {
    #[command(subcommand)]
    mode: Mode,

    /// Verbosity level (can be repeated: -v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Run the observer, reading commands from stdin
    Run {
        /// Path to configuration file (observer.toml)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
    /// Print the records of a capture file as JSON lines
    Decode {
        #[arg(value_name = "FILE")]
        capture: PathBuf,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    log::info!("SensorLab Observer v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Using codec library v{}", sensorlab_codec::VERSION);

    match args.mode {
        Mode::Run { config } => run(config.as_deref()),
        Mode::Decode { capture } => decode(&capture),
    }
}

fn run(config_path: Option<&Path>) -> Result<()> {
    let config = match config_path {
        Some(path) => {
            log::info!("Loading configuration from: {:?}", path);
            config::load_config(path)?
        }
        None => ObserverConfig::default(),
    };
    log::debug!("Configuration: {:?}", config);

    let (sender, receiver) = crossbeam_channel::bounded(config.transport.queue_capacity.max(1));
    let transport: Box<dyn Transport> = match config.transport.kind {
        TransportKind::Log => Box::new(LogTransport),
        TransportKind::Capture => Box::new(
            FileTransport::create(
                config.transport.capture_file.as_deref(),
                config.transport.json_file.as_deref(),
                config.transport.raw_file.as_deref(),
                config.transport.link_type,
            )
            .context("Failed to open capture transport")?,
        ),
    };
    let worker = output::spawn_transport(receiver, transport).context("Failed to start transport")?;

    let emitter = Arc::new(Emitter::new(config.node_id, config.output, sender));
    let node = Node::new(
        emitter,
        Arc::new(ShellRunner::new(&config.controller.shell)),
        system_ports()?,
        Duration::from_millis(config.serial.poll_ms),
    );
    let observer = Observer::new(
        node,
        Persistence::new(config.persistence.directory.clone()),
        config.scheduler.step(),
    );
    observer.bootstrap();

    console(&observer)?;

    log::info!("Console closed, shutting down");
    if let Err(e) = observer.experiment().stop() {
        log::debug!("Experiment not stopped: {}", e);
    }
    if let Err(e) = observer.node().stop() {
        log::debug!("Node not stopped: {}", e);
    }
    drop(observer);

    match worker.join() {
        Ok(delivered) => log::info!("Transport delivered {} records", delivered),
        Err(_) => log::error!("Transport thread panicked"),
    }
    Ok(())
}

#[cfg(feature = "hardware-serial")]
fn system_ports() -> Result<Arc<dyn PortOpener>> {
    Ok(Arc::new(sensorlab_observer::node::serial::SystemPorts))
}

#[cfg(not(feature = "hardware-serial"))]
fn system_ports() -> Result<Arc<dyn PortOpener>> {
    anyhow::bail!("built without serial port support (enable the hardware-serial feature)")
}

/// Answer every stdin line with one JSON reply on stdout
fn console(observer: &Observer) -> Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    for line in stdin.lock().lines() {
        let line = line.context("Failed to read console")?;
        if line.trim().is_empty() {
            continue;
        }
        let reply = match line.parse::<Command>() {
            Ok(command) => serde_json::to_string(&observer.execute(command))?,
            Err(e) => serde_json::json!({ "error": e.to_string() }).to_string(),
        };
        writeln!(stdout, "{}", reply)?;
        stdout.flush()?;
    }
    Ok(())
}

fn decode(path: &Path) -> Result<()> {
    let file = File::open(path).with_context(|| format!("Failed to open capture: {:?}", path))?;
    let reader = CaptureReader::new(BufReader::new(file)).with_context(|| format!("Not a capture file: {:?}", path))?;
    log::info!("Decoding capture {:?} (link type {})", path, reader.link_type());

    let mut decoder = Decoder::new();
    let mut stdout = io::stdout().lock();
    let mut records = 0usize;
    for output in decoder.decode_capture(reader) {
        let output = output.with_context(|| format!("Capture {:?} is damaged after {} records", path, records))?;
        writeln!(stdout, "{}", serde_json::to_string(&output)?)?;
        records += 1;
    }
    log::info!("Decoded {} records", records);
    Ok(())
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| writeln!(buf, "[{} {}] {}", record.level(), record.target(), record.args()))
        .target(env_logger::Target::Stderr)
        .init();
}
