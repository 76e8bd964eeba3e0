use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rmnet_bam::config::ConfigStore;
use rmnet_bam::gadget::{Direction, TransferStatus, UsbTransport};
use rmnet_bam::sim::{SimEndpoint, SimModem};
use rmnet_bam::RelayService;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// rmnet-bam command line arguments
///
/// Runs the relay against simulated USB endpoints and a loopback modem,
/// then prints the per-port diagnostics.
#[derive(Parser, Debug)]
#[command(name = "rmnet-bam")]
#[command(version, about = "USB RMNET to BAM-DMUX data relay (simulated loopback run)", long_about = None)]
struct CliArgs {
    /// Number of relay ports
    #[arg(short = 'n', long, default_value_t = 1)]
    ports: usize,

    /// Packets the host sends on each port
    #[arg(short = 'c', long, default_value_t = 64)]
    packets: usize,

    /// Payload size of each packet in bytes
    #[arg(short = 's', long, default_value_t = 1500)]
    size: usize,

    /// JSON configuration file (created with defaults if missing)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print diagnostics as JSON instead of text
    #[arg(long)]
    json: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

struct SimPort {
    in_ep: Arc<SimEndpoint>,
    out_ep: Arc<SimEndpoint>,
}

fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose, args.json_logs);

    tracing::info!("Starting rmnet-bam v{}", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => ConfigStore::open(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => ConfigStore::in_memory(Default::default())?,
    };

    let modem = SimModem::new();
    modem.set_loopback(true);
    let relay = RelayService::setup(args.ports, modem, config)?;

    let ports: Vec<SimPort> = (0..args.ports)
        .map(|num| SimPort {
            in_ep: SimEndpoint::new(&format!("ep{}in", num + 1), Direction::In),
            out_ep: SimEndpoint::new(&format!("ep{}out", num + 1), Direction::Out),
        })
        .collect();

    for (num, port) in ports.iter().enumerate() {
        let usb = Arc::new(UsbTransport::new(port.in_ep.clone(), port.out_ep.clone()));
        relay.connect(usb, num)?;
    }
    relay.flush();

    let payload = vec![0x45u8; args.size];
    let mut remaining = args.packets;
    while remaining > 0 {
        // One burst per round, bounded by the queued OUT requests
        for port in &ports {
            let burst = remaining.min(port.out_ep.queued_len());
            for _ in 0..burst {
                port.out_ep.receive(&payload);
            }
        }
        relay.flush();

        let mut delivered = 0;
        for port in &ports {
            while port.in_ep.complete_next(TransferStatus::Complete) {}
            delivered = delivered.max(port.in_ep.take_delivered().len());
        }
        if delivered == 0 {
            tracing::warn!("No packets came back, {} left unsent", remaining);
            break;
        }
        remaining = remaining.saturating_sub(delivered);
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&relay.stats())?);
    } else {
        print!("{}", relay.read_stats());
    }

    relay.teardown();
    tracing::info!("Relay stopped");
    Ok(())
}

fn init_logging(level: LogLevel, verbose_count: u8, json: bool) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "rmnet_bam=error",
        LogLevel::Warn => "rmnet_bam=warn",
        LogLevel::Info => "rmnet_bam=info",
        LogLevel::Verbose => "rmnet_bam=info,rmnet_bam::relay=debug",
        LogLevel::Debug => "rmnet_bam=debug",
        LogLevel::Trace => "rmnet_bam=trace",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    let result = if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
    };
    if let Err(err) = result {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
