use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::{Args, Parser};
use tracing::{info, warn};

use modbee::{setup_logging, ModbeeConfig, ModbeeNode, SerialTransport};

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args)]
struct CommonArgs {
    /// Path to the config file (layered config/ tree is used when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured node ID
    #[arg(short, long)]
    node_id: Option<u8>,

    /// Dump default config and exit
    #[arg(long = "dump-default-config")]
    dump_default: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line args
    let cli = Cli::parse();

    if cli.common.dump_default {
        let config = ModbeeConfig::default();
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    // Load config
    let mut config = match &cli.common.config {
        Some(path) => ModbeeConfig::from_file(path.clone())?,
        None => ModbeeConfig::new()?,
    };
    if let Some(node_id) = cli.common.node_id {
        config.node.node_id = node_id;
        ModbeeConfig::validate(&config)?;
    }

    setup_logging(&config)?;

    info!(
        "Starting ModBee node {} on {}",
        config.node.node_id,
        config.serial.serial_port_info()
    );

    let transport = SerialTransport::open(&config.serial)?;
    let node_id = config.node.node_id;
    let mut node = ModbeeNode::new(config);
    node.begin(Box::new(transport), node_id)?;
    node.on_error(Box::new(|kind, message| {
        if kind.is_error() {
            warn!("[{}] {}: {}", kind.category(), kind, message);
        } else {
            info!("[{}] {}: {}", kind.category(), kind, message);
        }
    }));
    node.connect()?;

    let mut last_report = Instant::now();
    loop {
        node.tick()?;

        if last_report.elapsed() >= Duration::from_secs(10) {
            let (ops, events) = node.statistics();
            info!(
                "state={} known={:?} pending={} completed={} tx={} rx={} errors={}",
                node.state(),
                node.known_nodes(),
                ops.pending,
                ops.completed,
                events.frames_sent,
                events.frames_received,
                events.errors
            );
            last_report = Instant::now();
        }

        std::thread::sleep(Duration::from_millis(1));
    }
}
