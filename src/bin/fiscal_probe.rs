//! Fiscal printer probe
//!
//! Opens a session, reads the status block and the device identity, and
//! prints both as JSON.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use fiscal_link::logging::{self, LogOptions};
use fiscal_link::probe::{self, DETECTION_BAUD_RATES};
use fiscal_link::{codes, list_ports, DriverConfig, Session, TransportConfig};
use tracing::info;

/// Read status and identity from an FP-700X-class fiscal printer.
#[derive(Parser, Debug)]
#[command(
    name = "fiscal-probe",
    version = fiscal_link::VERSION,
    about = "Read status and identity from a fiscal printer",
    long_about = None
)]
struct Cli {
    /// JSON driver config; overrides the connection flags
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serial port
    #[arg(short, long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial baud rate
    #[arg(short, long, default_value = "115200")]
    baud: u32,

    /// Connect over TCP to this host instead of a serial port
    #[arg(long)]
    host: Option<String>,

    /// TCP port used with --host
    #[arg(long, default_value = "4999")]
    tcp_port: u16,

    /// Auto-detect the baud rate on --port
    #[arg(long, conflicts_with = "host")]
    detect: bool,

    /// List serial ports and exit
    #[arg(long)]
    list: bool,

    /// Also write rolling log files to this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

fn driver_config(args: &Cli) -> Result<DriverConfig> {
    if let Some(path) = &args.config {
        return DriverConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()));
    }
    if let Some(host) = &args.host {
        return Ok(DriverConfig::new(TransportConfig::network(host, args.tcp_port)));
    }
    if args.detect {
        let found = probe::detect(&args.port, &DETECTION_BAUD_RATES)
            .with_context(|| format!("probing {}", args.port))?;
        let Some(detection) = found else {
            bail!("no fiscal device answered on {}", args.port);
        };
        info!("Detected device at {} baud", detection.baud_rate);
        return Ok(DriverConfig::new(detection.transport));
    }
    Ok(DriverConfig::new(TransportConfig::serial(&args.port, args.baud)))
}

fn main() -> Result<()> {
    let args = Cli::parse();

    let mut log_options = LogOptions::default();
    if let Some(dir) = &args.log_dir {
        log_options = log_options.with_directory(dir);
    }
    let _guard = logging::init(&log_options).context("initialising logging")?;

    if args.list {
        let ports = list_ports().context("listing serial ports")?;
        println!("{}", serde_json::to_string_pretty(&ports)?);
        return Ok(());
    }

    let config = driver_config(&args)?;
    let session = Session::open(&config).context("opening session")?;
    info!(session = %session.id(), "Probing {}", session.description());

    let status = session
        .execute::<&str>(codes::READ_STATUS, &[])
        .context("reading status")?
        .status;
    let device = probe::identify(&session).context("reading device info")?;
    session.close();

    let conditions = status.active_conditions();
    let report = serde_json::json!({
        "transport": config.transport,
        "device": device,
        "status": status,
        "conditions": conditions,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
