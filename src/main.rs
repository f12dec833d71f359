//! CLI entry point for bus-daq.
//!
//! Headless front-end for the acquisition engine:
//! - `run`: bring up every configured instrument on the shared bus, start
//!   continuous acquisition, and print snapshots until Ctrl-C.
//! - `read`: take one synchronous reading from a single instrument.
//! - `cal-dump`: read and validate an instrument's calibration RAM image.

use anyhow::{bail, Context, Result};
use bus_daq::bus::{shared_bus, BusDevice, SharedBus};
use bus_daq::config::{DaqConfig, InstrumentConfig, TransportKind};
use bus_daq::instrument::dmm::DmmDriver;
use bus_daq::{
    logging, Command, CommandReply, DriverRegistry, Instrument, InstrumentListener, Reading,
    Settings, Status,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "bus-daq")]
#[command(about = "Shared-bus instrument acquisition engine", long_about = None)]
struct Cli {
    /// Configuration file (defaults to config/default.toml).
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run continuous acquisition for all configured instruments.
    Run,

    /// Take a single reading from one instrument.
    Read {
        /// Instrument name from the configuration.
        instrument: String,

        /// Synchronous-bridge timeout in milliseconds.
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
    },

    /// Read and validate an instrument's 256-byte calibration RAM image.
    CalDump {
        /// Instrument name from the configuration.
        instrument: String,

        /// Timeout in milliseconds; a full image is 256 bus round-trips.
        #[arg(long, default_value_t = 60000)]
        timeout_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => DaqConfig::load_path(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => DaqConfig::load(None).context("loading config/default.toml")?,
    };
    logging::init(&config.application.log_level)?;

    let registry = build_registry();

    match cli.command {
        Commands::Run => run(&config, &registry).await,
        Commands::Read {
            instrument,
            timeout_ms,
        } => {
            read_once(&config, &registry, &instrument, Duration::from_millis(timeout_ms)).await
        }
        Commands::CalDump {
            instrument,
            timeout_ms,
        } => cal_dump(&config, &registry, &instrument, Duration::from_millis(timeout_ms)).await,
    }
}

fn build_registry() -> DriverRegistry {
    let mut registry = DriverRegistry::new();
    registry.register("mock_dmm", DmmDriver::from_config);
    registry
}

fn build_bus(config: &DaqConfig) -> Result<SharedBus> {
    match config.bus.transport {
        TransportKind::Mock => {
            let (bus, handle) = bus_daq::bus::mock::MockBus::new();
            handle.set_latency(Duration::from_millis(2));
            for instrument in config.instruments.values() {
                handle.add_dmm(instrument.address);
                handle.set_jitter(instrument.address, 0.005);
            }
            Ok(shared_bus(bus))
        }
        #[cfg(feature = "instrument_serial")]
        TransportKind::Serial => {
            let port = config
                .bus
                .port
                .as_deref()
                .context("bus.port is required for the serial transport")?;
            let serial = bus_daq::bus::serial::SerialBus::open(port, config.bus.baud_rate)?
                .with_read_timeout(config.bus.read_timeout)
                .with_terminator(config.bus.terminator);
            info!("{}", serial.info());
            Ok(shared_bus(serial))
        }
        #[cfg(not(feature = "instrument_serial"))]
        TransportKind::Serial => Err(bus_daq::DaqError::SerialFeatureDisabled.into()),
    }
}

fn open_instrument(
    registry: &DriverRegistry,
    bus: &SharedBus,
    name: &str,
    instrument: &InstrumentConfig,
) -> Result<Instrument> {
    let driver = registry.create(&instrument.model, &instrument.extra)?;
    let device = BusDevice::new(Arc::clone(bus), instrument.address);
    Ok(Instrument::open_with(
        name,
        driver,
        device,
        instrument.acquisition.clone(),
    ))
}

async fn run(config: &DaqConfig, registry: &DriverRegistry) -> Result<()> {
    if config.instruments.is_empty() {
        bail!("no instruments configured");
    }
    let bus = build_bus(config)?;
    let printer: Arc<dyn InstrumentListener> = Arc::new(SnapshotPrinter);

    let mut instruments = Vec::new();
    for (name, instrument_config) in &config.instruments {
        let instrument = open_instrument(registry, &bus, name, instrument_config)?;
        instrument.register_listener(Arc::clone(&printer));
        instrument.collector().start(true).await?;
        instruments.push(instrument);
    }
    info!(count = instruments.len(), "acquisition running; Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    for instrument in instruments {
        instrument.close().await;
    }
    Ok(())
}

async fn read_once(
    config: &DaqConfig,
    registry: &DriverRegistry,
    name: &str,
    timeout: Duration,
) -> Result<()> {
    let instrument_config = config
        .instruments
        .get(name)
        .with_context(|| format!("instrument '{name}' not found in configuration"))?;
    let bus = build_bus(config)?;
    let instrument = open_instrument(registry, &bus, name, instrument_config)?;

    let reply = instrument
        .submit_and_wait(Command::GetReading, timeout)
        .await?;
    if let CommandReply::Reading(reading) = reply {
        println!(
            "{name}: {:+.6e} {} [{}]",
            reading.value(),
            reading.unit(),
            reading.settings().function()
        );
    }
    instrument.close().await;
    Ok(())
}

async fn cal_dump(
    config: &DaqConfig,
    registry: &DriverRegistry,
    name: &str,
    timeout: Duration,
) -> Result<()> {
    let instrument_config = config
        .instruments
        .get(name)
        .with_context(|| format!("instrument '{name}' not found in configuration"))?;
    let bus = build_bus(config)?;
    let instrument = open_instrument(registry, &bus, name, instrument_config)?;

    let reply = instrument
        .submit_and_wait(Command::ReadCalibrationBlock, timeout)
        .await?;
    if let CommandReply::CalibrationBlock(block) = reply {
        for (row, chunk) in block.as_bytes().chunks(16).enumerate() {
            let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
            println!("{:02x}0: {}", row, hex.join(" "));
        }
    }
    instrument.close().await;
    Ok(())
}

/// Stdout listener: the stand-in for a presentation layer.
struct SnapshotPrinter;

impl InstrumentListener for SnapshotPrinter {
    fn on_new_settings(&self, instrument: &str, settings: &Arc<Settings>) {
        println!(
            "[{instrument}] settings: {} ({})",
            settings.function(),
            settings.unit()
        );
    }

    fn on_new_status(&self, instrument: &str, status: &Arc<Status>) {
        println!("[{instrument}] status: {:#04x}", status.byte());
    }

    fn on_new_reading(&self, instrument: &str, reading: &Arc<Reading>) {
        println!(
            "[{instrument}] {:+.6e} {}",
            reading.value(),
            reading.unit()
        );
    }
}
