//! Configuration management.
//!
//! Configuration is layered TOML loaded through the `config` crate: a file
//! under `config/` (or an explicit path) overridden by `BUS_DAQ__`-prefixed
//! environment variables. Engine-level sections are typed; per-instrument
//! tables keep their instrument-specific keys as free-form TOML handed to the
//! driver factory.

use crate::bus::Terminator;
use crate::collector::AcquisitionConfig;
use crate::error::{DaqError, DaqResult};
use config::Config;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DaqConfig {
    /// Application-wide options.
    #[serde(default)]
    pub application: ApplicationConfig,
    /// The shared physical bus.
    pub bus: BusConfig,
    /// Instruments attached to the bus, keyed by name.
    #[serde(default)]
    pub instruments: HashMap<String, InstrumentConfig>,
}

/// Application-wide options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Log level: trace, debug, info, warn, or error.
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Which transport drives the physical bus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// In-process simulated bus.
    #[default]
    Mock,
    /// Serial port (requires the `instrument_serial` feature).
    Serial,
}

/// Shared-bus configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    /// Transport backing the bus.
    #[serde(default)]
    pub transport: TransportKind,
    /// Serial port path (e.g. `/dev/ttyUSB0`); required for serial.
    pub port: Option<String>,
    /// Serial baud rate.
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Record-terminator policy for bus frames.
    #[serde(default)]
    pub terminator: Terminator,
    /// Transport-level read timeout.
    #[serde(with = "humantime_serde", default = "default_read_timeout")]
    pub read_timeout: Duration,
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(1)
}

/// One instrument attached to the bus.
#[derive(Debug, Clone, Deserialize)]
pub struct InstrumentConfig {
    /// Driver model identifier (looked up in the driver registry).
    pub model: String,
    /// Device address on the multi-drop bus.
    pub address: u8,
    /// Acquisition timing for this instrument's collector.
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    /// Instrument-specific keys, passed to the driver factory verbatim.
    #[serde(flatten)]
    pub extra: toml::Table,
}

impl DaqConfig {
    /// Load `config/<name>.toml` (default `config/default.toml`) layered with
    /// `BUS_DAQ__` environment variables.
    pub fn load(config_name: Option<&str>) -> DaqResult<Self> {
        let config_path = format!("config/{}", config_name.unwrap_or("default"));
        let settings = Config::builder()
            .add_source(config::File::with_name(&config_path))
            .add_source(config::Environment::with_prefix("BUS_DAQ").separator("__"))
            .build()?;
        let config: DaqConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit file path.
    pub fn load_path(path: &Path) -> DaqResult<Self> {
        let settings = Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("BUS_DAQ").separator("__"))
            .build()?;
        let config: DaqConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Semantic validation beyond what deserialization can express.
    pub fn validate(&self) -> DaqResult<()> {
        if self.bus.transport == TransportKind::Serial && self.bus.port.is_none() {
            return Err(DaqError::Configuration(
                "bus.transport = \"serial\" requires bus.port".into(),
            ));
        }
        let mut seen = HashMap::new();
        for (name, instrument) in &self.instruments {
            if let Some(other) = seen.insert(instrument.address, name) {
                return Err(DaqError::Configuration(format!(
                    "instruments '{other}' and '{name}' share bus address {}",
                    instrument.address
                )));
            }
        }
        Ok(())
    }
}
