//! Bench multimeter driver.
//!
//! Implements [`InstrumentDriver`] for SCPI-style bench multimeters that
//! report their configuration as a single ASCII record (`CONF?`), return one
//! measurement per `READ?` query, expose a one-byte serial-poll status, and
//! optionally carry a 256-byte calibration RAM readable one byte at a time.
//!
//! The interesting part is `get-reading`: a measurement is only trustworthy
//! together with the settings that defined its units, range, and resolution.
//! The driver therefore reads settings, value, and settings again as one
//! atomic bus sequence and rejects the value if the two settings records are
//! not byte-identical — proving no other traffic (including a front-panel
//! change) altered the instrument mid-read.

use crate::bus::{AtomicSequence, BusDevice, BusOutcome, BusTransaction, Terminator};
use crate::calibration::{CalibrationBlock, CAL_BLOCK_LEN};
use crate::command::{Command, CommandReply};
use crate::error::{DaqError, DaqResult};
use crate::instrument::driver::InstrumentDriver;
use crate::snapshot::{Reading, Settings, Status};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

const SETTINGS_QUERY: &[u8] = b"CONF?";
const VALUE_QUERY: &[u8] = b"READ?";

/// Bit positions in the DMM serial-poll status byte.
pub mod status_bit {
    /// A fresh reading is available.
    pub const DATA_READY: u8 = 0;
    /// The last command had a syntax error.
    pub const SYNTAX_ERROR: u8 = 2;
    /// The instrument requests service.
    pub const SRQ: u8 = 6;
}

/// Driver for a generic bench multimeter on the shared bus.
pub struct DmmDriver {
    terminator: Terminator,
    transaction_timeout: Duration,
    reading_timeout: Duration,
    cal_block_timeout: Duration,
    has_cal_ram: bool,
    last_settings: Option<Arc<Settings>>,
}

impl Default for DmmDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl DmmDriver {
    /// Driver with default timeouts and calibration RAM support.
    pub fn new() -> Self {
        Self {
            terminator: Terminator::default(),
            transaction_timeout: Duration::from_secs(1),
            reading_timeout: Duration::from_secs(3),
            // A full calibration image is 256 separate bus round-trips; at
            // low baud rates that takes tens of seconds.
            cal_block_timeout: Duration::from_secs(30),
            has_cal_ram: true,
            last_settings: None,
        }
    }

    /// Set the record-terminator policy for this instrument's responses.
    pub fn with_terminator(mut self, terminator: Terminator) -> Self {
        self.terminator = terminator;
        self
    }

    /// Set the timeout for a single ordinary transaction.
    pub fn with_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = timeout;
        self
    }

    /// Set the aggregate timeout for the consistent-reading sequence.
    pub fn with_reading_timeout(mut self, timeout: Duration) -> Self {
        self.reading_timeout = timeout;
        self
    }

    /// Set the aggregate timeout for the 256-step calibration block read.
    pub fn with_cal_block_timeout(mut self, timeout: Duration) -> Self {
        self.cal_block_timeout = timeout;
        self
    }

    /// Declare whether this model exposes readable calibration RAM.
    pub fn with_cal_ram(mut self, has_cal_ram: bool) -> Self {
        self.has_cal_ram = has_cal_ram;
        self
    }

    /// Factory for [`crate::instrument::driver::DriverRegistry`] registration.
    pub fn from_config(config: &toml::Table) -> DaqResult<Box<dyn InstrumentDriver>> {
        let mut driver = DmmDriver::new();
        if let Some(terminator) = config.get("terminator").and_then(|v| v.as_str()) {
            driver.terminator = match terminator {
                "cr" => Terminator::Cr,
                "lf" => Terminator::Lf,
                "crlf" => Terminator::CrLf,
                other => {
                    return Err(DaqError::Configuration(format!(
                        "unknown terminator '{other}' (expected cr, lf, or crlf)"
                    )))
                }
            };
        }
        if let Some(ms) = config.get("transaction_timeout_ms").and_then(|v| v.as_integer()) {
            driver.transaction_timeout = Duration::from_millis(ms.max(0) as u64);
        }
        if let Some(ms) = config.get("reading_timeout_ms").and_then(|v| v.as_integer()) {
            driver.reading_timeout = Duration::from_millis(ms.max(0) as u64);
        }
        if let Some(ms) = config.get("cal_block_timeout_ms").and_then(|v| v.as_integer()) {
            driver.cal_block_timeout = Duration::from_millis(ms.max(0) as u64);
        }
        if let Some(cal_ram) = config.get("cal_ram").and_then(|v| v.as_bool()) {
            driver.has_cal_ram = cal_ram;
        }
        Ok(Box::new(driver))
    }

    fn decode_settings(&self, raw: &[u8]) -> Settings {
        let record = String::from_utf8_lossy(raw);
        let record = record.trim();
        let function = record.split_whitespace().next().unwrap_or("").to_string();
        let unit = match function.split(':').next().unwrap_or("") {
            "VOLT" => "V",
            "CURR" => "A",
            "RES" | "FRES" => "Ohm",
            "FREQ" => "Hz",
            _ => "",
        };
        Settings::new(raw.to_vec(), function, unit)
    }

    fn parse_value(&self, raw: &[u8]) -> DaqResult<f64> {
        let text = String::from_utf8_lossy(raw);
        text.trim()
            .parse()
            .map_err(|_| DaqError::Bus(format!("unparseable measurement response '{}'", text.trim())))
    }

    async fn read_settings(&mut self, bus: &BusDevice) -> DaqResult<Arc<Settings>> {
        let transaction = BusTransaction::query_line(SETTINGS_QUERY, self.terminator);
        let outcome = bus.execute(&transaction, self.transaction_timeout).await?;
        let raw = outcome
            .bytes()
            .ok_or_else(|| DaqError::Bus("settings query returned no record".into()))?;
        let settings = Arc::new(self.decode_settings(raw));
        self.last_settings = Some(Arc::clone(&settings));
        Ok(settings)
    }

    async fn read_consistent(&mut self, bus: &BusDevice) -> DaqResult<Arc<Reading>> {
        let sequence = AtomicSequence::new(vec![
            BusTransaction::query_line(SETTINGS_QUERY, self.terminator),
            BusTransaction::query_line(VALUE_QUERY, self.terminator),
            BusTransaction::query_line(SETTINGS_QUERY, self.terminator),
        ])?;
        let outcomes = bus.execute_atomic(&sequence, self.reading_timeout).await?;

        let pre = outcome_bytes(&outcomes, 0)?;
        let value_raw = outcome_bytes(&outcomes, 1)?;
        let post = outcome_bytes(&outcomes, 2)?;
        if pre != post {
            return Err(DaqError::Consistency(format!(
                "settings changed during reading: '{}' -> '{}'",
                String::from_utf8_lossy(pre).trim(),
                String::from_utf8_lossy(post).trim()
            )));
        }

        let settings = Arc::new(self.decode_settings(pre));
        let value = self.parse_value(value_raw)?;
        let reading = Reading::new(value, settings.unit(), Arc::clone(&settings));
        self.last_settings = Some(settings);
        Ok(Arc::new(reading))
    }

    async fn read_cal_byte(&self, bus: &BusDevice, offset: u16) -> DaqResult<u8> {
        let transaction = BusTransaction::write_read_exact(cal_query(offset), 1);
        let outcome = bus.execute(&transaction, self.transaction_timeout).await?;
        outcome
            .bytes()
            .and_then(|bytes| bytes.first().copied())
            .ok_or_else(|| DaqError::Bus("calibration query returned no byte".into()))
    }

    async fn read_cal_block(&self, bus: &BusDevice) -> DaqResult<CalibrationBlock> {
        let steps = (0..CAL_BLOCK_LEN as u16)
            .map(|offset| BusTransaction::write_read_exact(cal_query(offset), 1))
            .collect();
        let sequence = AtomicSequence::new(steps)?;
        let outcomes = bus.execute_atomic(&sequence, self.cal_block_timeout).await?;

        let mut image = Vec::with_capacity(CAL_BLOCK_LEN);
        for (offset, outcome) in outcomes.iter().enumerate() {
            let byte = outcome
                .bytes()
                .and_then(|bytes| bytes.first().copied())
                .ok_or_else(|| {
                    DaqError::Bus(format!("calibration read at offset {offset} returned no byte"))
                })?;
            image.push(byte);
        }
        CalibrationBlock::from_bytes(&image)
    }
}

fn cal_query(offset: u16) -> Vec<u8> {
    format!("CAL? {offset}").into_bytes()
}

fn outcome_bytes(outcomes: &[BusOutcome], index: usize) -> DaqResult<&[u8]> {
    outcomes
        .get(index)
        .and_then(BusOutcome::bytes)
        .ok_or_else(|| DaqError::Bus(format!("sequence step {index} returned no data")))
}

#[async_trait]
impl InstrumentDriver for DmmDriver {
    fn model(&self) -> &'static str {
        "mock_dmm"
    }

    fn validate(&self, command: &Command) -> DaqResult<()> {
        match command {
            Command::ReadCalibrationByte { address } => {
                if !self.has_cal_ram {
                    return Err(DaqError::Unsupported(
                        "this model has no readable calibration RAM".into(),
                    ));
                }
                if usize::from(*address) >= CAL_BLOCK_LEN {
                    return Err(DaqError::Validation(format!(
                        "calibration address {address} out of range 0..{CAL_BLOCK_LEN}"
                    )));
                }
                Ok(())
            }
            Command::ReadCalibrationBlock if !self.has_cal_ram => Err(DaqError::Unsupported(
                "this model has no readable calibration RAM".into(),
            )),
            _ => Ok(()),
        }
    }

    async fn execute(&mut self, bus: &BusDevice, command: &Command) -> DaqResult<CommandReply> {
        trace!(address = bus.address(), kind = command.kind(), "dmm executing");
        match command {
            Command::Noop => Ok(CommandReply::Done),
            Command::GetSettings => Ok(CommandReply::Settings(self.read_settings(bus).await?)),
            Command::GetStatus => {
                let byte = bus.serial_poll(self.transaction_timeout).await?;
                let status = Status::new(byte, self.last_settings.clone());
                Ok(CommandReply::Status(Arc::new(status)))
            }
            Command::GetReading => Ok(CommandReply::Reading(self.read_consistent(bus).await?)),
            Command::ReadCalibrationByte { address } => Ok(CommandReply::CalibrationByte(
                self.read_cal_byte(bus, *address).await?,
            )),
            Command::ReadCalibrationBlock => Ok(CommandReply::CalibrationBlock(
                self.read_cal_block(bus).await?,
            )),
        }
    }
}
