//! Immutable instrument snapshots.
//!
//! Three snapshot types describe an instrument at a point in time:
//!
//! - [`Settings`] — the configuration in effect (function, range, units),
//!   keeping the verbatim configuration record as returned by the instrument.
//! - [`Status`] — the health/event flags from a serial poll.
//! - [`Reading`] — one measured value.
//!
//! A reading is meaningless without the settings that defined its units and
//! resolution at acquisition time, so every [`Reading`] carries an
//! `Arc<Settings>`. Snapshots are published atomically by the command
//! processor; readers always see a complete snapshot, never a partially
//! updated one.

use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Configuration snapshot of an instrument.
///
/// `raw` holds the configuration record exactly as the instrument returned
/// it. Atomic read sequences compare pre- and post-exchange records byte for
/// byte to prove nothing changed mid-read, so the raw bytes must be kept
/// verbatim, not re-encoded.
#[derive(Clone, Debug)]
pub struct Settings {
    raw: Vec<u8>,
    function: String,
    unit: String,
    acquired_at: DateTime<Utc>,
}

impl Settings {
    /// Create a settings snapshot from the instrument's verbatim
    /// configuration record plus its decoded function and unit.
    pub fn new(raw: Vec<u8>, function: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            raw,
            function: function.into(),
            unit: unit.into(),
            acquired_at: Utc::now(),
        }
    }

    /// The verbatim configuration record.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Decoded measurement function (e.g. `VOLT:DC`).
    pub fn function(&self) -> &str {
        &self.function
    }

    /// Unit of readings taken under these settings (e.g. `V`).
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// When this snapshot was taken.
    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// Byte-identical comparison of the configuration records.
    ///
    /// Timestamps are deliberately excluded: two records read seconds apart
    /// still match if the instrument configuration did not change.
    pub fn matches(&self, other: &Settings) -> bool {
        self.raw == other.raw
    }
}

/// Health/event snapshot from a serial poll.
#[derive(Clone, Debug)]
pub struct Status {
    byte: u8,
    settings: Option<Arc<Settings>>,
    acquired_at: DateTime<Utc>,
}

impl Status {
    /// Create a status snapshot from the poll byte and the settings in effect
    /// when it was taken, if known. A poll can legally happen before any
    /// settings have been read.
    pub fn new(byte: u8, settings: Option<Arc<Settings>>) -> Self {
        Self {
            byte,
            settings,
            acquired_at: Utc::now(),
        }
    }

    /// The raw serial-poll status byte.
    pub fn byte(&self) -> u8 {
        self.byte
    }

    /// Test a single status bit (0 = least significant).
    pub fn bit(&self, bit: u8) -> bool {
        bit < 8 && self.byte & (1 << bit) != 0
    }

    /// Settings in effect when the poll was taken, if any had been read.
    pub fn settings(&self) -> Option<&Arc<Settings>> {
        self.settings.as_ref()
    }

    /// When this snapshot was taken.
    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }
}

/// One measured value, tied to the settings that produced it.
#[derive(Clone, Debug)]
pub struct Reading {
    value: f64,
    unit: String,
    settings: Arc<Settings>,
    acquired_at: DateTime<Utc>,
    metadata: Option<serde_json::Value>,
}

impl Reading {
    /// Create a reading under the given settings.
    pub fn new(value: f64, unit: impl Into<String>, settings: Arc<Settings>) -> Self {
        Self {
            value,
            unit: unit.into(),
            settings,
            acquired_at: Utc::now(),
            metadata: None,
        }
    }

    /// Attach free-form metadata (driver diagnostics, raw response, ...).
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// The measured value.
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Unit of the value, as defined by the settings at acquisition time.
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// The settings in effect when this reading was acquired.
    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    /// When this reading was acquired.
    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// Optional metadata for this specific reading.
    pub fn metadata(&self) -> Option<&serde_json::Value> {
        self.metadata.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_match_on_raw_bytes_only() {
        let a = Settings::new(b"VOLT:DC 1,0.0001".to_vec(), "VOLT:DC", "V");
        let b = Settings::new(b"VOLT:DC 1,0.0001".to_vec(), "VOLT:DC", "V");
        let c = Settings::new(b"CURR:DC 1,0.0001".to_vec(), "CURR:DC", "A");
        assert!(a.matches(&b));
        assert!(!a.matches(&c));
    }

    #[test]
    fn status_bits_decode() {
        let status = Status::new(0b0100_0001, None);
        assert!(status.bit(0));
        assert!(status.bit(6));
        assert!(!status.bit(1));
        assert!(!status.bit(9));
    }

    #[test]
    fn reading_keeps_its_settings() {
        let settings = Arc::new(Settings::new(b"RES 3,0.01".to_vec(), "RES", "Ohm"));
        let reading = Reading::new(99.7, "Ohm", Arc::clone(&settings));
        assert_eq!(reading.unit(), "Ohm");
        assert!(reading.settings().matches(&settings));
        assert!(reading.metadata().is_none());
    }
}
