//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the entire
//! engine. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different kinds of failures that can occur on
//! a shared instrument bus, from configuration problems to transport faults.
//!
//! ## Error Taxonomy
//!
//! The command-path errors map onto five distinct situations:
//!
//! - **`Validation`**: a malformed command (bad argument, empty atomic
//!   sequence, corrupt calibration data). Rejected before any bus traffic.
//! - **`Timeout`**: no result within the caller's deadline. The fate of the
//!   underlying bus transaction is unknown and must be treated as
//!   indeterminate, not as "did not happen".
//! - **`Bus`**: a transport-level failure during a primitive or sequence.
//! - **`Consistency`**: an atomic exchange completed but its own invariant
//!   failed (e.g. the instrument's settings changed mid-read), so the data is
//!   untrustworthy. Reported distinctly from a raw bus failure.
//! - **`Unsupported`**: a command that is valid in general but not implemented
//!   by the addressed instrument model.
//!
//! The remaining variants cover configuration, I/O, and lifecycle plumbing.
//! By using `#[from]`, `DaqError` can be seamlessly created from underlying
//! error types, simplifying error handling throughout the crate with the `?`
//! operator.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the engine error type.
pub type DaqResult<T> = std::result::Result<T, DaqError>;

/// Central error type for the bus/command/acquisition engine.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Errors from the `config` crate while loading configuration files.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Semantic configuration errors caught during validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Wrapped standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A command or its arguments failed validation before touching the bus.
    #[error("Invalid command: {0}")]
    Validation(String),

    /// A caller-supplied deadline elapsed. The underlying transaction, if one
    /// was started, may still complete on the bus.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Transport-level failure during a bus primitive or atomic sequence.
    #[error("Bus failure: {0}")]
    Bus(String),

    /// An atomic exchange completed but produced untrustworthy data.
    #[error("Inconsistent exchange: {0}")]
    Consistency(String),

    /// The addressed instrument model does not implement this command.
    #[error("Unsupported by this instrument: {0}")]
    Unsupported(String),

    /// The instrument's command queue has been closed.
    #[error("Instrument '{0}' is closed")]
    InstrumentClosed(String),

    /// The command processor stopped before resolving the submission.
    #[error("Instrument worker stopped before completing the command")]
    WorkerStopped,

    /// Serial transport requested without the feature compiled in.
    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,
}

impl DaqError {
    /// True for failures the acquisition collector treats as per-cycle
    /// (log-and-continue) rather than fatal.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DaqError::Timeout(_) | DaqError::Bus(_) | DaqError::Consistency(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_failures_are_recoverable() {
        assert!(DaqError::Timeout(Duration::from_millis(10)).is_recoverable());
        assert!(DaqError::Bus("framing error".into()).is_recoverable());
        assert!(DaqError::Consistency("settings changed".into()).is_recoverable());
    }

    #[test]
    fn lifecycle_failures_are_fatal() {
        assert!(!DaqError::InstrumentClosed("dmm_1".into()).is_recoverable());
        assert!(!DaqError::Unsupported("read-calibration-block".into()).is_recoverable());
        assert!(!DaqError::Validation("address out of range".into()).is_recoverable());
    }
}
