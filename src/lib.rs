//! # bus_daq
//!
//! A data-acquisition engine for laboratory instruments (multimeters,
//! oscilloscopes, spectrum analyzers) attached to a shared, multi-drop
//! instrument bus where only one request/response transaction may be in
//! flight at a time. The engine turns that byte-oriented, half-duplex bus
//! into a concurrency-safe object model — settings, status, and readings that
//! multiple observers can consume without corrupting in-flight exchanges.
//!
//! ## Crate Structure
//!
//! - **`bus`**: bus transactions, atomic multi-step sequences, and the
//!   [`bus::BusDevice`] that owns exclusive bus-wide access per call. The
//!   physical transport sits behind [`bus::BusTransport`], with serial
//!   (`instrument_serial` feature) and simulated implementations.
//! - **`command`**: the generic [`command::Command`] union, submission
//!   identity, and the synchronous-bridge handle for waiting on outcomes.
//! - **`instrument`**: the [`instrument::Instrument`] aggregate root — one
//!   FIFO command queue and worker per instrument, cached snapshots, and the
//!   driver seam ([`instrument::driver::InstrumentDriver`]) where
//!   instrument-specific command translation lives.
//! - **`collector`**: the periodic acquisition task that takes readings on a
//!   timer through the same command path as external callers.
//! - **`snapshot`**: immutable settings/status/reading snapshots; every
//!   reading carries the settings in effect when it was acquired.
//! - **`listener`**: ordered, synchronous snapshot fan-out to observers.
//! - **`calibration`**: the validated 256-byte calibration RAM image.
//! - **`config`**: layered TOML configuration for the bus and instruments.
//! - **`error`**: the central [`DaqError`] taxonomy.
//! - **`logging`**: tracing initialization.

pub mod bus;
pub mod calibration;
pub mod collector;
pub mod command;
pub mod config;
pub mod error;
pub mod instrument;
pub mod listener;
pub mod logging;
pub mod snapshot;

pub use bus::{
    shared_bus, AtomicSequence, BusDevice, BusOutcome, BusTransaction, BusTransport, SharedBus,
    Terminator,
};
pub use calibration::{CalibrationBlock, CAL_BLOCK_LEN};
pub use collector::{AcquisitionCollector, AcquisitionConfig, CollectorState};
pub use command::{Command, CommandHandle, CommandReply};
pub use error::{DaqError, DaqResult};
pub use instrument::driver::{DriverRegistry, InstrumentDriver};
pub use instrument::Instrument;
pub use listener::InstrumentListener;
pub use snapshot::{Reading, Settings, Status};
