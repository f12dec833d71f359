//! Bus transactions, atomic sequences, and the bus device.
//!
//! The bus is the single shared mutable resource of the whole system: one
//! physical channel, many instruments, one transaction in flight at a time.
//! This module provides:
//!
//! - [`BusTransaction`] — the smallest unit sent over the bus (raw write,
//!   write-then-read-N, query-line, serial poll);
//! - [`AtomicSequence`] — an ordered, non-empty list of transactions executed
//!   back-to-back with no other traffic interleaved;
//! - [`BusDevice`] — the per-instrument handle that acquires exclusive
//!   bus-wide ownership for the duration of each call.
//!
//! Exclusivity is bus-wide, not per-instrument, because the bus is physically
//! multi-drop: a transaction for one instrument corrupts another's exchange
//! just as surely as its own.

pub mod mock;
#[cfg(feature = "instrument_serial")]
pub mod serial;
pub mod transport;

pub use transport::BusTransport;

use crate::error::{DaqError, DaqResult};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::trace;

/// Record-terminator policy for line-oriented reads.
///
/// Instruments vary in what they send as a record terminator; a wrong mode
/// either truncates or over-reads the response. This is purely a
/// line-delimiting policy — there is no length prefix at this layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Terminator {
    /// Carriage return only.
    Cr,
    /// Line feed only.
    Lf,
    /// Carriage return + line feed.
    #[default]
    CrLf,
}

impl Terminator {
    /// The terminator byte sequence.
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            Terminator::Cr => b"\r",
            Terminator::Lf => b"\n",
            Terminator::CrLf => b"\r\n",
        }
    }

    /// Whether `buffer` ends with this terminator.
    pub fn terminates(&self, buffer: &[u8]) -> bool {
        buffer.ends_with(self.as_bytes())
    }
}

/// The smallest unit of work sent over the bus.
#[derive(Clone, Debug)]
pub enum BusTransaction {
    /// Raw write, no response expected.
    Write {
        /// Bytes to send.
        payload: Vec<u8>,
    },
    /// Write, then read exactly `count` response bytes.
    WriteReadExact {
        /// Bytes to send.
        payload: Vec<u8>,
        /// Number of response bytes to read.
        count: usize,
    },
    /// Write (possibly nothing), then read one terminator-delimited record.
    QueryLine {
        /// Bytes to send before reading; may be empty.
        payload: Vec<u8>,
        /// Record-terminator policy for the response.
        terminator: Terminator,
    },
    /// One-byte status read for health/event polling.
    SerialPoll,
}

impl BusTransaction {
    /// Raw write transaction.
    pub fn write(payload: impl Into<Vec<u8>>) -> Self {
        BusTransaction::Write {
            payload: payload.into(),
        }
    }

    /// Write-then-read-exact transaction.
    pub fn write_read_exact(payload: impl Into<Vec<u8>>, count: usize) -> Self {
        BusTransaction::WriteReadExact {
            payload: payload.into(),
            count,
        }
    }

    /// Query transaction reading one terminated record.
    pub fn query_line(payload: impl Into<Vec<u8>>, terminator: Terminator) -> Self {
        BusTransaction::QueryLine {
            payload: payload.into(),
            terminator,
        }
    }

    /// Short operation name for logging.
    pub fn operation(&self) -> &'static str {
        match self {
            BusTransaction::Write { .. } => "write",
            BusTransaction::WriteReadExact { .. } => "write-read",
            BusTransaction::QueryLine { .. } => "query-line",
            BusTransaction::SerialPoll => "serial-poll",
        }
    }
}

/// Result of one executed transaction.
#[derive(Clone, Debug)]
pub enum BusOutcome {
    /// A write completed; nothing was read back.
    Written,
    /// Response bytes from a read-bearing transaction.
    Bytes(Vec<u8>),
    /// The one-byte serial-poll status.
    StatusByte(u8),
}

impl BusOutcome {
    /// Response bytes, if this outcome carries any.
    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            BusOutcome::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// The serial-poll status byte, if this outcome is one.
    pub fn status_byte(&self) -> Option<u8> {
        match self {
            BusOutcome::StatusByte(byte) => Some(*byte),
            _ => None,
        }
    }
}

/// An ordered, non-empty list of transactions executed as one atomic unit.
///
/// Either all steps complete or the whole sequence fails; partial completion
/// is reported as a single failure, never as a partially-successful result.
#[derive(Clone, Debug)]
pub struct AtomicSequence {
    steps: Vec<BusTransaction>,
}

impl AtomicSequence {
    /// Build a sequence; rejects an empty step list.
    pub fn new(steps: Vec<BusTransaction>) -> DaqResult<Self> {
        if steps.is_empty() {
            return Err(DaqError::Validation(
                "atomic sequence must contain at least one transaction".into(),
            ));
        }
        Ok(Self { steps })
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Always false; the constructor rejects empty sequences.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The ordered steps.
    pub fn steps(&self) -> &[BusTransaction] {
        &self.steps
    }
}

/// Shared handle to one physical bus.
///
/// The `Mutex` is the bus-wide mutual-exclusion point: whoever holds it owns
/// the wire.
pub type SharedBus = Arc<Mutex<Box<dyn BusTransport>>>;

/// Wrap a transport as a [`SharedBus`].
pub fn shared_bus(transport: impl BusTransport + 'static) -> SharedBus {
    let transport: Box<dyn BusTransport> = Box::new(transport);
    Arc::new(Mutex::new(transport))
}

/// Exclusive-access handle to the bus for one instrument address.
///
/// Every call acquires bus-wide ownership for its full duration and releases
/// it before returning, success or failure. Timeouts are aggregate per call
/// and cover lock acquisition plus I/O; a deadline that fires mid-transaction
/// abandons the wait, and the transaction's fate on the wire is indeterminate.
#[derive(Clone)]
pub struct BusDevice {
    address: u8,
    bus: SharedBus,
}

impl BusDevice {
    /// Create a handle for `address` on the given bus.
    pub fn new(bus: SharedBus, address: u8) -> Self {
        Self { address, bus }
    }

    /// The instrument address this handle routes to.
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Execute one transaction under the bus lock.
    pub async fn execute(
        &self,
        transaction: &BusTransaction,
        timeout: Duration,
    ) -> DaqResult<BusOutcome> {
        let mut outcomes = tokio::time::timeout(
            timeout,
            self.run_locked(std::slice::from_ref(transaction)),
        )
        .await
        .map_err(|_| DaqError::Timeout(timeout))??;
        outcomes
            .pop()
            .ok_or_else(|| DaqError::Bus("transaction produced no outcome".into()))
    }

    /// Execute all steps back-to-back with no other traffic interleaved.
    ///
    /// Returns the per-step outcomes only if every step completed; an error
    /// or an elapsed deadline mid-sequence fails the whole call with no
    /// partial results.
    pub async fn execute_atomic(
        &self,
        sequence: &AtomicSequence,
        timeout: Duration,
    ) -> DaqResult<Vec<BusOutcome>> {
        tokio::time::timeout(timeout, self.run_locked(sequence.steps()))
            .await
            .map_err(|_| DaqError::Timeout(timeout))?
    }

    /// One-byte status read for health/event polling.
    pub async fn serial_poll(&self, timeout: Duration) -> DaqResult<u8> {
        match self.execute(&BusTransaction::SerialPoll, timeout).await? {
            BusOutcome::StatusByte(byte) => Ok(byte),
            other => Err(DaqError::Bus(format!(
                "serial poll returned unexpected outcome: {other:?}"
            ))),
        }
    }

    async fn run_locked(&self, steps: &[BusTransaction]) -> DaqResult<Vec<BusOutcome>> {
        let mut transport = self.bus.lock().await;
        let mut outcomes = Vec::with_capacity(steps.len());
        for step in steps {
            trace!(address = self.address, operation = step.operation(), "bus transaction");
            let outcome = run_step(&mut **transport, self.address, step).await?;
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}

async fn run_step(
    transport: &mut dyn BusTransport,
    address: u8,
    step: &BusTransaction,
) -> DaqResult<BusOutcome> {
    match step {
        BusTransaction::Write { payload } => {
            transport.write(address, payload).await?;
            Ok(BusOutcome::Written)
        }
        BusTransaction::WriteReadExact { payload, count } => Ok(BusOutcome::Bytes(
            transport.write_read_exact(address, payload, *count).await?,
        )),
        BusTransaction::QueryLine {
            payload,
            terminator,
        } => Ok(BusOutcome::Bytes(
            transport.query_line(address, payload, *terminator).await?,
        )),
        BusTransaction::SerialPoll => {
            Ok(BusOutcome::StatusByte(transport.serial_poll(address).await?))
        }
    }
}
