//! Boundary trait to the physical bus transport.
//!
//! The physical layer (serial framing, USB, TCP) is outside this engine; a
//! [`BusTransport`] is whatever can move addressed byte sequences to and from
//! instruments on one physical bus. Exactly one boxed transport exists per
//! bus, and it is only ever driven while the bus-wide lock is held (see
//! [`super::BusDevice`]), so implementations do not need their own locking.

use crate::bus::Terminator;
use crate::error::DaqResult;
use async_trait::async_trait;

/// Byte-level operations against one physical bus.
///
/// Each method addresses a single instrument. Implementations report
/// transport faults as [`crate::DaqError::Bus`]; deadlines are enforced a
/// layer above, per call, by the bus device.
#[async_trait]
pub trait BusTransport: Send {
    /// Write a payload to the addressed instrument.
    async fn write(&mut self, address: u8, payload: &[u8]) -> DaqResult<()>;

    /// Write a payload, then read exactly `count` response bytes.
    async fn write_read_exact(
        &mut self,
        address: u8,
        payload: &[u8],
        count: usize,
    ) -> DaqResult<Vec<u8>>;

    /// Write a payload (which may be empty), then read one response record
    /// delimited by `terminator`. The returned bytes exclude the terminator.
    async fn query_line(
        &mut self,
        address: u8,
        payload: &[u8],
        terminator: Terminator,
    ) -> DaqResult<Vec<u8>>;

    /// Read the addressed instrument's one-byte serial-poll status.
    async fn serial_poll(&mut self, address: u8) -> DaqResult<u8>;
}
