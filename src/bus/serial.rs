//! Serial-port bus transport for RS-232/RS-485 multi-drop instrument buses.
//!
//! Blocking serial I/O is pushed onto Tokio's blocking executor so the async
//! runtime is never stalled by the wire. Addressing follows the multi-drop
//! convention of prefixing each frame with the target device's address digit;
//! controllers with a different addressing scheme can replace this transport
//! wholesale behind [`BusTransport`].
//!
//! The serial poll is sent as ENQ (0x05) to the addressed device, which
//! answers with its one status byte.

use crate::bus::{BusTransport, Terminator};
use crate::error::{DaqError, DaqResult};
use async_trait::async_trait;
use serialport::SerialPort;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, trace};

const SERIAL_POLL_REQUEST: u8 = 0x05;

/// Serial transport for a multi-drop instrument bus.
pub struct SerialBus {
    port_name: String,
    baud_rate: u32,
    read_timeout: Duration,
    terminator: Terminator,
    port: Arc<Mutex<Box<dyn SerialPort>>>,
}

impl SerialBus {
    /// Open the serial port at the given baud rate.
    pub fn open(port_name: &str, baud_rate: u32) -> DaqResult<Self> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(Duration::from_millis(100)) // Internal read timeout
            .open()
            .map_err(|e| {
                DaqError::Bus(format!(
                    "failed to open serial port '{port_name}' at {baud_rate} baud: {e}"
                ))
            })?;
        debug!(port = port_name, baud_rate, "serial port opened");
        Ok(Self {
            port_name: port_name.to_string(),
            baud_rate,
            read_timeout: Duration::from_secs(1),
            terminator: Terminator::default(),
            port: Arc::new(Mutex::new(port)),
        })
    }

    /// Set the transport-level read timeout.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the terminator appended to outgoing frames.
    pub fn with_terminator(mut self, terminator: Terminator) -> Self {
        self.terminator = terminator;
        self
    }

    /// Human-readable transport description.
    pub fn info(&self) -> String {
        format!("SerialBus({} @ {} baud)", self.port_name, self.baud_rate)
    }

    fn frame(&self, address: u8, payload: &[u8]) -> Vec<u8> {
        // Multi-drop address prefix: one ASCII hex digit, then the payload,
        // then the frame terminator.
        let mut frame = Vec::with_capacity(payload.len() + 3);
        frame.push(hex_digit(address));
        frame.extend_from_slice(payload);
        frame.extend_from_slice(self.terminator.as_bytes());
        frame
    }

    async fn blocking_io<R, F>(&self, op: F) -> DaqResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Box<dyn SerialPort>) -> DaqResult<R> + Send + 'static,
    {
        let port = Arc::clone(&self.port);
        tokio::task::spawn_blocking(move || {
            let mut port = port.blocking_lock();
            op(&mut port)
        })
        .await
        .map_err(|e| DaqError::Bus(format!("serial I/O task panicked: {e}")))?
    }
}

fn hex_digit(address: u8) -> u8 {
    match address & 0x0F {
        digit @ 0..=9 => b'0' + digit,
        digit => b'A' + (digit - 10),
    }
}

fn write_all(port: &mut Box<dyn SerialPort>, frame: &[u8]) -> DaqResult<()> {
    port.write_all(frame)
        .map_err(|e| DaqError::Bus(format!("serial write failed: {e}")))?;
    port.flush()
        .map_err(|e| DaqError::Bus(format!("serial flush failed: {e}")))?;
    Ok(())
}

fn read_exact(
    port: &mut Box<dyn SerialPort>,
    count: usize,
    deadline: Duration,
) -> DaqResult<Vec<u8>> {
    let mut response = Vec::with_capacity(count);
    let mut buffer = [0u8; 1];
    let start = Instant::now();
    while response.len() < count {
        if start.elapsed() > deadline {
            return Err(DaqError::Bus(format!(
                "serial read of {count} bytes timed out after {deadline:?} ({} received)",
                response.len()
            )));
        }
        match port.read(&mut buffer) {
            Ok(0) => return Err(DaqError::Bus("unexpected EOF from serial port".into())),
            Ok(_) => response.push(buffer[0]),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                // Port timeout is shorter than our overall deadline.
                continue;
            }
            Err(e) => return Err(DaqError::Bus(format!("serial read error: {e}"))),
        }
    }
    Ok(response)
}

fn read_line(
    port: &mut Box<dyn SerialPort>,
    terminator: Terminator,
    deadline: Duration,
) -> DaqResult<Vec<u8>> {
    let mut response: Vec<u8> = Vec::new();
    let mut buffer = [0u8; 1];
    let start = Instant::now();
    loop {
        if start.elapsed() > deadline {
            return Err(DaqError::Bus(format!(
                "serial line read timed out after {deadline:?} ({} bytes buffered)",
                response.len()
            )));
        }
        match port.read(&mut buffer) {
            Ok(0) => return Err(DaqError::Bus("unexpected EOF from serial port".into())),
            Ok(_) => {
                response.push(buffer[0]);
                if terminator.terminates(&response) {
                    response.truncate(response.len() - terminator.as_bytes().len());
                    return Ok(response);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) => return Err(DaqError::Bus(format!("serial read error: {e}"))),
        }
    }
}

#[async_trait]
impl BusTransport for SerialBus {
    async fn write(&mut self, address: u8, payload: &[u8]) -> DaqResult<()> {
        let frame = self.frame(address, payload);
        trace!(address, bytes = frame.len(), "serial write");
        self.blocking_io(move |port| write_all(port, &frame)).await
    }

    async fn write_read_exact(
        &mut self,
        address: u8,
        payload: &[u8],
        count: usize,
    ) -> DaqResult<Vec<u8>> {
        let frame = self.frame(address, payload);
        let deadline = self.read_timeout;
        self.blocking_io(move |port| {
            write_all(port, &frame)?;
            read_exact(port, count, deadline)
        })
        .await
    }

    async fn query_line(
        &mut self,
        address: u8,
        payload: &[u8],
        terminator: Terminator,
    ) -> DaqResult<Vec<u8>> {
        let frame = if payload.is_empty() {
            Vec::new()
        } else {
            self.frame(address, payload)
        };
        let deadline = self.read_timeout;
        self.blocking_io(move |port| {
            if !frame.is_empty() {
                write_all(port, &frame)?;
            }
            read_line(port, terminator, deadline)
        })
        .await
    }

    async fn serial_poll(&mut self, address: u8) -> DaqResult<u8> {
        let frame = vec![hex_digit(address), SERIAL_POLL_REQUEST];
        let deadline = self.read_timeout;
        let response = self
            .blocking_io(move |port| {
                write_all(port, &frame)?;
                read_exact(port, 1, deadline)
            })
            .await?;
        response
            .first()
            .copied()
            .ok_or_else(|| DaqError::Bus("serial poll returned no status byte".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_digits_are_ascii_hex() {
        assert_eq!(hex_digit(0), b'0');
        assert_eq!(hex_digit(9), b'9');
        assert_eq!(hex_digit(0x0A), b'A');
        assert_eq!(hex_digit(0x0F), b'F');
        // Addresses wrap at the 16-device multi-drop limit.
        assert_eq!(hex_digit(0x12), b'2');
    }
}
