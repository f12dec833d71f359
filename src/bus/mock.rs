//! Simulated bus transport for tests and hardware-free operation.
//!
//! [`MockBus`] emulates a multi-drop bus with DMM-style instruments attached
//! at configurable addresses. The paired [`MockBusHandle`] mutates the
//! simulation from outside: change the presented settings or value, inject
//! transport faults, flip settings behind an in-flight read (the
//! front-panel-twiddling scenario the atomic read sequence exists to catch),
//! and inspect the per-operation call log.
//!
//! The simulated command vocabulary is the minimal DMM set used by
//! [`crate::instrument::dmm::DmmDriver`]: `CONF?`, `READ?`, `*IDN?`, and
//! `CAL? <offset>`.

use crate::bus::{BusTransport, Terminator};
use crate::calibration::{CAL_BLOCK_LEN, CAL_NIBBLE_TAG};
use crate::error::{DaqError, DaqResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Endpoint {
    settings: Vec<u8>,
    value: f64,
    jitter: f64,
    status_byte: u8,
    cal_ram: [u8; CAL_BLOCK_LEN],
    settings_after_value_read: Option<Vec<u8>>,
}

impl Endpoint {
    fn dmm() -> Self {
        let mut cal_ram = [0u8; CAL_BLOCK_LEN];
        for (offset, byte) in cal_ram.iter_mut().enumerate() {
            *byte = CAL_NIBBLE_TAG | (offset as u8 & 0x0F);
        }
        Self {
            settings: b"VOLT:DC 1,0.000001".to_vec(),
            value: 1.234,
            jitter: 0.0,
            status_byte: 0x01,
            cal_ram,
            settings_after_value_read: None,
        }
    }
}

struct MockState {
    endpoints: Mutex<HashMap<u8, Endpoint>>,
    latency: Mutex<Duration>,
    ops_until_failure: Mutex<Option<u32>>,
    log: Mutex<Vec<(u8, String)>>,
}

/// A simulated bus transport.
///
/// # Example
///
/// ```
/// use bus_daq::bus::mock::MockBus;
/// use bus_daq::bus::{BusTransport, Terminator};
///
/// # tokio_test::block_on(async {
/// let (mut bus, handle) = MockBus::new();
/// handle.add_dmm(2);
/// let settings = bus.query_line(2, b"CONF?", Terminator::CrLf).await.unwrap();
/// assert_eq!(settings, b"VOLT:DC 1,0.000001");
/// # })
/// ```
pub struct MockBus {
    state: Arc<MockState>,
}

/// External control surface for a [`MockBus`].
#[derive(Clone)]
pub struct MockBusHandle {
    state: Arc<MockState>,
}

impl MockBus {
    /// Create an empty simulated bus and its control handle.
    pub fn new() -> (Self, MockBusHandle) {
        let state = Arc::new(MockState {
            endpoints: Mutex::new(HashMap::new()),
            latency: Mutex::new(Duration::ZERO),
            ops_until_failure: Mutex::new(None),
            log: Mutex::new(Vec::new()),
        });
        (
            Self {
                state: Arc::clone(&state),
            },
            MockBusHandle { state },
        )
    }

    async fn run_op(&self, address: u8, description: String) -> DaqResult<()> {
        {
            let mut counter = lock(&self.state.ops_until_failure);
            match counter.take() {
                Some(0) => {
                    lock(&self.state.log).push((address, format!("{description} [fault]")));
                    return Err(DaqError::Bus("injected transport fault".into()));
                }
                Some(remaining) => *counter = Some(remaining - 1),
                None => {}
            }
        }
        let latency = *lock(&self.state.latency);
        if latency > Duration::ZERO {
            tokio::time::sleep(latency).await;
        }
        lock(&self.state.log).push((address, description));
        Ok(())
    }

    fn with_endpoint<R>(
        &self,
        address: u8,
        f: impl FnOnce(&mut Endpoint) -> DaqResult<R>,
    ) -> DaqResult<R> {
        let mut endpoints = lock(&self.state.endpoints);
        let endpoint = endpoints
            .get_mut(&address)
            .ok_or_else(|| DaqError::Bus(format!("no instrument at address {address}")))?;
        f(endpoint)
    }

    fn answer_query(&self, address: u8, payload: &[u8]) -> DaqResult<Vec<u8>> {
        let query = String::from_utf8_lossy(payload);
        let query = query.trim();
        self.with_endpoint(address, |endpoint| match query {
            "CONF?" => Ok(endpoint.settings.clone()),
            "READ?" => {
                let noise = if endpoint.jitter > 0.0 {
                    (rand::random::<f64>() - 0.5) * 2.0 * endpoint.jitter
                } else {
                    0.0
                };
                let response = format!("{:+.6E}", endpoint.value + noise).into_bytes();
                if let Some(next) = endpoint.settings_after_value_read.take() {
                    endpoint.settings = next;
                }
                Ok(response)
            }
            "*IDN?" => Ok(b"BUSDAQ,MOCK-DMM,0,1.0".to_vec()),
            other => Err(DaqError::Bus(format!(
                "mock instrument does not understand query '{other}'"
            ))),
        })
    }
}

#[async_trait]
impl BusTransport for MockBus {
    async fn write(&mut self, address: u8, payload: &[u8]) -> DaqResult<()> {
        let text = String::from_utf8_lossy(payload).trim().to_string();
        self.run_op(address, format!("write {text}")).await?;
        self.with_endpoint(address, |_| Ok(()))
    }

    async fn write_read_exact(
        &mut self,
        address: u8,
        payload: &[u8],
        count: usize,
    ) -> DaqResult<Vec<u8>> {
        let text = String::from_utf8_lossy(payload).trim().to_string();
        self.run_op(address, format!("write-read {text}")).await?;
        if let Some(offset_text) = text.strip_prefix("CAL? ") {
            let offset: usize = offset_text
                .trim()
                .parse()
                .map_err(|_| DaqError::Bus(format!("bad CAL? offset '{offset_text}'")))?;
            return self.with_endpoint(address, |endpoint| {
                let byte = *endpoint
                    .cal_ram
                    .get(offset)
                    .ok_or_else(|| DaqError::Bus(format!("CAL? offset {offset} out of range")))?;
                Ok(vec![byte; count])
            });
        }
        Err(DaqError::Bus(format!(
            "mock instrument does not understand fixed-length query '{text}'"
        )))
    }

    async fn query_line(
        &mut self,
        address: u8,
        payload: &[u8],
        _terminator: Terminator,
    ) -> DaqResult<Vec<u8>> {
        let text = String::from_utf8_lossy(payload).trim().to_string();
        self.run_op(address, format!("query {text}")).await?;
        self.answer_query(address, payload)
    }

    async fn serial_poll(&mut self, address: u8) -> DaqResult<u8> {
        self.run_op(address, "serial-poll".to_string()).await?;
        self.with_endpoint(address, |endpoint| Ok(endpoint.status_byte))
    }
}

impl MockBusHandle {
    /// Attach a simulated DMM at `address` with default settings and value.
    pub fn add_dmm(&self, address: u8) {
        lock(&self.state.endpoints).insert(address, Endpoint::dmm());
    }

    /// Replace the measured value presented by the instrument.
    pub fn set_value(&self, address: u8, value: f64) {
        if let Some(endpoint) = lock(&self.state.endpoints).get_mut(&address) {
            endpoint.value = value;
        }
    }

    /// Add uniform noise of the given half-width to every reading.
    pub fn set_jitter(&self, address: u8, jitter: f64) {
        if let Some(endpoint) = lock(&self.state.endpoints).get_mut(&address) {
            endpoint.jitter = jitter;
        }
    }

    /// Replace the settings record presented by the instrument.
    pub fn set_settings(&self, address: u8, settings: &[u8]) {
        if let Some(endpoint) = lock(&self.state.endpoints).get_mut(&address) {
            endpoint.settings = settings.to_vec();
        }
    }

    /// Replace the serial-poll status byte.
    pub fn set_status_byte(&self, address: u8, byte: u8) {
        if let Some(endpoint) = lock(&self.state.endpoints).get_mut(&address) {
            endpoint.status_byte = byte;
        }
    }

    /// Overwrite one calibration RAM byte (e.g. to simulate corruption).
    pub fn set_cal_byte(&self, address: u8, offset: usize, byte: u8) {
        if let Some(endpoint) = lock(&self.state.endpoints).get_mut(&address) {
            if let Some(slot) = endpoint.cal_ram.get_mut(offset) {
                *slot = byte;
            }
        }
    }

    /// Swap the settings record the moment the next value is read, emulating
    /// a front-panel change landing between the steps of a read sequence.
    pub fn change_settings_after_value_read(&self, address: u8, settings: &[u8]) {
        if let Some(endpoint) = lock(&self.state.endpoints).get_mut(&address) {
            endpoint.settings_after_value_read = Some(settings.to_vec());
        }
    }

    /// Let `ok_ops` operations succeed, then fail the next one.
    pub fn fail_after(&self, ok_ops: u32) {
        *lock(&self.state.ops_until_failure) = Some(ok_ops);
    }

    /// Simulated per-operation latency.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.state.latency) = latency;
    }

    /// Copy of the `(address, operation)` log.
    pub fn call_log(&self) -> Vec<(u8, String)> {
        lock(&self.state.log).clone()
    }

    /// Clear the call log.
    pub fn clear_log(&self) {
        lock(&self.state.log).clear();
    }
}
