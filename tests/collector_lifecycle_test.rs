//! Acquisition collector state machine.
//!
//! `start(continuous = false)` runs exactly one cycle — success or failure —
//! then returns to Stopped. `start(continuous = true)` keeps acquiring across
//! individual cycle failures until an explicit `stop()`.

use bus_daq::bus::mock::MockBus;
use bus_daq::bus::{shared_bus, BusDevice};
use bus_daq::instrument::dmm::DmmDriver;
use bus_daq::{
    AcquisitionConfig, CollectorState, DaqError, Instrument, InstrumentListener, Reading,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct ReadingCounter {
    readings: AtomicUsize,
}

impl ReadingCounter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            readings: AtomicUsize::new(0),
        })
    }

    fn count(&self) -> usize {
        self.readings.load(Ordering::SeqCst)
    }
}

impl InstrumentListener for ReadingCounter {
    fn on_new_reading(&self, _instrument: &str, _reading: &Arc<Reading>) {
        self.readings.fetch_add(1, Ordering::SeqCst);
    }
}

fn open_polled_dmm(
    period: Duration,
) -> (
    Instrument,
    bus_daq::bus::mock::MockBusHandle,
    Arc<ReadingCounter>,
) {
    let (bus, handle) = MockBus::new();
    handle.add_dmm(2);
    let instrument = Instrument::open_with(
        "dmm_1",
        Box::new(DmmDriver::new()),
        BusDevice::new(shared_bus(bus), 2),
        AcquisitionConfig {
            period,
            cycle_timeout: Duration::from_secs(1),
        },
    );
    let counter = ReadingCounter::new();
    instrument.register_listener(Arc::clone(&counter) as Arc<dyn InstrumentListener>);
    (instrument, handle, counter)
}

#[tokio::test]
async fn one_shot_runs_exactly_one_cycle() {
    let (instrument, _handle, counter) = open_polled_dmm(Duration::from_millis(10));

    instrument.collector().start(false).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(instrument.collector().state(), CollectorState::Stopped);
    assert_eq!(counter.count(), 1);
    assert!(instrument.reading().is_some());
    instrument.close().await;
}

#[tokio::test]
async fn one_shot_stops_even_when_the_cycle_fails() {
    let (instrument, handle, counter) = open_polled_dmm(Duration::from_millis(10));

    handle.fail_after(0); // first bus operation faults
    instrument.collector().start(false).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(instrument.collector().state(), CollectorState::Stopped);
    assert_eq!(counter.count(), 0);
    assert!(instrument.reading().is_none());

    // And it can be started again afterwards.
    instrument.collector().start(false).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(counter.count(), 1);
    instrument.close().await;
}

#[tokio::test]
async fn continuous_mode_survives_cycle_failures_until_stopped() {
    let (instrument, handle, counter) = open_polled_dmm(Duration::from_millis(10));

    instrument.collector().start(true).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let before_failure = counter.count();
    assert!(before_failure > 0, "no cycles ran before the fault");

    // One cycle fails mid-sequence; acquisition must carry on.
    handle.fail_after(1);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(instrument.collector().state(), CollectorState::Running);
    let after_failure = counter.count();
    assert!(
        after_failure > before_failure,
        "acquisition did not recover after a failed cycle"
    );

    instrument.collector().stop().await;
    assert_eq!(instrument.collector().state(), CollectorState::Stopped);
    let frozen = counter.count();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(counter.count(), frozen, "cycles ran after stop()");
    instrument.close().await;
}

#[tokio::test]
async fn starting_a_running_collector_is_rejected() {
    let (instrument, _handle, _counter) = open_polled_dmm(Duration::from_millis(10));

    instrument.collector().start(true).await.unwrap();
    let err = instrument.collector().start(true).await.unwrap_err();
    assert!(matches!(err, DaqError::Validation(_)));

    instrument.collector().stop().await;
    instrument.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn collector_competes_fifo_with_manual_commands() {
    // The collector holds no special queue priority: its reading commands
    // and manual submissions share one strict-FIFO queue.
    let (instrument, _handle, counter) = open_polled_dmm(Duration::from_millis(20));

    instrument.collector().start(true).await.unwrap();
    for _ in 0..10 {
        instrument
            .submit_and_wait(bus_daq::Command::GetStatus, Duration::from_secs(1))
            .await
            .unwrap();
    }
    instrument.collector().stop().await;
    assert!(instrument.status().is_some());
    // Both paths made progress on the shared queue.
    assert!(counter.count() > 0);
    instrument.close().await;
}
