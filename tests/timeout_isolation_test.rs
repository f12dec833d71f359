//! Timeout semantics of the synchronous bridge.
//!
//! A timed-out `submit_and_wait` only stops waiting: the command is not
//! aborted on the bus, its late result is discarded, and it can never be
//! delivered to a different waiter — not even one awaiting an
//! identically-kinded command submitted right after.

use bus_daq::bus::mock::MockBus;
use bus_daq::bus::{shared_bus, BusDevice};
use bus_daq::instrument::dmm::DmmDriver;
use bus_daq::{Command, DaqError, Instrument};
use std::time::Duration;

fn open_dmm(address: u8) -> (Instrument, bus_daq::bus::mock::MockBusHandle) {
    let (bus, handle) = MockBus::new();
    handle.add_dmm(address);
    let instrument = Instrument::open(
        "dmm_1",
        Box::new(DmmDriver::new()),
        BusDevice::new(shared_bus(bus), address),
    );
    (instrument, handle)
}

#[tokio::test]
async fn late_result_is_never_cross_delivered() {
    let (instrument, handle) = open_dmm(2);
    handle.set_value(2, 1.0);

    // Make the first reading slow enough to outlive its caller's deadline.
    handle.set_latency(Duration::from_millis(60));
    let err = instrument
        .submit_and_wait(Command::GetReading, Duration::from_millis(30))
        .await
        .unwrap_err();
    assert!(matches!(err, DaqError::Timeout(_)));

    // The first command still executes on the bus. Change the instrument's
    // state, then issue a second, identically-kinded command: it must see its
    // own exchange, never the abandoned one's.
    handle.set_latency(Duration::ZERO);
    handle.set_value(2, 42.0);
    let reply = instrument
        .submit_and_wait(Command::GetReading, Duration::from_secs(5))
        .await
        .unwrap();
    let reading = reply.reading().unwrap();
    assert!(
        (reading.value() - 42.0).abs() < 1e-9,
        "second caller received a stale value: {}",
        reading.value()
    );
    instrument.close().await;
}

#[tokio::test]
async fn timed_out_command_still_completes_and_publishes() {
    let (instrument, handle) = open_dmm(2);
    handle.set_value(2, 7.5);
    handle.set_latency(Duration::from_millis(40));

    let err = instrument
        .submit_and_wait(Command::GetReading, Duration::from_millis(20))
        .await
        .unwrap_err();
    assert!(matches!(err, DaqError::Timeout(_)));

    // The processor finishes the abandoned command in the background; its
    // snapshot is published even though its result slot found no waiter.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let reading = instrument.reading().unwrap();
    assert!((reading.value() - 7.5).abs() < 1e-9);
    instrument.close().await;
}

#[tokio::test]
async fn dropped_handle_abandons_the_wait_not_the_command() {
    let (instrument, handle) = open_dmm(2);
    handle.set_value(2, 3.25);
    handle.set_latency(Duration::from_millis(10));

    let pending = instrument.submit(Command::GetReading).unwrap();
    drop(pending); // caller cancelled

    tokio::time::sleep(Duration::from_millis(200)).await;
    let reading = instrument.reading().unwrap();
    assert!((reading.value() - 3.25).abs() < 1e-9);
    instrument.close().await;
}
