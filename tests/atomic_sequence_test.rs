//! Atomicity and consistency of multi-step bus sequences.
//!
//! An atomic sequence either completes every step or fails as a whole — a
//! mid-sequence fault must leave zero partial results visible. And a reading
//! whose pre- and post-exchange settings records differ is rejected as
//! untrustworthy rather than returned.

use bus_daq::bus::mock::MockBus;
use bus_daq::bus::{shared_bus, AtomicSequence, BusDevice, BusTransaction, Terminator};
use bus_daq::instrument::dmm::DmmDriver;
use bus_daq::{Command, DaqError, Instrument};
use std::sync::Arc;
use std::time::Duration;

fn open_dmm(address: u8) -> (Instrument, bus_daq::bus::mock::MockBusHandle) {
    let (bus, handle) = MockBus::new();
    handle.add_dmm(address);
    let instrument = Instrument::open(
        format!("dmm_{address}"),
        Box::new(DmmDriver::new()),
        BusDevice::new(shared_bus(bus), address),
    );
    (instrument, handle)
}

#[tokio::test]
async fn mid_sequence_fault_leaves_no_partial_results() {
    let (instrument, handle) = open_dmm(2);

    // First step succeeds, second faults, third must never run.
    handle.fail_after(1);
    let err = instrument
        .submit_and_wait(Command::GetReading, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, DaqError::Bus(_)));

    assert!(instrument.reading().is_none());
    assert!(instrument.settings().is_none());

    let log = handle.call_log();
    assert_eq!(log.len(), 2, "sequence must stop at the faulted step: {log:?}");
    assert!(log[1].1.contains("[fault]"));
    instrument.close().await;
}

#[tokio::test]
async fn bus_level_atomic_failure_returns_no_outcomes() {
    let (bus, handle) = MockBus::new();
    handle.add_dmm(5);
    let device = BusDevice::new(shared_bus(bus), 5);

    let sequence = AtomicSequence::new(vec![
        BusTransaction::query_line(b"CONF?".to_vec(), Terminator::CrLf),
        BusTransaction::query_line(b"READ?".to_vec(), Terminator::CrLf),
        BusTransaction::query_line(b"CONF?".to_vec(), Terminator::CrLf),
    ])
    .unwrap();

    handle.fail_after(1);
    let result = device.execute_atomic(&sequence, Duration::from_secs(1)).await;
    assert!(matches!(result, Err(DaqError::Bus(_))));
    assert_eq!(handle.call_log().len(), 2);
}

#[tokio::test]
async fn bus_level_atomic_deadline_is_a_timeout() {
    let (bus, handle) = MockBus::new();
    handle.add_dmm(5);
    handle.set_latency(Duration::from_millis(50));
    let device = BusDevice::new(shared_bus(bus), 5);

    let sequence = AtomicSequence::new(vec![
        BusTransaction::query_line(b"CONF?".to_vec(), Terminator::CrLf),
        BusTransaction::query_line(b"READ?".to_vec(), Terminator::CrLf),
        BusTransaction::query_line(b"CONF?".to_vec(), Terminator::CrLf),
    ])
    .unwrap();

    let result = device
        .execute_atomic(&sequence, Duration::from_millis(75))
        .await;
    assert!(matches!(result, Err(DaqError::Timeout(_))));
}

#[tokio::test]
async fn settings_change_mid_read_is_a_consistency_failure() {
    let (instrument, handle) = open_dmm(2);

    handle.change_settings_after_value_read(2, b"CURR:DC 1,0.000001");
    let err = instrument
        .submit_and_wait(Command::GetReading, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, DaqError::Consistency(_)));
    assert!(instrument.reading().is_none());

    // The instrument has settled on the new configuration; the next reading
    // is consistent again and reports the new unit.
    let reply = instrument
        .submit_and_wait(Command::GetReading, Duration::from_secs(1))
        .await
        .unwrap();
    let reading = reply.reading().unwrap();
    assert_eq!(reading.unit(), "A");
    assert_eq!(reading.settings().function(), "CURR:DC");
    instrument.close().await;
}

#[tokio::test]
async fn sequences_from_two_instruments_never_interleave() {
    const READS_PER_INSTRUMENT: usize = 10;

    let (bus, handle) = MockBus::new();
    handle.add_dmm(2);
    handle.add_dmm(3);
    let bus = shared_bus(bus);

    let dmm_a = Arc::new(Instrument::open(
        "dmm_a",
        Box::new(DmmDriver::new()),
        BusDevice::new(Arc::clone(&bus), 2),
    ));
    let dmm_b = Arc::new(Instrument::open(
        "dmm_b",
        Box::new(DmmDriver::new()),
        BusDevice::new(Arc::clone(&bus), 3),
    ));

    let mut tasks = Vec::new();
    for instrument in [Arc::clone(&dmm_a), Arc::clone(&dmm_b)] {
        tasks.push(tokio::spawn(async move {
            for _ in 0..READS_PER_INSTRUMENT {
                instrument
                    .submit_and_wait(Command::GetReading, Duration::from_secs(5))
                    .await
                    .unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let log = handle.call_log();
    assert_eq!(log.len(), 2 * READS_PER_INSTRUMENT * 3);
    // Every reading is three back-to-back operations for one address; any
    // cross-address interleaving inside a triple means the bus lock leaked.
    for triple in log.chunks(3) {
        let address = triple[0].0;
        assert!(
            triple.iter().all(|(a, _)| *a == address),
            "interleaved atomic sequence in log: {triple:?}"
        );
        assert!(triple[0].1.contains("CONF?"));
        assert!(triple[1].1.contains("READ?"));
        assert!(triple[2].1.contains("CONF?"));
    }
}
