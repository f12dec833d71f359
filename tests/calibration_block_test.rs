//! Calibration RAM reads through the full command path.
//!
//! The 256-byte image is read as one atomic sequence of single-byte queries
//! and validated bit-exactly at construction: every byte's upper nibble must
//! be the 0x4 sentinel, and the block must be exactly 256 bytes.

use bus_daq::bus::mock::MockBus;
use bus_daq::bus::{shared_bus, BusDevice};
use bus_daq::instrument::dmm::DmmDriver;
use bus_daq::{Command, CommandReply, DaqError, Instrument, CAL_BLOCK_LEN};
use std::time::Duration;

fn open_dmm(driver: DmmDriver) -> (Instrument, bus_daq::bus::mock::MockBusHandle) {
    let (bus, handle) = MockBus::new();
    handle.add_dmm(2);
    let instrument = Instrument::open("dmm_1", Box::new(driver), BusDevice::new(shared_bus(bus), 2));
    (instrument, handle)
}

#[tokio::test]
async fn reads_and_validates_the_full_block() {
    let (instrument, handle) = open_dmm(DmmDriver::new());

    let reply = instrument
        .submit_and_wait(Command::ReadCalibrationBlock, Duration::from_secs(10))
        .await
        .unwrap();
    let block = match reply {
        CommandReply::CalibrationBlock(block) => block,
        other => panic!("expected a calibration block, got {other:?}"),
    };

    // The mock image stores offset & 0x0F in each nibble.
    assert_eq!(block.nibble(0), Some(0));
    assert_eq!(block.nibble(15), Some(0x0F));
    assert_eq!(block.nibble(255), Some(0x0F));
    assert!(block.as_bytes().iter().all(|byte| byte & 0xF0 == 0x40));

    // 256 single-byte transactions, executed back-to-back.
    assert_eq!(handle.call_log().len(), CAL_BLOCK_LEN);
    instrument.close().await;
}

#[tokio::test]
async fn corrupt_byte_fails_block_construction() {
    let (instrument, handle) = open_dmm(DmmDriver::new());
    handle.set_cal_byte(2, 100, 0x30);

    let err = instrument
        .submit_and_wait(Command::ReadCalibrationBlock, Duration::from_secs(10))
        .await
        .unwrap_err();
    match err {
        DaqError::Validation(message) => assert!(message.contains("offset 100")),
        other => panic!("expected a validation error, got {other:?}"),
    }
    instrument.close().await;
}

#[tokio::test]
async fn single_byte_read_returns_the_tagged_byte() {
    let (instrument, _handle) = open_dmm(DmmDriver::new());

    let reply = instrument
        .submit_and_wait(
            Command::ReadCalibrationByte { address: 0x2A },
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    match reply {
        CommandReply::CalibrationByte(byte) => assert_eq!(byte, 0x4A),
        other => panic!("expected a calibration byte, got {other:?}"),
    }
    instrument.close().await;
}

#[tokio::test]
async fn out_of_range_address_is_rejected_without_bus_traffic() {
    let (instrument, handle) = open_dmm(DmmDriver::new());

    let err = instrument
        .submit_and_wait(
            Command::ReadCalibrationByte { address: 300 },
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DaqError::Validation(_)));
    assert!(handle.call_log().is_empty(), "validation must precede bus traffic");
    instrument.close().await;
}

#[tokio::test]
async fn models_without_cal_ram_report_unsupported() {
    let (instrument, handle) = open_dmm(DmmDriver::new().with_cal_ram(false));

    let err = instrument
        .submit_and_wait(Command::ReadCalibrationBlock, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, DaqError::Unsupported(_)));

    let err = instrument
        .submit_and_wait(
            Command::ReadCalibrationByte { address: 0 },
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DaqError::Unsupported(_)));
    assert!(handle.call_log().is_empty());

    // Ordinary commands still work on such models.
    assert!(instrument
        .submit_and_wait(Command::GetReading, Duration::from_secs(1))
        .await
        .is_ok());
    instrument.close().await;
}
