//! End-to-end scenarios on the simulated device: a triggered capture, record
//! mode under overload, an I2C read cut short by a NAK and a pin conflict
//! between two bus engines.

use std::time::Duration;

use mixsig_daq::instrument::{AcquisitionMode, ChannelSelector, Instrument, InstrumentState};
use mixsig_daq::protocol::i2c::{I2cNak, I2cPhase};
use mixsig_daq::protocol::spi::SpiPins;
use mixsig_daq::sim::{I2cSlave, Signal, SimDevice, SimHandle};
use mixsig_daq::{Device, EngineId, ErrorKind, PinRole};

fn sim() -> (Device, SimHandle) {
    let (backend, handle) = SimDevice::new();
    (Device::new(backend), handle)
}

#[test]
fn test_single_capture_two_channels() {
    let (device, handle) = sim();
    let ramp: Vec<f64> = (0..1000).map(f64::from).collect();
    handle.set_analog_signal(0, Signal::Sequence(ramp));
    handle.set_analog_signal(1, Signal::Constant(2.5));

    let mut scope = device.analog_in().unwrap();
    scope.set_mode(AcquisitionMode::Single).unwrap();
    scope.set_channel_enable(ChannelSelector::Index(0), true).unwrap();
    scope.set_channel_enable(ChannelSelector::Index(1), true).unwrap();
    scope.set_sample_rate(1_000_000.0).unwrap();
    scope.set_buffer_size(1000).unwrap();
    assert_eq!(scope.configure(false, true).unwrap(), InstrumentState::Armed);

    handle.advance(Duration::from_micros(500));
    assert_eq!(scope.poll(true).unwrap(), InstrumentState::Triggered);
    assert_eq!(scope.valid_samples(), 500);

    handle.advance(Duration::from_micros(600));
    assert_eq!(scope.poll(true).unwrap(), InstrumentState::Done);
    assert_eq!(scope.valid_samples(), 1000);
    assert!(!scope.auto_triggered());
    assert_eq!(scope.trigger_offset(), Some(0));

    let ch0 = scope.read_samples(0, 0, 1000).unwrap();
    assert!(!ch0.is_short());
    assert_eq!(ch0.samples[0], 0.0);
    assert_eq!(ch0.samples[999], 999.0);
    let ch1 = scope.read_samples(1, 0, 1000).unwrap();
    assert!(ch1.samples.iter().all(|v| *v == 2.5));

    // Done stays Done and keeps the buffer
    handle.advance(Duration::from_millis(1));
    assert_eq!(scope.poll(true).unwrap(), InstrumentState::Done);
    assert_eq!(scope.valid_samples(), 1000);
}

#[test]
fn test_record_overproduction_reports_loss() {
    let (device, handle) = sim();
    let mut scope = device.analog_in().unwrap();
    scope.set_mode(AcquisitionMode::Record).unwrap();
    scope.set_sample_rate(1_000_000.0).unwrap();
    scope.set_buffer_size(1000).unwrap();
    scope.configure(false, true).unwrap();

    let mut available = 0;
    let mut lost = 0;
    for _ in 0..5 {
        // twice what the hardware buffer holds
        handle.advance(Duration::from_millis(2));
        assert_eq!(scope.poll(true).unwrap(), InstrumentState::Triggered);
        let status = scope.record_status().unwrap();
        assert_eq!(status.available, 1000);
        assert!(status.lost > 0);
        available += status.available;
        lost += status.lost;
    }
    assert_eq!(available + lost, 10_000);
    assert_eq!(lost, 5_000);
}

#[test]
fn test_record_without_new_data_waits() {
    let (device, handle) = sim();
    let mut scope = device.analog_in().unwrap();
    scope.set_mode(AcquisitionMode::Record).unwrap();
    scope.set_sample_rate(1_000_000.0).unwrap();
    scope.set_buffer_size(1000).unwrap();
    scope.configure(false, true).unwrap();

    handle.advance(Duration::from_micros(300));
    assert_eq!(scope.poll(true).unwrap(), InstrumentState::Triggered);
    let status = scope.record_status().unwrap();
    assert_eq!(status.available, 300);
    assert_eq!(status.lost, 0);

    assert_eq!(scope.poll(true).unwrap(), InstrumentState::Wait);
    assert_eq!(scope.record_status().unwrap().available, 0);
}

#[test]
fn test_i2c_nak_on_third_read_byte() {
    let (device, handle) = sim();
    let mut slave = I2cSlave::new(0x50).with_memory(0x10, &[0xAA, 0xBB, 0xCC, 0xDD]);
    slave.nak_read_after = Some(2);
    handle.add_i2c_slave(slave);

    let mut i2c = device.i2c().unwrap();
    i2c.set_pins(2, 3).unwrap();
    let outcome = i2c.write_then_read(0x50, &[0x10], 4, None).unwrap();

    assert_eq!(
        outcome.nak,
        Some(I2cNak {
            phase: I2cPhase::Read,
            index: 3
        })
    );
    assert_eq!(outcome.nak_index(), 3);
    assert_eq!(outcome.rx, vec![0xAA, 0xBB]);
    assert_eq!(outcome.transfer.completed, 3);
    assert_eq!(outcome.transfer.requested, 5);
}

#[test]
fn test_pin_conflict_leaves_first_claim_intact() {
    let (device, _handle) = sim();
    let mut uart = device.uart().unwrap();
    let mut spi = device.spi().unwrap();

    uart.set_pins(Some(4), Some(5)).unwrap();
    let err = spi
        .set_pins(&SpiPins {
            clk: 4,
            dq: vec![6],
            cs: Some(7),
        })
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceConflict);

    assert_eq!(uart.claims().pin_for(PinRole::UartTx), Some(4));
    assert_eq!(uart.claims().pin_for(PinRole::UartRx), Some(5));
    assert!(spi.claims().claims().is_empty());
    assert_eq!(device.pins().owner_of(4).map(|c| c.owner), Some(EngineId::Uart));
    assert!(device.pins().owner_of(6).is_none());
    assert!(device.pins().owner_of(7).is_none());

    // the loser can retry on free pins
    spi.set_pins(&SpiPins {
        clk: 8,
        dq: vec![6],
        cs: Some(7),
    })
    .unwrap();
    assert_eq!(device.pins().owner_of(8).map(|c| c.owner), Some(EngineId::Spi));
}
