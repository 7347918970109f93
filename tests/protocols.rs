//! Bus engines against the simulated endpoints: GPIO, UART, SPI, I2C and CAN.

use std::time::Duration;

use mixsig_daq::gpio::Direction;
use mixsig_daq::protocol::can::{CanError, CanFrame, CanRx};
use mixsig_daq::protocol::i2c::{I2cNak, I2cPhase};
use mixsig_daq::protocol::spi::{ChipSelect, DataLines, SpiDirection, SpiPins};
use mixsig_daq::protocol::uart::{Parity, UartConfig};
use mixsig_daq::sim::{I2cSlave, SimDevice, SimHandle};
use mixsig_daq::{Device, EngineId, ErrorKind};

fn sim() -> (Device, SimHandle) {
    let (backend, handle) = SimDevice::new();
    (Device::new(backend), handle)
}

// ---- GPIO ----

#[test]
fn test_gpio_outputs_read_back() {
    let (device, handle) = sim();
    let mut gpio = device.gpio().unwrap();
    gpio.set_direction(0, Some(Direction::Output)).unwrap();
    gpio.set_direction(1, Some(Direction::Input)).unwrap();
    handle.set_gpio_external(0b1110);

    gpio.set_level(0, true).unwrap();
    assert_eq!(handle.gpio_outputs(), (0b1, 0b1));
    // pin 2 and 3 are driven externally but not claimed
    assert_eq!(gpio.read().unwrap(), 0b11);
    assert!(gpio.read_pin(1).unwrap());

    gpio.write(0b1, 0).unwrap();
    assert!(!gpio.read_pin(0).unwrap());

    assert_eq!(
        gpio.write(0b10, 0b10).unwrap_err().kind(),
        ErrorKind::InvalidParameter
    );
    assert_eq!(
        gpio.set_level(1, true).unwrap_err().kind(),
        ErrorKind::InvalidParameter
    );
    assert_eq!(gpio.read_pin(5).unwrap_err().kind(), ErrorKind::InvalidParameter);
}

#[test]
fn test_gpio_claims_follow_direction() {
    let (device, handle) = sim();
    let mut uart = device.uart().unwrap();
    uart.set_pins(Some(4), None).unwrap();

    let mut gpio = device.gpio().unwrap();
    let err = gpio.set_direction(4, Some(Direction::Output)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceConflict);
    assert_eq!(gpio.direction(4), None);

    gpio.set_direction(3, Some(Direction::Output)).unwrap();
    assert_eq!(device.pins().owner_of(3).map(|c| c.owner), Some(EngineId::Gpio));
    gpio.set_direction(3, None).unwrap();
    assert!(device.pins().owner_of(3).is_none());
    assert_eq!(handle.gpio_outputs().0, 0);

    gpio.set_direction(6, Some(Direction::Output)).unwrap();
    gpio.reset().unwrap();
    assert!(device.pins().owner_of(6).is_none());
    assert_eq!(handle.gpio_outputs(), (0, 0));
}

// ---- UART ----

#[test]
fn test_uart_loopback() {
    let (device, handle) = sim();
    let mut uart = device.uart().unwrap();
    uart.set_pins(Some(0), Some(1)).unwrap();

    let sent = uart.tx(b"hi", None).unwrap();
    assert!(sent.is_complete());
    assert_eq!(handle.uart_tx_log().len(), 2);
    assert!(handle.uart_tx_log().iter().all(|frame| frame.len() == 10));

    let rx = uart.rx(16).unwrap();
    assert_eq!(rx.bytes(), b"hi".to_vec());
    assert!(!rx.parity_error);
    assert!(!rx.framing_error);

    // nothing left
    assert!(uart.rx(16).unwrap().data.is_empty());
}

#[test]
fn test_uart_rx_limits_word_count() {
    let (device, _handle) = sim();
    let mut uart = device.uart().unwrap();
    uart.set_pins(Some(0), Some(1)).unwrap();
    uart.tx(b"abcdef", None).unwrap();

    assert_eq!(uart.rx(4).unwrap().bytes(), b"abcd".to_vec());
    assert_eq!(uart.rx(4).unwrap().bytes(), b"ef".to_vec());
}

#[test]
fn test_uart_parity_and_framing_errors() {
    let (device, handle) = sim();
    let mut uart = device.uart().unwrap();
    uart.set_pins(None, Some(1)).unwrap();
    uart.set_parity(Parity::Even);

    let line = UartConfig {
        parity: Parity::Even,
        ..Default::default()
    };
    let good = line.encode(0x41);
    let mut bad_parity = good.clone();
    bad_parity[9] = !bad_parity[9];
    handle.push_uart_rx(vec![good.clone(), bad_parity]);

    let rx = uart.rx(8).unwrap();
    assert_eq!(rx.data, vec![0x41, 0x41]);
    assert!(rx.parity_error);
    assert!(!rx.framing_error);

    let mut bad_stop = good;
    let last = bad_stop.len() - 1;
    bad_stop[last] = false;
    handle.push_uart_rx(vec![bad_stop]);
    let rx = uart.rx(8).unwrap();
    assert!(rx.framing_error);
    assert!(!rx.parity_error);
}

#[test]
fn test_uart_timeout_truncates() {
    let (device, handle) = sim();
    let mut uart = device.uart().unwrap();
    uart.set_rate(9600.0).unwrap();
    uart.set_pins(Some(0), Some(1)).unwrap();

    // 48 bit times fit four 10-bit frames
    let sent = uart.tx(&[0u8; 10], Some(Duration::from_millis(5))).unwrap();
    assert_eq!(sent.completed, 4);
    assert_eq!(sent.requested, 10);
    assert!(sent.timed_out());
    assert_eq!(handle.uart_tx_log().len(), 4);
}

#[test]
fn test_uart_word_width_and_pins_checked() {
    let (device, handle) = sim();
    let mut uart = device.uart().unwrap();
    assert_eq!(uart.tx(b"x", None).unwrap_err().kind(), ErrorKind::InvalidParameter);

    uart.set_pins(Some(0), None).unwrap();
    assert_eq!(
        uart.tx_words(&[0x100], None).unwrap_err().kind(),
        ErrorKind::InvalidParameter
    );
    assert_eq!(uart.rx(1).unwrap_err().kind(), ErrorKind::InvalidParameter);

    uart.set_data_bits(9).unwrap();
    handle.set_uart_loopback(false);
    assert!(uart.tx_words(&[0x1FF], None).unwrap().is_complete());
    assert_eq!(handle.uart_tx_log()[0].len(), 11);
}

// ---- SPI ----

fn spi_pins(dq: &[u8]) -> SpiPins {
    SpiPins {
        clk: 0,
        dq: dq.to_vec(),
        cs: Some(7),
    }
}

#[test]
fn test_spi_duplex_echo_and_responses() {
    let (device, handle) = sim();
    let mut spi = device.spi().unwrap();
    spi.set_pins(&spi_pins(&[1, 2])).unwrap();

    let out = spi.write_read(&[0xA5, 0x3C], 2, None).unwrap();
    assert_eq!(out.rx, vec![0xA5, 0x3C]);
    assert!(out.transfer.is_complete());

    // the slave answers once, then echoes again; missing tx words are zero
    handle.queue_spi_response(&[0x11]);
    let out = spi.write_read(&[0x01, 0x02], 3, None).unwrap();
    assert_eq!(out.rx, vec![0x11, 0x02, 0x00]);
    assert_eq!(out.transfer.requested, 3);
}

#[test]
fn test_spi_chip_select() {
    let (device, handle) = sim();
    let mut spi = device.spi().unwrap();
    spi.set_pins(&SpiPins {
        clk: 0,
        dq: vec![1],
        cs: None,
    })
    .unwrap();
    assert_eq!(
        spi.chip_select(ChipSelect::Low).unwrap_err().kind(),
        ErrorKind::InvalidParameter
    );

    spi.set_pins(&spi_pins(&[1])).unwrap();
    spi.chip_select(ChipSelect::Low).unwrap();
    assert_eq!(handle.spi_chip_select(), Some(ChipSelect::Low));
    spi.chip_select(ChipSelect::HighZ).unwrap();
    assert_eq!(handle.spi_chip_select(), Some(ChipSelect::HighZ));
}

#[test]
fn test_spi_quad_runs_write_then_read() {
    let (device, handle) = sim();
    let mut spi = device.spi().unwrap();
    spi.set_lines(DataLines::Quad);
    spi.set_pins(&spi_pins(&[1, 2])).unwrap();
    assert_eq!(
        spi.write_read(&[0xAB], 2, None).unwrap_err().kind(),
        ErrorKind::InvalidParameter
    );

    spi.set_pins(&spi_pins(&[1, 2, 3, 4])).unwrap();
    let out = spi.write_read(&[0xAB], 2, None).unwrap();
    assert_eq!(out.rx.len(), 2);
    assert_eq!(out.transfer.completed, 3);
    assert_eq!(out.transfer.requested, 3);

    let log = handle.spi_log();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].direction, SpiDirection::Write);
    assert_eq!(log[0].symbols, vec![0xA, 0xB]);
    assert_eq!(log[1].direction, SpiDirection::Read);
    assert_eq!(log[1].lines, DataLines::Quad);
}

#[test]
fn test_spi_timeout_and_word_checks() {
    let (device, _handle) = sim();
    let mut spi = device.spi().unwrap();
    assert_eq!(
        spi.write(&[1], None).unwrap_err().kind(),
        ErrorKind::InvalidParameter
    );
    spi.set_pins(&spi_pins(&[1, 2])).unwrap();

    // 20 clocks at 1 MHz hold two 8-bit words
    let sent = spi.write(&[1, 2, 3, 4], Some(Duration::from_micros(20))).unwrap();
    assert_eq!(sent.completed, 2);
    assert!(sent.timed_out());

    assert_eq!(
        spi.write(&[0x100], None).unwrap_err().kind(),
        ErrorKind::InvalidParameter
    );
    assert_eq!(spi.set_word_bits(33).unwrap_err().kind(), ErrorKind::InvalidParameter);
}

// ---- I2C ----

#[test]
fn test_i2c_address_nak() {
    let (device, _handle) = sim();
    let mut i2c = device.i2c().unwrap();
    i2c.set_pins(2, 3).unwrap();

    let outcome = i2c.write(0x20, &[0x01], None).unwrap();
    assert_eq!(
        outcome.nak,
        Some(I2cNak {
            phase: I2cPhase::WriteAddress,
            index: 1
        })
    );
    assert!(!outcome.acked());
    assert_eq!(outcome.transfer.completed, 0);

    let outcome = i2c.read(0x20, 2, None).unwrap();
    assert_eq!(outcome.nak.map(|n| n.phase), Some(I2cPhase::ReadAddress));
}

#[test]
fn test_i2c_write_then_read_register_file() {
    let (device, handle) = sim();
    handle.add_i2c_slave(I2cSlave::new(0x50));
    let mut i2c = device.i2c().unwrap();
    i2c.set_pins(2, 3).unwrap();

    let outcome = i2c.write(0x50, &[0x05, 1, 2, 3], None).unwrap();
    assert!(outcome.acked());
    assert_eq!(outcome.transfer.completed, 4);
    assert_eq!(&handle.i2c_memory(0x50).unwrap()[5..8], &[1, 2, 3]);

    let outcome = i2c.write_then_read(0x50, &[0x05], 3, None).unwrap();
    assert!(outcome.acked());
    assert_eq!(outcome.rx, vec![1, 2, 3]);
    assert_eq!(outcome.nak_index(), 0);
}

#[test]
fn test_i2c_write_nak_index() {
    let (device, handle) = sim();
    let mut slave = I2cSlave::new(0x50);
    slave.nak_write_after = Some(2);
    handle.add_i2c_slave(slave);
    let mut i2c = device.i2c().unwrap();
    i2c.set_pins(2, 3).unwrap();

    let outcome = i2c.write(0x50, &[0x00, 9, 9, 9], None).unwrap();
    assert_eq!(
        outcome.nak,
        Some(I2cNak {
            phase: I2cPhase::Write,
            index: 3
        })
    );
    assert_eq!(outcome.transfer.completed, 2);
}

#[test]
fn test_i2c_clock_stretching() {
    let (device, handle) = sim();
    let mut slave = I2cSlave::new(0x50).with_memory(0, &[0x12, 0x34]);
    slave.stretches = true;
    handle.add_i2c_slave(slave);
    let mut i2c = device.i2c().unwrap();
    i2c.set_pins(2, 3).unwrap();
    assert!(i2c.clock_stretching());

    let outcome = i2c.write_then_read(0x50, &[0x00], 2, None).unwrap();
    assert_eq!(outcome.rx, vec![0x12, 0x34]);

    i2c.set_clock_stretching(false);
    let outcome = i2c.write_then_read(0x50, &[0x00], 2, None).unwrap();
    assert_eq!(outcome.rx, vec![0xFF, 0xFF]);
}

#[test]
fn test_i2c_device_error_still_releases_bus() {
    let (device, handle) = sim();
    handle.add_i2c_slave(I2cSlave::new(0x50).with_memory(0, &[0x12, 0x34]));
    let mut i2c = device.i2c().unwrap();
    i2c.set_pins(2, 3).unwrap();

    // fails on the address byte, after START
    handle.fail_next("SDA stuck");
    let err = i2c.write_then_read(0x50, &[0x00], 2, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Device);
    assert!(!handle.i2c_bus_held());

    let outcome = i2c.write_then_read(0x50, &[0x00], 2, None).unwrap();
    assert!(outcome.acked());
    assert_eq!(outcome.rx, vec![0x12, 0x34]);
    assert!(!handle.i2c_bus_held());
}

#[test]
fn test_i2c_timeout_and_address_checks() {
    let (device, handle) = sim();
    handle.add_i2c_slave(I2cSlave::new(0x50));
    let mut i2c = device.i2c().unwrap();
    assert_eq!(
        i2c.write(0x50, &[0], None).unwrap_err().kind(),
        ErrorKind::InvalidParameter
    );
    i2c.set_pins(2, 3).unwrap();

    // 20 bit times at 100 kHz: the address byte and one data byte
    let outcome = i2c.write(0x50, &[0, 1, 2], Some(Duration::from_micros(200))).unwrap();
    assert!(outcome.nak.is_none());
    assert_eq!(outcome.transfer.completed, 1);
    assert!(outcome.transfer.timed_out());

    assert_eq!(
        i2c.write(0x80, &[0], None).unwrap_err().kind(),
        ErrorKind::InvalidParameter
    );
}

// ---- CAN ----

#[test]
fn test_can_loopback_frames() {
    let (device, handle) = sim();
    let mut can = device.can().unwrap();
    can.set_pins(10, 11).unwrap();

    let standard = CanFrame::data(0x123, false, &[0x11, 0x22]).unwrap();
    let extended = CanFrame::data(0x1AB_CDEF, true, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
    let remote = CanFrame::remote(0x42, false, 4).unwrap();
    for frame in [&standard, &extended, &remote] {
        assert!(can.tx(frame).unwrap().acked);
    }
    assert_eq!(handle.can_tx_log().len(), 3);

    assert_eq!(can.rx().unwrap(), CanRx::Frame(standard));
    assert_eq!(can.rx().unwrap(), CanRx::Frame(extended));
    assert_eq!(can.rx().unwrap(), CanRx::Frame(remote));
    assert_eq!(can.rx().unwrap(), CanRx::NoFrame);
}

#[test]
fn test_can_corrupted_frame_reports_crc_error() {
    let (device, handle) = sim();
    let mut can = device.can().unwrap();
    can.set_pins(10, 11).unwrap();

    handle.flip_next_can_bit(24);
    can.tx(&CanFrame::data(0x123, false, &[0x11, 0x22]).unwrap()).unwrap();
    assert_eq!(can.rx().unwrap(), CanRx::Error(CanError::Crc));
}

#[test]
fn test_can_unacknowledged_and_unconfigured() {
    let (device, handle) = sim();
    let mut can = device.can().unwrap();
    let frame = CanFrame::data(0x10, false, &[0xFF]).unwrap();
    assert_eq!(can.tx(&frame).unwrap_err().kind(), ErrorKind::InvalidParameter);

    can.set_pins(10, 11).unwrap();
    handle.set_can_ack(false);
    handle.set_can_loopback(false);
    assert!(!can.tx(&frame).unwrap().acked);
    assert_eq!(can.rx().unwrap(), CanRx::NoFrame);

    assert_eq!(can.set_rate(2_000_000.0).unwrap_err().kind(), ErrorKind::InvalidParameter);
    assert_eq!(can.rate(), 500_000.0);
}
