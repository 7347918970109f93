//! Simulated bus endpoints: GPIO loopback, UART and CAN loopback with
//! injection, an SPI echo slave and register-file I2C slaves.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use super::SimState;
use crate::error::Result;
use crate::gpio::GpioPort;
use crate::protocol::can::CanPort;
use crate::protocol::i2c::I2cPort;
use crate::protocol::spi::{ChipSelect, SpiConfig, SpiDirection, SpiFrame, SpiPort};
use crate::protocol::uart::{UartConfig, UartPort};

#[derive(Debug, Default)]
pub(crate) struct GpioState {
    pub enable: u32,
    pub output: u32,
    /// Levels driven from outside on undriven pins
    pub external: u32,
}

#[derive(Debug)]
pub(crate) struct UartState {
    pub config: UartConfig,
    pub loopback: bool,
    pub tx_log: Vec<Vec<bool>>,
    pub rx: VecDeque<Vec<bool>>,
}

impl Default for UartState {
    fn default() -> Self {
        Self {
            config: UartConfig::default(),
            loopback: true,
            tx_log: Vec::new(),
            rx: VecDeque::new(),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct SpiState {
    pub config: SpiConfig,
    pub chip_select: Option<ChipSelect>,
    pub log: Vec<SpiFrame>,
    /// Words the slave answers with before falling back to echo
    pub responses: VecDeque<u32>,
}

/// A simulated I2C slave with a 256-byte register file.
///
/// The first byte of a write sets the register pointer; further bytes are
/// stored at the pointer, which increments after every access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct I2cSlave {
    /// 7-bit address
    pub address: u8,
    /// Register file
    pub memory: Vec<u8>,
    /// Register pointer
    pub pointer: u8,
    /// Stop driving SDA after this many bytes of a read phase
    pub nak_read_after: Option<usize>,
    /// Stop acknowledging after this many data bytes of a write phase
    pub nak_write_after: Option<usize>,
    /// Holds SCL low; reads return 0xFF if the master does not wait
    pub stretches: bool,
}

impl I2cSlave {
    /// Slave at `address` with zeroed memory.
    pub fn new(address: u8) -> Self {
        Self {
            address,
            memory: vec![0; 256],
            pointer: 0,
            nak_read_after: None,
            nak_write_after: None,
            stretches: false,
        }
    }

    /// Preload `bytes` at `start`, wrapping at the end of memory.
    pub fn with_memory(mut self, start: u8, bytes: &[u8]) -> Self {
        for (i, byte) in bytes.iter().enumerate() {
            let at = (usize::from(start) + i) % self.memory.len();
            self.memory[at] = *byte;
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum I2cPhase {
    Idle,
    Address,
    Write { slave: usize, count: usize },
    Read { slave: usize, count: usize },
}

#[derive(Debug)]
pub(crate) struct I2cState {
    pub rate_hz: f64,
    pub clock_stretching: bool,
    pub slaves: Vec<I2cSlave>,
    phase: I2cPhase,
}

impl I2cState {
    /// Whether a START was issued without a matching STOP.
    pub fn is_held(&self) -> bool {
        self.phase != I2cPhase::Idle
    }
}

impl Default for I2cState {
    fn default() -> Self {
        Self {
            rate_hz: 100_000.0,
            clock_stretching: true,
            slaves: Vec::new(),
            phase: I2cPhase::Idle,
        }
    }
}

#[derive(Debug)]
pub(crate) struct CanState {
    pub rate_hz: f64,
    pub acked: bool,
    pub loopback: bool,
    /// Bit index flipped in the next looped-back frame
    pub flip_next: Option<usize>,
    pub tx_log: Vec<Vec<bool>>,
    pub rx: VecDeque<Vec<bool>>,
}

impl Default for CanState {
    fn default() -> Self {
        Self {
            rate_hz: 500_000.0,
            acked: true,
            loopback: true,
            flip_next: None,
            tx_log: Vec::new(),
            rx: VecDeque::new(),
        }
    }
}

pub(crate) struct SimGpio(pub Arc<Mutex<SimState>>);

impl GpioPort for SimGpio {
    fn set_output_enable(&mut self, mask: u32) -> Result<()> {
        self.0.lock().gpio.enable = mask;
        Ok(())
    }

    fn set_output(&mut self, value: u32) -> Result<()> {
        self.0.lock().gpio.output = value;
        Ok(())
    }

    fn read_input(&mut self) -> Result<u32> {
        let state = self.0.lock();
        let gpio = &state.gpio;
        Ok((gpio.output & gpio.enable) | (gpio.external & !gpio.enable))
    }
}

pub(crate) struct SimUart(pub Arc<Mutex<SimState>>);

impl UartPort for SimUart {
    fn configure(&mut self, config: &UartConfig) -> Result<()> {
        self.0.lock().uart.config = *config;
        Ok(())
    }

    fn write_frames(&mut self, frames: &[Vec<bool>]) -> Result<()> {
        let mut state = self.0.lock();
        let uart = &mut state.uart;
        uart.tx_log.extend(frames.iter().cloned());
        if uart.loopback {
            uart.rx.extend(frames.iter().cloned());
        }
        Ok(())
    }

    fn read_frames(&mut self, max: usize) -> Result<Vec<Vec<bool>>> {
        let mut state = self.0.lock();
        let rx = &mut state.uart.rx;
        let count = max.min(rx.len());
        Ok(rx.drain(..count).collect())
    }
}

pub(crate) struct SimSpi(pub Arc<Mutex<SimState>>);

impl SpiPort for SimSpi {
    fn configure(&mut self, config: &SpiConfig) -> Result<()> {
        self.0.lock().spi.config = *config;
        Ok(())
    }

    fn set_chip_select(&mut self, level: ChipSelect) -> Result<()> {
        self.0.lock().spi.chip_select = Some(level);
        Ok(())
    }

    fn shift(&mut self, frame: &SpiFrame) -> Result<Vec<u8>> {
        let mut state = self.0.lock();
        let spi = &mut state.spi;
        spi.log.push(frame.clone());
        if frame.direction == SpiDirection::Write {
            return Ok(Vec::new());
        }

        let per_word = spi.config.clocks_per_word().max(1);
        let words = frame.symbols.len() / per_word;
        let sent = spi.config.from_symbols(&frame.symbols);
        let reply: Vec<u32> = (0..words)
            .map(|i| {
                spi.responses
                    .pop_front()
                    .unwrap_or_else(|| sent.get(i).copied().unwrap_or(0))
            })
            .collect();
        Ok(spi.config.to_symbols(&reply))
    }
}

pub(crate) struct SimI2c(pub Arc<Mutex<SimState>>);

impl I2cPort for SimI2c {
    fn configure(&mut self, rate_hz: f64, clock_stretching: bool) -> Result<()> {
        let mut state = self.0.lock();
        state.i2c.rate_hz = rate_hz;
        state.i2c.clock_stretching = clock_stretching;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.0.lock().i2c.phase = I2cPhase::Address;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.0.lock().i2c.phase = I2cPhase::Idle;
        Ok(())
    }

    fn write_byte(&mut self, byte: u8) -> Result<bool> {
        let mut state = self.0.lock();
        state.take_failure()?;
        let i2c = &mut state.i2c;
        match i2c.phase {
            I2cPhase::Idle | I2cPhase::Read { .. } => Ok(false),
            I2cPhase::Address => {
                let address = byte >> 1;
                let Some(slave) = i2c.slaves.iter().position(|s| s.address == address) else {
                    i2c.phase = I2cPhase::Idle;
                    return Ok(false);
                };
                i2c.phase = if byte & 1 == 1 {
                    I2cPhase::Read { slave, count: 0 }
                } else {
                    I2cPhase::Write { slave, count: 0 }
                };
                Ok(true)
            }
            I2cPhase::Write { slave, count } => {
                let device = &mut i2c.slaves[slave];
                if device.nak_write_after.is_some_and(|n| count >= n) {
                    return Ok(false);
                }
                if count == 0 {
                    device.pointer = byte;
                } else {
                    let at = usize::from(device.pointer) % device.memory.len();
                    device.memory[at] = byte;
                    device.pointer = device.pointer.wrapping_add(1);
                }
                i2c.phase = I2cPhase::Write {
                    slave,
                    count: count + 1,
                };
                Ok(true)
            }
        }
    }

    fn read_byte(&mut self, _ack: bool) -> Result<Option<u8>> {
        let mut state = self.0.lock();
        state.take_failure()?;
        let i2c = &mut state.i2c;
        let I2cPhase::Read { slave, count } = i2c.phase else {
            return Ok(None);
        };
        let stretching_ignored = !i2c.clock_stretching;
        let device = &mut i2c.slaves[slave];
        if device.nak_read_after.is_some_and(|n| count >= n) {
            return Ok(None);
        }
        i2c.phase = I2cPhase::Read {
            slave,
            count: count + 1,
        };
        if device.stretches && stretching_ignored {
            // master samples before the slave releases SCL
            return Ok(Some(0xFF));
        }
        let at = usize::from(device.pointer) % device.memory.len();
        let byte = device.memory[at];
        device.pointer = device.pointer.wrapping_add(1);
        Ok(Some(byte))
    }
}

pub(crate) struct SimCan(pub Arc<Mutex<SimState>>);

impl CanPort for SimCan {
    fn configure(&mut self, rate_hz: f64) -> Result<()> {
        self.0.lock().can.rate_hz = rate_hz;
        Ok(())
    }

    fn transmit(&mut self, bits: &[bool]) -> Result<bool> {
        let mut state = self.0.lock();
        let can = &mut state.can;
        can.tx_log.push(bits.to_vec());
        if can.loopback {
            let mut looped = bits.to_vec();
            if let Some(index) = can.flip_next.take() {
                if let Some(bit) = looped.get_mut(index) {
                    *bit = !*bit;
                }
            }
            can.rx.push_back(looped);
        }
        Ok(can.acked)
    }

    fn receive(&mut self) -> Result<Option<Vec<bool>>> {
        Ok(self.0.lock().can.rx.pop_front())
    }
}
