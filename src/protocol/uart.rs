//! UART engine.
//!
//! Frames are line-level bit vectors, start bit first:
//!
//! ```text
//!  idle ─┐   ┌─d0─┬─d1─┬ ... ┬─dN─┬─P─┬─stop(s)─ idle
//!        └───┘    (LSB first)       (opt)
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::capabilities::ParamRange;
use crate::device::Device;
use crate::error::{DaqError, Result};
use crate::pins::{ClaimSet, EngineId, PinRole};
use crate::protocol::{BitClock, Transfer};

/// Parity bit mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    /// No parity bit
    #[default]
    None,
    /// Odd number of ones
    Odd,
    /// Even number of ones
    Even,
    /// Always 1
    Mark,
    /// Always 0
    Space,
}

/// Stop bits per frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopBits {
    /// One stop bit
    #[default]
    One,
    /// Two stop bits
    Two,
}

impl StopBits {
    fn count(&self) -> usize {
        match self {
            Self::One => 1,
            Self::Two => 2,
        }
    }
}

/// Line format of the UART.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UartConfig {
    /// Bit rate in Hz
    pub rate_hz: f64,
    /// Data bits per frame, 5..=9
    pub data_bits: u8,
    /// Parity mode
    pub parity: Parity,
    /// Stop bits
    pub stop_bits: StopBits,
}

impl Default for UartConfig {
    fn default() -> Self {
        Self {
            rate_hz: 9600.0,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: StopBits::One,
        }
    }
}

/// One decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UartFrame {
    /// Data bits, LSB first on the wire
    pub data: u16,
    /// Parity bit did not match
    pub parity_error: bool,
    /// Start or stop bit had the wrong level
    pub framing_error: bool,
}

impl UartConfig {
    /// Bits on the wire per frame.
    pub fn frame_bits(&self) -> usize {
        let parity = usize::from(self.parity != Parity::None);
        1 + usize::from(self.data_bits) + parity + self.stop_bits.count()
    }

    fn parity_bit(&self, data: u16) -> Option<bool> {
        let odd_ones = data.count_ones() % 2 == 1;
        match self.parity {
            Parity::None => None,
            Parity::Odd => Some(!odd_ones),
            Parity::Even => Some(odd_ones),
            Parity::Mark => Some(true),
            Parity::Space => Some(false),
        }
    }

    fn data_mask(&self) -> u16 {
        ((1u32 << self.data_bits) - 1) as u16
    }

    /// Line bits of one frame.
    pub fn encode(&self, data: u16) -> Vec<bool> {
        let mut bits = Vec::with_capacity(self.frame_bits());
        bits.push(false);
        bits.extend((0..self.data_bits).map(|i| (data >> i) & 1 == 1));
        bits.extend(self.parity_bit(data & self.data_mask()));
        bits.extend(std::iter::repeat(true).take(self.stop_bits.count()));
        bits
    }

    /// Decode one frame; a short frame is a framing error.
    pub fn decode(&self, bits: &[bool]) -> UartFrame {
        let data_bits = usize::from(self.data_bits);
        let data = bits
            .iter()
            .skip(1)
            .take(data_bits)
            .enumerate()
            .fold(0u16, |acc, (i, bit)| acc | (u16::from(*bit) << i));

        let mut framing_error = bits.len() < self.frame_bits() || bits.first() != Some(&false);
        let mut parity_error = false;
        let mut pos = 1 + data_bits;
        if let Some(expected) = self.parity_bit(data) {
            parity_error = bits.get(pos) != Some(&expected);
            pos += 1;
        }
        for i in 0..self.stop_bits.count() {
            if bits.get(pos + i) != Some(&true) {
                framing_error = true;
            }
        }
        UartFrame {
            data,
            parity_error,
            framing_error,
        }
    }
}

/// Bit-level UART endpoint.
pub trait UartPort: Send {
    /// Apply the line format.
    fn configure(&mut self, config: &UartConfig) -> Result<()>;

    /// Clock frames out on TX.
    fn write_frames(&mut self, frames: &[Vec<bool>]) -> Result<()>;

    /// Take up to `max` received frames; never blocks.
    fn read_frames(&mut self, max: usize) -> Result<Vec<Vec<bool>>>;
}

/// Result of a receive call.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UartRx {
    /// Received words in arrival order
    pub data: Vec<u16>,
    /// Any frame of this call had a parity mismatch
    pub parity_error: bool,
    /// Any frame of this call had a bad start or stop bit
    pub framing_error: bool,
}

impl UartRx {
    /// Received data truncated to bytes.
    pub fn bytes(&self) -> Vec<u8> {
        self.data.iter().map(|w| (*w & 0xFF) as u8).collect()
    }
}

/// UART engine.
pub struct Uart {
    port: Box<dyn UartPort>,
    claims: ClaimSet,
    rates: ParamRange,
    config: UartConfig,
    port_stale: bool,
}

impl std::fmt::Debug for Uart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uart")
            .field("config", &self.config)
            .field("claims", &self.claims)
            .finish_non_exhaustive()
    }
}

impl Uart {
    pub(crate) fn open(device: Device) -> Result<Self> {
        Ok(Self {
            port: device.backend().open_uart()?,
            claims: device.pins().claim_set(EngineId::Uart),
            rates: device.capabilities().protocols.uart_rate,
            config: UartConfig::default(),
            port_stale: true,
        })
    }

    /// Current line format.
    pub fn config(&self) -> &UartConfig {
        &self.config
    }

    /// Set the bit rate.
    pub fn set_rate(&mut self, hz: f64) -> Result<()> {
        self.config.rate_hz = self.rates.snap("UART rate", hz)?;
        self.port_stale = true;
        Ok(())
    }

    /// Set data bits per frame.
    pub fn set_data_bits(&mut self, bits: u8) -> Result<()> {
        if !(5..=9).contains(&bits) {
            return Err(DaqError::invalid("data bits", format!("{bits} outside 5..=9")));
        }
        self.config.data_bits = bits;
        self.port_stale = true;
        Ok(())
    }

    /// Set the parity mode.
    pub fn set_parity(&mut self, parity: Parity) {
        self.config.parity = parity;
        self.port_stale = true;
    }

    /// Set the number of stop bits.
    pub fn set_stop_bits(&mut self, stop_bits: StopBits) {
        self.config.stop_bits = stop_bits;
        self.port_stale = true;
    }

    /// Assign TX and RX pins; `None` leaves that direction unused.
    pub fn set_pins(&mut self, tx: Option<u8>, rx: Option<u8>) -> Result<()> {
        let request: Vec<(u8, PinRole)> = tx
            .map(|p| (p, PinRole::UartTx))
            .into_iter()
            .chain(rx.map(|p| (p, PinRole::UartRx)))
            .collect();
        self.claims.replace(&request)?;
        debug!(tx = ?tx, rx = ?rx, "UART pins assigned");
        Ok(())
    }

    /// Pins held by the engine.
    pub fn claims(&self) -> &ClaimSet {
        &self.claims
    }

    /// Release the pins and restore the default line format.
    pub fn reset(&mut self) {
        self.claims.clear();
        self.config = UartConfig::default();
        self.port_stale = true;
    }

    fn require_pin(&self, role: PinRole) -> Result<()> {
        match self.claims.pin_for(role) {
            Some(_) => Ok(()),
            None => Err(DaqError::invalid("pin", format!("no {role} pin assigned"))),
        }
    }

    fn sync_port(&mut self) -> Result<()> {
        if self.port_stale {
            self.port.configure(&self.config)?;
            self.port_stale = false;
        }
        Ok(())
    }

    /// Transmit bytes.
    pub fn tx(&mut self, data: &[u8], timeout: Option<Duration>) -> Result<Transfer> {
        let words: Vec<u16> = data.iter().map(|b| u16::from(*b)).collect();
        self.tx_words(&words, timeout)
    }

    /// Transmit data words (up to 9 bits each).
    pub fn tx_words(&mut self, data: &[u16], timeout: Option<Duration>) -> Result<Transfer> {
        self.require_pin(PinRole::UartTx)?;
        let mask = self.config.data_mask();
        if let Some(word) = data.iter().find(|w| **w & !mask != 0) {
            return Err(DaqError::invalid(
                "data",
                format!("{word:#x} does not fit {} data bits", self.config.data_bits),
            ));
        }
        self.sync_port()?;

        let clock = BitClock::new(self.config.rate_hz);
        let fit = clock.bits_within(timeout) / self.config.frame_bits() as u64;
        let count = data.len().min(usize::try_from(fit).unwrap_or(usize::MAX));
        let frames: Vec<Vec<bool>> = data[..count].iter().map(|w| self.config.encode(*w)).collect();
        self.port.write_frames(&frames)?;

        let transfer = Transfer::new(count, data.len());
        if transfer.timed_out() {
            warn!(sent = count, requested = data.len(), "UART transmit timed out");
        } else {
            debug!(frames = count, "UART transmit");
        }
        Ok(transfer)
    }

    /// Take up to `max` received words; never blocks.
    pub fn rx(&mut self, max: usize) -> Result<UartRx> {
        self.require_pin(PinRole::UartRx)?;
        self.sync_port()?;
        let mut out = UartRx::default();
        for bits in self.port.read_frames(max)? {
            let frame = self.config.decode(&bits);
            out.parity_error |= frame.parity_error;
            out.framing_error |= frame.framing_error;
            out.data.push(frame.data);
        }
        if out.parity_error || out.framing_error {
            debug!(
                words = out.data.len(),
                parity_error = out.parity_error,
                framing_error = out.framing_error,
                "UART receive error"
            );
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_8n1() {
        let config = UartConfig::default();
        let bits = config.encode(0x55);
        assert_eq!(bits.len(), 10);
        assert_eq!(
            bits,
            vec![false, true, false, true, false, true, false, true, false, true]
        );
    }

    #[test]
    fn test_parity_modes() {
        let mut config = UartConfig {
            parity: Parity::Even,
            ..Default::default()
        };
        // 0x07 has three ones: even parity bit is 1
        assert!(config.encode(0x07)[9]);
        config.parity = Parity::Odd;
        assert!(!config.encode(0x07)[9]);
        config.parity = Parity::Mark;
        assert!(config.encode(0x00)[9]);
    }

    #[test]
    fn test_decode_detects_parity_and_framing() {
        let config = UartConfig {
            parity: Parity::Odd,
            stop_bits: StopBits::Two,
            ..Default::default()
        };
        let mut bits = config.encode(0xA5);
        assert_eq!(bits.len(), 12);
        let clean = config.decode(&bits);
        assert_eq!(clean.data, 0xA5);
        assert!(!clean.parity_error && !clean.framing_error);

        bits[9] = !bits[9];
        assert!(config.decode(&bits).parity_error);
        bits[9] = !bits[9];
        bits[11] = false;
        assert!(config.decode(&bits).framing_error);
    }

    #[test]
    fn test_nine_bit_words() {
        let config = UartConfig {
            data_bits: 9,
            ..Default::default()
        };
        let bits = config.encode(0x1FF);
        assert_eq!(config.decode(&bits).data, 0x1FF);
    }
}
