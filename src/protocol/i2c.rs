//! I2C master engine.
//!
//! [`I2c::write_then_read`] runs both phases under one START with a
//! repeated START in between:
//!
//! ```text
//!  S addr+W [A] tx0 [A] .. txN [A]  Sr addr+R [A] rx0 A .. rxM N  P
//! ```
//!
//! A missing acknowledge ends the transfer and is reported as an
//! [`I2cNak`]: the phase it happened in and a 1-based index local to that
//! phase. Data received before the NAK is returned.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::capabilities::ParamRange;
use crate::device::Device;
use crate::error::{DaqError, Result};
use crate::pins::{ClaimSet, EngineId, PinRole};
use crate::protocol::{BitClock, Transfer};

/// Bit times per byte on the wire (8 data + acknowledge).
const BITS_PER_BYTE: u64 = 9;

/// Largest 7-bit address.
const MAX_ADDRESS: u8 = 0x7F;

/// Bit-level I2C endpoint.
pub trait I2cPort: Send {
    /// Apply the clock rate and stretching support.
    fn configure(&mut self, rate_hz: f64, clock_stretching: bool) -> Result<()>;

    /// START, or repeated START when the bus is already held.
    fn start(&mut self) -> Result<()>;

    /// STOP; releases the bus.
    fn stop(&mut self) -> Result<()>;

    /// Clock out a byte; returns whether the slave acknowledged.
    fn write_byte(&mut self, byte: u8) -> Result<bool>;

    /// Clock in a byte and answer with `ack`; `None` when no slave drove it.
    fn read_byte(&mut self, ack: bool) -> Result<Option<u8>>;
}

/// Transfer phase of a NAK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum I2cPhase {
    /// Address byte of a write
    WriteAddress,
    /// Data byte of a write
    Write,
    /// Address byte of a read
    ReadAddress,
    /// Data byte of a read
    Read,
}

/// Where a transfer was not acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct I2cNak {
    /// Phase that was not acknowledged
    pub phase: I2cPhase,
    /// 1-based position inside the phase
    pub index: usize,
}

/// Result of an I2C transfer.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct I2cOutcome {
    /// First NAK, if any
    pub nak: Option<I2cNak>,
    /// Bytes received before any NAK
    pub rx: Vec<u8>,
    /// Data bytes transferred (write plus read)
    pub transfer: Transfer,
}

impl I2cOutcome {
    /// 1-based NAK position in its phase, 0 when everything was acknowledged.
    pub fn nak_index(&self) -> usize {
        self.nak.map_or(0, |nak| nak.index)
    }

    /// No NAK occurred.
    pub fn acked(&self) -> bool {
        self.nak.is_none()
    }
}

/// I2C engine.
pub struct I2c {
    port: Box<dyn I2cPort>,
    claims: ClaimSet,
    rates: ParamRange,
    rate_hz: f64,
    clock_stretching: bool,
    port_stale: bool,
}

impl std::fmt::Debug for I2c {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("I2c")
            .field("rate_hz", &self.rate_hz)
            .field("clock_stretching", &self.clock_stretching)
            .field("claims", &self.claims)
            .finish_non_exhaustive()
    }
}

/// Budget of bit times left in a transfer.
struct Budget(u64);

impl Budget {
    fn take_byte(&mut self) -> bool {
        if self.0 < BITS_PER_BYTE {
            return false;
        }
        self.0 -= BITS_PER_BYTE;
        true
    }
}

impl I2c {
    pub(crate) fn open(device: Device) -> Result<Self> {
        Ok(Self {
            port: device.backend().open_i2c()?,
            claims: device.pins().claim_set(EngineId::I2c),
            rates: device.capabilities().protocols.i2c_rate,
            rate_hz: 100_000.0,
            clock_stretching: true,
            port_stale: true,
        })
    }

    /// Clock rate in Hz.
    pub fn rate(&self) -> f64 {
        self.rate_hz
    }

    /// Set the clock rate.
    pub fn set_rate(&mut self, hz: f64) -> Result<()> {
        self.rate_hz = self.rates.snap("I2C rate", hz)?;
        self.port_stale = true;
        Ok(())
    }

    /// Whether the master waits for stretched clocks.
    pub fn clock_stretching(&self) -> bool {
        self.clock_stretching
    }

    /// Allow slaves to hold SCL low.
    pub fn set_clock_stretching(&mut self, enabled: bool) {
        self.clock_stretching = enabled;
        self.port_stale = true;
    }

    /// Claim the SCL and SDA pins.
    pub fn set_pins(&mut self, scl: u8, sda: u8) -> Result<()> {
        self.claims
            .replace(&[(scl, PinRole::I2cScl), (sda, PinRole::I2cSda)])?;
        debug!(scl, sda, "I2C pins assigned");
        Ok(())
    }

    /// Pins held by the engine.
    pub fn claims(&self) -> &ClaimSet {
        &self.claims
    }

    /// Release the pins and restore defaults.
    pub fn reset(&mut self) {
        self.claims.clear();
        self.rate_hz = 100_000.0;
        self.clock_stretching = true;
        self.port_stale = true;
    }

    fn prepare(&mut self, address: u8) -> Result<()> {
        if self.claims.pin_for(PinRole::I2cScl).is_none() {
            return Err(DaqError::invalid("pin", "no I2C pins assigned"));
        }
        if address > MAX_ADDRESS {
            return Err(DaqError::invalid(
                "address",
                format!("{address:#04x} is not a 7-bit address"),
            ));
        }
        if self.port_stale {
            self.port.configure(self.rate_hz, self.clock_stretching)?;
            self.port_stale = false;
        }
        Ok(())
    }

    /// Write `tx`, then read `rx_count` bytes after a repeated START.
    pub fn write_then_read(
        &mut self,
        address: u8,
        tx: &[u8],
        rx_count: usize,
        timeout: Option<Duration>,
    ) -> Result<I2cOutcome> {
        self.prepare(address)?;
        let mut budget = Budget(BitClock::new(self.rate_hz).bits_within(timeout));
        let mut outcome = I2cOutcome {
            transfer: Transfer::new(0, tx.len() + rx_count),
            ..Default::default()
        };

        // STOP goes out even when a phase failed so the bus is released
        let phases = self.run_phases(address, tx, rx_count, &mut budget, &mut outcome);
        let stopped = self.port.stop();
        if let Err(err) = phases {
            warn!(address, error = %err, "I2C transfer failed");
            return Err(err);
        }
        stopped?;

        if let Some(nak) = outcome.nak {
            debug!(address, phase = ?nak.phase, index = nak.index, "I2C NAK");
        } else if outcome.transfer.timed_out() {
            warn!(
                address,
                completed = outcome.transfer.completed,
                requested = outcome.transfer.requested,
                "I2C transfer timed out"
            );
        }
        Ok(outcome)
    }

    fn run_phases(
        &mut self,
        address: u8,
        tx: &[u8],
        rx_count: usize,
        budget: &mut Budget,
        outcome: &mut I2cOutcome,
    ) -> Result<()> {
        if !tx.is_empty() || rx_count == 0 {
            self.port.start()?;
            if !budget.take_byte() {
                return Ok(());
            }
            if !self.port.write_byte(address << 1)? {
                outcome.nak = Some(I2cNak {
                    phase: I2cPhase::WriteAddress,
                    index: 1,
                });
                return Ok(());
            }
            for (i, byte) in tx.iter().enumerate() {
                if !budget.take_byte() {
                    return Ok(());
                }
                if !self.port.write_byte(*byte)? {
                    outcome.nak = Some(I2cNak {
                        phase: I2cPhase::Write,
                        index: i + 1,
                    });
                    return Ok(());
                }
                outcome.transfer.completed += 1;
            }
        }

        if rx_count == 0 {
            return Ok(());
        }
        self.port.start()?;
        if !budget.take_byte() {
            return Ok(());
        }
        if !self.port.write_byte((address << 1) | 1)? {
            outcome.nak = Some(I2cNak {
                phase: I2cPhase::ReadAddress,
                index: 1,
            });
            return Ok(());
        }
        for i in 0..rx_count {
            if !budget.take_byte() {
                return Ok(());
            }
            let last = i + 1 == rx_count;
            match self.port.read_byte(!last)? {
                Some(byte) => {
                    outcome.rx.push(byte);
                    outcome.transfer.completed += 1;
                }
                None => {
                    outcome.nak = Some(I2cNak {
                        phase: I2cPhase::Read,
                        index: i + 1,
                    });
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Write-only transfer.
    pub fn write(&mut self, address: u8, tx: &[u8], timeout: Option<Duration>) -> Result<I2cOutcome> {
        self.write_then_read(address, tx, 0, timeout)
    }

    /// Read-only transfer.
    pub fn read(&mut self, address: u8, count: usize, timeout: Option<Duration>) -> Result<I2cOutcome> {
        self.write_then_read(address, &[], count, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nak_index_zero_when_acked() {
        let outcome = I2cOutcome::default();
        assert_eq!(outcome.nak_index(), 0);
        assert!(outcome.acked());
    }

    #[test]
    fn test_budget_counts_bytes() {
        let mut budget = Budget(20);
        assert!(budget.take_byte());
        assert!(budget.take_byte());
        assert!(!budget.take_byte());
    }
}
