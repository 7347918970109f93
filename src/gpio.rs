//! Static digital I/O engine.
//!
//! Pins are claimed as [`PinRole::GpioIn`] or [`PinRole::GpioOut`] when a
//! direction is set and released when the direction is cleared, on
//! [`Gpio::reset`] or on drop.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::device::Device;
use crate::error::{DaqError, Result};
use crate::pins::{ClaimSet, EngineId, PinRole};

/// Bit-level static I/O endpoint.
pub trait GpioPort: Send {
    /// Drive the pins set in `mask`; all others float.
    fn set_output_enable(&mut self, mask: u32) -> Result<()>;

    /// Output levels for the driven pins.
    fn set_output(&mut self, value: u32) -> Result<()>;

    /// Current level of every pin.
    fn read_input(&mut self) -> Result<u32>;
}

/// Direction of a claimed pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// High impedance, sampled on read
    Input,
    /// Driven by the output register
    Output,
}

impl Direction {
    fn role(&self) -> PinRole {
        match self {
            Self::Input => PinRole::GpioIn,
            Self::Output => PinRole::GpioOut,
        }
    }
}

/// Static I/O engine.
pub struct Gpio {
    port: Box<dyn GpioPort>,
    claims: ClaimSet,
    directions: Vec<Option<Direction>>,
    output: u32,
}

impl std::fmt::Debug for Gpio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gpio")
            .field("directions", &self.directions)
            .field("output", &format_args!("{:#06x}", self.output))
            .finish_non_exhaustive()
    }
}

impl Gpio {
    pub(crate) fn open(device: Device) -> Result<Self> {
        let port = device.backend().open_gpio()?;
        let pins = usize::from(device.pins().pin_count()).min(32);
        Ok(Self {
            port,
            claims: device.pins().claim_set(EngineId::Gpio),
            directions: vec![None; pins],
            output: 0,
        })
    }

    /// Number of GPIO pins.
    pub fn pin_count(&self) -> usize {
        self.directions.len()
    }

    fn check_pin(&self, pin: u8) -> Result<usize> {
        let index = usize::from(pin);
        if index < self.directions.len() {
            Ok(index)
        } else {
            Err(DaqError::invalid(
                "pin",
                format!("pin {pin} out of range 0..{}", self.directions.len()),
            ))
        }
    }

    fn mask_of(&self, direction: Direction) -> u32 {
        self.directions
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == Some(direction))
            .fold(0, |mask, (pin, _)| mask | 1 << pin)
    }

    /// Claim a pin as input or output, or release it with `None`.
    pub fn set_direction(&mut self, pin: u8, direction: Option<Direction>) -> Result<()> {
        let index = self.check_pin(pin)?;
        let mut next = self.directions.clone();
        next[index] = direction;
        let request: Vec<(u8, PinRole)> = next
            .iter()
            .enumerate()
            .filter_map(|(p, d)| d.map(|d| (p as u8, d.role())))
            .collect();
        self.claims.replace(&request)?;
        self.directions = next;

        let enable = self.mask_of(Direction::Output);
        self.port.set_output_enable(enable)?;
        debug!(pin, direction = ?direction, output_enable = enable, "GPIO direction set");
        Ok(())
    }

    /// Configured direction, `None` for unconfigured or unknown pins.
    pub fn direction(&self, pin: u8) -> Option<Direction> {
        self.directions.get(usize::from(pin)).copied().flatten()
    }

    /// Drive one output pin.
    pub fn set_level(&mut self, pin: u8, high: bool) -> Result<()> {
        let index = self.check_pin(pin)?;
        if self.directions[index] != Some(Direction::Output) {
            return Err(DaqError::invalid(
                "pin",
                format!("pin {pin} is not configured as output"),
            ));
        }
        if high {
            self.output |= 1 << index;
        } else {
            self.output &= !(1 << index);
        }
        self.port.set_output(self.output)
    }

    /// Drive several output pins at once; bits outside `mask` keep their level.
    pub fn write(&mut self, mask: u32, value: u32) -> Result<()> {
        let outputs = self.mask_of(Direction::Output);
        if mask & !outputs != 0 {
            return Err(DaqError::invalid(
                "mask",
                format!("{:#x} includes pins not configured as output", mask & !outputs),
            ));
        }
        self.output = (self.output & !mask) | (value & mask);
        self.port.set_output(self.output)
    }

    /// Levels of every claimed pin; unclaimed bits read as zero.
    pub fn read(&mut self) -> Result<u32> {
        let claimed = self.mask_of(Direction::Input) | self.mask_of(Direction::Output);
        Ok(self.port.read_input()? & claimed)
    }

    /// Sample one pin.
    pub fn read_pin(&mut self, pin: u8) -> Result<bool> {
        let index = self.check_pin(pin)?;
        if self.directions[index].is_none() {
            return Err(DaqError::invalid("pin", format!("pin {pin} is not claimed")));
        }
        Ok(self.read()? & (1 << index) != 0)
    }

    /// Release every pin and stop driving.
    pub fn reset(&mut self) -> Result<()> {
        self.claims.clear();
        self.directions.iter_mut().for_each(|d| *d = None);
        self.output = 0;
        self.port.set_output_enable(0)?;
        self.port.set_output(0)
    }
}
