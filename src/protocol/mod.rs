//! Serial protocol engines over the shared digital pins.
//!
//! Each engine owns a [`ClaimSet`](crate::pins::ClaimSet) for its pins and
//! a backend port that moves bits. Transfers are synchronous. An optional
//! timeout bounds how many bit times a transfer may take; a transfer that
//! runs out of time reports how far it got in a [`Transfer`].

pub mod can;
pub mod i2c;
pub mod spi;
pub mod uart;

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bit timing of a protocol engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BitClock {
    /// Bits per second
    pub rate_hz: f64,
}

impl BitClock {
    /// Clock at `rate_hz` bits per second.
    pub fn new(rate_hz: f64) -> Self {
        Self { rate_hz }
    }

    /// Time needed to clock `bits` bits.
    pub fn duration_of(&self, bits: u64) -> Duration {
        Duration::from_secs_f64(bits as f64 / self.rate_hz)
    }

    /// Bits that fit in `timeout` (unbounded without one).
    pub fn bits_within(&self, timeout: Option<Duration>) -> u64 {
        match timeout {
            None => u64::MAX,
            // float to int casts saturate
            Some(t) => (t.as_secs_f64() * self.rate_hz + 1e-9).floor() as u64,
        }
    }
}

/// Completion of a bounded transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Transfer {
    /// Units (bytes, words, frames) actually transferred
    pub completed: usize,
    /// Units requested
    pub requested: usize,
}

impl Transfer {
    /// Transfer of `completed` out of `requested` units.
    pub fn new(completed: usize, requested: usize) -> Self {
        Self {
            completed,
            requested,
        }
    }

    /// All requested units were transferred.
    pub fn is_complete(&self) -> bool {
        self.completed >= self.requested
    }

    /// Whether the timeout cut the transfer short.
    pub fn timed_out(&self) -> bool {
        !self.is_complete()
    }
}
