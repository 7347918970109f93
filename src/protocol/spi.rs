//! SPI master engine.
//!
//! Words of 1 to 32 bits are serialized into *symbols*: the bits clocked on
//! one SCLK edge. In single-line mode a symbol is one bit per direction and
//! the transfer is full duplex; dual and quad modes carry 2 or 4 bits per
//! clock on bidirectional lines and run a write phase followed by a read
//! phase. Chip select is driven by the caller.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::capabilities::ParamRange;
use crate::device::Device;
use crate::error::{DaqError, Result};
use crate::pins::{ClaimSet, EngineId, PinRole};
use crate::protocol::{BitClock, Transfer};

/// Clock polarity and phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpiMode {
    /// CPOL 0, CPHA 0
    #[default]
    Mode0,
    /// CPOL 0, CPHA 1
    Mode1,
    /// CPOL 1, CPHA 0
    Mode2,
    /// CPOL 1, CPHA 1
    Mode3,
}

impl SpiMode {
    /// Clock idles high.
    pub fn cpol(&self) -> bool {
        matches!(self, Self::Mode2 | Self::Mode3)
    }

    /// Data sampled on the second edge.
    pub fn cpha(&self) -> bool {
        matches!(self, Self::Mode1 | Self::Mode3)
    }
}

/// Bit order of a word on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BitOrder {
    /// Most significant bit first
    #[default]
    MsbFirst,
    /// Least significant bit first
    LsbFirst,
}

/// Number of data lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataLines {
    /// Standard SPI, one line per direction
    #[default]
    Single,
    /// Two bidirectional lines
    Dual,
    /// Four bidirectional lines
    Quad,
}

impl DataLines {
    /// Bits per clock.
    pub fn width(&self) -> u8 {
        match self {
            Self::Single => 1,
            Self::Dual => 2,
            Self::Quad => 4,
        }
    }
}

/// Chip select drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChipSelect {
    /// Asserted
    Low,
    /// Deasserted
    High,
    /// Released
    HighZ,
}

/// Word format and clocking of the SPI engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpiConfig {
    /// Clock rate in Hz
    pub rate_hz: f64,
    /// Clock polarity and phase
    pub mode: SpiMode,
    /// Bit order of each word
    pub order: BitOrder,
    /// Bits per word, 1..=32
    pub word_bits: u8,
    /// Data line width
    pub lines: DataLines,
}

impl Default for SpiConfig {
    fn default() -> Self {
        Self {
            rate_hz: 1_000_000.0,
            mode: SpiMode::Mode0,
            order: BitOrder::MsbFirst,
            word_bits: 8,
            lines: DataLines::Single,
        }
    }
}

impl SpiConfig {
    fn word_mask(&self) -> u32 {
        if self.word_bits >= 32 {
            u32::MAX
        } else {
            (1u32 << self.word_bits) - 1
        }
    }

    /// Clocks per word.
    pub fn clocks_per_word(&self) -> usize {
        usize::from(self.word_bits / self.lines.width())
    }

    /// Split words into per-clock symbols.
    pub fn to_symbols(&self, words: &[u32]) -> Vec<u8> {
        let width = u32::from(self.lines.width());
        let bits = u32::from(self.word_bits);
        let mut symbols = Vec::with_capacity(words.len() * self.clocks_per_word());
        for word in words {
            let mut symbol = 0u8;
            for k in 0..bits {
                let bit = match self.order {
                    BitOrder::MsbFirst => (word >> (bits - 1 - k)) & 1,
                    BitOrder::LsbFirst => (word >> k) & 1,
                };
                symbol = (symbol << 1) | bit as u8;
                if (k + 1) % width == 0 {
                    symbols.push(symbol);
                    symbol = 0;
                }
            }
        }
        symbols
    }

    /// Reassemble words from symbols; a trailing partial word is dropped.
    pub fn from_symbols(&self, symbols: &[u8]) -> Vec<u32> {
        let width = u32::from(self.lines.width());
        let bits = u32::from(self.word_bits);
        symbols
            .chunks_exact(self.clocks_per_word().max(1))
            .map(|chunk| {
                let mut word = 0u32;
                let mut k = 0u32;
                for symbol in chunk {
                    for j in (0..width).rev() {
                        let bit = u32::from((symbol >> j) & 1);
                        match self.order {
                            BitOrder::MsbFirst => word |= bit << (bits - 1 - k),
                            BitOrder::LsbFirst => word |= bit << k,
                        }
                        k += 1;
                    }
                }
                word
            })
            .collect()
    }
}

/// Direction of one shift operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpiDirection {
    /// Drive and sample on every clock (single line)
    Duplex,
    /// Drive only
    Write,
    /// Sample only
    Read,
}

/// One burst of clocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpiFrame {
    /// Clocking of the burst
    pub mode: SpiMode,
    /// Lines used
    pub lines: DataLines,
    /// Drive or sample
    pub direction: SpiDirection,
    /// Driven symbols; for reads only the length matters
    pub symbols: Vec<u8>,
}

/// Bit-level SPI endpoint.
pub trait SpiPort: Send {
    /// Apply rate, mode and line width.
    fn configure(&mut self, config: &SpiConfig) -> Result<()>;

    /// Drive the chip select line.
    fn set_chip_select(&mut self, level: ChipSelect) -> Result<()>;

    /// Clock a frame; returns the sampled symbols (empty for writes).
    fn shift(&mut self, frame: &SpiFrame) -> Result<Vec<u8>>;
}

/// Pin assignment of the SPI engine.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SpiPins {
    /// Clock pin
    pub clk: u8,
    /// DQ0 (MOSI), DQ1 (MISO), DQ2, DQ3
    pub dq: Vec<u8>,
    /// Chip select pin, if driven by the engine
    pub cs: Option<u8>,
}

/// Outcome of a combined write/read.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SpiTransfer {
    /// Received words
    pub rx: Vec<u32>,
    /// Words clocked (write plus read phase in dual/quad mode)
    pub transfer: Transfer,
}

/// SPI engine.
pub struct Spi {
    port: Box<dyn SpiPort>,
    claims: ClaimSet,
    rates: ParamRange,
    config: SpiConfig,
    dq_lines: usize,
    port_stale: bool,
}

impl std::fmt::Debug for Spi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Spi")
            .field("config", &self.config)
            .field("claims", &self.claims)
            .finish_non_exhaustive()
    }
}

impl Spi {
    pub(crate) fn open(device: Device) -> Result<Self> {
        Ok(Self {
            port: device.backend().open_spi()?,
            claims: device.pins().claim_set(EngineId::Spi),
            rates: device.capabilities().protocols.spi_rate,
            config: SpiConfig::default(),
            dq_lines: 0,
            port_stale: true,
        })
    }

    /// Current word format.
    pub fn config(&self) -> &SpiConfig {
        &self.config
    }

    /// Set the clock rate.
    pub fn set_rate(&mut self, hz: f64) -> Result<()> {
        self.config.rate_hz = self.rates.snap("SPI rate", hz)?;
        self.port_stale = true;
        Ok(())
    }

    /// Set clock polarity and phase.
    pub fn set_mode(&mut self, mode: SpiMode) {
        self.config.mode = mode;
        self.port_stale = true;
    }

    /// Set the bit order.
    pub fn set_bit_order(&mut self, order: BitOrder) {
        self.config.order = order;
        self.port_stale = true;
    }

    /// Set bits per word.
    pub fn set_word_bits(&mut self, bits: u8) -> Result<()> {
        if !(1..=32).contains(&bits) {
            return Err(DaqError::invalid("word bits", format!("{bits} outside 1..=32")));
        }
        self.config.word_bits = bits;
        self.port_stale = true;
        Ok(())
    }

    /// Set the data line width.
    pub fn set_lines(&mut self, lines: DataLines) {
        self.config.lines = lines;
        self.port_stale = true;
    }

    /// Claim clock, data and chip-select pins.
    pub fn set_pins(&mut self, pins: &SpiPins) -> Result<()> {
        if pins.dq.is_empty() || pins.dq.len() > 4 {
            return Err(DaqError::invalid(
                "pins",
                format!("{} data lines outside 1..=4", pins.dq.len()),
            ));
        }
        let mut request = vec![(pins.clk, PinRole::SpiClk)];
        request.extend(pins.dq.iter().zip(0u8..).map(|(pin, i)| (*pin, PinRole::SpiDq(i))));
        request.extend(pins.cs.map(|pin| (pin, PinRole::SpiCs)));
        self.claims.replace(&request)?;
        self.dq_lines = pins.dq.len();
        debug!(clk = pins.clk, dq = ?pins.dq, cs = ?pins.cs, "SPI pins assigned");
        Ok(())
    }

    /// Pins held by the engine.
    pub fn claims(&self) -> &ClaimSet {
        &self.claims
    }

    /// Release the pins and restore defaults.
    pub fn reset(&mut self) {
        self.claims.clear();
        self.dq_lines = 0;
        self.config = SpiConfig::default();
        self.port_stale = true;
    }

    /// Drive chip select.
    pub fn chip_select(&mut self, level: ChipSelect) -> Result<()> {
        if self.claims.pin_for(PinRole::SpiCs).is_none() {
            return Err(DaqError::invalid("pin", "no chip select pin assigned"));
        }
        self.port.set_chip_select(level)
    }

    fn prepare(&mut self, tx: &[u32]) -> Result<()> {
        if self.claims.pin_for(PinRole::SpiClk).is_none() {
            return Err(DaqError::invalid("pin", "no SPI pins assigned"));
        }
        let width = usize::from(self.config.lines.width());
        if self.dq_lines < width.max(1) {
            return Err(DaqError::invalid(
                "lines",
                format!("{:?} needs {width} data pins, {} assigned", self.config.lines, self.dq_lines),
            ));
        }
        if self.config.word_bits % self.config.lines.width() != 0 {
            return Err(DaqError::invalid(
                "word bits",
                format!(
                    "{} bits do not split into {}-bit symbols",
                    self.config.word_bits,
                    self.config.lines.width()
                ),
            ));
        }
        let mask = self.config.word_mask();
        if let Some(word) = tx.iter().find(|w| **w & !mask != 0) {
            return Err(DaqError::invalid(
                "data",
                format!("{word:#x} does not fit {} bits", self.config.word_bits),
            ));
        }
        if self.port_stale {
            self.port.configure(&self.config)?;
            self.port_stale = false;
        }
        Ok(())
    }

    fn shift(&mut self, direction: SpiDirection, words: &[u32]) -> Result<Vec<u32>> {
        if words.is_empty() {
            return Ok(Vec::new());
        }
        let frame = SpiFrame {
            mode: self.config.mode,
            lines: self.config.lines,
            direction,
            symbols: self.config.to_symbols(words),
        };
        let sampled = self.port.shift(&frame)?;
        Ok(self.config.from_symbols(&sampled))
    }

    /// Write `tx` and read `rx_count` words.
    ///
    /// Single-line transfers are full duplex over `max(tx, rx_count)` words
    /// (missing TX words are sent as zero); dual and quad run the write
    /// phase first. A timeout truncates at a word boundary.
    pub fn write_read(
        &mut self,
        tx: &[u32],
        rx_count: usize,
        timeout: Option<Duration>,
    ) -> Result<SpiTransfer> {
        self.prepare(tx)?;
        let clock = BitClock::new(self.config.rate_hz);
        let per_word = self.config.clocks_per_word().max(1) as u64;
        let budget = usize::try_from(clock.bits_within(timeout) / per_word).unwrap_or(usize::MAX);

        let outcome = if self.config.lines == DataLines::Single {
            let requested = tx.len().max(rx_count);
            let count = requested.min(budget);
            let mut words = tx.to_vec();
            words.resize(requested, 0);
            words.truncate(count);
            let mut rx = self.shift(SpiDirection::Duplex, &words)?;
            rx.truncate(rx_count);
            SpiTransfer {
                rx,
                transfer: Transfer::new(count, requested),
            }
        } else {
            let write = tx.len().min(budget);
            self.shift(SpiDirection::Write, &tx[..write])?;
            let read = rx_count.min(budget - write);
            let rx = self.shift(SpiDirection::Read, &vec![0; read])?;
            SpiTransfer {
                rx,
                transfer: Transfer::new(write + read, tx.len() + rx_count),
            }
        };

        if outcome.transfer.timed_out() {
            warn!(
                completed = outcome.transfer.completed,
                requested = outcome.transfer.requested,
                "SPI transfer timed out"
            );
        } else {
            debug!(tx = tx.len(), rx = outcome.rx.len(), lines = ?self.config.lines, "SPI transfer");
        }
        Ok(outcome)
    }

    /// Write-only transfer.
    pub fn write(&mut self, tx: &[u32], timeout: Option<Duration>) -> Result<Transfer> {
        Ok(self.write_read(tx, 0, timeout)?.transfer)
    }

    /// Read-only transfer.
    pub fn read(&mut self, count: usize, timeout: Option<Duration>) -> Result<SpiTransfer> {
        self.write_read(&[], count, timeout)
    }
}
