//! CAN engine with classical frame encoding.
//!
//! Frames travel as line-level bits (`false` = dominant). SOF through the
//! CRC sequence are bit-stuffed: after five equal bits the opposite bit is
//! inserted. The CRC is CRC-15 (polynomial 0x4599) over the unstuffed bits
//! from SOF to the end of the data field.
//!
//! ```text
//!  SOF | ID(11) RTR IDE r0 | DLC(4) | DATA(0..64) | CRC(15) | 1 ACK 1 | EOF(7)
//!  └───────────────────── stuffed ──────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::capabilities::ParamRange;
use crate::device::Device;
use crate::error::{DaqError, Result};
use crate::pins::{ClaimSet, EngineId, PinRole};

const CRC15_POLY: u16 = 0x4599;
const MAX_STANDARD_ID: u32 = 0x7FF;
const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;
const EOF_BITS: usize = 7;

/// A classical CAN frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanFrame {
    /// Identifier, 11 or 29 bits
    pub id: u32,
    /// 29-bit identifier
    pub extended: bool,
    /// Remote transmission request
    pub remote: bool,
    /// Data length code
    pub dlc: u8,
    /// Payload, empty for remote frames
    pub data: Vec<u8>,
}

impl CanFrame {
    /// Data frame; the DLC is the payload length.
    pub fn data(id: u32, extended: bool, data: &[u8]) -> Result<Self> {
        let frame = Self {
            id,
            extended,
            remote: false,
            dlc: u8::try_from(data.len()).unwrap_or(u8::MAX),
            data: data.to_vec(),
        };
        frame.validate()?;
        Ok(frame)
    }

    /// Remote frame requesting `dlc` bytes.
    pub fn remote(id: u32, extended: bool, dlc: u8) -> Result<Self> {
        let frame = Self {
            id,
            extended,
            remote: true,
            dlc,
            data: Vec::new(),
        };
        frame.validate()?;
        Ok(frame)
    }

    /// Payload bytes implied by the DLC.
    pub fn payload_len(&self) -> usize {
        if self.remote {
            0
        } else {
            usize::from(self.dlc.min(8))
        }
    }

    /// Check the identifier range and the DLC.
    pub fn validate(&self) -> Result<()> {
        let max_id = if self.extended {
            MAX_EXTENDED_ID
        } else {
            MAX_STANDARD_ID
        };
        if self.id > max_id {
            return Err(DaqError::invalid(
                "CAN id",
                format!("{:#x} exceeds {max_id:#x}", self.id),
            ));
        }
        if self.dlc > 15 {
            return Err(DaqError::invalid("DLC", format!("{} exceeds 15", self.dlc)));
        }
        if self.data.len() != self.payload_len() {
            return Err(DaqError::invalid(
                "CAN data",
                format!("{} bytes for DLC {}", self.data.len(), self.dlc),
            ));
        }
        Ok(())
    }

    fn fields(&self) -> Vec<bool> {
        let mut bits = Vec::with_capacity(128);
        let mut put = |value: u32, width: u32| {
            bits.extend((0..width).rev().map(|i| (value >> i) & 1 == 1));
        };
        put(0, 1);
        if self.extended {
            put(self.id >> 18, 11);
            put(1, 1); // SRR
            put(1, 1); // IDE
            put(self.id & 0x3_FFFF, 18);
            put(u32::from(self.remote), 1);
            put(0, 2);
        } else {
            put(self.id, 11);
            put(u32::from(self.remote), 1);
            put(0, 2); // IDE, r0
        }
        put(u32::from(self.dlc), 4);
        for byte in &self.data {
            put(u32::from(*byte), 8);
        }
        bits
    }

    /// Line bits of the complete frame, ACK slot recessive.
    pub fn encode(&self) -> Vec<bool> {
        let mut fields = self.fields();
        let crc = crc15(&fields);
        fields.extend((0..15).rev().map(|i| (crc >> i) & 1 == 1));

        let mut bits = stuff(&fields);
        bits.extend([true, true, true]); // CRC delimiter, ACK slot, ACK delimiter
        bits.extend(std::iter::repeat(true).take(EOF_BITS));
        bits
    }

    /// Decode line bits into a frame.
    pub fn decode(bits: &[bool]) -> std::result::Result<Self, CanError> {
        let mut reader = Destuffer::new(bits);
        if reader.read(1)? != 0 {
            return Err(CanError::Form);
        }
        let base = reader.read(11)?;
        let rtr_or_srr = reader.read(1)? == 1;
        let extended = reader.read(1)? == 1;
        let (id, remote) = if extended {
            if !rtr_or_srr {
                return Err(CanError::Form);
            }
            let low = reader.read(18)?;
            let remote = reader.read(1)? == 1;
            reader.read(2)?;
            ((base << 18) | low, remote)
        } else {
            reader.read(1)?;
            (base, rtr_or_srr)
        };
        let dlc = reader.read(4)? as u8;
        let len = if remote { 0 } else { usize::from(dlc.min(8)) };
        let mut data = Vec::with_capacity(len);
        for _ in 0..len {
            data.push(reader.read(8)? as u8);
        }
        let expected = crc15(reader.consumed());
        let received = reader.read(15)? as u16;
        reader.finish()?;
        if received != expected {
            return Err(CanError::Crc);
        }

        let tail = &bits[reader.position()..];
        let well_formed = tail.len() >= 3 + EOF_BITS
            && tail[0]
            && tail[2]
            && tail[3..3 + EOF_BITS].iter().all(|b| *b);
        if !well_formed {
            return Err(CanError::Form);
        }
        Ok(Self {
            id,
            extended,
            remote,
            dlc,
            data,
        })
    }
}

/// Receive-side frame errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
pub enum CanError {
    /// Six equal bits in a row
    #[error("bit stuffing violation")]
    Stuff,
    /// CRC field mismatch
    #[error("CRC mismatch")]
    Crc,
    /// Fixed-form field violated
    #[error("malformed frame")]
    Form,
}

fn crc15(bits: &[bool]) -> u16 {
    bits.iter().fold(0u16, |crc, bit| {
        let feedback = *bit ^ ((crc >> 14) & 1 == 1);
        let shifted = (crc << 1) & 0x7FFF;
        if feedback {
            shifted ^ CRC15_POLY
        } else {
            shifted
        }
    })
}

fn stuff(bits: &[bool]) -> Vec<bool> {
    let mut out = Vec::with_capacity(bits.len() + bits.len() / 4);
    let mut last = None;
    let mut run = 0;
    for bit in bits {
        out.push(*bit);
        if last == Some(*bit) {
            run += 1;
        } else {
            last = Some(*bit);
            run = 1;
        }
        if run == 5 {
            out.push(!*bit);
            last = Some(!*bit);
            run = 1;
        }
    }
    out
}

/// Reads unstuffed bits from a stuffed stream.
struct Destuffer<'a> {
    raw: &'a [bool],
    pos: usize,
    last: Option<bool>,
    run: usize,
    plain: Vec<bool>,
}

impl<'a> Destuffer<'a> {
    fn new(raw: &'a [bool]) -> Self {
        Self {
            raw,
            pos: 0,
            last: None,
            run: 0,
            plain: Vec::with_capacity(raw.len()),
        }
    }

    fn raw_bit(&mut self) -> std::result::Result<bool, CanError> {
        let bit = *self.raw.get(self.pos).ok_or(CanError::Form)?;
        self.pos += 1;
        Ok(bit)
    }

    /// Skip the stuff bit owed after five equal bits.
    fn finish(&mut self) -> std::result::Result<(), CanError> {
        if self.run == 5 {
            let stuff = self.raw_bit()?;
            if Some(stuff) == self.last {
                return Err(CanError::Stuff);
            }
            self.last = Some(stuff);
            self.run = 1;
        }
        Ok(())
    }

    fn bit(&mut self) -> std::result::Result<bool, CanError> {
        self.finish()?;
        let bit = self.raw_bit()?;
        if self.last == Some(bit) {
            self.run += 1;
        } else {
            self.last = Some(bit);
            self.run = 1;
        }
        self.plain.push(bit);
        Ok(bit)
    }

    fn read(&mut self, width: u32) -> std::result::Result<u32, CanError> {
        let mut value = 0;
        for _ in 0..width {
            value = (value << 1) | u32::from(self.bit()?);
        }
        Ok(value)
    }

    fn consumed(&self) -> &[bool] {
        &self.plain
    }

    fn position(&self) -> usize {
        self.pos
    }
}

/// Bit-level CAN endpoint.
pub trait CanPort: Send {
    /// Apply the bit rate.
    fn configure(&mut self, rate_hz: f64) -> Result<()>;

    /// Send a frame; returns whether any node drove the ACK slot.
    fn transmit(&mut self, bits: &[bool]) -> Result<bool>;

    /// Next received frame, if any; never blocks.
    fn receive(&mut self) -> Result<Option<Vec<bool>>>;
}

/// Result of a transmit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanTxOutcome {
    /// A node drove the ACK slot
    pub acked: bool,
}

/// Result of a receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CanRx {
    /// A valid frame
    Frame(CanFrame),
    /// Nothing pending
    NoFrame,
    /// A frame that failed to decode
    Error(CanError),
}

/// CAN engine.
pub struct Can {
    port: Box<dyn CanPort>,
    claims: ClaimSet,
    rates: ParamRange,
    rate_hz: f64,
    port_stale: bool,
}

impl std::fmt::Debug for Can {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Can")
            .field("rate_hz", &self.rate_hz)
            .field("claims", &self.claims)
            .finish_non_exhaustive()
    }
}

impl Can {
    pub(crate) fn open(device: Device) -> Result<Self> {
        Ok(Self {
            port: device.backend().open_can()?,
            claims: device.pins().claim_set(EngineId::Can),
            rates: device.capabilities().protocols.can_rate,
            rate_hz: 500_000.0,
            port_stale: true,
        })
    }

    /// Bit rate in Hz.
    pub fn rate(&self) -> f64 {
        self.rate_hz
    }

    /// Set the bit rate.
    pub fn set_rate(&mut self, hz: f64) -> Result<()> {
        self.rate_hz = self.rates.snap("CAN rate", hz)?;
        self.port_stale = true;
        Ok(())
    }

    /// Claim the TX and RX pins.
    pub fn set_pins(&mut self, tx: u8, rx: u8) -> Result<()> {
        self.claims
            .replace(&[(tx, PinRole::CanTx), (rx, PinRole::CanRx)])?;
        debug!(tx, rx, "CAN pins assigned");
        Ok(())
    }

    /// Pins held by the engine.
    pub fn claims(&self) -> &ClaimSet {
        &self.claims
    }

    /// Release pins and restore the default rate.
    pub fn reset(&mut self) {
        self.claims.clear();
        self.rate_hz = 500_000.0;
        self.port_stale = true;
    }

    fn prepare(&mut self) -> Result<()> {
        if self.claims.pin_for(PinRole::CanTx).is_none() {
            return Err(DaqError::invalid("pin", "no CAN pins assigned"));
        }
        if self.port_stale {
            self.port.configure(self.rate_hz)?;
            self.port_stale = false;
        }
        Ok(())
    }

    /// Transmit one frame.
    pub fn tx(&mut self, frame: &CanFrame) -> Result<CanTxOutcome> {
        frame.validate()?;
        self.prepare()?;
        let acked = self.port.transmit(&frame.encode())?;
        if acked {
            debug!(id = frame.id, dlc = frame.dlc, "CAN frame sent");
        } else {
            warn!(id = frame.id, "CAN frame not acknowledged");
        }
        Ok(CanTxOutcome { acked })
    }

    /// Receive one frame without blocking.
    pub fn rx(&mut self) -> Result<CanRx> {
        self.prepare()?;
        let Some(bits) = self.port.receive()? else {
            return Ok(CanRx::NoFrame);
        };
        match CanFrame::decode(&bits) {
            Ok(frame) => Ok(CanRx::Frame(frame)),
            Err(error) => {
                debug!(error = %error, bits = bits.len(), "CAN receive error");
                Ok(CanRx::Error(error))
            }
        }
    }
}
