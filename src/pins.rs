//! Shared digital pin registry.
//!
//! Every engine that drives or samples a shared digital pin (GPIO, pattern
//! generator, UART, SPI, I2C, CAN) claims it here first. A pin carries at
//! most one claim; a request that touches a pin owned by another engine
//! fails with [`DaqError::ResourceConflict`] and changes nothing.
//!
//! Claims are grouped in a [`ClaimSet`] owned by the engine. Replacing the
//! set is atomic (all requested pins are checked before any is taken) and
//! dropping the set releases every pin in it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{DaqError, Result};

/// Role a claimed pin plays for its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PinRole {
    /// Static input
    GpioIn,
    /// Static output
    GpioOut,
    /// Pattern generator output
    PatternOut,
    /// UART transmit
    UartTx,
    /// UART receive
    UartRx,
    /// SPI clock
    SpiClk,
    /// SPI data line (0 = MOSI/DQ0, 1 = MISO/DQ1, 2..3 quad lines)
    SpiDq(u8),
    /// SPI chip select
    SpiCs,
    /// I2C clock
    I2cScl,
    /// I2C data
    I2cSda,
    /// CAN transmit
    CanTx,
    /// CAN receive
    CanRx,
}

impl fmt::Display for PinRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GpioIn => write!(f, "GPIO input"),
            Self::GpioOut => write!(f, "GPIO output"),
            Self::PatternOut => write!(f, "pattern output"),
            Self::UartTx => write!(f, "UART TX"),
            Self::UartRx => write!(f, "UART RX"),
            Self::SpiClk => write!(f, "SPI CLK"),
            Self::SpiDq(n) => write!(f, "SPI DQ{n}"),
            Self::SpiCs => write!(f, "SPI CS"),
            Self::I2cScl => write!(f, "I2C SCL"),
            Self::I2cSda => write!(f, "I2C SDA"),
            Self::CanTx => write!(f, "CAN TX"),
            Self::CanRx => write!(f, "CAN RX"),
        }
    }
}

/// Engine that owns a pin claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineId {
    /// GPIO engine
    Gpio,
    /// Pattern generator
    DigitalOut,
    /// UART engine
    Uart,
    /// SPI engine
    Spi,
    /// I2C engine
    I2c,
    /// CAN engine
    Can,
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Gpio => "GPIO",
            Self::DigitalOut => "DigitalOut",
            Self::Uart => "UART",
            Self::Spi => "SPI",
            Self::I2c => "I2C",
            Self::Can => "CAN",
        };
        f.write_str(name)
    }
}

/// An active claim on one pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinClaim {
    /// Pin index
    pub pin: u8,
    /// Role on that pin
    pub role: PinRole,
    /// Owning engine
    pub owner: EngineId,
}

#[derive(Debug)]
struct Slot {
    claim: PinClaim,
    set_id: u64,
}

#[derive(Debug)]
struct RegistryState {
    slots: Vec<Option<Slot>>,
}

/// Device-wide pin ownership table.
#[derive(Clone)]
pub struct PinRegistry {
    state: Arc<Mutex<RegistryState>>,
    next_set: Arc<AtomicU64>,
}

impl fmt::Debug for PinRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinRegistry")
            .field("claims", &self.claims())
            .finish()
    }
}

impl PinRegistry {
    /// Create a registry for `pin_count` pins, all free.
    pub fn new(pin_count: u8) -> Self {
        let slots = (0..pin_count).map(|_| None).collect();
        Self {
            state: Arc::new(Mutex::new(RegistryState { slots })),
            next_set: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Number of pins managed.
    pub fn pin_count(&self) -> u8 {
        // the slot vector is built from a u8 count
        self.state.lock().slots.len() as u8
    }

    /// Create an empty claim set for an engine.
    pub fn claim_set(&self, owner: EngineId) -> ClaimSet {
        ClaimSet {
            registry: self.clone(),
            owner,
            id: self.next_set.fetch_add(1, Ordering::Relaxed),
            claims: Vec::new(),
        }
    }

    /// Claim pins for `owner` in one step.
    pub fn claim(&self, owner: EngineId, request: &[(u8, PinRole)]) -> Result<ClaimSet> {
        let mut set = self.claim_set(owner);
        set.replace(request)?;
        Ok(set)
    }

    /// Current claim on a pin, if any.
    pub fn owner_of(&self, pin: u8) -> Option<PinClaim> {
        self.state
            .lock()
            .slots
            .get(usize::from(pin))
            .and_then(|slot| slot.as_ref().map(|s| s.claim))
    }

    /// All active claims ordered by pin.
    pub fn claims(&self) -> Vec<PinClaim> {
        self.state
            .lock()
            .slots
            .iter()
            .flatten()
            .map(|slot| slot.claim)
            .collect()
    }

    fn release_set(&self, set_id: u64) {
        let mut state = self.state.lock();
        for slot in state.slots.iter_mut() {
            if slot.as_ref().is_some_and(|s| s.set_id == set_id) {
                *slot = None;
            }
        }
    }
}

/// Pins held by one engine; released when dropped.
#[derive(Debug)]
pub struct ClaimSet {
    registry: PinRegistry,
    owner: EngineId,
    id: u64,
    claims: Vec<PinClaim>,
}

impl ClaimSet {
    /// Owning engine.
    pub fn owner(&self) -> EngineId {
        self.owner
    }

    /// Claims currently held.
    pub fn claims(&self) -> &[PinClaim] {
        &self.claims
    }

    /// Pin held in `role`, if any.
    pub fn pin_for(&self, role: PinRole) -> Option<u8> {
        self.claims.iter().find(|c| c.role == role).map(|c| c.pin)
    }

    /// Replace the held claims with `request`.
    ///
    /// Either every requested pin is free (or already held by this set) and
    /// the set becomes exactly `request`, or nothing changes.
    pub fn replace(&mut self, request: &[(u8, PinRole)]) -> Result<()> {
        let mut state = self.registry.state.lock();

        for (i, (pin, _)) in request.iter().enumerate() {
            let Some(slot) = state.slots.get(usize::from(*pin)) else {
                return Err(DaqError::invalid(
                    "pin",
                    format!("pin {} out of range 0..{}", pin, state.slots.len()),
                ));
            };
            if request[..i].iter().any(|(other, _)| other == pin) {
                return Err(DaqError::invalid(
                    "pin",
                    format!("pin {pin} requested twice"),
                ));
            }
            if let Some(existing) = slot {
                if existing.set_id != self.id {
                    debug!(
                        pin = pin,
                        owner = %existing.claim.owner,
                        requested = %self.owner,
                        "Pin claim rejected"
                    );
                    return Err(DaqError::ResourceConflict {
                        pin: *pin,
                        owner: existing.claim.owner,
                        role: existing.claim.role,
                        requested: self.owner,
                    });
                }
            }
        }

        for slot in state.slots.iter_mut() {
            if slot.as_ref().is_some_and(|s| s.set_id == self.id) {
                *slot = None;
            }
        }
        self.claims.clear();
        for (pin, role) in request {
            let claim = PinClaim {
                pin: *pin,
                role: *role,
                owner: self.owner,
            };
            state.slots[usize::from(*pin)] = Some(Slot {
                claim,
                set_id: self.id,
            });
            self.claims.push(claim);
        }

        trace!(owner = %self.owner, pins = self.claims.len(), "Pin claims updated");
        Ok(())
    }

    /// Release every pin in the set.
    pub fn clear(&mut self) {
        if !self.claims.is_empty() {
            self.registry.release_set(self.id);
            self.claims.clear();
            trace!(owner = %self.owner, "Pin claims released");
        }
    }
}

impl Drop for ClaimSet {
    fn drop(&mut self) {
        self.clear();
    }
}
