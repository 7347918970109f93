//! Instrument state machine shared by the four instruments.
//!
//! ```text
//!   Ready ──configure──► Config ──start──► Prefill ──► Armed ──► Triggered ──► Done
//!     ▲                                                 │  (inputs)
//!     │                                                 └──► Wait ──► Running ──► Done
//!     └──────────────────── stop (any state) ◄──────────────── (outputs)
//! ```
//!
//! Setters only queue values; [`Instrument::configure`] applies them. While
//! an instrument is active (Prefill, Armed, Wait, Triggered, Running) a
//! configure without `reconfigure` fails with `Busy` and changes nothing.

pub mod analog_in;
pub mod analog_out;
pub mod digital_in;
pub mod digital_out;

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::capabilities::AcquisitionModes;
use crate::error::{DaqError, Result};

/// The four instrument types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstrumentKind {
    /// Oscilloscope
    AnalogIn,
    /// Waveform generator
    AnalogOut,
    /// Logic analyzer
    DigitalIn,
    /// Pattern generator
    DigitalOut,
}

impl fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Instrument lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum InstrumentState {
    /// Idle with default or stopped configuration
    #[default]
    Ready,
    /// Parameters applied, not started
    Config,
    /// Collecting pre-trigger samples
    Prefill,
    /// Waiting for the trigger
    Armed,
    /// Output wait period, or record mode with no new data this poll
    Wait,
    /// Input captured its trigger / record mode delivered data this poll
    Triggered,
    /// Output generating
    Running,
    /// Acquisition or generation complete
    Done,
}

impl InstrumentState {
    /// Whether the instrument is in an acquisition or generation cycle.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Prefill | Self::Armed | Self::Wait | Self::Triggered | Self::Running
        )
    }
}

impl fmt::Display for InstrumentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// How an input instrument fills its buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionMode {
    /// One triggered buffer, then Done
    #[default]
    Single,
    /// Continuous, newest sample appended at the end
    ScanShift,
    /// Continuous, written in place with a wrapping index
    ScanScreen,
    /// Continuous streaming of arbitrary length
    Record,
    /// Like Single, storing the mean of several hardware samples per sample
    Oversample,
}

impl AcquisitionMode {
    /// Capability flag of this mode.
    pub fn flag(&self) -> AcquisitionModes {
        match self {
            Self::Single => AcquisitionModes::SINGLE,
            Self::ScanShift => AcquisitionModes::SCAN_SHIFT,
            Self::ScanScreen => AcquisitionModes::SCAN_SCREEN,
            Self::Record => AcquisitionModes::RECORD,
            Self::Oversample => AcquisitionModes::OVERSAMPLE,
        }
    }

    /// Whether the mode runs without a trigger.
    pub fn is_scan(&self) -> bool {
        matches!(self, Self::ScanShift | Self::ScanScreen)
    }

    /// Whether the mode captures one pre/post-trigger window.
    pub fn is_windowed(&self) -> bool {
        matches!(self, Self::Single | Self::Oversample)
    }
}

/// Channel addressing for set-operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelSelector {
    /// One channel by index
    Index(usize),
    /// Every currently enabled channel
    AllEnabled,
}

impl ChannelSelector {
    /// Resolve to concrete indices given the enable flags.
    pub(crate) fn resolve(
        &self,
        instrument: InstrumentKind,
        enabled: &[bool],
    ) -> Result<Vec<usize>> {
        match self {
            Self::Index(channel) if *channel < enabled.len() => Ok(vec![*channel]),
            Self::Index(channel) => Err(DaqError::InvalidChannel {
                instrument,
                channel: *channel,
                max: enabled.len(),
            }),
            Self::AllEnabled => Ok(enabled
                .iter()
                .enumerate()
                .filter_map(|(i, on)| on.then_some(i))
                .collect()),
        }
    }
}

/// Common control surface of every instrument.
///
/// Calls on one instrument are serialized by `&mut self`; wrap an instrument
/// in [`SharedInstrument`] to drive it from several threads.
pub trait Instrument: Send {
    /// Which instrument this is.
    fn kind(&self) -> InstrumentKind;

    /// Current state without polling.
    fn state(&self) -> InstrumentState;

    /// Apply queued parameters and optionally start.
    fn configure(&mut self, reconfigure: bool, start: bool) -> Result<InstrumentState>;

    /// Advance the state machine; inputs drain data when `read_data` is set.
    fn poll(&mut self, read_data: bool) -> Result<InstrumentState>;

    /// Trigger immediately; only valid while Armed.
    fn force_trigger(&mut self) -> Result<()>;

    /// Stop and return to Ready, keeping buffers readable.
    fn stop(&mut self) -> Result<()>;

    /// Stop the hardware endpoint and restore defaults.
    ///
    /// The device handle and other instruments are untouched. Settings
    /// are restored even when stopping the endpoint fails.
    fn reset(&mut self) -> Result<()>;
}

/// An instrument shared between threads.
pub type SharedInstrument<I> = Arc<Mutex<I>>;

/// Wrap an instrument for shared use.
pub fn shared<I: Instrument>(instrument: I) -> SharedInstrument<I> {
    Arc::new(Mutex::new(instrument))
}

/// What `configure` has to do for the given state and arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConfigureStep {
    /// Nothing queued and nothing to start
    Nothing,
    /// Apply (and maybe start); `abort` when a running cycle has to end first
    Apply { abort: bool },
}

pub(crate) fn configure_step(
    instrument: InstrumentKind,
    state: InstrumentState,
    dirty: bool,
    reconfigure: bool,
    start: bool,
) -> Result<ConfigureStep> {
    if state.is_active() {
        if !reconfigure {
            return Err(DaqError::Busy { instrument, state });
        }
        return Ok(ConfigureStep::Apply { abort: true });
    }
    if !dirty && !start {
        return Ok(ConfigureStep::Nothing);
    }
    Ok(ConfigureStep::Apply { abort: false })
}

pub(crate) fn require_armed(instrument: InstrumentKind, state: InstrumentState) -> Result<()> {
    if state == InstrumentState::Armed {
        Ok(())
    } else {
        Err(DaqError::InvalidState {
            instrument,
            expected: InstrumentState::Armed,
            actual: state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configure_step_table() {
        use InstrumentState::*;
        let kind = InstrumentKind::AnalogIn;

        assert_eq!(configure_step(kind, Ready, false, false, false).unwrap(), ConfigureStep::Nothing);
        assert_eq!(
            configure_step(kind, Ready, true, false, false).unwrap(),
            ConfigureStep::Apply { abort: false }
        );
        assert_eq!(
            configure_step(kind, Done, false, false, true).unwrap(),
            ConfigureStep::Apply { abort: false }
        );
        assert!(configure_step(kind, Armed, true, false, true).unwrap_err().is_busy());
        assert_eq!(
            configure_step(kind, Triggered, false, true, false).unwrap(),
            ConfigureStep::Apply { abort: true }
        );
    }

    #[test]
    fn test_selector_resolve() {
        let enabled = [true, false, true];
        let kind = InstrumentKind::DigitalOut;
        assert_eq!(ChannelSelector::Index(1).resolve(kind, &enabled).unwrap(), vec![1]);
        assert_eq!(ChannelSelector::AllEnabled.resolve(kind, &enabled).unwrap(), vec![0, 2]);
        assert!(ChannelSelector::Index(3).resolve(kind, &enabled).is_err());
    }

    #[test]
    fn test_force_trigger_requires_armed() {
        assert!(require_armed(InstrumentKind::AnalogIn, InstrumentState::Armed).is_ok());
        let err = require_armed(InstrumentKind::AnalogIn, InstrumentState::Prefill).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidState);
    }
}
