//! Error types for instrument and bus-engine operations.
//!
//! [`DaqError`] covers every failure the core reports through `Result`.
//! Conditions that are expected during normal operation are *not* errors:
//! sample loss and corruption are reported through
//! [`RecordStatus`](crate::record::RecordStatus) and
//! [`PlayStatus`](crate::generator::PlayStatus) counters, and bus NAKs are
//! structured results of the protocol engines.
//!
//! [`ErrorKind`] projects each variant onto the recovery taxonomy:
//!
//! | Kind | Recovery |
//! |------|----------|
//! | `InvalidParameter` | call rejected, previous value kept |
//! | `NotSupported` | capability set does not advertise the request |
//! | `ResourceConflict` | pin already claimed by another engine |
//! | `Busy` | retry with `reconfigure = true` or after Done/Ready |
//! | `InvalidState` | operation not valid in the current state |
//! | `Device` | backend reported a failure |

use thiserror::Error;

use crate::instrument::{InstrumentKind, InstrumentState};
use crate::pins::{EngineId, PinRole};

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, DaqError>;

/// Errors that can occur when configuring or running instruments and bus engines.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DaqError {
    /// Value outside the advertised min/max/step range, or malformed request
    #[error("Invalid {parameter}: {message}")]
    InvalidParameter {
        /// Name of the offending parameter
        parameter: String,
        /// What was wrong with it
        message: String,
    },

    /// Channel index out of range for the instrument
    #[error("Invalid channel {channel}: {instrument} has {max} channels")]
    InvalidChannel {
        /// Instrument the channel was addressed on
        instrument: InstrumentKind,
        /// Requested index
        channel: usize,
        /// Number of channels the instrument has
        max: usize,
    },

    /// Mode, filter or trigger combination the capability set does not advertise
    #[error("Operation not supported: {message}")]
    NotSupported {
        /// What was asked for
        message: String,
    },

    /// Pin already claimed by another engine
    #[error("Pin {pin} is claimed by {owner} as {role}; {requested} cannot claim it")]
    ResourceConflict {
        /// Contested pin
        pin: u8,
        /// Current holder
        owner: EngineId,
        /// Role the holder uses the pin for
        role: PinRole,
        /// Engine that asked for the pin
        requested: EngineId,
    },

    /// Configure attempted while the instrument is running without reconfigure
    #[error("{instrument} is busy (state {state})")]
    Busy {
        /// Instrument that refused
        instrument: InstrumentKind,
        /// State it was in
        state: InstrumentState,
    },

    /// Operation not valid in the current state
    #[error("{instrument} must be {expected} for this operation, but is {actual}")]
    InvalidState {
        /// Instrument that refused
        instrument: InstrumentKind,
        /// State the operation needs
        expected: InstrumentState,
        /// State it was in
        actual: InstrumentState,
    },

    /// Failure reported by the device backend
    #[error("Device error: {message}")]
    Device {
        /// Backend message
        message: String,
    },
}

/// Recovery category of a [`DaqError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad argument; fix the request and retry
    InvalidParameter,
    /// The device cannot do this at all
    NotSupported,
    /// A pin is held by another engine
    ResourceConflict,
    /// Stop the instrument or reconfigure
    Busy,
    /// Call order is wrong
    InvalidState,
    /// Backend failure
    Device,
}

impl DaqError {
    pub(crate) fn invalid(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            parameter: parameter.into(),
            message: message.into(),
        }
    }

    pub(crate) fn not_supported(message: impl Into<String>) -> Self {
        Self::NotSupported {
            message: message.into(),
        }
    }

    /// Create a backend failure.
    pub fn device(message: impl Into<String>) -> Self {
        Self::Device {
            message: message.into(),
        }
    }

    /// Recovery category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidParameter { .. } | Self::InvalidChannel { .. } => {
                ErrorKind::InvalidParameter
            }
            Self::NotSupported { .. } => ErrorKind::NotSupported,
            Self::ResourceConflict { .. } => ErrorKind::ResourceConflict,
            Self::Busy { .. } => ErrorKind::Busy,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::Device { .. } => ErrorKind::Device,
        }
    }

    /// Check if the instrument was busy.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }

    /// Check if this is a pin claim conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ResourceConflict { .. })
    }

    /// Check if the request was rejected as out of range or malformed.
    pub fn is_invalid_parameter(&self) -> bool {
        self.kind() == ErrorKind::InvalidParameter
    }

    /// Check if the capability set does not cover the request.
    pub fn is_not_supported(&self) -> bool {
        matches!(self, Self::NotSupported { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::InvalidChannel {
            instrument: InstrumentKind::AnalogIn,
            channel: 7,
            max: 2,
        };
        assert!(err.to_string().contains('7'));
        assert!(err.to_string().contains("AnalogIn"));
    }

    #[test]
    fn test_conflict_display_names_both_engines() {
        let err = DaqError::ResourceConflict {
            pin: 4,
            owner: EngineId::Uart,
            role: PinRole::UartTx,
            requested: EngineId::Spi,
        };
        let text = err.to_string();
        assert!(text.contains("Pin 4"));
        assert!(text.contains("UART"));
        assert!(text.contains("SPI"));
        assert!(err.is_conflict());
    }

    #[test]
    fn test_kind_projection() {
        assert_eq!(
            DaqError::invalid("sample rate", "too high").kind(),
            ErrorKind::InvalidParameter
        );
        assert_eq!(DaqError::not_supported("x").kind(), ErrorKind::NotSupported);
        assert!(DaqError::Busy {
            instrument: InstrumentKind::DigitalOut,
            state: InstrumentState::Running,
        }
        .is_busy());
    }
}
