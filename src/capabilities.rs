//! Device capability description.
//!
//! A [`DeviceCapabilities`] value is queried once from the backend when a
//! [`Device`](crate::Device) is created and shared by reference with every
//! instrument and engine on that device. Setters validate against it:
//!
//! - [`ParamRange`] - min/max/step ranges; values are snapped to the step
//! - [`RateClock`] - base clock plus integer divider; rates snap to the
//!   nearest achievable divider
//! - bitflag sets ([`TriggerSources`], [`AcquisitionModes`], ...) answer
//!   "is this supported" queries
//!
//! The [`Default`] profile describes a two-channel oscilloscope, two-channel
//! waveform generator and a 16-pin digital block.

use bitflags::bitflags;

use crate::error::{DaqError, Result};

/// Tolerance used when comparing requested values against range limits.
const RANGE_EPSILON: f64 = 1e-9;

bitflags! {
    /// Trigger sources an instrument accepts.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TriggerSources: u32 {
        /// Start immediately
        const NONE = 1 << 0;
        /// Software trigger
        const PC = 1 << 1;
        /// Oscilloscope level detector
        const ANALOG_IN_DETECTOR = 1 << 2;
        /// Logic analyzer pattern detector
        const DIGITAL_IN_DETECTOR = 1 << 3;
        /// Oscilloscope trigger output
        const ANALOG_IN = 1 << 4;
        /// Logic analyzer trigger output
        const DIGITAL_IN = 1 << 5;
        /// Waveform generator start
        const ANALOG_OUT = 1 << 6;
        /// Pattern generator start
        const DIGITAL_OUT = 1 << 7;
        /// External trigger input
        const EXTERNAL = 1 << 8;
        /// Constant high
        const HIGH = 1 << 9;
        /// Constant low
        const LOW = 1 << 10;
    }

    /// Trigger condition types a detector implements.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TriggerKinds: u8 {
        /// Level crossing
        const EDGE = 1 << 0;
        /// Pulse length compared with a limit
        const PULSE = 1 << 1;
        /// Crossing time compared with a limit
        const TRANSITION = 1 << 2;
    }

    /// Acquisition modes an input instrument supports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AcquisitionModes: u8 {
        /// One buffer per trigger
        const SINGLE = 1 << 0;
        /// Rolling buffer, oldest sample first
        const SCAN_SHIFT = 1 << 1;
        /// Circular buffer with a moving write index
        const SCAN_SCREEN = 1 << 2;
        /// Unbounded streaming
        const RECORD = 1 << 3;
        /// Averaged groups of samples
        const OVERSAMPLE = 1 << 4;
    }

    /// Waveform functions an analog output node can generate.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct WaveFunctions: u16 {
        /// Constant
        const DC = 1 << 0;
        /// Sine
        const SINE = 1 << 1;
        /// Square
        const SQUARE = 1 << 2;
        /// Triangle
        const TRIANGLE = 1 << 3;
        /// Rising ramp
        const RAMP_UP = 1 << 4;
        /// Falling ramp
        const RAMP_DOWN = 1 << 5;
        /// Noise
        const NOISE = 1 << 6;
        /// Unipolar pulse
        const PULSE = 1 << 7;
        /// Trapezium
        const TRAPEZIUM = 1 << 8;
        /// Uploaded period
        const CUSTOM = 1 << 9;
        /// Streamed samples
        const PLAY = 1 << 10;
    }

    /// Output drive types of the digital pins.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DriveTypes: u8 {
        /// Push-pull
        const PUSH_PULL = 1 << 0;
        /// Open drain
        const OPEN_DRAIN = 1 << 1;
    }

    /// Pattern kinds a digital output pin can generate.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PatternKinds: u8 {
        /// Pulse train
        const PULSE = 1 << 0;
        /// Uploaded bits
        const CUSTOM = 1 << 1;
        /// Pseudo-random bits
        const RANDOM = 1 << 2;
    }
}

/// Continuous or stepped parameter range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamRange {
    /// Minimum accepted value
    pub min: f64,
    /// Maximum accepted value
    pub max: f64,
    /// Number of discrete steps across the range (0 = continuous)
    pub steps: u32,
}

impl ParamRange {
    /// Create a new range.
    pub const fn new(min: f64, max: f64, steps: u32) -> Self {
        Self { min, max, steps }
    }

    /// Create a continuous range.
    pub const fn continuous(min: f64, max: f64) -> Self {
        Self::new(min, max, 0)
    }

    /// Step resolution (0 for continuous ranges).
    pub fn step(&self) -> f64 {
        if self.steps <= 1 {
            0.0
        } else {
            (self.max - self.min) / f64::from(self.steps - 1)
        }
    }

    /// Check whether a value lies inside the range.
    pub fn contains(&self, value: f64) -> bool {
        value.is_finite() && value >= self.min - RANGE_EPSILON && value <= self.max + RANGE_EPSILON
    }

    /// Validate a value and snap it to the nearest step.
    pub fn snap(&self, parameter: &str, value: f64) -> Result<f64> {
        if !self.contains(value) {
            return Err(DaqError::invalid(
                parameter,
                format!("{} outside [{}, {}]", value, self.min, self.max),
            ));
        }
        let step = self.step();
        let snapped = if step > 0.0 {
            self.min + ((value - self.min) / step).round() * step
        } else {
            value
        };
        Ok(snapped.clamp(self.min, self.max))
    }
}

/// Sample clock derived from a base clock and an integer divider.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateClock {
    /// Base clock frequency in Hz
    pub base_hz: f64,
    /// Largest divider the hardware counter holds
    pub max_divider: u32,
}

impl RateClock {
    /// Create a clock description.
    pub const fn new(base_hz: f64, max_divider: u32) -> Self {
        Self {
            base_hz,
            max_divider,
        }
    }

    /// Slowest achievable rate.
    pub fn min_rate(&self) -> f64 {
        self.base_hz / f64::from(self.max_divider)
    }

    /// Divider closest to the requested rate.
    pub fn divider_for(&self, rate_hz: f64) -> u32 {
        let ideal = self.base_hz / rate_hz;
        // clamp keeps the cast in range
        ideal.round().clamp(1.0, f64::from(self.max_divider)) as u32
    }

    /// Validate a requested rate and return the nearest achievable one.
    pub fn snap(&self, parameter: &str, rate_hz: f64) -> Result<f64> {
        if !rate_hz.is_finite() || rate_hz <= 0.0 {
            return Err(DaqError::invalid(parameter, format!("{rate_hz} Hz is not a rate")));
        }
        if rate_hz > self.base_hz * (1.0 + RANGE_EPSILON) {
            return Err(DaqError::invalid(
                parameter,
                format!("{} Hz exceeds maximum {} Hz", rate_hz, self.base_hz),
            ));
        }
        if rate_hz < self.min_rate() * (1.0 - RANGE_EPSILON) {
            return Err(DaqError::invalid(
                parameter,
                format!("{} Hz below minimum {} Hz", rate_hz, self.min_rate()),
            ));
        }
        Ok(self.base_hz / f64::from(self.divider_for(rate_hz)))
    }
}

/// Analog input (oscilloscope) capabilities.
#[derive(Debug, Clone)]
pub struct AnalogInCapabilities {
    /// Number of channels
    pub channels: usize,
    /// Full-scale input ranges in volts peak-to-peak, ascending
    pub ranges: Vec<f64>,
    /// Channel offset range in volts
    pub offset: ParamRange,
    /// Input attenuation range
    pub attenuation: ParamRange,
    /// ADC resolution in bits
    pub adc_bits: u8,
    /// Sample clock
    pub clock: RateClock,
    /// Smallest and largest buffer size in samples
    pub buffer_size: (usize, usize),
    /// Largest oversample factor
    pub max_oversample: u32,
    /// Record length range in seconds (0 = unbounded)
    pub record_length: ParamRange,
    /// Supported acquisition modes
    pub modes: AcquisitionModes,
    /// Accepted trigger sources
    pub trigger_sources: TriggerSources,
    /// Detector condition types
    pub trigger_kinds: TriggerKinds,
    /// Number of external trigger inputs
    pub external_triggers: u8,
    /// Trigger level range in volts
    pub trigger_level: ParamRange,
    /// Trigger hysteresis range in volts
    pub trigger_hysteresis: ParamRange,
    /// Pulse length range in seconds
    pub trigger_length: ParamRange,
    /// Holdoff range in seconds
    pub holdoff: ParamRange,
    /// Auto-trigger timeout range in seconds
    pub auto_timeout: ParamRange,
    /// Horizontal trigger position range in seconds
    pub position: ParamRange,
}

impl AnalogInCapabilities {
    /// Smallest advertised range covering the requested span.
    pub fn snap_range(&self, volts: f64) -> Result<f64> {
        if !volts.is_finite() || volts <= 0.0 {
            return Err(DaqError::invalid("range", format!("{volts} V is not a range")));
        }
        self.ranges
            .iter()
            .copied()
            .find(|range| *range >= volts - RANGE_EPSILON)
            .ok_or_else(|| {
                DaqError::invalid(
                    "range",
                    format!(
                        "{} V exceeds largest range {} V",
                        volts,
                        self.ranges.last().copied().unwrap_or(0.0)
                    ),
                )
            })
    }
}

/// Analog output (waveform generator) capabilities.
#[derive(Debug, Clone)]
pub struct AnalogOutCapabilities {
    /// Number of channels
    pub channels: usize,
    /// Functions available on every node
    pub functions: WaveFunctions,
    /// Carrier frequency range in Hz
    pub frequency: ParamRange,
    /// Carrier amplitude range in volts
    pub amplitude: ParamRange,
    /// Carrier offset range in volts
    pub offset: ParamRange,
    /// Modulation depth range in percent (AM and FM nodes)
    pub modulation: ParamRange,
    /// Symmetry range in percent
    pub symmetry: ParamRange,
    /// Phase range in degrees
    pub phase: ParamRange,
    /// Largest custom waveform in samples
    pub custom_samples: usize,
    /// Play buffer depth in samples
    pub play_buffer: usize,
    /// Wait and run duration range in seconds
    pub duration: ParamRange,
    /// Largest repeat count
    pub max_repeat: u32,
    /// Accepted trigger sources
    pub trigger_sources: TriggerSources,
}

/// Digital input (logic analyzer) capabilities.
#[derive(Debug, Clone)]
pub struct DigitalInCapabilities {
    /// Number of input bits
    pub bits: usize,
    /// Sample clock
    pub clock: RateClock,
    /// Smallest and largest buffer size in samples
    pub buffer_size: (usize, usize),
    /// Supported sample widths in bits
    pub sample_formats: Vec<u8>,
    /// Supported acquisition modes
    pub modes: AcquisitionModes,
    /// Record length range in seconds (0 = unbounded)
    pub record_length: ParamRange,
    /// Accepted trigger sources
    pub trigger_sources: TriggerSources,
    /// Detector condition types
    pub trigger_kinds: TriggerKinds,
    /// Number of external trigger inputs
    pub external_triggers: u8,
    /// Holdoff range in seconds
    pub holdoff: ParamRange,
    /// Auto-trigger timeout range in seconds
    pub auto_timeout: ParamRange,
    /// Horizontal trigger position range in seconds
    pub position: ParamRange,
}

/// Digital output (pattern generator) capabilities.
#[derive(Debug, Clone)]
pub struct DigitalOutCapabilities {
    /// Number of output pins
    pub pins: usize,
    /// Pattern clock
    pub clock: RateClock,
    /// Largest low/high counter value
    pub max_counter: u32,
    /// Largest custom pattern in bits
    pub custom_bits: usize,
    /// Supported drive types
    pub drive_types: DriveTypes,
    /// Supported pattern kinds
    pub patterns: PatternKinds,
    /// Wait and run duration range in seconds
    pub duration: ParamRange,
    /// Largest repeat count
    pub max_repeat: u32,
    /// Accepted trigger sources
    pub trigger_sources: TriggerSources,
}

/// Bit rate limits of the protocol engines.
#[derive(Debug, Clone, Copy)]
pub struct ProtocolCapabilities {
    /// UART bit rate range in Hz
    pub uart_rate: ParamRange,
    /// SPI clock range in Hz
    pub spi_rate: ParamRange,
    /// I2C clock range in Hz
    pub i2c_rate: ParamRange,
    /// CAN bit rate range in Hz
    pub can_rate: ParamRange,
}

/// Everything a device advertises.
#[derive(Debug, Clone)]
pub struct DeviceCapabilities {
    /// Device model name
    pub name: String,
    /// Number of shared digital pins
    pub digital_pins: u8,
    /// Oscilloscope block
    pub analog_in: AnalogInCapabilities,
    /// Waveform generator block
    pub analog_out: AnalogOutCapabilities,
    /// Logic analyzer block
    pub digital_in: DigitalInCapabilities,
    /// Pattern generator block
    pub digital_out: DigitalOutCapabilities,
    /// Protocol engine limits
    pub protocols: ProtocolCapabilities,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        let local_sources = TriggerSources::NONE
            | TriggerSources::PC
            | TriggerSources::ANALOG_IN_DETECTOR
            | TriggerSources::DIGITAL_IN_DETECTOR
            | TriggerSources::ANALOG_IN
            | TriggerSources::DIGITAL_IN
            | TriggerSources::ANALOG_OUT
            | TriggerSources::DIGITAL_OUT
            | TriggerSources::EXTERNAL
            | TriggerSources::HIGH
            | TriggerSources::LOW;

        Self {
            name: "Mixed-signal reference device".to_string(),
            digital_pins: 16,
            analog_in: AnalogInCapabilities {
                channels: 2,
                ranges: vec![1.0, 5.0, 10.0, 50.0],
                offset: ParamRange::continuous(-25.0, 25.0),
                attenuation: ParamRange::continuous(0.001, 1000.0),
                adc_bits: 14,
                clock: RateClock::new(100_000_000.0, 1 << 30),
                buffer_size: (16, 8192),
                max_oversample: 64,
                record_length: ParamRange::continuous(0.0, 86_400.0),
                modes: AcquisitionModes::all(),
                trigger_sources: local_sources,
                trigger_kinds: TriggerKinds::EDGE | TriggerKinds::PULSE,
                external_triggers: 4,
                trigger_level: ParamRange::continuous(-25.0, 25.0),
                trigger_hysteresis: ParamRange::continuous(0.0, 5.0),
                trigger_length: ParamRange::continuous(0.0, 10.0),
                holdoff: ParamRange::continuous(0.0, 10.0),
                auto_timeout: ParamRange::continuous(0.0, 10.0),
                position: ParamRange::continuous(-10.0, 10.0),
            },
            analog_out: AnalogOutCapabilities {
                channels: 2,
                functions: WaveFunctions::all(),
                frequency: ParamRange::continuous(0.001, 20_000_000.0),
                amplitude: ParamRange::continuous(0.0, 5.0),
                offset: ParamRange::continuous(-5.0, 5.0),
                modulation: ParamRange::continuous(0.0, 100.0),
                symmetry: ParamRange::continuous(0.0, 100.0),
                phase: ParamRange::continuous(0.0, 360.0),
                custom_samples: 4096,
                play_buffer: 4096,
                duration: ParamRange::continuous(0.0, 10_000.0),
                max_repeat: 65_535,
                trigger_sources: local_sources - TriggerSources::ANALOG_OUT,
            },
            digital_in: DigitalInCapabilities {
                bits: 16,
                clock: RateClock::new(100_000_000.0, 1 << 30),
                buffer_size: (16, 4096),
                sample_formats: vec![8, 16, 32],
                modes: AcquisitionModes::SINGLE
                    | AcquisitionModes::SCAN_SHIFT
                    | AcquisitionModes::SCAN_SCREEN
                    | AcquisitionModes::RECORD,
                record_length: ParamRange::continuous(0.0, 86_400.0),
                trigger_sources: local_sources,
                trigger_kinds: TriggerKinds::EDGE | TriggerKinds::TRANSITION,
                external_triggers: 4,
                holdoff: ParamRange::continuous(0.0, 10.0),
                auto_timeout: ParamRange::continuous(0.0, 10.0),
                position: ParamRange::continuous(-10.0, 10.0),
            },
            digital_out: DigitalOutCapabilities {
                pins: 16,
                clock: RateClock::new(100_000_000.0, 1 << 30),
                max_counter: 1 << 15,
                custom_bits: 1024,
                drive_types: DriveTypes::all(),
                patterns: PatternKinds::all(),
                duration: ParamRange::continuous(0.0, 10_000.0),
                max_repeat: 65_535,
                trigger_sources: local_sources - TriggerSources::DIGITAL_OUT,
            },
            protocols: ProtocolCapabilities {
                uart_rate: ParamRange::continuous(1.0, 10_000_000.0),
                spi_rate: ParamRange::continuous(1.0, 25_000_000.0),
                i2c_rate: ParamRange::continuous(1.0, 1_000_000.0),
                can_rate: ParamRange::continuous(1.0, 1_000_000.0),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_range_snap_to_step() {
        let range = ParamRange::new(0.0, 10.0, 11);
        assert_eq!(range.step(), 1.0);
        assert_eq!(range.snap("x", 3.4).unwrap(), 3.0);
        assert_eq!(range.snap("x", 3.6).unwrap(), 4.0);
        assert!(range.snap("x", 10.5).is_err());
        assert!(range.snap("x", f64::NAN).is_err());
    }

    #[test]
    fn test_continuous_range_keeps_value() {
        let range = ParamRange::continuous(-5.0, 5.0);
        assert_eq!(range.snap("offset", 1.234).unwrap(), 1.234);
    }

    #[test]
    fn test_rate_clock_snaps_to_divider() {
        let clock = RateClock::new(100_000_000.0, 1 << 30);
        assert_eq!(clock.snap("rate", 1_000_000.0).unwrap(), 1_000_000.0);
        // 100 MHz / 3 is the closest achievable rate to 33 MHz
        let snapped = clock.snap("rate", 33_000_000.0).unwrap();
        assert!((snapped - 100_000_000.0 / 3.0).abs() < 1e-6);
        assert!(clock.snap("rate", 200_000_000.0).is_err());
        assert!(clock.snap("rate", 0.0).is_err());
    }

    #[test]
    fn test_snap_range_picks_smallest_covering() {
        let caps = DeviceCapabilities::default();
        assert_eq!(caps.analog_in.snap_range(0.5).unwrap(), 1.0);
        assert_eq!(caps.analog_in.snap_range(5.0).unwrap(), 5.0);
        assert_eq!(caps.analog_in.snap_range(7.0).unwrap(), 10.0);
        assert!(caps.analog_in.snap_range(100.0).is_err());
    }

    #[test]
    fn test_default_profile_sets() {
        let caps = DeviceCapabilities::default();
        assert!(caps.analog_in.modes.contains(AcquisitionModes::OVERSAMPLE));
        assert!(!caps.digital_in.modes.contains(AcquisitionModes::OVERSAMPLE));
        assert!(!caps
            .analog_in
            .trigger_kinds
            .contains(TriggerKinds::TRANSITION));
        assert!(!caps
            .analog_out
            .trigger_sources
            .contains(TriggerSources::ANALOG_OUT));
    }
}
