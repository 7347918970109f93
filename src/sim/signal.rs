//! Deterministic signals fed into the simulated inputs.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Analog input signal in hardware volts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    /// Fixed level
    Constant(f64),
    /// Sine around `offset`
    Sine {
        /// Peak volts
        amplitude: f64,
        /// Hz
        frequency: f64,
        /// Volts
        offset: f64,
    },
    /// Square wave around `offset`
    Square {
        /// Peak volts
        amplitude: f64,
        /// Hz
        frequency: f64,
        /// Volts
        offset: f64,
        /// High fraction of the period, 0..=1
        duty: f64,
    },
    /// `start + slope * t`
    Ramp {
        /// Volts at t = 0
        start: f64,
        /// Volts per second
        slope: f64,
    },
    /// One value per sample, repeating
    Sequence(Vec<f64>),
    /// Uniform noise, one value per sample
    Noise {
        /// Peak volts
        amplitude: f64,
        /// Generator seed; equal seeds give equal sequences
        seed: u64,
    },
}

impl Default for Signal {
    fn default() -> Self {
        Self::Constant(0.0)
    }
}

impl Signal {
    /// Zero-offset sine.
    pub fn sine(amplitude: f64, frequency: f64) -> Self {
        Self::Sine {
            amplitude,
            frequency,
            offset: 0.0,
        }
    }

    /// Zero-offset square with 50% duty.
    pub fn square(amplitude: f64, frequency: f64) -> Self {
        Self::Square {
            amplitude,
            frequency,
            offset: 0.0,
            duty: 0.5,
        }
    }

    /// Value of sample `index` at `rate_hz`.
    pub fn value(&self, index: u64, rate_hz: f64) -> f64 {
        let t = if rate_hz > 0.0 {
            index as f64 / rate_hz
        } else {
            0.0
        };
        match self {
            Self::Constant(v) => *v,
            Self::Sine {
                amplitude,
                frequency,
                offset,
            } => offset + amplitude * (std::f64::consts::TAU * frequency * t).sin(),
            Self::Square {
                amplitude,
                frequency,
                offset,
                duty,
            } => {
                let phase = (frequency * t).fract();
                if phase < *duty {
                    offset + amplitude
                } else {
                    offset - amplitude
                }
            }
            Self::Ramp { start, slope } => start + slope * t,
            Self::Sequence(values) => {
                if values.is_empty() {
                    0.0
                } else {
                    values[(index % values.len() as u64) as usize]
                }
            }
            Self::Noise { amplitude, seed } => {
                let mut rng =
                    ChaCha8Rng::seed_from_u64(seed ^ index.wrapping_mul(0x9E37_79B9_7F4A_7C15));
                amplitude * rng.gen_range(-1.0..=1.0)
            }
        }
    }
}

/// Digital input word source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigitalSignal {
    /// Fixed word
    Constant(u32),
    /// The sample index itself
    Counter,
    /// One word per sample, repeating
    Sequence(Vec<u32>),
}

impl Default for DigitalSignal {
    fn default() -> Self {
        Self::Constant(0)
    }
}

impl DigitalSignal {
    /// Word at sample `index`.
    pub fn value(&self, index: u64) -> u32 {
        match self {
            Self::Constant(word) => *word,
            // wraps like a hardware counter
            Self::Counter => index as u32,
            Self::Sequence(words) => {
                if words.is_empty() {
                    0
                } else {
                    words[(index % words.len() as u64) as usize]
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sine_quarter_period() {
        let signal = Signal::sine(2.0, 1000.0);
        assert!((signal.value(250, 1_000_000.0) - 2.0).abs() < 1e-9);
        assert!(signal.value(0, 1_000_000.0).abs() < 1e-12);
    }

    #[test]
    fn test_square_duty() {
        let signal = Signal::square(1.0, 1.0);
        assert_eq!(signal.value(1, 10.0), 1.0);
        assert_eq!(signal.value(6, 10.0), -1.0);
    }

    #[test]
    fn test_noise_is_seeded() {
        let a = Signal::Noise {
            amplitude: 1.0,
            seed: 7,
        };
        assert_eq!(a.value(42, 1.0), a.value(42, 1.0));
        assert!(a.value(42, 1.0).abs() <= 1.0);
    }

    #[test]
    fn test_sequences_repeat() {
        assert_eq!(Signal::Sequence(vec![1.0, 2.0]).value(3, 1.0), 2.0);
        assert_eq!(DigitalSignal::Sequence(vec![5, 6, 7]).value(4), 6);
        assert_eq!(DigitalSignal::Counter.value(9), 9);
    }
}
