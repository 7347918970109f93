//! Waveform and pattern synthesis.
//!
//! Analog output channels are built from three nodes: a carrier, an
//! amplitude modulator (AM) and a frequency modulator (FM). Each node
//! produces a unit shape in `[-1, 1]`; the channel value at time `t` is
//!
//! ```text
//! offset + amplitude · carrier(φ(t)) · (1 + am%·am(t) + am_offset%)
//! φ(t) = f·t·(1 + fm_offset%) + f·fm% · ∫₀ᵗ fm(τ) dτ + phase/360
//! ```
//!
//! Digital output pins generate either a counter-based pulse train, a
//! custom bit stream or pseudo-random bits, all clocked by
//! `base_clock / divider`.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::capabilities::{PatternKinds, WaveFunctions};

/// Intervals used when integrating one period of a modulator shape.
const INTEGRATION_STEPS: usize = 64;

/// Unit shape generated by an analog output node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaveFunction {
    /// Constant; only the offset is output
    #[default]
    Dc,
    /// Unit sine
    Sine,
    /// High for `symmetry` of the period
    Square,
    /// Rises for `symmetry` of the period
    Triangle,
    /// Rises over the whole period
    RampUp,
    /// Falls over the whole period
    RampDown,
    /// One pseudo-random value per period
    Noise,
    /// Unipolar square: 1 for `symmetry` of the period, else 0
    Pulse,
    /// Triangle doubled and clipped to flat tops
    Trapezium,
    /// Uploaded samples repeated every period
    Custom,
    /// Caller-streamed samples
    Play,
}

impl WaveFunction {
    /// Capability flag of this function.
    pub fn flag(&self) -> WaveFunctions {
        match self {
            Self::Dc => WaveFunctions::DC,
            Self::Sine => WaveFunctions::SINE,
            Self::Square => WaveFunctions::SQUARE,
            Self::Triangle => WaveFunctions::TRIANGLE,
            Self::RampUp => WaveFunctions::RAMP_UP,
            Self::RampDown => WaveFunctions::RAMP_DOWN,
            Self::Noise => WaveFunctions::NOISE,
            Self::Pulse => WaveFunctions::PULSE,
            Self::Trapezium => WaveFunctions::TRAPEZIUM,
            Self::Custom => WaveFunctions::CUSTOM,
            Self::Play => WaveFunctions::PLAY,
        }
    }
}

/// Parameters of one analog output node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Node contributes to the output
    pub enabled: bool,
    /// Unit shape
    pub function: WaveFunction,
    /// Hz
    pub frequency: f64,
    /// Volts for the carrier, percent for AM/FM
    pub amplitude: f64,
    /// Volts for the carrier, percent for AM/FM
    pub offset: f64,
    /// Percent
    pub symmetry: f64,
    /// Degrees
    pub phase: f64,
    /// Custom samples normalized to `[-1, 1]`
    #[serde(default)]
    pub custom: Vec<f64>,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            function: WaveFunction::Sine,
            frequency: 1000.0,
            amplitude: 1.0,
            offset: 0.0,
            symmetry: 50.0,
            phase: 0.0,
            custom: Vec::new(),
        }
    }
}

fn noise_value(seed: u64, period: i64) -> f64 {
    // period index mixed into the seed gives one stable value per period
    let mut rng = ChaCha8Rng::seed_from_u64(seed ^ (period as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    rng.gen_range(-1.0..=1.0)
}

impl NodeSettings {
    /// Unit shape at `cycles` periods from the origin (phase included).
    pub fn shape(&self, cycles: f64, seed: u64) -> f64 {
        let period = cycles.floor();
        let u = cycles - period;
        let sym = (self.symmetry / 100.0).clamp(0.0, 1.0);
        match self.function {
            WaveFunction::Dc | WaveFunction::Play => 0.0,
            WaveFunction::Sine => (std::f64::consts::TAU * u).sin(),
            WaveFunction::Square => {
                if u < sym {
                    1.0
                } else {
                    -1.0
                }
            }
            WaveFunction::Triangle => triangle(u, sym),
            WaveFunction::RampUp => -1.0 + 2.0 * u,
            WaveFunction::RampDown => 1.0 - 2.0 * u,
            WaveFunction::Noise => noise_value(seed, period as i64),
            WaveFunction::Pulse => {
                if u < sym {
                    1.0
                } else {
                    0.0
                }
            }
            WaveFunction::Trapezium => (2.0 * triangle(u, 0.5)).clamp(-1.0, 1.0),
            WaveFunction::Custom => {
                if self.custom.is_empty() {
                    0.0
                } else {
                    let i = ((u * self.custom.len() as f64) as usize).min(self.custom.len() - 1);
                    self.custom[i]
                }
            }
        }
    }

    /// Shape at time `t` seconds.
    pub fn shape_at(&self, t: f64, seed: u64) -> f64 {
        self.shape(self.frequency * t + self.phase / 360.0, seed)
    }

    fn partial_integral(&self, period: f64, upto: f64, seed: u64) -> f64 {
        if upto <= 0.0 {
            return 0.0;
        }
        // Simpson over [period, period + upto]
        let h = upto / INTEGRATION_STEPS as f64;
        let mut sum = self.shape(period, seed) + self.shape(period + upto - 1e-12, seed);
        for k in 1..INTEGRATION_STEPS {
            let weight = if k % 2 == 1 { 4.0 } else { 2.0 };
            sum += weight * self.shape(period + h * k as f64, seed);
        }
        sum * h / 3.0
    }

    /// ∫ shape over `[0, x]` cycles.
    fn cycle_integral(&self, x: f64, seed: u64) -> f64 {
        let whole = x.floor();
        let rest = x - whole;
        let per_period = match self.function {
            // zero-mean on average
            WaveFunction::Noise => 0.0,
            _ => self.partial_integral(0.0, 1.0, seed),
        };
        whole * per_period + self.partial_integral(whole, rest, seed)
    }
}

fn triangle(u: f64, sym: f64) -> f64 {
    if sym <= 0.0 {
        1.0 - 2.0 * u
    } else if sym >= 1.0 || u < sym {
        -1.0 + 2.0 * u / sym.max(f64::EPSILON)
    } else {
        1.0 - 2.0 * (u - sym) / (1.0 - sym)
    }
}

/// Channel output at time `t` seconds for a carrier and optional modulators.
pub fn synthesize(
    carrier: &NodeSettings,
    am: Option<&NodeSettings>,
    fm: Option<&NodeSettings>,
    t: f64,
    seed: u64,
) -> f64 {
    let mut cycles = carrier.frequency * t + carrier.phase / 360.0;
    if let Some(fm) = fm.filter(|n| n.enabled && n.frequency > 0.0) {
        let depth = fm.amplitude / 100.0;
        let start = fm.phase / 360.0;
        let end = fm.frequency * t + start;
        let integral = (fm.cycle_integral(end, seed) - fm.cycle_integral(start, seed)) / fm.frequency;
        cycles += carrier.frequency * (t * fm.offset / 100.0 + depth * integral);
    }

    let mut factor = 1.0;
    if let Some(am) = am.filter(|n| n.enabled) {
        factor += am.amplitude / 100.0 * am.shape_at(t, seed) + am.offset / 100.0;
    }

    carrier.offset + carrier.amplitude * carrier.shape(cycles, seed) * factor
}

/// Pattern generated by a digital output pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    /// Counter-based pulse train
    #[default]
    Pulse,
    /// Uploaded bit stream
    Custom,
    /// Pseudo-random bits
    Random,
}

impl PatternKind {
    /// Capability flag of this pattern.
    pub fn flag(&self) -> PatternKinds {
        match self {
            Self::Pulse => PatternKinds::PULSE,
            Self::Custom => PatternKinds::CUSTOM,
            Self::Random => PatternKinds::RANDOM,
        }
    }
}

/// Pattern parameters of one digital output pin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinPattern {
    /// Pulse, random or custom pattern
    pub kind: PatternKind,
    /// Base clock ticks per pattern step
    pub divider: u32,
    /// Steps spent low per pulse period
    pub low: u32,
    /// Steps spent high per pulse period
    pub high: u32,
    /// Start in the high phase
    pub initial_high: bool,
    /// Steps already elapsed in the first period
    pub initial_counter: u32,
    /// Bits of a custom pattern, one per step
    #[serde(default)]
    pub custom: Vec<bool>,
}

impl Default for PinPattern {
    fn default() -> Self {
        Self {
            kind: PatternKind::Pulse,
            divider: 1,
            low: 1,
            high: 1,
            initial_high: false,
            initial_counter: 0,
            custom: Vec::new(),
        }
    }
}

impl PinPattern {
    /// Level after `tick` base clock ticks.
    pub fn level_at(&self, tick: u64, seed: u64) -> bool {
        let step = tick / u64::from(self.divider.max(1));
        match self.kind {
            PatternKind::Pulse => {
                let period = u64::from(self.low) + u64::from(self.high);
                if period == 0 {
                    return self.initial_high;
                }
                let pos = (step + u64::from(self.initial_counter)) % period;
                if self.initial_high {
                    pos < u64::from(self.high)
                } else {
                    pos >= u64::from(self.low)
                }
            }
            PatternKind::Custom => {
                if self.custom.is_empty() {
                    false
                } else {
                    self.custom[(step % self.custom.len() as u64) as usize]
                }
            }
            PatternKind::Random => {
                let mut rng = ChaCha8Rng::seed_from_u64(seed ^ step.wrapping_mul(0x9E37_79B9_7F4A_7C15));
                rng.gen::<bool>()
            }
        }
    }
}
