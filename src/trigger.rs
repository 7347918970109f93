//! Trigger detection and the device-wide trigger bus.
//!
//! A [`TriggerEngine`] makes a fire / no-fire decision per sample. It works
//! entirely in sample indices: the capture engine converts holdoff, auto
//! timeout and pulse length from seconds once, at arm time.
//!
//! Sources that are not a local detector (the PC, another instrument,
//! external inputs) reach the engine through the [`TriggerBus`], which keeps
//! one generation counter per source. Publishing bumps the counter; every
//! listener that remembered an older generation sees one fire.
//!
//! # Edge with hysteresis
//!
//! ```text
//!   level ─────────────┬──────────────────┬───────
//!                   ↑ fire             ↑ fire
//!   level - H ──────╱───╲──────────╱──────
//!                  ╱     ╲________╱  re-armed here
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::capabilities::{ParamRange, TriggerKinds, TriggerSources};
use crate::error::{DaqError, Result};

/// Where a trigger comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    /// Start immediately
    #[default]
    None,
    /// Software trigger issued through [`Device::trigger_pc`](crate::Device::trigger_pc)
    Pc,
    /// Analog input level detector
    AnalogInDetector,
    /// Digital input pattern detector
    DigitalInDetector,
    /// Analog input instrument trigger
    AnalogIn,
    /// Digital input instrument trigger
    DigitalIn,
    /// Analog output instrument start
    AnalogOut,
    /// Digital output instrument start
    DigitalOut,
    /// External trigger input (1-based)
    External(u8),
    /// Constant high: fires immediately
    High,
    /// Constant low: never fires
    Low,
}

const BUS_SLOTS: usize = 11;

impl TriggerSource {
    /// Capability flag of this source.
    pub fn flag(&self) -> TriggerSources {
        match self {
            Self::None => TriggerSources::NONE,
            Self::Pc => TriggerSources::PC,
            Self::AnalogInDetector => TriggerSources::ANALOG_IN_DETECTOR,
            Self::DigitalInDetector => TriggerSources::DIGITAL_IN_DETECTOR,
            Self::AnalogIn => TriggerSources::ANALOG_IN,
            Self::DigitalIn => TriggerSources::DIGITAL_IN,
            Self::AnalogOut => TriggerSources::ANALOG_OUT,
            Self::DigitalOut => TriggerSources::DIGITAL_OUT,
            Self::External(_) => TriggerSources::EXTERNAL,
            Self::High => TriggerSources::HIGH,
            Self::Low => TriggerSources::LOW,
        }
    }

    fn bus_slot(&self) -> Option<usize> {
        match self {
            Self::None | Self::High | Self::Low => None,
            Self::Pc => Some(0),
            Self::AnalogInDetector => Some(1),
            Self::DigitalInDetector => Some(2),
            Self::AnalogIn => Some(3),
            Self::DigitalIn => Some(4),
            Self::AnalogOut => Some(5),
            Self::DigitalOut => Some(6),
            Self::External(n) => {
                let n = usize::from(*n);
                (1..=BUS_SLOTS - 7).contains(&n).then_some(6 + n)
            }
        }
    }

    /// Validate the source against a capability set.
    pub(crate) fn check(&self, sources: TriggerSources, external_inputs: u8) -> Result<()> {
        if !sources.contains(self.flag()) {
            return Err(DaqError::not_supported(format!("trigger source {self}")));
        }
        if let Self::External(n) = self {
            if *n == 0 || *n > external_inputs {
                return Err(DaqError::invalid(
                    "trigger source",
                    format!("external input {n} outside 1..={external_inputs}"),
                ));
            }
        }
        Ok(())
    }
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::External(n) => write!(f, "External{n}"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Edge direction of the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Slope {
    /// Rising edge / positive pulse
    #[default]
    Rise,
    /// Falling edge / negative pulse
    Fall,
    /// Either direction
    Either,
}

/// Detector condition type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Level crossing
    #[default]
    Edge,
    /// Pulse width compared against a length
    Pulse,
    /// Pattern becomes satisfied (digital detector)
    Transition,
}

impl TriggerKind {
    fn flag(&self) -> TriggerKinds {
        match self {
            Self::Edge => TriggerKinds::EDGE,
            Self::Pulse => TriggerKinds::PULSE,
            Self::Transition => TriggerKinds::TRANSITION,
        }
    }
}

/// How a pulse width is compared with the configured length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LengthCondition {
    /// Fires at pulse end when the width is shorter than the length
    #[default]
    Less,
    /// Fires at pulse end when the width is longer than the length
    More,
    /// Fires as soon as the pulse has lasted the length
    Timeout,
}

/// Complete trigger configuration of an input instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerSpec {
    /// What fires the trigger
    pub source: TriggerSource,
    /// Edge direction for edge and length triggers
    pub slope: Slope,
    /// Edge, pulse length or transition
    pub kind: TriggerKind,
    /// Detector channel (analog detector)
    pub channel: usize,
    /// Detector level in volts; only for edge/pulse on the analog detector
    pub level: Option<f64>,
    /// Detector hysteresis in volts; only for edge/pulse on the analog detector
    pub hysteresis: Option<f64>,
    /// Pulse length in seconds
    pub length: f64,
    /// How the measured length compares with `length`
    pub length_condition: LengthCondition,
    /// Dead time after a fire, in seconds
    pub holdoff: f64,
    /// Fire without a match after this many seconds (0 = wait forever)
    pub auto_timeout: f64,
    /// Horizontal position of the trigger relative to the buffer centre, in seconds
    pub position: f64,
}

impl Default for TriggerSpec {
    fn default() -> Self {
        Self {
            source: TriggerSource::None,
            slope: Slope::Rise,
            kind: TriggerKind::Edge,
            channel: 0,
            level: None,
            hysteresis: None,
            length: 0.0,
            length_condition: LengthCondition::Less,
            holdoff: 0.0,
            auto_timeout: 0.0,
            position: 0.0,
        }
    }
}

/// Which local detector an instrument owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LocalDetector {
    Analog,
    Digital,
}

impl LocalDetector {
    fn source(&self) -> TriggerSource {
        match self {
            Self::Analog => TriggerSource::AnalogInDetector,
            Self::Digital => TriggerSource::DigitalInDetector,
        }
    }
}

/// Limits a trigger spec is validated against.
pub(crate) struct TriggerLimits<'a> {
    pub detector: LocalDetector,
    pub sources: TriggerSources,
    pub kinds: TriggerKinds,
    pub external_inputs: u8,
    pub channels: usize,
    pub level: Option<&'a ParamRange>,
    pub hysteresis: Option<&'a ParamRange>,
    pub length: Option<&'a ParamRange>,
    pub holdoff: &'a ParamRange,
    pub auto_timeout: &'a ParamRange,
    pub position: &'a ParamRange,
}

impl TriggerSpec {
    /// Whether level and hysteresis apply to this configuration.
    pub fn uses_level(&self) -> bool {
        self.source == TriggerSource::AnalogInDetector
            && matches!(self.kind, TriggerKind::Edge | TriggerKind::Pulse)
    }

    /// Validate against `limits` and return the snapped spec.
    pub(crate) fn validated(&self, limits: &TriggerLimits<'_>) -> Result<Self> {
        let mut spec = self.clone();
        spec.source.check(limits.sources, limits.external_inputs)?;

        let local = spec.source == limits.detector.source();
        if local && !limits.kinds.contains(spec.kind.flag()) {
            return Err(DaqError::not_supported(format!(
                "{:?} trigger on {}",
                spec.kind, spec.source
            )));
        }

        let local_analog = local && limits.detector == LocalDetector::Analog && spec.uses_level();
        if (spec.level.is_some() || spec.hysteresis.is_some()) && !local_analog {
            return Err(DaqError::invalid(
                "trigger level",
                "level and hysteresis only apply to edge or pulse triggers on the analog detector",
            ));
        }
        if let (Some(level), Some(range)) = (spec.level, limits.level) {
            spec.level = Some(range.snap("trigger level", level)?);
        }
        if let (Some(hysteresis), Some(range)) = (spec.hysteresis, limits.hysteresis) {
            spec.hysteresis = Some(range.snap("trigger hysteresis", hysteresis)?);
        }

        if local && limits.detector == LocalDetector::Analog && spec.channel >= limits.channels {
            return Err(DaqError::invalid(
                "trigger channel",
                format!("channel {} outside 0..{}", spec.channel, limits.channels),
            ));
        }

        if local && spec.kind == TriggerKind::Pulse {
            if spec.length <= 0.0 {
                return Err(DaqError::invalid("trigger length", "pulse length must be positive"));
            }
            if let Some(range) = limits.length {
                spec.length = range.snap("trigger length", spec.length)?;
            }
        }

        spec.holdoff = limits.holdoff.snap("holdoff", spec.holdoff)?;
        spec.auto_timeout = limits.auto_timeout.snap("auto timeout", spec.auto_timeout)?;
        spec.position = limits.position.snap("trigger position", spec.position)?;
        Ok(spec)
    }
}

/// Level-pattern and edge masks of the digital detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DigitalPattern {
    /// Bits that must be low
    pub level_low: u32,
    /// Bits that must be high
    pub level_high: u32,
    /// Bits whose rising edge fires
    pub edge_rise: u32,
    /// Bits whose falling edge fires
    pub edge_fall: u32,
}

impl DigitalPattern {
    fn satisfied(&self, word: u32) -> bool {
        word & self.level_high == self.level_high && word & self.level_low == 0
    }
}

/// One value seen by a detector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DetectorValue {
    /// Detector channel voltage
    Analog(f64),
    /// Digital input word
    Digital(u32),
}

/// A trigger decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerFire {
    /// Sample index at which the trigger fired
    pub index: u64,
    /// Fired by the auto timeout rather than a matched condition
    pub auto: bool,
}

#[derive(Debug, Clone)]
struct EdgeTracker {
    level: f64,
    hysteresis: f64,
    rise_armed: bool,
    fall_armed: bool,
}

impl EdgeTracker {
    fn new(level: f64, hysteresis: f64) -> Self {
        Self {
            level,
            hysteresis,
            rise_armed: false,
            fall_armed: false,
        }
    }

    /// Returns (rose above level, fell below level).
    fn update(&mut self, value: f64) -> (bool, bool) {
        let mut rose = false;
        if self.rise_armed && value > self.level {
            rose = true;
            self.rise_armed = false;
        } else if value < self.level - self.hysteresis {
            self.rise_armed = true;
        }

        let mut fell = false;
        if self.fall_armed && value < self.level {
            fell = true;
            self.fall_armed = false;
        } else if value > self.level + self.hysteresis {
            self.fall_armed = true;
        }
        (rose, fell)
    }
}

#[derive(Debug, Clone, Default)]
struct PulseState {
    start: Option<u64>,
    timed_out: bool,
}

#[derive(Debug, Clone)]
struct AnalogDetector {
    kind: TriggerKind,
    slope: Slope,
    edges: EdgeTracker,
    length: u64,
    condition: LengthCondition,
    positive: PulseState,
    negative: PulseState,
}

impl AnalogDetector {
    fn update(&mut self, index: u64, value: f64) -> bool {
        let (rose, fell) = self.edges.update(value);
        match self.kind {
            TriggerKind::Edge => match self.slope {
                Slope::Rise => rose,
                Slope::Fall => fell,
                Slope::Either => rose || fell,
            },
            TriggerKind::Pulse => {
                let low = self.edges.level - self.edges.hysteresis;
                let high = self.edges.level + self.edges.hysteresis;
                let mut fired = false;
                if matches!(self.slope, Slope::Rise | Slope::Either) {
                    let ended = value < low;
                    fired |= Self::pulse(&mut self.positive, index, rose, ended, self.length, self.condition);
                }
                if matches!(self.slope, Slope::Fall | Slope::Either) {
                    let ended = value > high;
                    fired |= Self::pulse(&mut self.negative, index, fell, ended, self.length, self.condition);
                }
                fired
            }
            TriggerKind::Transition => false,
        }
    }

    fn pulse(
        state: &mut PulseState,
        index: u64,
        began: bool,
        ended: bool,
        length: u64,
        condition: LengthCondition,
    ) -> bool {
        if began {
            state.start = Some(index);
            state.timed_out = false;
            return false;
        }
        let Some(start) = state.start else {
            return false;
        };
        let width = index - start;
        if ended {
            state.start = None;
            return match condition {
                LengthCondition::Less => width < length,
                LengthCondition::More => width > length,
                LengthCondition::Timeout => false,
            };
        }
        if condition == LengthCondition::Timeout && !state.timed_out && width >= length {
            state.timed_out = true;
            return true;
        }
        false
    }
}

#[derive(Debug, Clone)]
struct DigitalDetector {
    kind: TriggerKind,
    pattern: DigitalPattern,
    previous: Option<u32>,
    was_satisfied: bool,
}

impl DigitalDetector {
    fn update(&mut self, word: u32) -> bool {
        let satisfied = self.pattern.satisfied(word);
        let became = satisfied && !self.was_satisfied;
        let edge_masks = self.pattern.edge_rise | self.pattern.edge_fall;
        let edged = self.previous.is_some_and(|prev| {
            (!prev & word & self.pattern.edge_rise) != 0 || (prev & !word & self.pattern.edge_fall) != 0
        });
        self.previous = Some(word);
        self.was_satisfied = satisfied;

        match self.kind {
            TriggerKind::Edge if edge_masks != 0 => satisfied && edged,
            TriggerKind::Edge | TriggerKind::Transition => became,
            TriggerKind::Pulse => false,
        }
    }
}

#[derive(Debug, Clone)]
enum Condition {
    Always,
    Never,
    Analog(AnalogDetector),
    Digital(DigitalDetector),
    Bus { listener: BusTrigger, pending: bool },
}

impl Condition {
    fn update(&mut self, index: u64, value: DetectorValue) -> bool {
        match (self, value) {
            (Self::Always, _) => true,
            (Self::Never, _) => false,
            (Self::Analog(detector), DetectorValue::Analog(value)) => detector.update(index, value),
            (Self::Digital(detector), DetectorValue::Digital(word)) => detector.update(word),
            (Self::Bus { pending, .. }, _) => std::mem::take(pending),
            _ => false,
        }
    }
}

/// Converts seconds to a sample count at `rate_hz`.
pub(crate) fn seconds_to_samples(seconds: f64, rate_hz: f64) -> u64 {
    if seconds <= 0.0 || rate_hz <= 0.0 {
        0
    } else {
        // values are range-checked before they get here
        (seconds * rate_hz).round() as u64
    }
}

/// Per-sample trigger decision engine.
#[derive(Debug, Clone)]
pub struct TriggerEngine {
    source: TriggerSource,
    condition: Condition,
    holdoff: u64,
    auto_timeout: u64,
    armed_at: Option<u64>,
    holdoff_until: u64,
}

impl TriggerEngine {
    /// Build an engine for a validated spec.
    ///
    /// `pattern` is only used by the digital detector.
    pub fn new(
        spec: &TriggerSpec,
        pattern: &DigitalPattern,
        rate_hz: f64,
        bus: &TriggerBus,
    ) -> Self {
        let condition = match spec.source {
            TriggerSource::None | TriggerSource::High => Condition::Always,
            TriggerSource::Low => Condition::Never,
            TriggerSource::AnalogInDetector => Condition::Analog(AnalogDetector {
                kind: spec.kind,
                slope: spec.slope,
                edges: EdgeTracker::new(spec.level.unwrap_or(0.0), spec.hysteresis.unwrap_or(0.0)),
                length: seconds_to_samples(spec.length, rate_hz),
                condition: spec.length_condition,
                positive: PulseState::default(),
                negative: PulseState::default(),
            }),
            TriggerSource::DigitalInDetector => Condition::Digital(DigitalDetector {
                kind: spec.kind,
                pattern: *pattern,
                previous: None,
                was_satisfied: false,
            }),
            source => Condition::Bus {
                listener: bus.listen(source),
                pending: false,
            },
        };

        Self {
            source: spec.source,
            condition,
            holdoff: seconds_to_samples(spec.holdoff, rate_hz),
            auto_timeout: seconds_to_samples(spec.auto_timeout, rate_hz),
            armed_at: None,
            holdoff_until: 0,
        }
    }

    /// Source this engine listens to.
    pub fn source(&self) -> TriggerSource {
        self.source
    }

    /// Start accepting fires from sample `index` on.
    pub fn arm(&mut self, index: u64) {
        self.armed_at = Some(index);
        if let Condition::Bus { pending, .. } = &mut self.condition {
            *pending = false;
        }
    }

    /// Stop accepting fires.
    pub fn disarm(&mut self) {
        self.armed_at = None;
    }

    /// Whether the engine is armed.
    pub fn is_armed(&self) -> bool {
        self.armed_at.is_some()
    }

    /// Latch a bus fire so the next fed sample sees it.
    ///
    /// Bus fires that arrive while disarmed are discarded.
    pub fn check_bus(&mut self, bus: &TriggerBus) {
        let armed = self.is_armed();
        if let Condition::Bus { listener, pending } = &mut self.condition {
            if listener.fired(bus) && armed {
                *pending = true;
            }
        }
    }

    /// Feed one sample; returns a fire when the trigger goes off.
    pub fn feed(&mut self, index: u64, value: DetectorValue) -> Option<TriggerFire> {
        let matched = self.condition.update(index, value);
        let armed_at = self.armed_at?;

        if index < self.holdoff_until {
            return None;
        }
        let auto = !matched
            && self.auto_timeout > 0
            && index >= armed_at.max(self.holdoff_until) + self.auto_timeout;
        if !matched && !auto {
            return None;
        }

        self.holdoff_until = index + 1 + self.holdoff;
        self.armed_at = Some(index + 1);
        trace!(source = %self.source, index = index, auto = auto, "Trigger fired");
        Some(TriggerFire { index, auto })
    }
}

/// Device-wide trigger distribution.
#[derive(Clone)]
pub struct TriggerBus {
    generations: Arc<[AtomicU64; BUS_SLOTS]>,
}

impl Default for TriggerBus {
    fn default() -> Self {
        Self {
            generations: Arc::new(std::array::from_fn(|_| AtomicU64::new(0))),
        }
    }
}

impl fmt::Debug for TriggerBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerBus").finish_non_exhaustive()
    }
}

impl TriggerBus {
    /// Create a bus with no pending fires.
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver one fire of `source` to every listener.
    pub fn publish(&self, source: TriggerSource) {
        if let Some(slot) = source.bus_slot() {
            self.generations[slot].fetch_add(1, Ordering::AcqRel);
            trace!(source = %source, "Trigger published");
        }
    }

    /// Current generation of `source`.
    pub fn generation(&self, source: TriggerSource) -> u64 {
        source
            .bus_slot()
            .map_or(0, |slot| self.generations[slot].load(Ordering::Acquire))
    }

    /// Listener that sees fires published after this call.
    pub fn listen(&self, source: TriggerSource) -> BusTrigger {
        BusTrigger {
            source,
            seen: self.generation(source),
        }
    }
}

/// Listener on one bus source.
#[derive(Debug, Clone)]
pub struct BusTrigger {
    source: TriggerSource,
    seen: u64,
}

impl BusTrigger {
    /// Source listened to.
    pub fn source(&self) -> TriggerSource {
        self.source
    }

    /// Consume any fires published since the last call.
    pub fn fired(&mut self, bus: &TriggerBus) -> bool {
        let current = bus.generation(self.source);
        if current != self.seen {
            self.seen = current;
            true
        } else {
            false
        }
    }

    /// Forget fires published so far.
    pub fn rearm(&mut self, bus: &TriggerBus) {
        self.seen = bus.generation(self.source);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analog_engine(spec: TriggerSpec) -> TriggerEngine {
        let mut engine = TriggerEngine::new(&spec, &DigitalPattern::default(), 1000.0, &TriggerBus::new());
        engine.arm(0);
        engine
    }

    fn run(engine: &mut TriggerEngine, values: &[f64]) -> Vec<u64> {
        values
            .iter()
            .enumerate()
            .filter_map(|(i, v)| engine.feed(i as u64, DetectorValue::Analog(*v)))
            .map(|fire| fire.index)
            .collect()
    }

    fn edge_spec(level: f64, hysteresis: f64, slope: Slope) -> TriggerSpec {
        TriggerSpec {
            source: TriggerSource::AnalogInDetector,
            slope,
            level: Some(level),
            hysteresis: Some(hysteresis),
            ..Default::default()
        }
    }

    #[test]
    fn test_rising_edge_with_hysteresis() {
        let mut engine = analog_engine(edge_spec(1.0, 0.5, Slope::Rise));
        // dips to 0.8 are inside the hysteresis band and must not re-arm
        let fires = run(&mut engine, &[0.0, 1.2, 0.8, 1.2, 0.4, 1.1]);
        assert_eq!(fires, vec![1, 5]);
    }

    #[test]
    fn test_falling_edge_mirrors_rising() {
        let mut engine = analog_engine(edge_spec(0.0, 0.2, Slope::Fall));
        let fires = run(&mut engine, &[0.5, -0.1, 0.1, -0.1, 0.3, -0.5]);
        assert_eq!(fires, vec![1, 5]);
    }

    #[test]
    fn test_either_edge() {
        let mut engine = analog_engine(edge_spec(0.0, 0.1, Slope::Either));
        let fires = run(&mut engine, &[-1.0, 1.0, -1.0, 1.0]);
        assert_eq!(fires, vec![1, 2, 3]);
    }

    #[test]
    fn test_holdoff_suppresses_fires() {
        let mut spec = edge_spec(0.0, 0.1, Slope::Rise);
        spec.holdoff = 0.004; // 4 samples at 1 kHz
        let mut engine = analog_engine(spec);
        let fires = run(&mut engine, &[-1.0, 1.0, -1.0, 1.0, -1.0, 1.0, -1.0, 1.0]);
        assert_eq!(fires, vec![1, 7]);
    }

    #[test]
    fn test_pulse_less_and_more() {
        let mut spec = edge_spec(0.5, 0.0, Slope::Rise);
        spec.kind = TriggerKind::Pulse;
        spec.length = 0.003; // 3 samples
        spec.length_condition = LengthCondition::Less;
        let mut engine = analog_engine(spec.clone());
        // pulse of width 2 then width 5
        let signal = [0.0, 1.0, 1.0, 0.0, 1.0, 1.0, 1.0, 1.0, 1.0, 0.0];
        assert_eq!(run(&mut engine, &signal), vec![3]);

        spec.length_condition = LengthCondition::More;
        let mut engine = analog_engine(spec);
        assert_eq!(run(&mut engine, &signal), vec![9]);
    }

    #[test]
    fn test_pulse_timeout_fires_during_pulse() {
        let mut spec = edge_spec(0.5, 0.0, Slope::Rise);
        spec.kind = TriggerKind::Pulse;
        spec.length = 0.003;
        spec.length_condition = LengthCondition::Timeout;
        let mut engine = analog_engine(spec);
        let signal = [0.0, 1.0, 1.0, 1.0, 1.0, 1.0, 0.0];
        assert_eq!(run(&mut engine, &signal), vec![4]);
    }

    #[test]
    fn test_auto_timeout_fires_and_is_flagged() {
        let mut spec = edge_spec(10.0, 0.0, Slope::Rise);
        spec.auto_timeout = 0.005;
        let mut engine = analog_engine(spec);
        let fire = (0..10)
            .find_map(|i| engine.feed(i, DetectorValue::Analog(0.0)))
            .unwrap();
        assert_eq!(fire, TriggerFire { index: 5, auto: true });
    }

    #[test]
    fn test_auto_timeout_waits_for_holdoff() {
        let mut spec = edge_spec(0.0, 0.0, Slope::Rise);
        spec.auto_timeout = 0.002;
        spec.holdoff = 0.005;
        let mut engine = analog_engine(spec);
        let mut fires = Vec::new();
        for (i, v) in [-1.0, 1.0].into_iter().chain(std::iter::repeat(1.0).take(20)).enumerate() {
            if let Some(fire) = engine.feed(i as u64, DetectorValue::Analog(v)) {
                fires.push(fire);
            }
        }
        // real fire at 1; holdoff ends at 7; auto clock starts there
        assert_eq!(fires[0], TriggerFire { index: 1, auto: false });
        assert_eq!(fires[1], TriggerFire { index: 9, auto: true });
    }

    #[test]
    fn test_digital_transition_and_edge() {
        let pattern = DigitalPattern {
            level_high: 0b01,
            ..Default::default()
        };
        let spec = TriggerSpec {
            source: TriggerSource::DigitalInDetector,
            kind: TriggerKind::Transition,
            ..Default::default()
        };
        let mut engine = TriggerEngine::new(&spec, &pattern, 1000.0, &TriggerBus::new());
        engine.arm(0);
        let words = [0b00, 0b01, 0b11, 0b10, 0b01];
        let fires: Vec<u64> = words
            .iter()
            .enumerate()
            .filter_map(|(i, w)| engine.feed(i as u64, DetectorValue::Digital(*w)))
            .map(|f| f.index)
            .collect();
        assert_eq!(fires, vec![1, 4]);

        let edge_pattern = DigitalPattern {
            edge_fall: 0b10,
            ..Default::default()
        };
        let spec = TriggerSpec {
            source: TriggerSource::DigitalInDetector,
            ..Default::default()
        };
        let mut engine = TriggerEngine::new(&spec, &edge_pattern, 1000.0, &TriggerBus::new());
        engine.arm(0);
        let fires: Vec<u64> = words
            .iter()
            .enumerate()
            .filter_map(|(i, w)| engine.feed(i as u64, DetectorValue::Digital(*w)))
            .map(|f| f.index)
            .collect();
        assert_eq!(fires, vec![4]);
    }

    #[test]
    fn test_bus_source_fires_on_next_sample() {
        let bus = TriggerBus::new();
        let spec = TriggerSpec {
            source: TriggerSource::Pc,
            ..Default::default()
        };
        let mut engine = TriggerEngine::new(&spec, &DigitalPattern::default(), 1000.0, &bus);
        engine.arm(0);
        engine.check_bus(&bus);
        assert!(engine.feed(0, DetectorValue::Analog(0.0)).is_none());

        bus.publish(TriggerSource::Pc);
        engine.check_bus(&bus);
        assert_eq!(engine.feed(1, DetectorValue::Analog(0.0)).map(|f| f.index), Some(1));
        assert!(engine.feed(2, DetectorValue::Analog(0.0)).is_none());
    }

    #[test]
    fn test_unarmed_engine_never_fires() {
        let spec = TriggerSpec::default();
        let mut engine = TriggerEngine::new(&spec, &DigitalPattern::default(), 1.0, &TriggerBus::new());
        assert!(engine.feed(0, DetectorValue::Analog(0.0)).is_none());
        engine.arm(1);
        assert!(engine.feed(1, DetectorValue::Analog(0.0)).is_some());
    }

    #[test]
    fn test_low_never_fires() {
        let spec = TriggerSpec {
            source: TriggerSource::Low,
            ..Default::default()
        };
        let mut engine = analog_engine(spec);
        assert!(run(&mut engine, &[0.0; 16]).is_empty());
    }

    fn limits<'a>(
        level: &'a ParamRange,
        wide: &'a ParamRange,
        kinds: TriggerKinds,
    ) -> TriggerLimits<'a> {
        TriggerLimits {
            detector: LocalDetector::Analog,
            sources: TriggerSources::all() - TriggerSources::EXTERNAL,
            kinds,
            external_inputs: 0,
            channels: 2,
            level: Some(level),
            hysteresis: Some(level),
            length: Some(wide),
            holdoff: wide,
            auto_timeout: wide,
            position: wide,
        }
    }

    #[test]
    fn test_level_rejected_outside_analog_edge() {
        let level = ParamRange::continuous(-5.0, 5.0);
        let wide = ParamRange::continuous(0.0, 10.0);
        let limits = limits(&level, &wide, TriggerKinds::EDGE | TriggerKinds::PULSE);

        let on_pc = TriggerSpec {
            source: TriggerSource::Pc,
            level: Some(1.0),
            ..Default::default()
        };
        assert!(on_pc.validated(&limits).unwrap_err().is_invalid_parameter());

        let ok = edge_spec(1.0, 0.1, Slope::Rise);
        assert!(ok.validated(&limits).is_ok());

        let transition = TriggerSpec {
            source: TriggerSource::AnalogInDetector,
            kind: TriggerKind::Transition,
            ..Default::default()
        };
        assert!(transition.validated(&limits).unwrap_err().is_not_supported());

        let external = TriggerSpec {
            source: TriggerSource::External(1),
            ..Default::default()
        };
        assert!(external.validated(&limits).unwrap_err().is_not_supported());
    }

    #[test]
    fn test_pulse_requires_length() {
        let level = ParamRange::continuous(-5.0, 5.0);
        let wide = ParamRange::continuous(0.0, 10.0);
        let limits = limits(&level, &wide, TriggerKinds::EDGE | TriggerKinds::PULSE);
        let mut spec = edge_spec(0.0, 0.0, Slope::Rise);
        spec.kind = TriggerKind::Pulse;
        assert!(spec.validated(&limits).is_err());
        spec.length = 0.001;
        assert!(spec.validated(&limits).is_ok());
    }
}
