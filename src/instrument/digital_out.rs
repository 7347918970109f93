//! Digital output (pattern generator) instrument.
//!
//! Enabling a pin claims it in the device pin registry as
//! [`PinRole::PatternOut`]; the claim fails fast when another engine holds
//! the pin and the enable flag stays unchanged. Disabling releases it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::capabilities::{DeviceCapabilities, DigitalOutCapabilities, DriveTypes};
use crate::device::{Device, GenerationPlan};
use crate::error::{DaqError, Result};
use crate::generator::{OutputEngine, RunPlan};
use crate::instrument::{
    configure_step, ChannelSelector, ConfigureStep, Instrument, InstrumentKind, InstrumentState,
};
use crate::pins::{ClaimSet, EngineId, PinRole};
use crate::trigger::TriggerSource;
use crate::waveform::{PatternKind, PinPattern};

const KIND: InstrumentKind = InstrumentKind::DigitalOut;

const RANDOM_SEED: u64 = 0x5EED_D0D0;

/// Output stage of a pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriveType {
    /// Drives both levels
    #[default]
    PushPull,
    /// Drives low only; high releases the pin
    OpenDrain,
}

impl DriveType {
    /// Capability flag of this drive type.
    pub fn flag(&self) -> DriveTypes {
        match self {
            Self::PushPull => DriveTypes::PUSH_PULL,
            Self::OpenDrain => DriveTypes::OPEN_DRAIN,
        }
    }
}

/// What a pin does while the generator is not running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdleLevel {
    /// Initial level of the pattern
    #[default]
    Init,
    /// Held low
    Low,
    /// Held high
    High,
    /// Released
    HighZ,
}

/// Electrical state of an output pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputLevel {
    /// Driven low
    Low,
    /// Driven high
    High,
    /// Not driven
    HighZ,
}

/// Settings of one pattern pin.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DigitalOutPin {
    /// Driven by the pattern
    pub enabled: bool,
    /// Output stage
    pub drive: DriveType,
    /// Level while not running
    pub idle: IdleLevel,
    /// Pattern parameters
    pub pattern: PinPattern,
}

impl DigitalOutPin {
    fn drive_level(&self, high: bool) -> OutputLevel {
        match (high, self.drive) {
            (false, _) => OutputLevel::Low,
            (true, DriveType::PushPull) => OutputLevel::High,
            (true, DriveType::OpenDrain) => OutputLevel::HighZ,
        }
    }

    fn idle_level(&self, seed: u64) -> OutputLevel {
        match self.idle {
            IdleLevel::Init => self.drive_level(self.pattern.level_at(0, seed)),
            IdleLevel::Low => OutputLevel::Low,
            IdleLevel::High => self.drive_level(true),
            IdleLevel::HighZ => OutputLevel::HighZ,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct DigitalOutSettings {
    pins: Vec<DigitalOutPin>,
    run: RunPlan,
    trigger: TriggerSource,
}

impl DigitalOutSettings {
    fn defaults(caps: &DigitalOutCapabilities) -> Self {
        Self {
            pins: vec![DigitalOutPin::default(); caps.pins],
            run: RunPlan::default(),
            trigger: TriggerSource::None,
        }
    }
}

/// Pattern generator instrument.
pub struct DigitalOut {
    device: Device,
    caps: Arc<DeviceCapabilities>,
    pending: DigitalOutSettings,
    applied: DigitalOutSettings,
    dirty: bool,
    output: OutputEngine<bool>,
    claims: ClaimSet,
}

impl std::fmt::Debug for DigitalOut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigitalOut")
            .field("state", &self.output.state())
            .field("claims", &self.claims)
            .finish_non_exhaustive()
    }
}

impl DigitalOut {
    pub(crate) fn open(device: Device) -> Result<Self> {
        let caps = device.capabilities().clone();
        let sink = device.backend().open_digital_out()?;
        let defaults = DigitalOutSettings::defaults(&caps.digital_out);
        debug!(pins = caps.digital_out.pins, "Opened digital output");
        Ok(Self {
            output: OutputEngine::new(KIND, sink, device.triggers().clone()),
            claims: device.pins().claim_set(EngineId::DigitalOut),
            device,
            caps,
            pending: defaults.clone(),
            applied: defaults,
            dirty: false,
        })
    }

    fn limits(&self) -> &DigitalOutCapabilities {
        &self.caps.digital_out
    }

    /// The owning device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Number of pattern pins.
    pub fn pin_count(&self) -> usize {
        self.pending.pins.len()
    }

    fn pins_for(&self, selector: ChannelSelector) -> Result<Vec<usize>> {
        let enabled: Vec<bool> = self.pending.pins.iter().map(|p| p.enabled).collect();
        selector.resolve(KIND, &enabled)
    }

    /// Queued settings of one pin.
    pub fn pin(&self, pin: usize) -> Result<&DigitalOutPin> {
        self.pending.pins.get(pin).ok_or(DaqError::InvalidChannel {
            instrument: KIND,
            channel: pin,
            max: self.pending.pins.len(),
        })
    }

    /// Pins currently claimed by the generator.
    pub fn claims(&self) -> &ClaimSet {
        &self.claims
    }

    /// Enable or disable pins; enabling claims them.
    pub fn set_pin_enable(&mut self, selector: ChannelSelector, enabled: bool) -> Result<()> {
        let targets = self.pins_for(selector)?;
        let mut flags: Vec<bool> = self.pending.pins.iter().map(|p| p.enabled).collect();
        for pin in &targets {
            flags[*pin] = enabled;
        }
        let request = flags
            .iter()
            .enumerate()
            .filter(|(_, on)| **on)
            .map(|(pin, _)| {
                u8::try_from(pin)
                    .map(|pin| (pin, PinRole::PatternOut))
                    .map_err(|_| DaqError::invalid("pin", format!("pin {pin} out of range")))
            })
            .collect::<Result<Vec<_>>>()?;
        self.claims.replace(&request)?;
        for pin in targets {
            self.pending.pins[pin].enabled = enabled;
        }
        self.dirty = true;
        Ok(())
    }

    /// Set the output stage of the selected pins.
    pub fn set_drive(&mut self, selector: ChannelSelector, drive: DriveType) -> Result<()> {
        if !self.limits().drive_types.contains(drive.flag()) {
            return Err(DaqError::not_supported(format!("{drive:?} drive")));
        }
        for pin in self.pins_for(selector)? {
            self.pending.pins[pin].drive = drive;
        }
        self.dirty = true;
        Ok(())
    }

    /// Set the idle level of the selected pins.
    pub fn set_idle(&mut self, selector: ChannelSelector, idle: IdleLevel) -> Result<()> {
        for pin in self.pins_for(selector)? {
            self.pending.pins[pin].idle = idle;
        }
        self.dirty = true;
        Ok(())
    }

    /// Replace the pattern of the selected pins.
    pub fn set_pattern(&mut self, selector: ChannelSelector, pattern: PinPattern) -> Result<()> {
        let caps = self.limits();
        if !caps.patterns.contains(pattern.kind.flag()) {
            return Err(DaqError::not_supported(format!("{:?} pattern", pattern.kind)));
        }
        if pattern.divider == 0 || pattern.divider > caps.clock.max_divider {
            return Err(DaqError::invalid(
                "divider",
                format!("{} outside 1..={}", pattern.divider, caps.clock.max_divider),
            ));
        }
        for (name, value) in [("low", pattern.low), ("high", pattern.high)] {
            if value > caps.max_counter {
                return Err(DaqError::invalid(
                    name,
                    format!("{value} exceeds counter maximum {}", caps.max_counter),
                ));
            }
        }
        if pattern.kind == PatternKind::Pulse {
            let period = u64::from(pattern.low) + u64::from(pattern.high);
            if u64::from(pattern.initial_counter) > period {
                return Err(DaqError::invalid(
                    "initial counter",
                    format!("{} exceeds period {period}", pattern.initial_counter),
                ));
            }
        }
        if pattern.kind == PatternKind::Custom
            && (pattern.custom.is_empty() || pattern.custom.len() > caps.custom_bits)
        {
            return Err(DaqError::invalid(
                "custom pattern",
                format!("{} bits outside 1..={}", pattern.custom.len(), caps.custom_bits),
            ));
        }
        for pin in self.pins_for(selector)? {
            self.pending.pins[pin].pattern = pattern.clone();
        }
        self.dirty = true;
        Ok(())
    }

    // ---- run control ----

    /// Delay between trigger and output, in seconds.
    pub fn set_wait(&mut self, seconds: f64) -> Result<()> {
        self.pending.run.wait = self.limits().duration.snap("wait", seconds)?;
        self.dirty = true;
        Ok(())
    }

    /// Run length in seconds.
    pub fn set_run(&mut self, seconds: f64) -> Result<()> {
        self.pending.run.run = self.limits().duration.snap("run", seconds)?;
        self.dirty = true;
        Ok(())
    }

    /// Number of runs.
    pub fn set_repeat(&mut self, count: u32) -> Result<()> {
        let max = self.limits().max_repeat;
        if count > max {
            return Err(DaqError::invalid("repeat", format!("{count} exceeds {max}")));
        }
        self.pending.run.repeat = count;
        self.dirty = true;
        Ok(())
    }

    /// Wait for the trigger before every repeat.
    pub fn set_repeat_trigger(&mut self, enabled: bool) {
        self.pending.run.repeat_trigger = enabled;
        self.dirty = true;
    }

    /// Wait, run and repeat settings.
    pub fn run_plan(&self) -> RunPlan {
        self.pending.run
    }

    /// Select what starts the generator.
    pub fn set_trigger_source(&mut self, source: TriggerSource) -> Result<()> {
        source.check(self.limits().trigger_sources, self.caps.analog_in.external_triggers)?;
        self.pending.trigger = source;
        self.dirty = true;
        Ok(())
    }

    /// Current start trigger.
    pub fn trigger_source(&self) -> TriggerSource {
        self.pending.trigger
    }

    // ---- output ----

    fn applied_pin(&self, pin: usize) -> Result<&DigitalOutPin> {
        self.applied.pins.get(pin).ok_or(DaqError::InvalidChannel {
            instrument: KIND,
            channel: pin,
            max: self.applied.pins.len(),
        })
    }

    /// Pattern output of a pin after `tick` base clock ticks of a run.
    pub fn level_at(&self, pin: usize, tick: u64) -> Result<OutputLevel> {
        let settings = self.applied_pin(pin)?;
        let seed = RANDOM_SEED ^ pin as u64;
        Ok(settings.drive_level(settings.pattern.level_at(tick, seed)))
    }

    /// Level a pin shows while the generator is not running.
    pub fn idle_level(&self, pin: usize) -> Result<OutputLevel> {
        let settings = self.applied_pin(pin)?;
        Ok(settings.idle_level(RANDOM_SEED ^ pin as u64))
    }

    /// Current level of a pin, following the device clock.
    pub fn output_level(&mut self, pin: usize) -> Result<OutputLevel> {
        let enabled = self.applied_pin(pin)?.enabled;
        if !enabled {
            return Ok(OutputLevel::HighZ);
        }
        if self.output.state() != InstrumentState::Running {
            return self.idle_level(pin);
        }
        let ticks = self.output.running_time()? * self.limits().clock.base_hz;
        // non-negative and finite by construction
        self.level_at(pin, ticks.floor().max(0.0) as u64)
    }

    /// Seconds since the current run started.
    pub fn running_time(&mut self) -> Result<f64> {
        self.output.running_time()
    }

    fn start(&mut self) -> Result<()> {
        if !self.applied.pins.iter().any(|p| p.enabled) {
            return Err(DaqError::invalid("pin", "no pin enabled"));
        }
        let plan = GenerationPlan {
            rate_hz: self.limits().clock.base_hz,
            channels: self.applied.pins.iter().map(|p| p.enabled).collect(),
        };
        for (pin, settings) in self.applied.pins.iter().enumerate() {
            if settings.enabled && settings.pattern.kind == PatternKind::Custom {
                self.output.sink().write(pin, &settings.pattern.custom)?;
            }
        }
        self.output.start(&plan, self.applied.run, self.applied.trigger)
    }
}

impl Instrument for DigitalOut {
    fn kind(&self) -> InstrumentKind {
        KIND
    }

    fn state(&self) -> InstrumentState {
        self.output.state()
    }

    fn configure(&mut self, reconfigure: bool, start: bool) -> Result<InstrumentState> {
        let step = configure_step(KIND, self.output.state(), self.dirty, reconfigure, start)?;
        let ConfigureStep::Apply { abort } = step else {
            return Ok(self.output.state());
        };
        if abort {
            self.output.halt(InstrumentState::Config)?;
        }
        if self.dirty {
            self.applied = self.pending.clone();
            self.dirty = false;
            debug!(
                pins = self.claims.claims().len(),
                trigger = %self.applied.trigger,
                "Digital output configured"
            );
        }
        self.output.set_state(InstrumentState::Config);
        if start {
            self.start()?;
        }
        Ok(self.output.state())
    }

    fn poll(&mut self, _read_data: bool) -> Result<InstrumentState> {
        self.output.poll()
    }

    fn force_trigger(&mut self) -> Result<()> {
        self.output.force_trigger()
    }

    fn stop(&mut self) -> Result<()> {
        self.output.halt(InstrumentState::Ready)
    }

    fn reset(&mut self) -> Result<()> {
        let defaults = DigitalOutSettings::defaults(self.limits());
        self.pending = defaults.clone();
        self.applied = defaults;
        self.dirty = false;
        self.claims.clear();
        info!("Digital output reset");
        self.output.reset()
    }
}
