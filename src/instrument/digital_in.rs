//! Digital input (logic analyzer) instrument.
//!
//! One word per sample carries every input bit; the sample format selects
//! how many low bits are kept. The digital detector fires on the
//! [`DigitalPattern`] level and edge masks.

use std::sync::Arc;

use tracing::{debug, info};

use crate::capabilities::{DeviceCapabilities, DigitalInCapabilities};
use crate::capture::{CaptureEngine, CaptureSettings};
use crate::device::Device;
use crate::error::{DaqError, Result};
use crate::instrument::{
    configure_step, AcquisitionMode, ConfigureStep, Instrument, InstrumentKind, InstrumentState,
};
use crate::record::{ReadOutcome, RecordStatus};
use crate::trigger::{DigitalPattern, LocalDetector, TriggerLimits, TriggerSpec};

const KIND: InstrumentKind = InstrumentKind::DigitalIn;

#[derive(Debug, Clone, PartialEq)]
struct DigitalInSettings {
    mode: AcquisitionMode,
    sample_rate: f64,
    buffer_size: usize,
    sample_format: u8,
    record_length: f64,
    trigger: TriggerSpec,
    pattern: DigitalPattern,
}

impl DigitalInSettings {
    fn defaults(caps: &DigitalInCapabilities) -> Self {
        let default_rate = 1_000_000.0_f64.min(caps.clock.base_hz);
        let widest = caps.sample_formats.iter().copied().max().unwrap_or(32);
        Self {
            mode: AcquisitionMode::Single,
            sample_rate: caps.clock.base_hz / f64::from(caps.clock.divider_for(default_rate)),
            buffer_size: caps.buffer_size.1,
            sample_format: widest.min(32),
            record_length: 0.0,
            trigger: TriggerSpec::default(),
            pattern: DigitalPattern::default(),
        }
    }

    fn mask(&self) -> u32 {
        if self.sample_format >= 32 {
            u32::MAX
        } else {
            (1u32 << self.sample_format) - 1
        }
    }
}

/// Logic analyzer instrument.
pub struct DigitalIn {
    device: Device,
    caps: Arc<DeviceCapabilities>,
    pending: DigitalInSettings,
    applied: DigitalInSettings,
    dirty: bool,
    capture: CaptureEngine<u32>,
}

impl std::fmt::Debug for DigitalIn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigitalIn")
            .field("state", &self.capture.state())
            .field("settings", &self.pending)
            .finish_non_exhaustive()
    }
}

impl DigitalIn {
    pub(crate) fn open(device: Device) -> Result<Self> {
        let caps = device.capabilities().clone();
        let source = device.backend().open_digital_in()?;
        let defaults = DigitalInSettings::defaults(&caps.digital_in);
        debug!(bits = caps.digital_in.bits, "Opened digital input");
        Ok(Self {
            capture: CaptureEngine::new(KIND, source, device.triggers().clone()),
            device,
            caps,
            pending: defaults.clone(),
            applied: defaults,
            dirty: false,
        })
    }

    fn limits(&self) -> &DigitalInCapabilities {
        &self.caps.digital_in
    }

    /// The owning device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Number of input bits.
    pub fn bit_count(&self) -> usize {
        self.limits().bits
    }

    /// Select the acquisition mode.
    pub fn set_mode(&mut self, mode: AcquisitionMode) -> Result<()> {
        if !self.limits().modes.contains(mode.flag()) {
            return Err(DaqError::not_supported(format!("{mode:?} acquisition")));
        }
        self.pending.mode = mode;
        self.dirty = true;
        Ok(())
    }

    /// Current acquisition mode.
    pub fn mode(&self) -> AcquisitionMode {
        self.pending.mode
    }

    /// Set the sample rate in Hz.
    pub fn set_sample_rate(&mut self, hz: f64) -> Result<()> {
        self.pending.sample_rate = self.limits().clock.snap("sample rate", hz)?;
        self.dirty = true;
        Ok(())
    }

    /// Sample rate in Hz.
    pub fn sample_rate(&self) -> f64 {
        self.pending.sample_rate
    }

    /// Set the number of samples per capture.
    pub fn set_buffer_size(&mut self, samples: usize) -> Result<()> {
        let (min, max) = self.limits().buffer_size;
        if !(min..=max).contains(&samples) {
            return Err(DaqError::invalid(
                "buffer size",
                format!("{samples} outside {min}..={max}"),
            ));
        }
        self.pending.buffer_size = samples;
        self.dirty = true;
        Ok(())
    }

    /// Samples per capture.
    pub fn buffer_size(&self) -> usize {
        self.pending.buffer_size
    }

    /// Sample width in bits (one of the advertised formats).
    pub fn set_sample_format(&mut self, bits: u8) -> Result<()> {
        if !self.limits().sample_formats.contains(&bits) {
            return Err(DaqError::invalid(
                "sample format",
                format!("{bits} bits not in {:?}", self.limits().sample_formats),
            ));
        }
        self.pending.sample_format = bits;
        self.dirty = true;
        Ok(())
    }

    /// Bits per sample word.
    pub fn sample_format(&self) -> u8 {
        self.pending.sample_format
    }

    /// Set the record length in seconds, 0 for unbounded.
    pub fn set_record_length(&mut self, seconds: f64) -> Result<()> {
        self.pending.record_length = self.limits().record_length.snap("record length", seconds)?;
        self.dirty = true;
        Ok(())
    }

    /// Record length in seconds.
    pub fn record_length(&self) -> f64 {
        self.pending.record_length
    }

    /// Replace the trigger.
    pub fn set_trigger(&mut self, spec: TriggerSpec) -> Result<()> {
        let caps = self.limits();
        let limits = TriggerLimits {
            detector: LocalDetector::Digital,
            sources: caps.trigger_sources,
            kinds: caps.trigger_kinds,
            external_inputs: caps.external_triggers,
            channels: caps.bits,
            level: None,
            hysteresis: None,
            length: None,
            holdoff: &caps.holdoff,
            auto_timeout: &caps.auto_timeout,
            position: &caps.position,
        };
        self.pending.trigger = spec.validated(&limits)?;
        self.dirty = true;
        Ok(())
    }

    /// Current trigger.
    pub fn trigger(&self) -> &TriggerSpec {
        &self.pending.trigger
    }

    /// Level and edge masks of the digital detector.
    pub fn set_trigger_pattern(&mut self, pattern: DigitalPattern) -> Result<()> {
        let bits = self.limits().bits;
        let valid = if bits >= 32 { u32::MAX } else { (1u32 << bits) - 1 };
        let used = pattern.level_low | pattern.level_high | pattern.edge_rise | pattern.edge_fall;
        if used & !valid != 0 {
            return Err(DaqError::invalid(
                "trigger pattern",
                format!("mask {used:#x} uses bits beyond {bits}"),
            ));
        }
        if pattern.level_low & pattern.level_high != 0 {
            return Err(DaqError::invalid(
                "trigger pattern",
                "a bit cannot be required both low and high",
            ));
        }
        self.pending.pattern = pattern;
        self.dirty = true;
        Ok(())
    }

    /// Pattern condition of the trigger.
    pub fn trigger_pattern(&self) -> DigitalPattern {
        self.pending.pattern
    }

    /// Read captured words without consuming them.
    pub fn read_samples(&self, offset: usize, count: usize) -> ReadOutcome<u32> {
        let mask = self.applied.mask();
        let mut out = self.capture.read(0, offset, count);
        for word in &mut out.samples {
            *word &= mask;
        }
        out
    }

    /// Read the level history of one input bit.
    pub fn read_bits(&self, pin: usize, offset: usize, count: usize) -> Result<ReadOutcome<bool>> {
        let width = self.limits().bits.min(usize::from(self.applied.sample_format));
        if pin >= width {
            return Err(DaqError::InvalidChannel {
                instrument: KIND,
                channel: pin,
                max: width,
            });
        }
        let out = self.read_samples(offset, count);
        Ok(ReadOutcome {
            samples: out.samples.iter().map(|w| (w >> pin) & 1 == 1).collect(),
            requested: out.requested,
        })
    }

    /// Record counters since the last call.
    pub fn record_status(&self) -> Result<RecordStatus> {
        self.capture.record_status()
    }

    /// Samples available to read.
    pub fn valid_samples(&self) -> usize {
        self.capture.valid_samples()
    }

    /// Windows discarded because the hardware buffer overflowed under them.
    pub fn window_restarts(&self) -> u64 {
        self.capture.window_restarts()
    }

    /// Whether the last capture was started by the auto timeout.
    pub fn auto_triggered(&self) -> bool {
        self.capture.auto_triggered()
    }

    /// Buffer position of the trigger sample.
    pub fn trigger_offset(&self) -> Option<usize> {
        self.capture.trigger_offset()
    }

    /// Next write position in the ring.
    pub fn write_index(&self) -> usize {
        self.capture.write_index()
    }

    fn capture_settings(&self) -> CaptureSettings {
        let settings = &self.applied;
        CaptureSettings {
            mode: settings.mode,
            rate_hz: settings.sample_rate,
            buffer_size: settings.buffer_size,
            oversample: 1,
            record_length: settings.record_length,
            trigger: settings.trigger.clone(),
            pattern: settings.pattern,
            channels: vec![true],
        }
    }
}

impl Instrument for DigitalIn {
    fn kind(&self) -> InstrumentKind {
        KIND
    }

    fn state(&self) -> InstrumentState {
        self.capture.state()
    }

    fn configure(&mut self, reconfigure: bool, start: bool) -> Result<InstrumentState> {
        let step = configure_step(KIND, self.capture.state(), self.dirty, reconfigure, start)?;
        let ConfigureStep::Apply { abort } = step else {
            return Ok(self.capture.state());
        };
        if abort {
            self.capture.halt(InstrumentState::Config)?;
        }
        if self.dirty {
            self.applied = self.pending.clone();
            self.dirty = false;
            debug!(
                mode = ?self.applied.mode,
                rate_hz = self.applied.sample_rate,
                format = self.applied.sample_format,
                "Digital input configured"
            );
        }
        self.capture.set_state(InstrumentState::Config);
        if start {
            self.capture.start(self.capture_settings())?;
        }
        Ok(self.capture.state())
    }

    fn poll(&mut self, read_data: bool) -> Result<InstrumentState> {
        self.capture.poll(read_data)
    }

    fn force_trigger(&mut self) -> Result<()> {
        self.capture.force_trigger()
    }

    fn stop(&mut self) -> Result<()> {
        self.capture.halt(InstrumentState::Ready)
    }

    fn reset(&mut self) -> Result<()> {
        let defaults = DigitalInSettings::defaults(self.limits());
        self.pending = defaults.clone();
        self.applied = defaults;
        self.dirty = false;
        info!("Digital input reset");
        self.capture.reset()
    }
}
